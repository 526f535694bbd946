//! Property tests for cell notification.

use mdtracker::cell::{merge2, Cell};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

/// `initial` followed by `values`, with consecutive duplicates removed.
fn distinct_run(initial: u8, values: &[u8]) -> Vec<u8> {
    let mut expected = vec![initial];
    for v in values {
        if expected.last() != Some(v) {
            expected.push(*v);
        }
    }
    expected
}

proptest! {
    #[test]
    fn prop_subscriber_sees_distinct_values(initial in 0u8..4, values in prop::collection::vec(0u8..4, 0..64)) {
        let cell = Cell::new(initial);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = cell.subscribe(move |v| sink.lock().push(*v));

        for v in &values {
            cell.set(*v);
        }

        prop_assert_eq!(seen.lock().clone(), distinct_run(initial, &values));
        prop_assert_eq!(cell.get(), values.last().copied().unwrap_or(initial));
    }

    #[test]
    fn prop_unsubscribed_handler_is_never_called(values in prop::collection::vec(any::<u8>(), 1..32), cut in 0usize..32) {
        let cell = Cell::new(0u8);
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let sub = cell.subscribe(move |_| *counter.lock() += 1);

        let cut = cut.min(values.len());
        for v in &values[..cut] {
            cell.set(*v);
        }
        prop_assert!(sub.unsubscribe());
        let before = *calls.lock();

        for v in &values[cut..] {
            cell.set(*v);
        }
        prop_assert!(!sub.unsubscribe());
        prop_assert_eq!(*calls.lock(), before);
    }

    #[test]
    fn prop_merge_holds_latest_of_each(ops in prop::collection::vec((any::<bool>(), any::<u16>()), 0..48)) {
        let a = Cell::new(0u16);
        let b = Cell::new(0u16);
        let merged = merge2(&a, &b);

        for (first, v) in &ops {
            if *first { a.set(*v); } else { b.set(*v); }
        }

        prop_assert_eq!(merged.get().values, (a.get(), b.get()));
    }
}
