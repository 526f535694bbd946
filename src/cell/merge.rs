//! Combining several cells into one.

use super::value::{Cell, Derived};

/// Latest values of every merged source.
#[derive(Clone, Debug, PartialEq)]
pub struct Merged<V> {
    /// One slot per source, in argument order.
    pub values: V,
    /// Position of the source whose change produced this value. `None` for
    /// the initial value.
    pub source: Option<usize>,
}

macro_rules! merge_fn {
    ($(#[$doc:meta])* $name:ident, $($idx:tt => $src:ident: $T:ident),+) => {
        $(#[$doc])*
        pub fn $name<$($T),+>($($src: &Cell<$T>),+) -> Derived<Merged<($($T,)+)>>
        where
            $($T: Clone + PartialEq + Send + Sync + 'static),+
        {
            let target = Cell::new(Merged {
                values: ($($src.get(),)+),
                source: None,
            });
            let sources = vec![$({
                let target = target.clone();
                $src.attach(move |value: &$T| {
                    target.set_with(|merged| {
                        merged.values.$idx = value.clone();
                        merged.source = Some($idx);
                    });
                })
            }),+];
            Derived::new(target, sources)
        }
    };
}

merge_fn!(
    /// Merge two cells. The result updates whenever either source changes.
    merge2, 0 => a: A, 1 => b: B
);
merge_fn!(
    /// Merge three cells.
    merge3, 0 => a: A, 1 => b: B, 2 => c: C
);
merge_fn!(
    /// Merge four cells.
    merge4, 0 => a: A, 1 => b: B, 2 => c: C, 3 => d: D
);

/// Merge two to four cells into a [`Derived`] cell of [`Merged`] tuples.
///
/// ```ignore
/// let both = merge_all!(todo, token);
/// let (todo, token) = both.get().values;
/// ```
#[macro_export]
macro_rules! merge_all {
    ($a:expr, $b:expr $(,)?) => {
        $crate::cell::merge2(&$a, &$b)
    };
    ($a:expr, $b:expr, $c:expr $(,)?) => {
        $crate::cell::merge3(&$a, &$b, &$c)
    };
    ($a:expr, $b:expr, $c:expr, $d:expr $(,)?) => {
        $crate::cell::merge4(&$a, &$b, &$c, &$d)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_merge_tracks_latest_of_each_source() {
        let a = Cell::new(1);
        let b = Cell::new("x".to_string());
        let merged = merge2(&a, &b);

        assert_eq!(merged.get().values, (1, "x".to_string()));
        assert_eq!(merged.get().source, None);

        a.set(2);
        assert_eq!(merged.get().values, (2, "x".to_string()));
        assert_eq!(merged.get().source, Some(0));

        b.set("y".into());
        assert_eq!(merged.get().values, (2, "y".to_string()));
        assert_eq!(merged.get().source, Some(1));
    }

    #[test]
    fn test_merge_notifies_once_per_source_change() {
        let a = Cell::new(0);
        let b = Cell::new(0);
        let c = Cell::new(0);
        let merged = crate::merge_all!(a, b, c);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        merged.subscribe(move |m| s.lock().push(m.values));

        c.set(3);
        a.set(1);
        a.set(1);

        assert_eq!(*seen.lock(), vec![(0, 0, 0), (0, 0, 3), (1, 0, 3)]);
    }

    #[test]
    fn test_dropping_merge_releases_every_source() {
        let a = Cell::new(0);
        let b = Cell::new(0);
        let c = Cell::new(0);
        let d = Cell::new(0);

        let merged = merge4(&a, &b, &c, &d);
        assert_eq!(a.subscriber_count() + d.subscriber_count(), 2);

        drop(merged);
        for cell in [&a, &b, &c, &d] {
            assert_eq!(cell.subscriber_count(), 0);
        }
    }
}
