//! Aggregation of chapters read per title, and title muting.

use crate::api::{ApiCache, FetchOptions};
use crate::cell::{merge2, Cell, Derived, Merged, Subscription};
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::store::{ChapterHistory, ChapterToTitle, Table};
use crate::subscriptions::{ChangeEvent, ChangeKind};
use crate::types::ChapterTitle;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chapter metadata never changes its title; cache it for a year.
pub const CHAPTER_MAX_AGE: Duration = Duration::from_secs(365 * 86_400);

pub const FOLLOWS_MAX_AGE: Duration = Duration::from_secs(600);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Chapters read of one title.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TitleSeen {
    pub title: String,
    pub chapters: BTreeSet<String>,
}

/// Title id → chapters read.
pub type TitlesSeen = BTreeMap<String, TitleSeen>;

/// Reading status per followed title id.
pub type Follows = Map<String, Value>;

/// Record `chapter` under `title`. Notifies only if the map changed.
pub fn upsert_title_seen(titles: &Cell<TitlesSeen>, chapter: &str, title: &str) -> bool {
    titles.set_with(|seen| {
        seen.entry(title.to_string())
            .or_insert_with(|| TitleSeen {
                title: title.to_string(),
                chapters: BTreeSet::new(),
            })
            .chapters
            .insert(chapter.to_string());
    })
}

/// Resolve the title of `chapter` through the API cache and remember the
/// mapping. `None` if the chapter is unknown upstream.
pub async fn fetch_title_for_chapter(cache: &ApiCache, token: &str, chapter: &str) -> Result<Option<String>> {
    let path = format!("/chapter/{}", chapter);
    let Some(body) = cache
        .fetch_cached(&path, Some(token), &path, FetchOptions::max_age(CHAPTER_MAX_AGE))
        .await?
    else {
        return Ok(None);
    };

    let title = body
        .pointer("/data/relationships")
        .and_then(Value::as_array)
        .and_then(|relationships| {
            relationships
                .iter()
                .find(|r| r.get("type").and_then(Value::as_str) == Some("manga"))
        })
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(String::from);

    let Some(title) = title else {
        warn!(chapter, "chapter has no title relationship");
        return Ok(None);
    };

    cache.database().put::<ChapterToTitle>(&ChapterTitle {
        chapter: chapter.to_string(),
        title: title.clone(),
    })?;
    Ok(Some(title))
}

/// Rebuild `titles` from the stored chapter → title mapping and the reading
/// history, resolving unmapped chapters through the API.
///
/// `cancel` is checked between chapters; on cancellation the function
/// returns [`TrackerError::Cancelled`] and mappings fetched so far stay
/// stored.
pub async fn fetch_titles_seen(
    cache: &ApiCache,
    token: &str,
    titles: &Cell<TitlesSeen>,
    cancel: &CancellationToken,
) -> Result<()> {
    let db = cache.database();
    let mut done = HashSet::new();

    for ChapterTitle { chapter, title } in db.get_all::<ChapterToTitle>()? {
        upsert_title_seen(titles, &chapter, &title);
        done.insert(chapter);
    }

    let history = db.get_all::<ChapterHistory>()?;
    let total = history.len();
    let mut last_progress = Instant::now();

    for (idx, record) in history.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(TrackerError::Cancelled);
        }
        if last_progress.elapsed() > PROGRESS_INTERVAL {
            last_progress = Instant::now();
            info!(done = idx + 1, total, "fetching chapter metadata");
        }
        if !done.insert(record.content_id.clone()) {
            continue;
        }

        match fetch_title_for_chapter(cache, token, &record.content_id).await? {
            Some(title) => {
                upsert_title_seen(titles, &record.content_id, &title);
            }
            None => warn!(chapter = %record.content_id, "unknown chapter"),
        }
        tokio::task::yield_now().await;
    }

    Ok(())
}

/// Keeps a [`TitlesSeen`] cell current as chapters are read.
///
/// Dropping the watch stops it.
pub struct TitlesWatch {
    feed: Subscription,
    pending: Cell<VecDeque<String>>,
    _merged: Derived<Merged<(VecDeque<String>, Option<String>)>>,
    worker: Subscription,
}

impl TitlesWatch {
    /// Chapters waiting to be resolved.
    pub fn pending(&self) -> Vec<String> {
        self.pending.with(|q| q.iter().cloned().collect())
    }
}

impl Drop for TitlesWatch {
    fn drop(&mut self) {
        self.feed.unsubscribe();
        self.worker.unsubscribe();
    }
}

/// Watch `chapter_history` writes and add their chapters to `titles`.
///
/// New chapter ids are queued; whenever the queue or the API token changes
/// and a token is available, the queue is drained through the API cache.
/// Deletes and clears of the history are ignored.
///
/// Must be called from within a tokio runtime.
pub fn watch_titles_seen(
    cache: ApiCache,
    titles: Cell<TitlesSeen>,
    token: &Cell<Option<String>>,
) -> TitlesWatch {
    let pending: Cell<VecDeque<String>> = Cell::new(VecDeque::new());
    let latest = cache.database().feed().latest();
    let since = latest.with(|event| event.as_ref().map_or(0, |e| e.seq));

    let feed = {
        let pending = pending.clone();
        latest.subscribe(move |event: &Option<Arc<ChangeEvent>>| {
            let Some(event) = event.as_ref().filter(|e| e.seq > since) else {
                return;
            };
            let chapters = read_chapters(event);
            if !chapters.is_empty() {
                pending.update(|q| q.extend(chapters));
            }
        })
    };

    let merged = merge2(&pending, token);
    let worker = {
        let pending = pending.clone();
        merged.subscribe_async(move |merged: Merged<(VecDeque<String>, Option<String>)>| {
            let cache = cache.clone();
            let titles = titles.clone();
            let pending = pending.clone();
            async move {
                let (queue, token) = merged.values;
                let Some(token) = token else { return };

                for chapter in queue {
                    match fetch_title_for_chapter(&cache, &token, &chapter).await {
                        Ok(Some(title)) => {
                            upsert_title_seen(&titles, &chapter, &title);
                        }
                        Ok(None) => warn!(%chapter, "unknown chapter"),
                        Err(e) => warn!(%chapter, error = %e, "failed to resolve chapter"),
                    }
                    pending.set_with(|q| {
                        if q.front() == Some(&chapter) {
                            q.pop_front();
                        }
                    });
                }
            }
        })
    };

    TitlesWatch {
        feed,
        pending,
        _merged: merged,
        worker,
    }
}

/// Content ids of chapter history rows written by `event`.
fn read_chapters(event: &ChangeEvent) -> Vec<String> {
    event
        .changes_for(ChapterHistory::NAME)
        .filter_map(|change| match change.kind {
            ChangeKind::Add | ChangeKind::Put => change
                .value
                .as_ref()
                .and_then(|v| v.get("contentId"))
                .and_then(Value::as_str)
                .map(String::from),
            ChangeKind::Delete | ChangeKind::Clear => {
                debug!(kind = ?change.kind, "ignoring history removal");
                None
            }
        })
        .collect()
}

/// The user's follow list, or `None` if unavailable.
pub async fn fetch_follows(cache: &ApiCache, token: &str) -> Result<Option<Follows>> {
    let path = "/manga/status";
    let body = cache
        .fetch_cached(path, Some(token), path, FetchOptions::max_age(FOLLOWS_MAX_AGE))
        .await?;
    Ok(body.and_then(|mut body| match body.get_mut("statuses").map(Value::take) {
        Some(Value::Object(statuses)) => Some(statuses),
        _ => None,
    }))
}

/// A title listed on the page, as far as muting is concerned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListedTitle {
    pub id: String,
    pub tags: Vec<String>,
}

/// Why a listed title is muted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MuteReason {
    BlacklistedTag(String),
    /// Followed, with its reading status.
    Followed(String),
    /// At least the configured number of its chapters were read.
    Seen { chapters: usize },
}

/// Decide whether `item` should be muted. Tags are checked first, then
/// follows, then reading history.
pub fn mute_reason(
    item: &ListedTitle,
    config: &Config,
    follows: Option<&Follows>,
    titles: &TitlesSeen,
) -> Option<MuteReason> {
    if let Some(tag) = item
        .tags
        .iter()
        .map(|t| t.to_lowercase())
        .find(|t| config.tags_blacklist.contains(t))
    {
        return Some(MuteReason::BlacklistedTag(tag));
    }

    if let Some(status) = follows.and_then(|f| f.get(&item.id)) {
        let status = status.as_str().unwrap_or_default().to_string();
        return Some(MuteReason::Followed(status));
    }

    let chapters = titles.get(&item.id).map_or(0, |t| t.chapters.len());
    if chapters >= config.chapters_per_title_threshold as usize {
        return Some(MuteReason::Seen { chapters });
    }

    None
}
