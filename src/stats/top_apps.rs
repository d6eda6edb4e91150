//! Applications ranked by request count over a sliding window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::lifecycle::ticker::Ticker;
use crate::stats::heap::{Arena, HeapOrder, IndexedHeap};
use crate::stats::unix_secs;

/// Default interval between top-apps trims.
pub const TOP_APPS_TRIM_INTERVAL: Duration = Duration::from_secs(10);
/// Default window the top apps report counts over.
pub const TOP_APPS_ENTRY_LIFETIME: Duration = Duration::from_secs(60);

/// Requests counted within one unix second.
#[derive(Debug, Clone, Copy)]
struct TimeSlot {
    t: i64,
    n: i64,
}

#[derive(Debug)]
struct Entry {
    application_id: String,
    slots: VecDeque<TimeSlot>,
    total: i64,
}

impl Entry {
    fn mark(&mut self, t: i64) {
        match self.slots.back_mut() {
            Some(slot) if slot.t >= t => slot.n += 1,
            _ => self.slots.push_back(TimeSlot { t, n: 1 }),
        }
        self.total += 1;
    }

    /// Drop slots up to and including `t`.
    fn trim(&mut self, t: i64) {
        while let Some(slot) = self.slots.front() {
            if slot.t > t {
                break;
            }
            self.total -= slot.n;
            self.slots.pop_front();
        }
    }

    fn first_mark(&self) -> i64 {
        self.slots.front().map_or(i64::MAX, |s| s.t)
    }
}

struct ByFirstMark;

impl HeapOrder<Entry> for ByFirstMark {
    fn less(a: &Entry, b: &Entry) -> bool {
        a.first_mark() < b.first_mark()
    }
}

struct ByRequests;

impl HeapOrder<Entry> for ByRequests {
    fn less(a: &Entry, b: &Entry) -> bool {
        a.total > b.total
    }
}

/// One row of a ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopAppsEntry {
    pub application_id: String,
    pub requests: i64,
}

#[derive(Default)]
struct Inner {
    by_app: HashMap<String, usize>,
    entries: Arena<Entry>,
    by_first_mark: IndexedHeap<Entry, ByFirstMark>,
    by_requests: IndexedHeap<Entry, ByRequests>,
}

impl Inner {
    fn trim(&mut self, t: i64) {
        while let Some(id) = self.by_first_mark.peek() {
            let entry = match self.entries.get_mut(id) {
                Some(entry) => entry,
                None => break,
            };
            if entry.first_mark() > t {
                break;
            }

            entry.trim(t);
            if entry.slots.is_empty() {
                self.by_first_mark.pop(&self.entries);
                self.by_requests.remove(&self.entries, id);
                if let Some(entry) = self.entries.remove(id) {
                    self.by_app.remove(&entry.application_id);
                }
            } else {
                self.by_first_mark.fix(&self.entries, id);
                self.by_requests.fix(&self.entries, id);
            }
        }
    }
}

/// Per-application request counts bucketed by second.
#[derive(Default)]
pub struct TopApps {
    inner: Mutex<Inner>,
}

impl TopApps {
    /// Empty request counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `application_id` at `at`.
    pub fn mark(&self, application_id: &str, at: SystemTime) {
        let t = unix_secs(at);
        let mut guard = self.inner.lock().expect("top apps mutex poisoned");
        let inner = &mut *guard;

        let id = match inner.by_app.get(application_id) {
            Some(&id) => id,
            None => {
                let id = inner.entries.insert(Entry {
                    application_id: application_id.to_string(),
                    slots: VecDeque::new(),
                    total: 0,
                });
                inner.by_app.insert(application_id.to_string(), id);
                id
            }
        };

        if let Some(entry) = inner.entries.get_mut(id) {
            entry.mark(t);
        }

        if inner.by_first_mark.contains(id) {
            inner.by_first_mark.fix(&inner.entries, id);
            inner.by_requests.fix(&inner.entries, id);
        } else {
            inner.by_first_mark.push(&inner.entries, id);
            inner.by_requests.push(&inner.entries, id);
        }
    }

    /// Discard counts recorded at or before `cutoff`.
    pub fn trim(&self, cutoff: SystemTime) {
        let t = unix_secs(cutoff);
        self.inner.lock().expect("top apps mutex poisoned").trim(t);
    }

    /// The `n` busiest applications counting requests from `since` onward.
    pub fn top_since(&self, since: SystemTime, n: usize) -> Vec<TopAppsEntry> {
        let t = unix_secs(since) - 1;
        let mut inner = self.inner.lock().expect("top apps mutex poisoned");
        inner.trim(t);

        let mut snapshot = inner.by_requests.clone();
        let mut top = Vec::with_capacity(n.min(snapshot.len()));
        while top.len() < n {
            let Some(id) = snapshot.pop(&inner.entries) else {
                break;
            };
            if let Some(entry) = inner.entries.get(id) {
                top.push(TopAppsEntry {
                    application_id: entry.application_id.clone(),
                    requests: entry.total,
                });
            }
        }
        top
    }

    /// Number of applications currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("top apps mutex poisoned").by_app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically discard counts older than `lifetime`.
    pub fn start_trimming(self: &Arc<Self>, interval: Duration, lifetime: Duration) -> Ticker {
        let apps = Arc::clone(self);
        Ticker::start("top_apps_trim", interval, move || {
            apps.trim_older_than(SystemTime::now(), lifetime);
        })
    }

    /// Trim everything older than `lifetime` as of `now`. A lifetime that
    /// reaches back past the earliest representable time trims nothing.
    pub fn trim_older_than(&self, now: SystemTime, lifetime: Duration) {
        if let Some(cutoff) = now.checked_sub(lifetime) {
            self.trim(cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn top(apps: &TopApps, since: u64, n: usize) -> Vec<(String, i64)> {
        apps.top_since(at(since), n)
            .into_iter()
            .map(|e| (e.application_id, e.requests))
            .collect()
    }

    #[test]
    fn test_ranking_by_count() {
        let apps = TopApps::new();
        for _ in 0..5 {
            apps.mark("x", at(100));
        }
        for _ in 0..2 {
            apps.mark("y", at(100));
        }

        assert_eq!(top(&apps, 100, 2), vec![("x".to_string(), 5), ("y".to_string(), 2)]);
        assert_eq!(top(&apps, 100, 1), vec![("x".to_string(), 5)]);
        // Asking again yields the same ranking; the snapshot was private.
        assert_eq!(top(&apps, 100, 10), vec![("x".to_string(), 5), ("y".to_string(), 2)]);
    }

    #[test]
    fn test_trim_expires_slots() {
        let apps = TopApps::new();
        apps.mark("a", at(1));
        apps.mark("a", at(2));
        apps.mark("a", at(2));
        apps.mark("b", at(3));

        apps.trim(at(1));
        assert_eq!(top(&apps, 0, 5), vec![("a".to_string(), 2), ("b".to_string(), 1)]);

        apps.trim(at(2));
        assert_eq!(top(&apps, 0, 5), vec![("b".to_string(), 1)]);
        assert_eq!(apps.len(), 1);

        apps.trim(at(3));
        assert!(apps.is_empty());
    }

    #[test]
    fn test_trim_older_than_lifetime() {
        let apps = TopApps::new();
        apps.mark("old", at(50));
        apps.mark("new", at(95));

        apps.trim_older_than(at(100), Duration::MAX);
        assert_eq!(apps.len(), 2);

        apps.trim_older_than(at(100), Duration::from_secs(10));
        assert_eq!(top(&apps, 0, 5), vec![("new".to_string(), 1)]);
    }

    #[test]
    fn test_top_since_decays_old_requests() {
        let apps = TopApps::new();
        for _ in 0..10 {
            apps.mark("old", at(10));
        }
        for _ in 0..3 {
            apps.mark("new", at(20));
        }

        assert_eq!(top(&apps, 10, 5), vec![("old".to_string(), 10), ("new".to_string(), 3)]);
        assert_eq!(top(&apps, 11, 5), vec![("new".to_string(), 3)]);
    }

    #[test]
    fn test_ranking_follows_new_marks() {
        let apps = TopApps::new();
        apps.mark("a", at(5));
        apps.mark("a", at(5));
        apps.mark("b", at(5));
        assert_eq!(top(&apps, 5, 1), vec![("a".to_string(), 2)]);

        apps.mark("b", at(6));
        apps.mark("b", at(6));
        assert_eq!(top(&apps, 5, 2), vec![("b".to_string(), 3), ("a".to_string(), 2)]);
    }
}
