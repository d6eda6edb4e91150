//! Applications that have recently received traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::lifecycle::ticker::Ticker;
use crate::stats::heap::{Arena, HeapOrder, IndexedHeap};
use crate::stats::unix_secs;

/// Default interval between active-apps trims.
pub const ACTIVE_APPS_TRIM_INTERVAL: Duration = Duration::from_secs(60);
/// Default idle time after which an app is no longer active.
pub const ACTIVE_APPS_ENTRY_LIFETIME: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Entry {
    application_id: String,
    /// Last mark, unix seconds.
    t: i64,
}

struct Oldest;

impl HeapOrder<Entry> for Oldest {
    fn less(a: &Entry, b: &Entry) -> bool {
        a.t < b.t
    }
}

struct Newest;

impl HeapOrder<Entry> for Newest {
    fn less(a: &Entry, b: &Entry) -> bool {
        a.t > b.t
    }
}

#[derive(Default)]
struct Inner {
    by_app: HashMap<String, usize>,
    entries: Arena<Entry>,
    oldest: IndexedHeap<Entry, Oldest>,
    newest: IndexedHeap<Entry, Newest>,
}

/// Tracks the most recent request time per application.
#[derive(Default)]
pub struct ActiveApps {
    inner: Mutex<Inner>,
}

impl ActiveApps {
    /// Empty set of active apps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for `application_id` at `at`. A mark older than the
    /// one already recorded is ignored.
    pub fn mark(&self, application_id: &str, at: SystemTime) {
        let t = unix_secs(at);
        let mut guard = self.inner.lock().expect("active apps mutex poisoned");
        let inner = &mut *guard;

        let existing = inner
            .by_app
            .get(application_id)
            .copied()
            .filter(|&id| inner.entries.get(id).is_some());

        match existing {
            Some(id) => {
                if let Some(entry) = inner.entries.get_mut(id).filter(|entry| entry.t < t) {
                    entry.t = t;
                    inner.oldest.fix(&inner.entries, id);
                    inner.newest.fix(&inner.entries, id);
                }
            }
            None => {
                let id = inner.entries.insert(Entry {
                    application_id: application_id.to_string(),
                    t,
                });
                inner.by_app.insert(application_id.to_string(), id);
                inner.oldest.push(&inner.entries, id);
                inner.newest.push(&inner.entries, id);
            }
        }
    }

    /// Forget every application last marked at or before `cutoff`.
    pub fn trim(&self, cutoff: SystemTime) {
        let t = unix_secs(cutoff);
        let mut guard = self.inner.lock().expect("active apps mutex poisoned");
        let inner = &mut *guard;

        while let Some(id) = inner.oldest.peek() {
            let stale = inner.entries.get(id).is_some_and(|e| e.t <= t);
            if !stale {
                break;
            }

            inner.oldest.pop(&inner.entries);
            inner.newest.remove(&inner.entries, id);
            if let Some(entry) = inner.entries.remove(id) {
                inner.by_app.remove(&entry.application_id);
            }
        }
    }

    /// Applications marked at or after `since`, most recently marked first.
    pub fn active_since(&self, since: SystemTime) -> Vec<String> {
        let t = unix_secs(since);
        let inner = self.inner.lock().expect("active apps mutex poisoned");

        let mut snapshot = inner.newest.clone();
        let mut apps = Vec::new();
        while let Some(id) = snapshot.pop(&inner.entries) {
            match inner.entries.get(id) {
                Some(entry) if entry.t >= t => apps.push(entry.application_id.clone()),
                _ => break,
            }
        }
        apps
    }

    /// Number of applications currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("active apps mutex poisoned").by_app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically drop applications idle for longer than `lifetime`.
    pub fn start_trimming(self: &Arc<Self>, interval: Duration, lifetime: Duration) -> Ticker {
        let apps = Arc::clone(self);
        Ticker::start("active_apps_trim", interval, move || {
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

    #[cfg(test)]
    fn heap_lens(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.oldest.len(), inner.newest.len())
    }
}
