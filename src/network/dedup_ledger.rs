//! Event deduplication ledger.
//!
//! Remembers which event ids this node has seen and which sources delivered
//! them. Every entry lives for a fixed window from its first sighting; later
//! sightings add sources but never push the deadline out, so memory is bounded
//! by (events per window x sources per event).
//!
//! Expiry is driven by one timer task per entry. Lookups also compare against
//! the stored deadline, so an entry is absent from the instant its window
//! closes even if the timer task has not been scheduled yet.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

struct LedgerEntry {
    sources: HashSet<String>,
    deadline: Instant,
    timer: Option<AbortHandle>,
}

impl LedgerEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

type Entries = Mutex<HashMap<String, LedgerEntry>>;

/// Time-bounded memory of `event id -> sources`. Cheap to clone; clones share
/// the same ledger.
#[derive(Clone)]
pub struct DedupLedger {
    entries: Arc<Entries>,
    window: Duration,
}

impl DedupLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record that `source` delivered `event_id`.
    /// Returns true if this call created the entry (first sighting).
    pub fn record_seen(&self, event_id: &str, source: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let first_sighting = !entries.get(event_id).is_some_and(|e| e.is_live(now));

        if first_sighting {
            let deadline = now + self.window;
            let timer = self.schedule_expiry(event_id.to_string(), deadline);
            let fresh = LedgerEntry {
                sources: HashSet::new(),
                deadline,
                timer,
            };
            // A stale entry whose timer hasn't run yet gets replaced
            if let Some(stale) = entries.insert(event_id.to_string(), fresh) {
                if let Some(timer) = stale.timer {
                    timer.abort();
                }
            }
            debug!("📒 New ledger entry {} (source: {})", event_id, source);
        }

        if let Some(entry) = entries.get_mut(event_id) {
            entry.sources.insert(source.to_string());
        }

        first_sighting
    }

    /// True if `source` is among the sources that delivered `event_id`.
    pub fn has_seen_from(&self, event_id: &str, source: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(event_id)
            .is_some_and(|e| e.is_live(now) && e.sources.contains(source))
    }

    pub fn contains(&self, event_id: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(event_id)
            .is_some_and(|e| e.is_live(now))
    }

    /// Sources recorded for `event_id`, sorted for stable output.
    pub fn sources(&self, event_id: &str) -> Option<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let entry = entries.get(event_id).filter(|e| e.is_live(now))?;
        let mut sources: Vec<String> = entry.sources.iter().cloned().collect();
        sources.sort();
        Some(sources)
    }

    /// Remove an entry now, cancelling its pending timer.
    /// Returns true if an entry was removed.
    pub fn expire(&self, event_id: &str) -> bool {
        match self.entries.lock().remove(event_id) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose window has closed. Only needed when entries were
    /// recorded outside a tokio runtime (no timer task could be spawned).
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    fn schedule_expiry(&self, event_id: String, deadline: Instant) -> Option<AbortHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let entries = Arc::downgrade(&self.entries);
        let task = handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            remove_if_due(&entries, &event_id);
        });
        Some(task.abort_handle())
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries.lock().len()
    }
}

fn remove_if_due(entries: &Weak<Entries>, event_id: &str) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let mut entries = entries.lock();
    // A replaced entry carries a later deadline; leave it for its own timer
    if entries
        .get(event_id)
        .is_some_and(|e| !e.is_live(Instant::now()))
    {
        entries.remove(event_id);
        debug!("🧹 Ledger entry {} expired", event_id);
    }
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::constants::ledger::WINDOW_SECS))
    }
}
