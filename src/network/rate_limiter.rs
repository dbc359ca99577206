//! Per-handler rate gate.
//!
//! Two independent sliding-window logs per handler registration: one keyed by
//! caller address, one shared by every caller. A call at capacity is marked
//! limited and its timestamp is not recorded, so a flood does not extend its
//! own penalty.

use crate::constants::rate_limit::CLEANUP_INTERVAL_SECS;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Which axes tripped for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateDecision {
    pub ip_rate_limited: bool,
    pub rate_limited: bool,
}

impl RateDecision {
    pub fn is_limited(&self) -> bool {
        self.ip_rate_limited || self.rate_limited
    }
}

pub struct RateGate {
    window: Duration,
    ip_limit: Option<usize>,
    global_limit: Option<usize>,
    per_source: HashMap<String, VecDeque<Instant>>,
    global: VecDeque<Instant>,
    last_cleanup: Instant,
}

impl RateGate {
    /// `None` or `Some(0)` leaves that axis unbounded.
    pub fn new(window: Duration, ip_limit: Option<u32>, global_limit: Option<u32>) -> Self {
        Self {
            window,
            ip_limit: ip_limit.filter(|&n| n > 0).map(|n| n as usize),
            global_limit: global_limit.filter(|&n| n > 0).map(|n| n as usize),
            per_source: HashMap::new(),
            global: VecDeque::new(),
            last_cleanup: Instant::now(),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.ip_limit.is_none() && self.global_limit.is_none()
    }

    /// Evaluate both axes for one call from `caller`. Both axes are always
    /// evaluated, even when the first one trips.
    pub fn check(&mut self, caller: &str) -> RateDecision {
        let now = Instant::now();
        let window = self.window;

        // Sweep idle callers (prevents unbounded growth of the per-source map)
        if now.duration_since(self.last_cleanup) > Duration::from_secs(CLEANUP_INTERVAL_SECS) {
            self.per_source.retain(|_, hits| {
                prune(hits, now, window);
                !hits.is_empty()
            });
            self.last_cleanup = now;
        }

        let mut decision = RateDecision::default();

        if let Some(max) = self.ip_limit {
            let hits = self.per_source.entry(caller.to_string()).or_default();
            decision.ip_rate_limited = !admit(hits, now, window, max);
        }

        if let Some(max) = self.global_limit {
            decision.rate_limited = !admit(&mut self.global, now, window, max);
        }

        decision
    }

    /// Hits currently counted against `caller`.
    pub fn source_hits(&self, caller: &str) -> usize {
        let now = Instant::now();
        self.per_source
            .get(caller)
            .map(|hits| {
                hits.iter()
                    .filter(|&&ts| now.duration_since(ts) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn global_hits(&self) -> usize {
        let now = Instant::now();
        self.global
            .iter()
            .filter(|&&ts| now.duration_since(ts) < self.window)
            .count()
    }

    pub fn tracked_sources(&self) -> usize {
        self.per_source.len()
    }
}

fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while hits
        .front()
        .is_some_and(|&ts| now.duration_since(ts) >= window)
    {
        hits.pop_front();
    }
}

/// Records `now` and returns true if below `max`, otherwise leaves the log
/// untouched and returns false.
fn admit(hits: &mut VecDeque<Instant>, now: Instant, window: Duration, max: usize) -> bool {
    prune(hits, now, window);
    if hits.len() >= max {
        false
    } else {
        hits.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_ip_limit_allows_first_n() {
        let mut gate = RateGate::new(WINDOW, Some(3), None);

        for _ in 0..3 {
            assert!(!gate.check("10.0.0.1").is_limited());
        }
        let fourth = gate.check("10.0.0.1");
        assert!(fourth.ip_rate_limited);
        assert!(!fourth.rate_limited);

        // Rejected call was not recorded
        assert_eq!(gate.source_hits("10.0.0.1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_limit_is_per_source() {
        let mut gate = RateGate::new(WINDOW, Some(1), None);

        assert!(!gate.check("10.0.0.1").is_limited());
        assert!(!gate.check("10.0.0.2").is_limited());
        assert!(gate.check("10.0.0.1").ip_rate_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let mut gate = RateGate::new(WINDOW, Some(2), None);

        gate.check("a");
        tokio::time::advance(Duration::from_secs(30)).await;
        gate.check("a");
        assert!(gate.check("a").ip_rate_limited);

        // First hit ages out, second is still inside the window
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!gate.check("a").is_limited());
        assert!(gate.check("a").ip_rate_limited);

        tokio::time::advance(WINDOW).await;
        assert!(!gate.check("a").is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_window_recovers() {
        let mut gate = RateGate::new(WINDOW, None, Some(3));

        for caller in ["a", "b", "c"] {
            assert!(!gate.check(caller).is_limited());
        }
        assert!(gate.check("d").rate_limited);
        assert_eq!(gate.global_hits(), 3);

        tokio::time::advance(WINDOW).await;
        let decision = gate.check("d");
        assert!(!decision.rate_limited);
        assert!(!decision.ip_rate_limited);
        assert_eq!(gate.global_hits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_spans_sources() {
        let mut gate = RateGate::new(WINDOW, None, Some(2));

        assert!(!gate.check("a").is_limited());
        assert!(!gate.check("b").is_limited());
        let third = gate.check("c");
        assert!(third.rate_limited);
        assert!(!third.ip_rate_limited);
        assert_eq!(gate.global_hits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_axes_evaluated() {
        let mut gate = RateGate::new(WINDOW, Some(1), Some(2));

        assert!(!gate.check("a").is_limited());
        // Per-source trips, but the global log still records the call
        let second = gate.check("a");
        assert!(second.ip_rate_limited);
        assert!(!second.rate_limited);
        assert_eq!(gate.global_hits(), 2);

        let third = gate.check("a");
        assert!(third.ip_rate_limited && third.rate_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_means_unbounded() {
        let mut gate = RateGate::new(WINDOW, Some(0), Some(0));
        assert!(gate.is_unbounded());
        for _ in 0..100 {
            assert!(!gate.check("a").is_limited());
        }
        assert_eq!(gate.tracked_sources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sources_swept() {
        let mut gate = RateGate::new(Duration::from_secs(5), Some(1), None);
        gate.check("a");
        gate.check("b");
        assert_eq!(gate.tracked_sources(), 2);

        tokio::time::advance(Duration::from_secs(CLEANUP_INTERVAL_SECS + 1)).await;
        gate.check("c");
        assert_eq!(gate.tracked_sources(), 1);
    }
}
