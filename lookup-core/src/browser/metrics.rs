use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub contexts_opened: u64,
    pub navigations: u64,
    pub navigation_timeouts: u64,
    pub screenshots: u64,
    pub responses_intercepted: u64,
}

/// Lock-free counters shared between a session and its contexts.
#[derive(Debug, Default)]
pub struct SessionCounters {
    contexts_opened: AtomicU64,
    navigations: AtomicU64,
    navigation_timeouts: AtomicU64,
    screenshots: AtomicU64,
    responses_intercepted: AtomicU64,
}

impl SessionCounters {
    pub fn record_context_open(&self) {
        self.contexts_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_navigation(&self, timed_out: bool) {
        self.navigations.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.navigation_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_screenshot(&self) {
        self.screenshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intercepted(&self) {
        self.responses_intercepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionMetrics {
        SessionMetrics {
            contexts_opened: self.contexts_opened.load(Ordering::Relaxed),
            navigations: self.navigations.load(Ordering::Relaxed),
            navigation_timeouts: self.navigation_timeouts.load(Ordering::Relaxed),
            screenshots: self.screenshots.load(Ordering::Relaxed),
            responses_intercepted: self.responses_intercepted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let counters = SessionCounters::default();
        counters.record_context_open();
        counters.record_navigation(false);
        counters.record_navigation(true);
        counters.record_screenshot();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.contexts_opened, 1);
        assert_eq!(snapshot.navigations, 2);
        assert_eq!(snapshot.navigation_timeouts, 1);
        assert_eq!(snapshot.screenshots, 1);
        assert_eq!(snapshot.responses_intercepted, 0);
    }
}
