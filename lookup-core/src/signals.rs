//! One-shot completion flags shared between the intercept router and the
//! capture flow of a single task.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{CaptureError, CaptureResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSignal {
    Profile,
    Tweets,
    Followers,
    Following,
}

impl CaptureSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureSignal::Profile => "profile",
            CaptureSignal::Tweets => "tweets",
            CaptureSignal::Followers => "followers",
            CaptureSignal::Following => "following",
        }
    }
}

impl fmt::Display for CaptureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals raised so far for one task. Each goes false -> true at most once.
#[derive(Debug, Clone)]
pub struct CompletionSignals {
    tx: Arc<watch::Sender<HashSet<CaptureSignal>>>,
}

impl Default for CompletionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignals {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HashSet::new());
        Self { tx: Arc::new(tx) }
    }

    /// Raise `signal`. Returns `true` only for the call that flipped it.
    pub fn fire(&self, signal: CaptureSignal) -> bool {
        self.tx.send_if_modified(|raised| raised.insert(signal))
    }

    pub fn is_set(&self, signal: CaptureSignal) -> bool {
        self.tx.borrow().contains(&signal)
    }

    /// Suspend until `signal` is raised, `deadline` elapses or `cancel` trips.
    pub async fn wait(
        &self,
        signal: CaptureSignal,
        deadline: Duration,
        cancel: &CancellationFlag,
    ) -> CaptureResult<()> {
        let mut rx = self.tx.subscribe();
        let raised = async {
            // The sender lives in `self`, so `wait_for` can only end by matching.
            let _ = rx.wait_for(|raised| raised.contains(&signal)).await;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CaptureError::Cancelled),
            outcome = tokio::time::timeout(deadline, raised) => match outcome {
                Ok(()) => Ok(()),
                Err(_) => Err(CaptureError::CaptureTimeout { signal, waited: deadline }),
            },
        }
    }
}

/// Cooperative cancellation for one task.
#[derive(Debug, Clone)]
pub struct CancellationFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fail with [`CaptureError::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> CaptureResult<()> {
        if self.is_cancelled() {
            Err(CaptureError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_flips_once() {
        let signals = CompletionSignals::new();
        assert!(!signals.is_set(CaptureSignal::Tweets));
        assert!(signals.fire(CaptureSignal::Tweets));
        assert!(!signals.fire(CaptureSignal::Tweets));
        assert!(signals.is_set(CaptureSignal::Tweets));
        assert!(!signals.is_set(CaptureSignal::Followers));
    }

    #[tokio::test]
    async fn wait_returns_when_signal_fires_later() {
        let signals = CompletionSignals::new();
        let cancel = CancellationFlag::new();
        let firing = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            firing.fire(CaptureSignal::Profile);
        });
        signals
            .wait(CaptureSignal::Profile, Duration::from_secs(2), &cancel)
            .await
            .expect("signal should arrive");
    }

    #[tokio::test]
    async fn wait_on_already_raised_signal_is_immediate() {
        let signals = CompletionSignals::new();
        signals.fire(CaptureSignal::Following);
        signals
            .wait(CaptureSignal::Following, Duration::from_millis(1), &CancellationFlag::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_signal_name() {
        let signals = CompletionSignals::new();
        let err = signals
            .wait(CaptureSignal::Tweets, Duration::from_secs(5), &CancellationFlag::new())
            .await
            .unwrap_err();
        match err {
            CaptureError::CaptureTimeout { signal, waited } => {
                assert_eq!(signal, CaptureSignal::Tweets);
                assert_eq!(waited, Duration::from_secs(5));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let signals = CompletionSignals::new();
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = signals
            .wait(CaptureSignal::Followers, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert!(cancel.checkpoint().is_err());
    }
}
