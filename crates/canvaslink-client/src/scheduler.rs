//! Delay scheduling behind a trait, so reconnect backoff can be driven and
//! cancelled deterministically in tests instead of chaining raw timers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A scheduled one-shot delay. `wait` resolves `true` when the delay fires
/// and `false` when it was cancelled first.
pub struct ScheduledDelay {
    token: CancellationToken,
    fut: BoxFuture<'static, bool>,
}

impl ScheduledDelay {
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn wait(self) -> bool {
        self.fut.await
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, after: Duration) -> ScheduledDelay;
}

/// Wall-clock scheduler backed by tokio timers.
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, after: Duration) -> ScheduledDelay {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let fut = async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => true,
                _ = cancelled.cancelled() => false,
            }
        }
        .boxed();
        ScheduledDelay { token, fut }
    }
}

/// Deterministic scheduler: delays fire only when `fire_next` is called.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<ManualEntry>>,
}

struct ManualEntry {
    after: Duration,
    trigger: oneshot::Sender<()>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Durations of the delays scheduled so far that have not been fired.
    pub fn scheduled(&self) -> Vec<Duration> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.after)
            .collect()
    }

    /// Fire the oldest pending delay. Returns false when nothing is pending.
    pub fn fire_next(&self) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        entry.trigger.send(()).is_ok()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, after: Duration) -> ScheduledDelay {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let (trigger, fired) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .push(ManualEntry { after, trigger });
        let fut = async move {
            tokio::select! {
                _ = cancelled.cancelled() => false,
                result = fired => result.is_ok(),
            }
        }
        .boxed();
        ScheduledDelay { token, fut }
    }
}
