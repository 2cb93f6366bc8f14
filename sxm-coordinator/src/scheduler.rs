//! The scheduler collaborator the watchdog depends on (spec §9): a
//! `one_shot(delay, callback) -> handle` plus `cancel(handle)`. The
//! coordinator only ever uses this contract; this module's `TokioScheduler`
//! is the one concrete implementation, built on `tokio::spawn` the same way
//! the teacher's snapshot scheduler runs its background loop.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An opaque handle to an armed one-shot timer. Encodes as a plain integer
/// when persisted (§6.1); in memory it also carries the means to cancel.
#[derive(Clone)]
pub struct ScheduledHandle {
    id: u64,
    cancel: CancellationToken,
}

impl ScheduledHandle {
    /// The opaque integer this handle would be persisted as (§6.1).
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for ScheduledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledHandle").field("id", &self.id).finish()
    }
}

type BoxedCallback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// `one_shot`/`cancel`, the only contract the mirror watchdog needs from a
/// task scheduler (spec §1, §9).
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn one_shot(&self, delay: Duration, callback: BoxedCallback) -> ScheduledHandle;
    fn cancel(&self, handle: &ScheduledHandle);
}

/// `tokio::spawn` + `tokio::time::sleep`-backed scheduler.
pub struct TokioScheduler {
    next_id: std::sync::atomic::AtomicU64,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn one_shot(&self, delay: Duration, callback: BoxedCallback) -> ScheduledHandle {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    callback().await;
                }
                _ = cancel_for_task.cancelled() => {}
            }
        });

        ScheduledHandle { id, cancel }
    }

    fn cancel(&self, handle: &ScheduledHandle) {
        handle.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_after_delay() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        scheduler.one_shot(
            Duration::from_millis(10),
            Box::new(move || {
                Box::pin(async move {
                    fired_clone.store(true, Ordering::SeqCst);
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let handle = scheduler.one_shot(
            Duration::from_millis(30),
            Box::new(move || {
                Box::pin(async move {
                    fired_clone.store(true, Ordering::SeqCst);
                })
            }),
        );
        scheduler.cancel(&handle);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
