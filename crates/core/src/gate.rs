use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::OrchestratorError;

/// Poll granularity for gate waits.  The stop flag is re-checked at least
/// this often while blocked.
const GATE_POLL: Duration = Duration::from_millis(500);

/// Cooperative cancellation shared by an orchestrator and its owner.
/// Every await site checks the flag; long waits also listen on the notify.
#[derive(Default)]
pub struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// A one-shot resolution slot another task fills while the orchestrator
/// blocks: plan approval (`bool`) and user assistance (the chosen option).
pub struct Gate<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Gate<T> {
    fn default() -> Self {
        Self { slot: Mutex::new(None), notify: Notify::new() }
    }
}

impl<T> Gate<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, value: T) {
        *self.slot.lock().expect("gate lock poisoned") = Some(value);
        self.notify.notify_waiters();
    }

    /// Discard any unconsumed resolution (e.g. when a turn is torn down).
    pub fn reset(&self) {
        *self.slot.lock().expect("gate lock poisoned") = None;
    }

    fn take(&self) -> Option<T> {
        self.slot.lock().expect("gate lock poisoned").take()
    }

    /// Block until resolved, stopped, or timed out, re-checking the stop
    /// flag at ≤500 ms granularity.
    pub async fn wait(&self, stop: &StopSignal, timeout: Duration) -> Result<T, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.take() {
                return Ok(value);
            }
            if stop.is_stopped() {
                return Err(OrchestratorError::Stopped);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = stop.notified() => {}
                _ = tokio::time::sleep(GATE_POLL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn gate_resolves_from_another_task() {
        let gate = Arc::new(Gate::<bool>::new());
        let stop = StopSignal::new();
        let resolver = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(true);
        });
        let value = gate.wait(&stop, Duration::from_secs(5)).await.unwrap();
        assert!(value);
    }

    #[tokio::test]
    async fn gate_sees_resolution_before_wait_starts() {
        let gate = Gate::<u32>::new();
        gate.resolve(7);
        let stop = StopSignal::new();
        assert_eq!(gate.wait(&stop, Duration::from_secs(1)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn stop_interrupts_the_wait() {
        let gate = Arc::new(Gate::<bool>::new());
        let stop = Arc::new(StopSignal::new());
        let stop2 = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop2.trigger();
        });
        let err = gate.wait(&stop, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Stopped));
    }

    #[tokio::test]
    async fn timeout_elapses_without_resolution() {
        let gate = Gate::<bool>::new();
        let stop = StopSignal::new();
        let err = gate.wait(&stop, Duration::from_millis(600)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout));
    }

    #[tokio::test]
    async fn double_stop_is_idempotent() {
        let stop = StopSignal::new();
        stop.trigger();
        stop.trigger();
        assert!(stop.is_stopped());
    }
}
