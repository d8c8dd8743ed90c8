use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - stop taking new work, let in-flight sends and replies finish
/// 3. Terminated - every tracked task has stopped, or the drain period ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Manages graceful shutdown with drain period
#[derive(Debug)]
pub struct ShutdownManager {
    state: watch::Sender<ShutdownState>,

    drain_period: Duration,

    /// When draining gives up; set by [`start_drain`](Self::start_drain)
    drain_deadline: Mutex<Option<Instant>>,

    /// Long-running tasks that have not finished yet
    active_tasks: AtomicU64,
}

impl ShutdownManager {
    pub fn new(drain_period: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);

        Arc::new(Self {
            state,
            drain_period,
            drain_deadline: Mutex::new(None),
            active_tasks: AtomicU64::new(0),
        })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Start draining (called on SIGTERM/SIGINT)
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }

        *self.drain_deadline.lock() = Some(Instant::now() + self.drain_period);

        info!(
            drain_period_secs = self.drain_period.as_secs(),
            active_tasks = self.active_tasks(),
            "starting graceful shutdown drain"
        );

        self.state.send_replace(ShutdownState::Draining);

        if self.active_tasks() == 0 {
            self.terminate();
        }
    }

    pub fn drain_deadline(&self) -> Option<Instant> {
        *self.drain_deadline.lock()
    }

    /// Whether draining is over: nothing is left running or the deadline passed.
    pub fn drain_expired(&self) -> bool {
        if self.state() != ShutdownState::Draining {
            return self.state() == ShutdownState::Terminated;
        }

        if self.active_tasks() == 0 {
            return true;
        }

        self.drain_deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Complete shutdown
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }

        let active = self.active_tasks();
        if active > 0 {
            warn!(active_tasks = active, "force terminating with tasks still running");
        }

        info!("shutdown complete");
        self.state.send_replace(ShutdownState::Terminated);
    }

    /// Wait until the state reaches [`ShutdownState::Terminated`].
    pub async fn terminated(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only ends on Terminated.
        let _ = rx.wait_for(|state| *state == ShutdownState::Terminated).await;
    }

    /// Track a long-running task. The returned guard keeps the drain open
    /// until it is dropped; `None` once shutdown has begun.
    pub fn track(self: &Arc<Self>, name: &'static str) -> Option<TaskGuard> {
        if !self.is_accepting() {
            return None;
        }

        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        debug!(task = name, "task started");
        Some(TaskGuard {
            manager: self.clone(),
            name,
        })
    }

    fn task_finished(&self, name: &'static str) {
        let prev = self.active_tasks.fetch_sub(1, Ordering::SeqCst);
        debug!(task = name, remaining = prev - 1, "task finished");

        // Last task out ends the drain
        if self.state() == ShutdownState::Draining && prev == 1 {
            self.terminate();
        }
    }

    /// Get active task count
    pub fn active_tasks(&self) -> u64 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Check if new work is accepted
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }
}

/// Marks one tracked task as running.
#[derive(Debug)]
pub struct TaskGuard {
    manager: Arc<ShutdownManager>,
    name: &'static str,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.manager.task_finished(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state_machine() {
        let manager = ShutdownManager::new(Duration::from_secs(30));

        assert_eq!(manager.state(), ShutdownState::Running);
        assert!(manager.is_accepting());

        let guard = manager.track("router").unwrap();
        assert_eq!(manager.active_tasks(), 1);

        manager.start_drain();
        assert_eq!(manager.state(), ShutdownState::Draining);
        assert!(!manager.is_accepting());
        assert!(!manager.drain_expired());

        // No new tasks during drain
        assert!(manager.track("webhook").is_none());

        // Last task finishing terminates
        drop(guard);
        assert_eq!(manager.state(), ShutdownState::Terminated);
        assert!(manager.drain_expired());
    }

    #[test]
    fn test_drain_without_tasks_terminates() {
        let manager = ShutdownManager::new(Duration::from_secs(30));
        manager.start_drain();
        assert_eq!(manager.state(), ShutdownState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_deadline() {
        let manager = ShutdownManager::new(Duration::from_secs(5));
        let _guard = manager.track("router").unwrap();

        manager.start_drain();
        assert!(!manager.drain_expired());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.drain_expired());
    }

    #[tokio::test]
    async fn test_terminated_wakes_waiters() {
        let manager = ShutdownManager::new(Duration::from_secs(5));
        let guard = manager.track("router").unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.terminated().await })
        };

        manager.start_drain();
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(manager.state(), ShutdownState::Terminated);
    }

    #[tokio::test]
    async fn test_state_changes_without_subscribers() {
        let manager = ShutdownManager::new(Duration::from_secs(5));

        manager.start_drain();
        assert_eq!(manager.state(), ShutdownState::Terminated);

        // Subscribing after the fact still observes the final state.
        assert_eq!(*manager.subscribe().borrow(), ShutdownState::Terminated);
        tokio::time::timeout(Duration::from_secs(1), manager.terminated())
            .await
            .expect("terminated() should return immediately");
    }
}
