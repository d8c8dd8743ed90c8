use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::telemetry::counters;

use super::shutdown::ShutdownState;

/// Exponential backoff between restarts, capped at `max_backoff`.
fn backoff(config: &SupervisorConfig, restarts: u32) -> Duration {
    let initial = u64::try_from(config.initial_backoff.as_millis()).unwrap_or(u64::MAX);
    let delay = initial.saturating_mul(2u64.saturating_pow(restarts));
    let capped = delay.min(config.max_backoff.as_millis() as u64);
    Duration::from_millis(capped)
}

fn running(shutdown_rx: &watch::Receiver<ShutdownState>) -> bool {
    *shutdown_rx.borrow() == ShutdownState::Running
}

/// Run `factory`'s task until shutdown, restarting it whenever it panics,
/// fails or returns while the process is still running.
///
/// A task that stayed up for longer than `max_backoff` restarts with the
/// initial delay again.
pub async fn supervise<F, Fut>(
    name: &'static str,
    config: SupervisorConfig,
    mut shutdown_rx: watch::Receiver<ShutdownState>,
    mut factory: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut restarts: u32 = 0;

    loop {
        let started = Instant::now();
        let outcome = tokio::spawn(factory()).await;

        if !running(&shutdown_rx) {
            if let Err(e) = &outcome {
                warn!(task = name, error = %e, "task failed during shutdown");
            }
            break;
        }

        match outcome {
            Ok(Ok(())) => warn!(task = name, "task exited unexpectedly"),
            Ok(Err(e)) => error!(task = name, error = %e, "task failed"),
            Err(e) if e.is_panic() => error!(task = name, "task panicked"),
            Err(e) => error!(task = name, error = %e, "task aborted"),
        }

        if started.elapsed() > config.max_backoff {
            restarts = 0;
        }
        let delay = backoff(&config, restarts);
        restarts = restarts.saturating_add(1);

        info!(task = name, delay_ms = delay.as_millis() as u64, "restarting task");
        counters::task_restarted(name);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.wait_for(|state| *state != ShutdownState::Running) => break,
        }
    }

    info!(task = name, "supervised task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = config();
        assert_eq!(backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff(&config, 10), Duration::from_secs(1));
        assert_eq!(backoff(&config, u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_long_restart_streak() {
        let config = config();
        for restarts in 50..70 {
            assert_eq!(backoff(&config, restarts), Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_panic() {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        let runs = Arc::new(AtomicU32::new(0));

        let task = {
            let runs = runs.clone();
            let rx = rx.clone();
            tokio::spawn(supervise("test", config(), rx.clone(), move || {
                let runs = runs.clone();
                let mut rx = rx.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run fails");
                    }
                    let _ = rx.wait_for(|s| *s != ShutdownState::Running).await;
                    Ok::<(), anyhow::Error>(())
                }
            }))
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        tx.send(ShutdownState::Draining).unwrap();
        task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_restart_after_shutdown() {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        let runs = Arc::new(AtomicU32::new(0));

        let task = {
            let runs = runs.clone();
            let rx = rx.clone();
            tokio::spawn(supervise("test", config(), rx.clone(), move || {
                runs.fetch_add(1, Ordering::SeqCst);
                let mut rx = rx.clone();
                async move {
                    let _ = rx.wait_for(|s| *s != ShutdownState::Running).await;
                    Err::<(), _>(anyhow::anyhow!("stopped"))
                }
            }))
        };

        tokio::task::yield_now().await;
        tx.send(ShutdownState::Draining).unwrap();
        task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
