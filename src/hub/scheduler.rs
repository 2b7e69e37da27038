//! Hub periodic tasks: session health sweep, cache sweep, outbox drain.
//!
//! Each task runs on its own interval. A failing (or panicking) run is logged
//! and the task simply waits for its next tick.

use super::Hub;
use anyhow::Result;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

pub fn spawn(hub: &Hub) -> Vec<JoinHandle<()>> {
    let config = hub.scheduler_config().clone();
    let shutdown = hub.shutdown_token();

    let health = {
        let hub = hub.clone();
        spawn_periodic(
            "health_sweep",
            config.health_interval(),
            shutdown.clone(),
            move || {
                let hub = hub.clone();
                async move {
                    let demoted = hub.health_sweep().await?;
                    if demoted > 0 {
                        tracing::info!(demoted, "Health sweep demoted sessions");
                    }
                    Ok(())
                }
            },
        )
    };

    let cache = {
        let hub = hub.clone();
        spawn_periodic(
            "cache_sweep",
            config.cache_sweep_interval(),
            shutdown.clone(),
            move || {
                let hub = hub.clone();
                async move {
                    hub.cache_sweep();
                    Ok(())
                }
            },
        )
    };

    let outbox = {
        let hub = hub.clone();
        let delay = config.queue_item_delay();
        let max_attempts = config.queue_max_attempts;
        spawn_periodic(
            "outbox_drain",
            config.queue_drain_interval(),
            shutdown,
            move || {
                let hub = hub.clone();
                async move {
                    let report = hub.drain_outbox(delay, max_attempts).await?;
                    if report.delivered + report.dropped > 0 {
                        tracing::info!(
                            delivered = report.delivered,
                            requeued = report.requeued,
                            dropped = report.dropped,
                            "Outbox drained"
                        );
                    }
                    Ok(())
                }
            },
        )
    };

    vec![health, cache, outbox]
}

/// Run `task` every `period`, first run one period from now. Missed ticks
/// are skipped, so a slow run never causes a burst of catch-up runs.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let period = period.max(Duration::from_millis(1));
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match tokio::spawn(task()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = name, "Scheduled task failed: {e:#}"),
                Err(e) => tracing::error!(task = name, "Scheduled task panicked: {e}"),
            }
        }
        tracing::debug!(task = name, "Scheduled task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn failing_task_keeps_its_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = spawn_periodic("flaky", Duration::from_secs(10), shutdown.clone(), {
            let runs = Arc::clone(&runs);
            move || {
                let runs = Arc::clone(&runs);
                async move {
                    let n = runs.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        anyhow::bail!("first run fails");
                    }
                    if n == 1 {
                        panic!("second run panics");
                    }
                    Ok(())
                }
            }
        });

        time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_waits_one_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let _handle = spawn_periodic("quiet", Duration::from_secs(60), shutdown.clone(), {
            let runs = Arc::clone(&runs);
            move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        time::sleep(Duration::from_secs(59)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        shutdown.cancel();
    }
}
