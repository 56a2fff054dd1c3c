// Cancellable background loops
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backup;
use crate::config::Config;
use crate::health::HealthChecker;
use crate::state::Services;

/// Runs named jobs on fixed periods until shut down
pub struct Scheduler {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Run `job` every `period`, first after one full period. A failing run
    /// is logged and the loop goes on.
    pub fn spawn_every<F, Fut, E>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = job().await {
                            tracing::error!(job = name, error = %e, "Background job failed");
                        }
                    }
                }
            }
            tracing::debug!(job = name, "Background job stopped");
        });
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every loop and wait for them to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::warn!(job = name, error = %e, "Background job panicked");
            }
        }
    }
}

/// Register the escalation, auto-close, health and backup loops
pub fn start_jobs(
    config: &Config,
    services: Arc<Services>,
    health: Arc<HealthChecker>,
    data_dir: PathBuf,
) -> Scheduler {
    let schedule = &config.schedule;
    let mut scheduler = Scheduler::new();

    let s = services.clone();
    scheduler.spawn_every(
        "sla_escalation",
        Duration::from_secs(schedule.sla_scan_secs),
        move || {
            let s = s.clone();
            async move {
                let report = s.tickets.escalate_overdue().await?;
                if report.sent > 0 {
                    tracing::info!(sent = report.sent, "Overdue tickets escalated");
                }
                Ok::<_, crate::support::SupportError>(())
            }
        },
    );

    let s = services.clone();
    let days = config.support.auto_close_days;
    scheduler.spawn_every(
        "auto_close",
        Duration::from_secs(schedule.auto_close_secs),
        move || {
            let s = s.clone();
            async move {
                let closed = s.tickets.auto_close_stale(days).await?;
                for ticket in &closed {
                    s.sessions.end_dialogue(*ticket).await;
                }
                Ok::<_, crate::support::SupportError>(())
            }
        },
    );

    scheduler.spawn_every(
        "health",
        Duration::from_secs(schedule.health_secs),
        move || {
            let health = health.clone();
            async move {
                health.check().await;
                Ok::<_, std::convert::Infallible>(())
            }
        },
    );

    let keep = schedule.backup_keep;
    let dir = Config::backups_path(&data_dir);
    scheduler.spawn_every(
        "backup",
        Duration::from_secs(schedule.backup_secs),
        move || run_backup(services.clone(), dir.clone(), keep),
    );

    scheduler
}

/// Snapshot off the async runtime; also used for the final backup on shutdown
pub async fn run_backup(
    services: Arc<Services>,
    dir: PathBuf,
    keep: usize,
) -> Result<(), backup::BackupError> {
    let now = services.clock.now();
    let pool = services.db.clone();
    tokio::task::spawn_blocking(move || backup::write_snapshot(&pool, &dir, now, keep))
        .await
        .map_err(|e| backup::BackupError::Io(std::io::Error::other(e)))??;
    Ok(())
}
