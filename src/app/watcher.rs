//! Deferred expiry resolution: a one-shot task per payment plus a periodic
//! sweeper that recovers records whose task was lost to a restart.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Duration as TokioDuration, Instant};
use tracing::{debug, error, info, warn};

use super::service::PaymentService;

/// Expiry deadline for one payment record
#[derive(Debug, Clone)]
pub struct ExpiryJob {
    pub payment_id: String,
    pub deadline: DateTime<Utc>,
}

/// Handle the service uses to schedule one-shot expiry tasks.
///
/// Scheduling is decoupled from execution through a channel so the service
/// never holds a reference to its own watcher. A send into a closed channel
/// is harmless: the sweeper still guarantees termination.
#[derive(Clone)]
pub struct ExpiryScheduler {
    tx: mpsc::UnboundedSender<ExpiryJob>,
}

impl ExpiryScheduler {
    /// Scheduler paired with the receiver a watcher loop consumes.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExpiryJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Scheduler with no watcher attached; scheduled jobs are dropped and the
    /// sweeper remains the only expiry path. Intended for tests.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn schedule(&self, payment_id: String, deadline: DateTime<Utc>) {
        if self
            .tx
            .send(ExpiryJob {
                payment_id,
                deadline,
            })
            .is_err()
        {
            debug!("Expiry watcher not running, record left to the sweeper");
        }
    }
}

/// Spawns the watcher loop that turns scheduled jobs into one-shot deferred
/// tasks, each firing at its payment's exact deadline.
pub fn spawn_expiry_watcher(
    service: Arc<PaymentService>,
    mut jobs: mpsc::UnboundedReceiver<ExpiryJob>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!("Expiry watcher started");
        let mut shutdown = shutdown_rx;
        loop {
            tokio::select! {
                job = jobs.recv() => {
                    match job {
                        Some(job) => {
                            let service = Arc::clone(&service);
                            tokio::spawn(run_expiry_task(service, job));
                        }
                        None => {
                            info!("Expiry job channel closed, watcher stopping");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Expiry watcher shutting down");
                        break;
                    }
                }
            }
        }
    });

    (handle, shutdown_tx)
}

async fn run_expiry_task(service: Arc<PaymentService>, job: ExpiryJob) {
    // A past deadline converts to a zero delay and fires immediately.
    let delay = (job.deadline - Utc::now()).to_std().unwrap_or_default();
    sleep_until(Instant::now() + delay).await;

    if let Err(e) = service.resolve_expiry(&job.payment_id).await {
        error!(id = %job.payment_id, error = ?e, "Expiry resolution failed, sweeper will retry");
    }
}

/// Sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Maximum overdue records resolved per sweep
    pub batch_size: i64,
    /// Disable to rely on one-shot tasks alone
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 50,
            enabled: true,
        }
    }
}

/// Spawns the periodic sweep resolving overdue `pending` payments whose
/// one-shot task never fired (in-process tasks do not survive a restart).
pub fn spawn_sweeper(
    config: SweeperConfig,
    service: Arc<PaymentService>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        if !config.enabled {
            info!("Expiry sweeper disabled");
            return;
        }

        info!(
            interval_secs = config.interval_secs,
            batch_size = config.batch_size,
            "Expiry sweeper started"
        );

        let mut ticker = interval(TokioDuration::from_secs(config.interval_secs));
        let mut shutdown = shutdown_rx;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match service.sweep_expired(config.batch_size).await {
                        Ok(0) => {}
                        Ok(count) => debug!(count = count, "Sweep resolved overdue payments"),
                        Err(e) => warn!(error = ?e, "Sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Expiry sweeper shutting down");
                        break;
                    }
                }
            }
        }
    });

    (handle, shutdown_tx)
}
