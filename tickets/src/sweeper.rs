//! Background ticket sweeper.
//!
//! Periodically evicts expired, orphaned and corrupt tickets so the registry
//! stays bounded even when tickets are never read again. Sweeps are
//! idempotent, so several nodes may run one against the same backend without
//! coordination.
//!
//! # Example
//!
//! ```ignore
//! let handle = TicketSweeper::new(registry, SweepConfig::default()).spawn();
//!
//! // On shutdown:
//! if let Some(handle) = handle {
//!     handle.shutdown().await;
//! }
//! ```

use crate::config::SweepConfig;
use crate::error::Result;
use crate::providers::TicketStorage;
use crate::registry::TicketRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Recurring sweep over a registry.
pub struct TicketSweeper<S> {
    registry: TicketRegistry<S>,
    config: SweepConfig,
}

impl<S: TicketStorage + 'static> TicketSweeper<S> {
    /// Create a sweeper.
    #[must_use]
    pub const fn new(registry: TicketRegistry<S>, config: SweepConfig) -> Self {
        Self { registry, config }
    }

    /// Run one sweep now.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn run_once(&self) -> Result<usize> {
        self.registry.sweep().await
    }

    /// Start sweeping on the current tokio runtime.
    ///
    /// Returns `None` when sweeping is disabled.
    #[must_use]
    pub fn spawn(self) -> Option<SweeperHandle> {
        if !self.config.enabled {
            tracing::info!("Ticket sweeper disabled");
            return None;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));

        Some(SweeperHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            start_delay_ms = u64::try_from(self.config.start_delay.as_millis()).unwrap_or(u64::MAX),
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "Ticket sweeper started"
        );

        tokio::select! {
            () = tokio::time::sleep(self.config.start_delay) => {}
            _ = shutdown.changed() => {
                tracing::info!("Ticket sweeper stopped before first run");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.registry.sweep().await {
                        Ok(removed) => {
                            tracing::debug!(removed = removed, "Scheduled ticket sweep finished");
                        }
                        Err(e) => {
                            // Next tick retries; sweeps converge.
                            metrics::counter!("tickets.sweeper.failed").increment(1);
                            tracing::warn!(error = %e, "Scheduled ticket sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Ticket sweeper stopped");
    }
}

/// Handle to a running sweeper.
///
/// Dropping the handle also stops the sweeper, at its next wake-up.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Whether the sweeper task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the sweeper and wait for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        // The receiver only disappears once the task has exited.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Ticket sweeper task panicked");
        }
    }
}
