//! Cluster health supervision.
//!
//! Pings the cluster on a timer and signals a single-shot failed channel
//! after a configured number of consecutive failures. The lifecycle loop
//! selects on that channel to trigger graceful shutdown.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::ClusterClient;
use crate::config::HealthCheckConfig;

/// Periodic ping supervisor.
pub struct HealthCheck {
    config: HealthCheckConfig,
    client: Arc<ClusterClient>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl HealthCheck {
    /// Creates a stopped supervisor.
    #[must_use]
    pub fn new(config: HealthCheckConfig, client: Arc<ClusterClient>) -> Self {
        Self {
            config,
            client,
            cancel: Mutex::new(None),
        }
    }

    /// Starts the ping loop. `failed_tx` fires once after
    /// `config.attempts` consecutive failures; the loop then stops itself.
    /// Starting twice replaces the previous loop.
    pub fn start(&self, failed_tx: oneshot::Sender<()>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let client = Arc::clone(&self.client);
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a slow startup
            // is not counted as a failed ping.
            ticker.tick().await;

            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match client.ping().await {
                            Ok(()) => {
                                consecutive_failures = 0;
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                warn!(
                                    failures = consecutive_failures,
                                    attempts = config.attempts,
                                    error = %e,
                                    "health check ping failed"
                                );
                                if consecutive_failures >= config.attempts {
                                    error!("health check failed, giving up");
                                    let _ = failed_tx.send(());
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        info!("health check started");
    }

    /// Stops the ping loop. Idempotent.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        info!("health check stopped");
    }
}
