use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::CommandKind;
use crate::error::StoreError;
use crate::ports::DeviceRegistry;
use crate::service::commands::CommandManager;

/// Periodically pings every registered device so liveness data stays warm.
pub struct FleetPinger {
    manager: Arc<CommandManager>,
    registry: Arc<dyn DeviceRegistry>,
    interval: Duration,
}

impl FleetPinger {
    pub fn new(manager: Arc<CommandManager>, registry: Arc<dyn DeviceRegistry>, interval: Duration) -> Self {
        Self { manager, registry, interval }
    }

    /// Returns how many pings were published.
    pub async fn ping_all(&self) -> Result<usize, StoreError> {
        let devices = self.registry.list().await?;
        let mut sent = 0;
        for device in &devices {
            match self.manager.issue_kind(&device.device_id, CommandKind::Ping).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(device_id = %device.device_id, "Fleet ping failed: {}", e),
            }
        }
        metrics::gauge!("fleet_ping_last_sent", sent as f64);
        info!(sent, total = devices.len(), "Fleet ping round complete");
        Ok(sent)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Fleet pinger started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.ping_all().await {
                        warn!("Fleet ping round skipped: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Fleet pinger stopping");
    }
}
