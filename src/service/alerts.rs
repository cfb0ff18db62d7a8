use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::domain::{Alert, AlertCategory, AlertEvent, Severity};
use crate::error::{StoreError, TransportError};
use crate::ports::{AlertNotifier, AlertSink, AlertStore};

/// Persists alerts and pushes them to the notification sink.
pub struct AlertService {
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn AlertNotifier>,
}

impl AlertService {
    pub fn new(store: Arc<dyn AlertStore>, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self { store, notifier }
    }

    #[instrument(skip(self))]
    pub async fn acknowledge(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self.store.acknowledge(id).await?;
        if changed {
            info!("Alert acknowledged");
        }
        Ok(changed)
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self.store.resolve(id).await?;
        if changed {
            info!("Alert resolved");
        }
        Ok(changed)
    }

    pub async fn active_for_device(&self, device_id: &str) -> Result<Vec<Alert>, StoreError> {
        self.store.list_active(Some(device_id)).await
    }

    pub async fn active(&self) -> Result<Vec<Alert>, StoreError> {
        self.store.list_active(None).await
    }

    /// Pushes a notification that is never persisted, to check the delivery path.
    pub async fn send_test_alert(&self) -> Result<(), TransportError> {
        let alert = Alert::new(
            "TEST-PROBE-01".to_string(),
            AlertCategory::System,
            "simulation",
            Severity::Info,
            0.0,
            0.0,
            0,
            "Simulation: ephemeral test notification".to_string(),
        );
        self.notifier.notify(&AlertEvent::from(&alert)).await?;
        info!("Ephemeral test alert published");
        Ok(())
    }
}

#[async_trait]
impl AlertSink for AlertService {
    #[instrument(skip(self, alert), fields(device_id = %alert.device_id, metric = %alert.metric_key))]
    async fn dispatch(&self, mut alert: Alert) -> anyhow::Result<Alert> {
        let id = self.store.create(&alert).await?;
        alert.id = Some(id);

        if let Err(e) = self.notifier.notify(&AlertEvent::from(&alert)).await {
            warn!("Alert {} stored but notification failed: {}", id, e);
            metrics::counter!("alert_notify_errors_total", 1);
        }

        if alert.severity == Severity::Critical {
            warn!(
                category = alert.category.as_str(),
                "CRITICAL ALERT: {} (probe {})", alert.message, alert.device_id
            );
        }
        Ok(alert)
    }
}
