use std::sync::Arc;
use std::time::Duration;

use sqlx::types::time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::domain::{Device, DeviceStatus, DeviceUpdate};
use crate::error::StoreError;
use crate::ports::DeviceRegistry;

/// Touches last contact off the caller's path, bounded by `limit`.
pub(crate) fn spawn_touch(
    registry: Arc<dyn DeviceRegistry>,
    device_id: String,
    at: OffsetDateTime,
    limit: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(limit, registry.touch_last_contact(&device_id, at)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(device_id = %device_id, "Failed to touch last contact: {}", e),
            Err(_) => warn!(device_id = %device_id, "Touching last contact timed out"),
        }
    })
}

/// Explicit registration and maintenance of fleet devices.
pub struct DeviceService {
    registry: Arc<dyn DeviceRegistry>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Registration {
    pub device_id: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub building: Option<String>,
    #[serde(default)]
    pub floor: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DeviceService {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }

    #[instrument(skip(self, registration), fields(device_id = %registration.device_id))]
    pub async fn register(&self, registration: Registration) -> Result<Device, StoreError> {
        let mut device = Device::placeholder(registration.device_id, OffsetDateTime::now_utc());
        DeviceUpdate {
            location: registration.location,
            building: registration.building,
            floor: registration.floor,
            department: registration.department,
            status: Some(DeviceStatus::Active),
            firmware_version: registration.firmware_version,
            metadata: Some(registration.metadata),
        }
        .apply(&mut device);

        self.registry.create(&device).await?;
        info!("Device registered");
        Ok(device)
    }

    #[instrument(skip(self, update))]
    pub async fn update(&self, device_id: &str, update: DeviceUpdate) -> Result<Device, StoreError> {
        let device = self.registry.update(device_id, &update).await?;
        info!("Device updated");
        Ok(device)
    }

    pub async fn get(&self, device_id: &str) -> Result<Device, StoreError> {
        self.registry
            .lookup(device_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "device",
                key: device_id.to_string(),
            })
    }

    pub async fn list(&self) -> Result<Vec<Device>, StoreError> {
        self.registry.list().await
    }

    /// Flags active devices silent for longer than `threshold` as stale.
    /// Returns the devices that were flagged.
    #[instrument(skip(self))]
    pub async fn mark_stale(&self, threshold: Duration) -> Result<Vec<Device>, StoreError> {
        let cutoff = OffsetDateTime::now_utc() - threshold;
        let candidates = self.registry.list_stale(cutoff).await?;
        let mut flagged = Vec::with_capacity(candidates.len());
        for device in candidates {
            let update = DeviceUpdate {
                status: Some(DeviceStatus::Stale),
                ..Default::default()
            };
            match self.registry.update(&device.device_id, &update).await {
                Ok(device) => flagged.push(device),
                Err(e) => warn!(device_id = %device.device_id, "Failed to flag stale device: {}", e),
            }
        }
        if !flagged.is_empty() {
            metrics::counter!("devices_marked_stale_total", flagged.len() as u64);
            warn!(count = flagged.len(), "Found stale devices");
        }
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mock::MemoryRegistry;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_register_then_duplicate() {
        let service = DeviceService::new(Arc::new(MemoryRegistry::new()));
        let device = service
            .register(Registration {
                device_id: "lib-2f-01".into(),
                building: Some("Library".into()),
                floor: Some("2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(device.status, DeviceStatus::Active);
        assert_eq!(device.location, "Unknown");

        let err = service
            .register(Registration {
                device_id: "lib-2f-01".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_and_missing_device() {
        let service = DeviceService::new(Arc::new(MemoryRegistry::new()));
        service
            .register(Registration {
                device_id: "p1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let updated = service
            .update(
                "p1",
                DeviceUpdate {
                    department: Some("IT".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.department, "IT");
        assert_eq!(service.list().await.unwrap().len(), 1);

        assert!(matches!(service.get("nope").await, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_touch_is_abandoned_after_timeout() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.stall_touch.store(true, Ordering::SeqCst);

        let handle = spawn_touch(registry, "p1".into(), OffsetDateTime::now_utc(), Duration::from_secs(10));
        let finished = tokio::time::timeout(Duration::from_secs(60), handle).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_silent_active_devices_turn_stale_and_recover_on_contact() {
        let registry = Arc::new(MemoryRegistry::new());
        let now = OffsetDateTime::now_utc();
        let mut quiet = Device::placeholder("quiet", now - time::Duration::hours(2));
        quiet.status = DeviceStatus::Active;
        let mut chatty = Device::placeholder("chatty", now);
        chatty.status = DeviceStatus::Active;
        registry.insert(quiet);
        registry.insert(chatty);
        registry.insert(Device::placeholder("never-registered", now - time::Duration::hours(2)));

        let service = DeviceService::new(registry.clone());
        let flagged = service.mark_stale(Duration::from_secs(15 * 60)).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].device_id, "quiet");
        assert_eq!(registry.get("quiet").unwrap().status, DeviceStatus::Stale);
        assert_eq!(registry.get("chatty").unwrap().status, DeviceStatus::Active);
        assert_eq!(registry.get("never-registered").unwrap().status, DeviceStatus::Unknown);

        assert!(service.mark_stale(Duration::from_secs(15 * 60)).await.unwrap().is_empty());

        registry.touch_last_contact("quiet", OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(registry.get("quiet").unwrap().status, DeviceStatus::Active);
    }
}
