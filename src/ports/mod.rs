use async_trait::async_trait;
use sqlx::types::time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::domain::{
    Alert, AlertEvent, Command, CommandStatus, Device, DeviceUpdate, NewCommand, Params,
    TelemetryRecord,
};
use crate::error::{StoreError, TransportError};

#[cfg(test)]
pub mod mock;

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn lookup(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// Fails with `AlreadyExists` when the key is taken.
    async fn create(&self, device: &Device) -> Result<(), StoreError>;

    /// A stale device heard from again becomes active.
    async fn touch_last_contact(&self, device_id: &str, at: OffsetDateTime) -> Result<(), StoreError>;

    async fn update(&self, device_id: &str, update: &DeviceUpdate) -> Result<Device, StoreError>;

    async fn list(&self) -> Result<Vec<Device>, StoreError>;

    /// Active devices last heard from before `cutoff`, oldest first.
    async fn list_stale(&self, cutoff: OffsetDateTime) -> Result<Vec<Device>, StoreError>;
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn append(&self, record: &TelemetryRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create(&self, alert: &Alert) -> Result<i64, StoreError>;

    /// Returns false when the alert is missing or not active.
    async fn acknowledge(&self, id: i64) -> Result<bool, StoreError>;

    /// Returns false when the alert is missing or already resolved.
    async fn resolve(&self, id: i64) -> Result<bool, StoreError>;

    async fn list_active(&self, device_id: Option<&str>) -> Result<Vec<Alert>, StoreError>;
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn create(&self, command: &NewCommand) -> Result<Command, StoreError>;

    /// Applies only while the row is non-terminal; returns whether a row changed.
    async fn update_status(
        &self,
        id: i64,
        status: CommandStatus,
        result: Option<&Params>,
    ) -> Result<bool, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Command>, StoreError>;

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<Command>, StoreError>;

    /// Most recently issued non-terminal command of this device and type.
    async fn find_latest_open(
        &self,
        device_id: &str,
        command_type: &str,
    ) -> Result<Option<Command>, StoreError>;

    async fn list_pending(&self) -> Result<Vec<Command>, StoreError>;

    /// Newest first.
    async fn list_for_device(&self, device_id: &str, limit: i64) -> Result<Vec<Command>, StoreError>;

    /// Deletes completed deep scans beyond the newest `keep`; returns rows removed.
    async fn prune_old_scans(&self, device_id: &str, keep: i64) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish data to a specific topic. QoS 1 implied.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Every message whose topic matches `pattern` is delivered on the returned channel.
    /// The subscription survives reconnects.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<(), TransportError>;
}

/// Destination for alerts raised by the evaluator.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn dispatch(&self, alert: Alert) -> anyhow::Result<Alert>;
}
