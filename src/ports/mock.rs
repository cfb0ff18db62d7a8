//! In-memory port implementations shared by the service tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::types::time::OffsetDateTime;
use tokio::sync::mpsc;

use super::{
    AlertNotifier, AlertSink, AlertStore, CommandStore, DeviceRegistry, InboundMessage,
    MessageBroker, TelemetryStore,
};
use crate::domain::topics::matches;
use crate::domain::{
    Alert, AlertEvent, AlertStatus, Command, CommandStatus, Device, DeviceStatus, DeviceUpdate,
    NewCommand, Params, TelemetryRecord,
};
use crate::error::{StoreError, TransportError};

#[derive(Default)]
pub struct MemoryRegistry {
    pub devices: Mutex<HashMap<String, Device>>,
    pub fail_create: AtomicBool,
    pub fail_touch: AtomicBool,
    pub stall_touch: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: Device) -> Self {
        let registry = Self::default();
        registry.insert(device);
        registry
    }

    pub fn insert(&self, device: Device) {
        self.devices.lock().unwrap().insert(device.device_id.clone(), device);
    }

    pub fn set_last_contact(&self, device_id: &str, at: OffsetDateTime) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(device_id) {
            device.last_contact = at;
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.lock().unwrap().get(device_id).cloned()
    }
}

fn unavailable() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn lookup(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.get(device_id))
    }

    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&device.device_id) {
            return Err(StoreError::AlreadyExists {
                entity: "device",
                key: device.device_id.clone(),
            });
        }
        devices.insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn touch_last_contact(&self, device_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        if self.fail_touch.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        if self.stall_touch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(device) = self.devices.lock().unwrap().get_mut(device_id) {
            device.last_contact = device.last_contact.max(at);
            if device.status == DeviceStatus::Stale {
                device.status = DeviceStatus::Active;
            }
        }
        Ok(())
    }

    async fn update(&self, device_id: &str, update: &DeviceUpdate) -> Result<Device, StoreError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(device_id).ok_or_else(|| StoreError::NotFound {
            entity: "device",
            key: device_id.to_string(),
        })?;
        update.apply(device);
        Ok(device.clone())
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self.devices.lock().unwrap().values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn list_stale(&self, cutoff: OffsetDateTime) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.status == DeviceStatus::Active && d.last_contact < cutoff)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.last_contact);
        Ok(devices)
    }
}

#[derive(Default)]
pub struct MemoryTelemetryStore {
    pub records: Mutex<Vec<TelemetryRecord>>,
    pub fail: AtomicBool,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    async fn append(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAlertStore {
    pub alerts: Mutex<Vec<Alert>>,
    pub fail: AtomicBool,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_status(&self, id: i64, from: &[AlertStatus], to: AlertStatus) -> bool {
        let mut alerts = self.alerts.lock().unwrap();
        match alerts.iter_mut().find(|a| a.id == Some(id)) {
            Some(alert) if from.contains(&alert.status) => {
                alert.status = to;
                alert.updated_at = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn create(&self, alert: &Alert) -> Result<i64, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut alerts = self.alerts.lock().unwrap();
        let id = alerts.len() as i64 + 1;
        let mut stored = alert.clone();
        stored.id = Some(id);
        alerts.push(stored);
        Ok(id)
    }

    async fn acknowledge(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.set_status(id, &[AlertStatus::Active], AlertStatus::Acknowledged))
    }

    async fn resolve(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.set_status(
            id,
            &[AlertStatus::Active, AlertStatus::Acknowledged],
            AlertStatus::Resolved,
        ))
    }

    async fn list_active(&self, device_id: Option<&str>) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.status != AlertStatus::Resolved)
            .filter(|a| device_id.map_or(true, |d| a.device_id == d))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCommandStore {
    pub commands: Mutex<Vec<Command>>,
    next_id: AtomicI64,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn status_of(&self, id: i64) -> Option<CommandStatus> {
        self.commands.lock().unwrap().iter().find(|c| c.id == id).map(|c| c.status)
    }

    /// Seeds a row directly, bypassing the lifecycle.
    pub fn seed(&self, device_id: &str, command_type: &str, status: CommandStatus) -> Command {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let command = Command {
            id,
            device_id: device_id.to_string(),
            command_type: command_type.to_string(),
            payload: Params::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            status,
            issued_at: OffsetDateTime::now_utc(),
            executed_at: None,
            result: None,
        };
        self.commands.lock().unwrap().push(command.clone());
        command
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn create(&self, command: &NewCommand) -> Result<Command, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = Command {
            id,
            device_id: command.device_id.clone(),
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
            correlation_id: command.correlation_id.clone(),
            status: CommandStatus::Pending,
            issued_at: OffsetDateTime::now_utc(),
            executed_at: None,
            result: None,
        };
        self.commands.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn update_status(
        &self,
        id: i64,
        status: CommandStatus,
        result: Option<&Params>,
    ) -> Result<bool, StoreError> {
        let mut commands = self.commands.lock().unwrap();
        let Some(command) = commands.iter_mut().find(|c| c.id == id) else {
            return Ok(false);
        };
        if !command.status.can_transition_to(status) {
            return Ok(false);
        }
        command.status = status;
        if let Some(result) = result {
            command.result = Some(result.clone());
        }
        if status.is_terminal() {
            command.executed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(true)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Command>, StoreError> {
        Ok(self.commands.lock().unwrap().iter().find(|c| c.id == id).cloned())
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<Command>, StoreError> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.correlation_id == correlation_id)
            .cloned())
    }

    async fn find_latest_open(
        &self,
        device_id: &str,
        command_type: &str,
    ) -> Result<Option<Command>, StoreError> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| {
                c.device_id == device_id && c.command_type == command_type && !c.status.is_terminal()
            })
            .cloned())
    }

    async fn list_pending(&self) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_for_device(&self, device_id: &str, limit: i64) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|c| c.device_id == device_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn prune_old_scans(&self, device_id: &str, keep: i64) -> Result<u64, StoreError> {
        let mut commands = self.commands.lock().unwrap();
        let scans: Vec<i64> = commands
            .iter()
            .rev()
            .filter(|c| {
                c.device_id == device_id
                    && c.command_type == "deep_scan"
                    && c.status == CommandStatus::Completed
            })
            .map(|c| c.id)
            .collect();
        let doomed: Vec<i64> = scans.into_iter().skip(keep.max(0) as usize).collect();
        commands.retain(|c| !doomed.contains(&c.id));
        Ok(doomed.len() as u64)
    }
}

type PublishHook = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Records publishes and lets tests inject inbound traffic.
pub struct RecordingBroker {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    routes: Mutex<Vec<(String, mpsc::Sender<InboundMessage>)>>,
    pub connected: AtomicBool,
    pub fail_publish: AtomicBool,
    on_publish: Mutex<Option<PublishHook>>,
}

impl Default for RecordingBroker {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            on_publish: Mutex::new(None),
        }
    }
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called synchronously for every successful publish, e.g. to play a device reply.
    pub fn on_publish(&self, hook: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        *self.on_publish.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn topics(&self) -> Vec<String> {
        self.published.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, p)| serde_json::from_slice(p).ok())
            .collect()
    }

    pub async fn inject(&self, topic: &str, payload: &[u8]) {
        let targets: Vec<mpsc::Sender<InboundMessage>> = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| matches(pattern, topic))
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in targets {
            let _ = tx
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .await;
        }
    }
}

#[async_trait]
impl MessageBroker for RecordingBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        if let Some(hook) = self.on_publish.lock().unwrap().as_ref() {
            hook(topic, &payload);
        }
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        self.routes.lock().unwrap().push((pattern.to_string(), tx));
        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<AlertEvent>>,
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<(), TransportError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub alerts: Mutex<Vec<Alert>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn taken(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn dispatch(&self, alert: Alert) -> anyhow::Result<Alert> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("alert sink unavailable");
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(alert)
    }
}
