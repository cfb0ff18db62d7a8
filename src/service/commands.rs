use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::types::time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    Command, CommandKind, CommandMessage, CommandRequest, CommandResultMessage, CommandStatus,
    NewCommand, Params, ResultOutcome, Topics, BROADCAST_DEVICE,
};
use crate::error::{CommandError, TransportError};
use crate::ports::{CommandStore, DeviceRegistry, MessageBroker};
use crate::service::decoder;
use crate::service::devices::spawn_touch;
use crate::service::ingest::TelemetryPipeline;
use crate::state::ProbeCache;

#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// Devices heard from within this window skip the liveness probe.
    pub freshness: Duration,
    pub poll_interval: Duration,
    pub deadline: Duration,
    /// Completed deep scans kept per device.
    pub scan_retention: i64,
    pub side_effect_timeout: Duration,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            deadline: Duration::from_secs(5),
            scan_retention: 5,
            side_effect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Device(&'a str),
    Broadcast,
}

pub struct CommandManager {
    registry: Arc<dyn DeviceRegistry>,
    store: Arc<dyn CommandStore>,
    broker: Arc<dyn MessageBroker>,
    cache: Arc<ProbeCache>,
    telemetry: Option<Arc<TelemetryPipeline>>,
    topics: Topics,
    settings: CommandSettings,
    shutdown: watch::Receiver<bool>,
}

impl CommandManager {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        store: Arc<dyn CommandStore>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<ProbeCache>,
        topics: Topics,
        settings: CommandSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            store,
            broker,
            cache,
            telemetry: None,
            topics,
            settings,
            shutdown,
        }
    }

    /// Completed deep scans are fed back through this pipeline.
    pub fn with_telemetry(mut self, pipeline: Arc<TelemetryPipeline>) -> Self {
        self.telemetry = Some(pipeline);
        self
    }

    /// Validates an untyped request and runs the full issuance lifecycle.
    pub async fn issue(&self, request: CommandRequest) -> Result<Command, CommandError> {
        let kind = CommandKind::parse(&request.command_type, request.params)?;
        if request.device_id == BROADCAST_DEVICE {
            self.issue_broadcast(kind).await
        } else {
            self.issue_kind(&request.device_id, kind).await
        }
    }

    #[instrument(skip(self, kind), fields(command_type = kind.type_name()))]
    pub async fn issue_kind(&self, device_id: &str, kind: CommandKind) -> Result<Command, CommandError> {
        self.run_lifecycle(Target::Device(device_id), &kind).await
    }

    #[instrument(skip(self, kind), fields(command_type = kind.type_name()))]
    pub async fn issue_broadcast(&self, kind: CommandKind) -> Result<Command, CommandError> {
        self.run_lifecycle(Target::Broadcast, &kind).await
    }

    async fn run_lifecycle(&self, target: Target<'_>, kind: &CommandKind) -> Result<Command, CommandError> {
        let (device_id, topic) = match target {
            Target::Device(id) => (id, self.topics.command(id)),
            Target::Broadcast => (BROADCAST_DEVICE, self.topics.broadcast_command()),
        };

        let command = self.store.create(&NewCommand::new(device_id, kind)).await?;
        metrics::counter!("commands_issued_total", 1, "type" => kind.type_name().to_string());
        info!(command_id = command.id, device_id, "Command persisted as pending");

        let verify = matches!(target, Target::Device(_)) && kind.requires_verification();
        let delivered = async {
            if verify {
                self.verify_connectivity(device_id).await?;
            }
            self.transmit(&command, &topic).await
        }
        .await;

        match delivered {
            Ok(()) => Ok(self.store.get_by_id(command.id).await?.unwrap_or(command)),
            Err(e) => {
                self.mark_failed(&command, &e).await;
                Err(e)
            }
        }
    }

    /// Wakes a quiet device with a ping and waits for its last contact to advance.
    #[instrument(skip(self))]
    pub async fn verify_connectivity(&self, device_id: &str) -> Result<(), CommandError> {
        let device = self
            .registry
            .lookup(device_id)
            .await?
            .ok_or_else(|| CommandError::DeviceNotFound(device_id.to_string()))?;

        if device.seen_within(OffsetDateTime::now_utc(), self.settings.freshness) {
            debug!("Device recently seen, skipping liveness probe");
            return Ok(());
        }

        let baseline = device.last_contact;
        info!(last_contact = %baseline, "Device quiet, sending liveness ping");
        let ping = self
            .store
            .create(&NewCommand::new(device_id, &CommandKind::Ping))
            .await?;
        if let Err(e) = self.transmit(&ping, &self.topics.command(device_id)).await {
            self.mark_failed(&ping, &e).await;
            return Err(e);
        }

        let started = Instant::now();
        let deadline = started + self.settings.deadline;
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(CommandError::Cancelled);
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("Liveness wait interrupted by shutdown");
                    return Err(CommandError::Cancelled);
                }
            }

            match self.registry.lookup(device_id).await {
                Ok(Some(current)) if current.last_contact > baseline => {
                    let waited = started.elapsed();
                    metrics::histogram!("liveness_wait_seconds", waited.as_secs_f64());
                    info!(waited_ms = waited.as_millis() as u64, "Device answered liveness ping");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!("Liveness poll lookup failed: {}", e),
            }

            if Instant::now() >= deadline {
                metrics::counter!("liveness_timeouts_total", 1);
                warn!("Device did not answer liveness ping");
                return Err(CommandError::DeviceUnreachable {
                    device: device_id.to_string(),
                    waited: self.settings.deadline,
                });
            }
        }
    }

    async fn transmit(&self, command: &Command, topic: &str) -> Result<(), CommandError> {
        let message = CommandMessage::for_command(command, OffsetDateTime::now_utc());
        let payload = serde_json::to_vec(&message).map_err(TransportError::from)?;
        self.broker.publish(topic, payload).await?;

        match self.store.update_status(command.id, CommandStatus::Sent, None).await {
            Ok(true) => info!(command_id = command.id, topic, "Command sent"),
            Ok(false) => debug!(command_id = command.id, "Result arrived before sent update"),
            Err(e) => warn!(command_id = command.id, "Failed to mark command sent: {}", e),
        }
        Ok(())
    }

    async fn mark_failed(&self, command: &Command, cause: &CommandError) {
        let mut result = Params::new();
        result.insert("error".to_string(), Value::from(cause.to_string()));
        metrics::counter!("commands_failed_total", 1, "type" => command.command_type.clone());
        match self
            .store
            .update_status(command.id, CommandStatus::Failed, Some(&result))
            .await
        {
            Ok(_) => warn!(command_id = command.id, "Command failed: {}", cause),
            Err(e) => error!(command_id = command.id, "Failed to record command failure: {}", e),
        }
    }

    /// Correlates an inbound result with its command row and applies it.
    /// Mismatches are logged and yield `None`.
    #[instrument(skip(self, payload), fields(topic = %topic, command_id = tracing::field::Empty))]
    pub async fn process_result(&self, topic: &str, payload: &[u8]) -> Result<Option<Command>, CommandError> {
        let mut message: CommandResultMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                metrics::counter!("command_results_total", 1, "outcome" => "malformed");
                warn!("Malformed command result: {}", e);
                return Ok(None);
            }
        };
        if message.device.is_empty() {
            message.device = self.topics.device_segment(topic).unwrap_or_default().to_string();
        }

        let Some(command) = self.correlate(&message).await? else {
            metrics::counter!("command_results_total", 1, "outcome" => "unmatched");
            return Ok(None);
        };
        tracing::Span::current().record("command_id", command.id);

        let outcome = message.outcome();
        if !command.status.can_transition_to(outcome.status()) {
            metrics::counter!("command_results_total", 1, "outcome" => "late");
            warn!(status = command.status.as_str(), "Result for command already in a terminal state ignored");
            return Ok(None);
        }
        if command.command_type == "ota_update" {
            if let Some(progress) = message.result.get("progress").and_then(Value::as_f64) {
                info!(device_id = %command.device_id, "OTA progress {:.0}%", progress);
            }
        }

        let applied = self
            .store
            .update_status(command.id, outcome.status(), Some(&message.result))
            .await?;
        if !applied {
            warn!(status = command.status.as_str(), "Command turned terminal before the result was applied");
            return Ok(None);
        }

        let outcome_label = match outcome {
            ResultOutcome::Completed => "completed",
            ResultOutcome::Failed => "failed",
            ResultOutcome::InProgress => "progress",
        };
        metrics::counter!("command_results_total", 1, "outcome" => outcome_label);
        info!(
            command_type = %command.command_type,
            device_id = %command.device_id,
            "Command result applied: {}",
            outcome_label
        );

        if outcome == ResultOutcome::Completed {
            self.apply_side_effects(&command, &message.result);
        }

        Ok(self.store.get_by_id(command.id).await?)
    }

    async fn correlate(&self, message: &CommandResultMessage) -> Result<Option<Command>, CommandError> {
        if let Some(correlation_id) = message.command_id.as_deref().filter(|c| !c.is_empty()) {
            let found = self.store.find_by_correlation(correlation_id).await?;
            if found.is_none() {
                warn!(correlation_id, "Result references an unknown command");
            }
            return Ok(found);
        }

        let found = self
            .store
            .find_latest_open(&message.device, &message.command_type)
            .await?;
        if found.is_none() {
            warn!(
                device_id = %message.device,
                command_type = %message.command_type,
                "No open command matches result"
            );
        }
        Ok(found)
    }

    /// Side effects never block correlation; slow ones run detached with a timeout.
    fn apply_side_effects(&self, command: &Command, result: &Params) {
        let device_id = command.device_id.clone();
        match command.command_type.as_str() {
            "deep_scan" => {
                let store = self.store.clone();
                let telemetry = self.telemetry.clone();
                let keep = self.settings.scan_retention;
                let limit = self.settings.side_effect_timeout;
                let result = result.clone();
                tokio::spawn(async move {
                    let work = async {
                        match store.prune_old_scans(&device_id, keep).await {
                            Ok(pruned) if pruned > 0 => info!(device_id = %device_id, pruned, "Pruned old deep scans"),
                            Ok(_) => {}
                            Err(e) => warn!(device_id = %device_id, "Deep scan pruning failed: {}", e),
                        }
                        if let Some(pipeline) = telemetry {
                            match decoder::record_from_scan(&device_id, &result, OffsetDateTime::now_utc()) {
                                Ok(record) => {
                                    if let Err(e) = pipeline.ingest_record(record).await {
                                        warn!(device_id = %device_id, "Deep scan telemetry not stored: {}", e);
                                    }
                                }
                                Err(e) => debug!(device_id = %device_id, "Deep scan result carries no telemetry: {}", e),
                            }
                        }
                    };
                    if tokio::time::timeout(limit, work).await.is_err() {
                        warn!(device_id = %device_id, "Deep scan post-processing timed out");
                    }
                });
            }
            "ping" | "get_status" => {
                let now = OffsetDateTime::now_utc();
                self.cache.mark_online(&device_id, now);
                spawn_touch(self.registry.clone(), device_id, now, self.settings.side_effect_timeout);
            }
            "rename" | "config_update" | "set_wifi" | "set_mqtt" | "get_config" | "restart" => {
                info!(device_id = %device_id, command_type = %command.command_type, "Device applied configuration command");
            }
            "ota_update" => info!(device_id = %device_id, "OTA update completed"),
            "factory_reset" => warn!(device_id = %device_id, "Device completed factory reset"),
            other => debug!(device_id = %device_id, command_type = other, "No side effects for command"),
        }
    }

    pub async fn history(&self, device_id: &str, limit: i64) -> Result<Vec<Command>, CommandError> {
        Ok(self.store.list_for_device(device_id, limit).await?)
    }

    pub async fn pending(&self) -> Result<Vec<Command>, CommandError> {
        Ok(self.store.list_pending().await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Command>, CommandError> {
        Ok(self.store.get_by_id(id).await?)
    }
}
