use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::domain::topics::matches;
use crate::domain::Topics;
use crate::error::{IngestError, TransportError};
use crate::ports::{InboundMessage, MessageBroker};
use crate::service::commands::CommandManager;
use crate::service::ingest::TelemetryPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Telemetry,
    OfflineTelemetry,
    CommandResult,
    Unrouted,
}

/// Routes pooled inbound messages to the telemetry pipeline or the command manager.
pub struct ServiceProcessor {
    topics: Topics,
    pipeline: Arc<TelemetryPipeline>,
    commands: Arc<CommandManager>,
}

impl ServiceProcessor {
    pub fn new(topics: Topics, pipeline: Arc<TelemetryPipeline>, commands: Arc<CommandManager>) -> Self {
        Self { topics, pipeline, commands }
    }

    pub fn classify(&self, topic: &str) -> InboundKind {
        if topic == self.topics.telemetry() {
            InboundKind::Telemetry
        } else if topic == self.topics.offline_telemetry() {
            InboundKind::OfflineTelemetry
        } else if matches(&self.topics.results_pattern(), topic) {
            InboundKind::CommandResult
        } else {
            InboundKind::Unrouted
        }
    }

    /// Decode failures are logged and dropped; storage failures surface to the pool.
    #[instrument(skip(self, message), fields(topic = %message.topic, payload_len = message.payload.len()))]
    pub async fn process(&self, message: &InboundMessage) -> anyhow::Result<()> {
        match self.classify(&message.topic) {
            InboundKind::Telemetry => match self.pipeline.ingest(&message.payload).await {
                Ok(_) => Ok(()),
                Err(IngestError::Decode(e)) => {
                    let raw = String::from_utf8_lossy(&message.payload);
                    error!(payload = %raw, "Dropping telemetry: {}", e);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            InboundKind::OfflineTelemetry => match self.pipeline.ingest_offline(&message.payload).await {
                Ok(_) => Ok(()),
                Err(IngestError::Decode(e)) => {
                    error!("Dropping offline upload: {}", e);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            InboundKind::CommandResult => {
                self.commands.process_result(&message.topic, &message.payload).await?;
                Ok(())
            }
            InboundKind::Unrouted => {
                debug!("Ignoring message on unrouted topic");
                Ok(())
            }
        }
    }
}

/// Subscribes the pooled topics and forwards each one from its own task.
pub async fn spawn_ingest_forwarders(
    broker: Arc<dyn MessageBroker>,
    topics: &Topics,
    sender: mpsc::Sender<InboundMessage>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, TransportError> {
    let patterns = [
        topics.telemetry(),
        topics.offline_telemetry(),
        topics.results_pattern(),
    ];
    let mut handles = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let mut rx = broker.subscribe(&pattern).await?;
        let sender = sender.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            info!(pattern = %pattern, "Ingest forwarder started");
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if sender.send(msg).await.is_err() {
                                error!("Worker pool channel closed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!(pattern = %pattern, "Ingest forwarder stopping");
        }));
    }
    Ok(handles)
}
