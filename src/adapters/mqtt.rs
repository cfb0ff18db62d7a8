use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::domain::topics::matches;
use crate::error::TransportError;
use crate::ports::{InboundMessage, MessageBroker};

const ROUTE_CAPACITY: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct Route {
    pattern: String,
    sender: mpsc::Sender<InboundMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportHealth {
    pub connected: bool,
    pub subscriptions: usize,
}

/// MQTT transport. Incoming publishes are fanned out to per-pattern channels so
/// the event loop never waits on downstream processing.
pub struct MqttAdapter {
    client: AsyncClient,
    routes: RwLock<Vec<Route>>,
    connected: AtomicBool,
}

impl MqttAdapter {
    pub fn build(config: &AppConfig) -> (Self, EventLoop) {
        // Stable client id so the broker keeps our persistent session across restarts
        let client_id = format!("{}_{}", config.mqtt_client_id_prefix, config.instance_id);

        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(username, config.mqtt_password.as_deref().unwrap_or_default());
        }
        options.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs));
        options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(options, 1000);
        (Self::new(client), eventloop)
    }

    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            routes: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn health(&self) -> TransportHealth {
        let subscriptions = self.routes.read().map(|r| r.len()).unwrap_or(0);
        TransportHealth {
            connected: self.is_connected(),
            subscriptions,
        }
    }

    fn patterns(&self) -> Vec<String> {
        match self.routes.read() {
            Ok(routes) => routes.iter().map(|r| r.pattern.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Ok(routes) = self.routes.read() else {
            error!("Route table poisoned, dropping message");
            return;
        };
        let mut delivered = false;
        for route in routes.iter().filter(|r| matches(&r.pattern, topic)) {
            delivered = true;
            let msg = InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            match route.sender.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %topic, pattern = %route.pattern, "Subscriber lagging, message dropped");
                    metrics::counter!("mqtt_messages_dropped_total", 1, "reason" => "backpressure");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(pattern = %route.pattern, "Subscriber gone");
                }
            }
        }
        if !delivered {
            debug!(topic = %topic, "No subscriber for topic");
        }
    }

    async fn resubscribe(&self) {
        for pattern in self.patterns() {
            if let Err(e) = self.client.subscribe(&pattern, QoS::AtLeastOnce).await {
                error!(pattern = %pattern, "Resubscribe failed: {:?}", e);
            } else {
                info!(pattern = %pattern, "Subscribed");
            }
        }
    }

    /// Drives the connection until shutdown. Reconnects on error after a fixed delay.
    pub async fn run_event_loop(&self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        info!("MQTT event loop starting");
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        metrics::counter!("mqtt_messages_received_total", 1);
                        self.dispatch(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        self.connected.store(true, Ordering::SeqCst);
                        metrics::gauge!("mqtt_connected", 1.0);
                        self.resubscribe().await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.connected.store(false, Ordering::SeqCst);
                        metrics::gauge!("mqtt_connected", 0.0);
                        error!("MQTT connection error: {:?}. Retrying in {:?}", e, RECONNECT_DELAY);
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect on shutdown failed: {:?}", e);
        }
        info!("MQTT event loop stopped");
    }
}

#[async_trait]
impl MessageBroker for MqttAdapter {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: format!("{:?}", e),
            })?;
        metrics::counter!("mqtt_messages_published_total", 1);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        let (sender, receiver) = mpsc::channel(ROUTE_CAPACITY);
        {
            let mut routes = self.routes.write().map_err(|_| TransportError::Subscribe {
                pattern: pattern.to_string(),
                reason: "route table poisoned".to_string(),
            })?;
            routes.push(Route {
                pattern: pattern.to_string(),
                sender,
            });
        }
        // Queued by the client; also replayed on every ConnAck.
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                pattern: pattern.to_string(),
                reason: format!("{:?}", e),
            })?;
        Ok(receiver)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
