use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::domain::{AlertEvent, Topics};
use crate::error::TransportError;
use crate::ports::{AlertNotifier, MessageBroker};

/// Publishes alert events as JSON on the fleet alerts topic.
pub struct MqttAlertNotifier {
    broker: Arc<dyn MessageBroker>,
    topic: String,
}

impl MqttAlertNotifier {
    pub fn new(broker: Arc<dyn MessageBroker>, topics: &Topics) -> Self {
        Self {
            broker,
            topic: topics.alerts(),
        }
    }
}

#[async_trait]
impl AlertNotifier for MqttAlertNotifier {
    #[instrument(skip(self, event), fields(device_id = %event.device, severity = event.severity.as_str()))]
    async fn notify(&self, event: &AlertEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(event)?;
        self.broker.publish(&self.topic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertCategory, AlertThresholds, Severity};
    use crate::ports::mock::RecordingBroker;

    #[tokio::test]
    async fn test_event_published_on_alerts_topic() {
        let broker = Arc::new(RecordingBroker::new());
        let notifier = MqttAlertNotifier::new(broker.clone(), &Topics::default());
        let event = AlertEvent {
            id: Some(4),
            device: "p1".into(),
            category: AlertCategory::Signal,
            severity: Severity::Warning,
            message: "Sustained Low Signal".into(),
            thresholds: AlertThresholds {
                metric: "rssi".into(),
                threshold: -85.0,
                observed: -86.0,
            },
        };
        notifier.notify(&event).await.unwrap();

        let sent = broker.messages_on("campus/probes/alerts");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["device"], "p1");
        assert_eq!(sent[0]["severity"], "warning");
        assert_eq!(sent[0]["thresholds"]["observed"], -86.0);
    }
}
