use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, instrument};

use crate::domain::{Alert, AlertCategory, AlertConfig, Severity, TelemetryRecord};
use crate::ports::AlertSink;
use crate::state::WindowRegistry;

/// Sustained-condition detector over per-device sliding windows.
///
/// Each (device, metric) pair fires once when its window becomes uniformly
/// beyond threshold and re-arms after an evaluation sees a non-conforming window.
pub struct AlertEvaluator {
    config: RwLock<AlertConfig>,
    windows: WindowRegistry,
    sink: Arc<dyn AlertSink>,
}

struct Trigger {
    category: AlertCategory,
    metric: &'static str,
    severity: Severity,
    threshold: f64,
    observed: f64,
    window: usize,
    message: String,
}

impl Trigger {
    fn into_alert(self, device_id: &str) -> Alert {
        Alert::new(
            device_id.to_string(),
            self.category,
            self.metric,
            self.severity,
            self.threshold,
            self.observed,
            self.window as i32,
            self.message,
        )
    }
}

impl AlertEvaluator {
    pub fn new(config: AlertConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config: RwLock::new(config),
            windows: WindowRegistry::new(),
            sink,
        }
    }

    pub fn config(&self) -> AlertConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Pushes the record's metrics and dispatches any alert that became due.
    /// Returns the alerts the sink accepted.
    #[instrument(skip(self, record), fields(device_id = %record.device_id))]
    pub async fn evaluate(&self, record: &TelemetryRecord) -> Vec<Alert> {
        // Sizes are read and the entry created under one config guard, so a
        // concurrent resize cannot leave an entry built with the old sizes.
        let (config, state) = {
            let config = match self.config.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let state = self
                .windows
                .entry(&record.device_id, config.rssi_window, config.latency_window);
            (config.clone(), state)
        };
        let mut state = state.lock().await;
        let mut raised = Vec::new();

        if let Some(rssi) = record.rssi() {
            state.rssi.push(rssi);
            if state.rssi.is_consistently_below(config.rssi_threshold) {
                if !state.rssi_fired {
                    state.rssi_fired = true;
                    let trigger = Trigger {
                        category: AlertCategory::Signal,
                        metric: "rssi",
                        severity: Severity::Warning,
                        threshold: config.rssi_threshold,
                        observed: rssi,
                        window: config.rssi_window,
                        message: format!(
                            "Sustained Low Signal: {} consecutive samples below {:.0}dBm",
                            config.rssi_window, config.rssi_threshold
                        ),
                    };
                    match self.dispatch(trigger.into_alert(&record.device_id)).await {
                        Some(alert) => raised.push(alert),
                        None => state.rssi_fired = false,
                    }
                }
            } else {
                state.rssi_fired = false;
            }
        }

        if let Some(latency) = record.latency() {
            state.latency.push(latency);
            if state.latency.is_consistently_above(config.latency_threshold) {
                if !state.latency_fired {
                    state.latency_fired = true;
                    let trigger = Trigger {
                        category: AlertCategory::Network,
                        metric: "latency",
                        severity: Severity::Critical,
                        threshold: config.latency_threshold,
                        observed: latency,
                        window: config.latency_window,
                        message: format!(
                            "High Network Latency: {} consecutive samples above {:.0}ms",
                            config.latency_window, config.latency_threshold
                        ),
                    };
                    match self.dispatch(trigger.into_alert(&record.device_id)).await {
                        Some(alert) => raised.push(alert),
                        None => state.latency_fired = false,
                    }
                }
            } else {
                state.latency_fired = false;
            }
        }

        raised
    }

    async fn dispatch(&self, alert: Alert) -> Option<Alert> {
        let metric = alert.metric_key.clone();
        match self.sink.dispatch(alert).await {
            Ok(alert) => {
                metrics::counter!("alerts_triggered_total", 1, "metric" => metric);
                info!(alert_id = ?alert.id, severity = alert.severity.as_str(), "Alert raised: {}", alert.message);
                Some(alert)
            }
            Err(e) => {
                error!("Alert dispatch failed for {}: {:?}", metric, e);
                metrics::counter!("alert_dispatch_errors_total", 1, "metric" => metric);
                None
            }
        }
    }

    /// Window-size changes drop every device's state; threshold-only changes keep it.
    /// The map is cleared while the write guard is held.
    pub fn update_config(&self, config: AlertConfig) {
        let mut current = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !current.same_windows(&config) {
            let dropped = self.windows.len();
            self.windows.clear();
            info!(dropped, "Alert window sizes changed, cleared all device windows");
        }
        *current = config;
    }

    pub fn reset_device(&self, device_id: &str) {
        if self.windows.remove(device_id) {
            debug!(device_id, "Cleared alert windows");
        }
    }

    pub fn tracked_devices(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LinkMetrics, TelemetryVariant};
    use crate::ports::mock::RecordingSink;
    use serde_json::Map;
    use sqlx::types::time::OffsetDateTime;
    use std::sync::atomic::Ordering;

    fn sample(device: &str, rssi: Option<i32>, latency: Option<i32>) -> TelemetryRecord {
        let now = OffsetDateTime::now_utc();
        TelemetryRecord {
            device_id: device.to_string(),
            timestamp: now,
            received_at: now,
            link: LinkMetrics {
                rssi,
                latency,
                ..Default::default()
            },
            variant: TelemetryVariant::Light,
            metadata: Map::new(),
        }
    }

    fn evaluator() -> (AlertEvaluator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (AlertEvaluator::new(AlertConfig::default(), sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_sustained_low_signal_fires_once() {
        let (evaluator, sink) = evaluator();

        for rssi in [-90, -88] {
            assert!(evaluator.evaluate(&sample("p1", Some(rssi), None)).await.is_empty());
        }
        let raised = evaluator.evaluate(&sample("p1", Some(-86), None)).await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, Severity::Warning);
        assert_eq!(raised[0].category, AlertCategory::Signal);
        assert_eq!(raised[0].observed, -86.0);
        assert_eq!(raised[0].threshold, -85.0);

        assert!(evaluator.evaluate(&sample("p1", Some(-80), None)).await.is_empty());
        assert_eq!(sink.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_condition_latches_until_window_recovers() {
        let (evaluator, sink) = evaluator();
        for rssi in [-90, -90, -90, -91, -92] {
            evaluator.evaluate(&sample("p1", Some(rssi), None)).await;
        }
        assert_eq!(sink.taken().len(), 1);

        evaluator.evaluate(&sample("p1", Some(-60), None)).await;
        for rssi in [-90, -90, -90] {
            evaluator.evaluate(&sample("p1", Some(rssi), None)).await;
        }
        assert_eq!(sink.taken().len(), 2);
    }

    #[tokio::test]
    async fn test_high_latency_is_critical() {
        let (evaluator, _sink) = evaluator();
        let mut raised = Vec::new();
        for latency in [600, 700, 800] {
            raised = evaluator.evaluate(&sample("p1", None, Some(latency))).await;
        }
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, Severity::Critical);
        assert_eq!(raised[0].category, AlertCategory::Network);
        assert_eq!(raised[0].metric_key, "latency");
    }

    #[tokio::test]
    async fn test_missing_metric_does_not_push() {
        let (evaluator, sink) = evaluator();
        evaluator.evaluate(&sample("p1", Some(-90), None)).await;
        evaluator.evaluate(&sample("p1", None, Some(10))).await;
        evaluator.evaluate(&sample("p1", Some(-90), None)).await;
        assert!(sink.taken().is_empty());
        evaluator.evaluate(&sample("p1", Some(-90), None)).await;
        assert_eq!(sink.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_retries_on_next_sample() {
        let (evaluator, sink) = evaluator();
        sink.fail.store(true, Ordering::SeqCst);
        for rssi in [-90, -90, -90] {
            evaluator.evaluate(&sample("p1", Some(rssi), None)).await;
        }
        assert!(sink.taken().is_empty());

        sink.fail.store(false, Ordering::SeqCst);
        let raised = evaluator.evaluate(&sample("p1", Some(-90), None)).await;
        assert_eq!(raised.len(), 1);
    }

    #[tokio::test]
    async fn test_window_resize_clears_all_devices() {
        let (evaluator, _sink) = evaluator();
        evaluator.evaluate(&sample("p1", Some(-90), None)).await;
        evaluator.evaluate(&sample("p2", Some(-90), None)).await;
        assert_eq!(evaluator.tracked_devices(), 2);

        evaluator.update_config(AlertConfig {
            rssi_threshold: -80.0,
            ..AlertConfig::default()
        });
        assert_eq!(evaluator.tracked_devices(), 2);

        evaluator.update_config(AlertConfig {
            rssi_window: 5,
            ..AlertConfig::default()
        });
        assert_eq!(evaluator.tracked_devices(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resize_racing_evaluations_leaves_no_old_sized_window() {
        let resized = AlertConfig {
            rssi_window: 7,
            ..AlertConfig::default()
        };
        for _ in 0..100 {
            let (evaluator, sink) = evaluator();
            let evaluator = Arc::new(evaluator);

            let mut tasks = Vec::new();
            for i in 0..8 {
                let evaluator = evaluator.clone();
                tasks.push(tokio::spawn(async move {
                    evaluator.evaluate(&sample(&format!("p{}", i), Some(-60), None)).await;
                }));
            }
            evaluator.update_config(resized.clone());
            for task in tasks {
                task.await.unwrap();
            }

            // Three low samples only fill a window of the old size.
            for i in 0..8 {
                for _ in 0..3 {
                    evaluator.evaluate(&sample(&format!("p{}", i), Some(-90), None)).await;
                }
            }
            assert!(sink.taken().is_empty());
        }
    }

    #[tokio::test]
    async fn test_reset_device_only_clears_one() {
        let (evaluator, _sink) = evaluator();
        evaluator.evaluate(&sample("p1", Some(-90), None)).await;
        evaluator.evaluate(&sample("p2", Some(-90), None)).await;
        evaluator.reset_device("p1");
        assert_eq!(evaluator.tracked_devices(), 1);
    }
}
