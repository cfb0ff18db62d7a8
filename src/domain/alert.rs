use serde::{Deserialize, Serialize};
use sqlx::types::time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "critical" => Severity::Critical,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Signal,
    Network,
    System,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Signal => "signal",
            AlertCategory::Network => "network",
            AlertCategory::System => "system",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "signal" => AlertCategory::Signal,
            "network" => AlertCategory::Network,
            _ => AlertCategory::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "acknowledged" => AlertStatus::Acknowledged,
            "resolved" => AlertStatus::Resolved,
            _ => AlertStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub device_id: String,
    pub category: AlertCategory,
    pub metric_key: String,
    pub severity: Severity,
    pub threshold: f64,
    pub observed: f64,
    pub message: String,
    pub status: AlertStatus,
    pub occurrences: i32,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601")]
    pub updated_at: OffsetDateTime,
}

impl Alert {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        category: AlertCategory,
        metric_key: &str,
        severity: Severity,
        threshold: f64,
        observed: f64,
        occurrences: i32,
        message: String,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: None,
            device_id,
            category,
            metric_key: metric_key.to_string(),
            severity,
            threshold,
            observed,
            message,
            status: AlertStatus::Active,
            occurrences,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub metric: String,
    pub threshold: f64,
    pub observed: f64,
}

/// Shape pushed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Option<i64>,
    pub device: String,
    pub category: AlertCategory,
    pub severity: Severity,
    pub message: String,
    pub thresholds: AlertThresholds,
}

impl From<&Alert> for AlertEvent {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id,
            device: alert.device_id.clone(),
            category: alert.category,
            severity: alert.severity,
            message: alert.message.clone(),
            thresholds: AlertThresholds {
                metric: alert.metric_key.clone(),
                threshold: alert.threshold,
                observed: alert.observed,
            },
        }
    }
}

/// Thresholds and window sizes used by the sliding-window evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub rssi_threshold: f64,
    pub rssi_window: usize,
    pub latency_threshold: f64,
    pub latency_window: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rssi_threshold: -85.0,
            rssi_window: 3,
            latency_threshold: 500.0,
            latency_window: 3,
        }
    }
}

impl AlertConfig {
    pub fn same_windows(&self, other: &AlertConfig) -> bool {
        self.rssi_window == other.rssi_window && self.latency_window == other.latency_window
    }
}
