use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;

/// Link-layer metrics shared by every telemetry variant.
/// Fields a probe did not report stay `None` so they never skew averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub rssi: Option<i32>,
    pub latency: Option<i32>,
    pub packet_loss: Option<f64>,
    pub dns_time: Option<i32>,
    pub channel: Option<i32>,
    pub bssid: Option<String>,
    pub neighbors: Option<i32>,
    pub overlap: Option<i32>,
    pub congestion: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnhancedMetrics {
    pub snr: Option<f64>,
    pub link_quality: Option<f64>,
    pub utilization: Option<f64>,
    pub phy_mode: Option<String>,
    pub throughput: Option<i32>,
    pub noise_floor: Option<i32>,
    pub uptime: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryVariant {
    Light,
    Enhanced(EnhancedMetrics),
}

impl TelemetryVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryVariant::Light => "light",
            TelemetryVariant::Enhanced(_) => "enhanced",
        }
    }

    pub fn enhanced(&self) -> Option<&EnhancedMetrics> {
        match self {
            TelemetryVariant::Enhanced(m) => Some(m),
            TelemetryVariant::Light => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    #[serde(with = "time::serde::iso8601")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::iso8601")]
    pub received_at: OffsetDateTime,
    #[serde(flatten)]
    pub link: LinkMetrics,
    pub variant: TelemetryVariant,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TelemetryRecord {
    pub fn rssi(&self) -> Option<f64> {
        self.link.rssi.map(f64::from)
    }

    pub fn latency(&self) -> Option<f64> {
        self.link.latency.map(f64::from)
    }
}
