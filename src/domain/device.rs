use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;
use std::time::Duration;

const PLACEHOLDER: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Active,
    /// Active device silent past the stale threshold; revived by the next contact.
    Stale,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Active => "active",
            DeviceStatus::Stale => "stale",
        }
    }

    /// Unrecognized values read back from storage collapse to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => DeviceStatus::Active,
            "stale" => DeviceStatus::Stale,
            _ => DeviceStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub location: String,
    pub building: String,
    pub floor: String,
    pub department: String,
    pub status: DeviceStatus,
    pub firmware_version: String,
    #[serde(with = "time::serde::iso8601")]
    pub last_contact: OffsetDateTime,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Device {
    /// Record created for a device first seen through telemetry.
    pub fn placeholder(device_id: impl Into<String>, seen_at: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            location: PLACEHOLDER.to_string(),
            building: PLACEHOLDER.to_string(),
            floor: PLACEHOLDER.to_string(),
            department: PLACEHOLDER.to_string(),
            status: DeviceStatus::Unknown,
            firmware_version: PLACEHOLDER.to_lowercase(),
            last_contact: seen_at,
            metadata: Map::new(),
        }
    }

    pub fn seen_within(&self, now: OffsetDateTime, window: Duration) -> bool {
        let elapsed = now - self.last_contact;
        elapsed.whole_milliseconds() <= window.as_millis() as i128
    }
}

/// Partial update applied through explicit registration flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub location: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub department: Option<String>,
    pub status: Option<DeviceStatus>,
    pub firmware_version: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl DeviceUpdate {
    pub fn apply(&self, device: &mut Device) {
        if let Some(v) = &self.location {
            device.location = v.clone();
        }
        if let Some(v) = &self.building {
            device.building = v.clone();
        }
        if let Some(v) = &self.floor {
            device.floor = v.clone();
        }
        if let Some(v) = &self.department {
            device.department = v.clone();
        }
        if let Some(v) = self.status {
            device.status = v;
        }
        if let Some(v) = &self.firmware_version {
            device.firmware_version = v.clone();
        }
        if let Some(v) = &self.metadata {
            device.metadata = v.clone();
        }
    }
}
