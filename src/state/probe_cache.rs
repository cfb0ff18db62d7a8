use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;
use std::time::Duration;

/// Last unsolicited status broadcast of a probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeStatusSnapshot {
    pub uptime: Option<i64>,
    pub free_heap: Option<i64>,
    pub rssi: Option<i32>,
    pub ip: Option<String>,
    pub ssid: Option<String>,
    pub temp_c: Option<f64>,
    pub timestamp: Option<String>,
}

/// Last unsolicited config broadcast of a probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfigSnapshot {
    pub wifi: Option<Map<String, Value>>,
    pub mqtt: Option<Map<String, Value>>,
    pub heap_free: Option<i64>,
    pub uptime: Option<i64>,
    pub temp_c: Option<f64>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cached<T> {
    pub value: T,
    #[serde(with = "time::serde::iso8601")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Liveness {
    pub online: bool,
    #[serde(with = "time::serde::iso8601")]
    pub last_seen: OffsetDateTime,
    #[serde(with = "time::serde::iso8601")]
    pub updated_at: OffsetDateTime,
}

fn int(data: &Map<String, Value>, key: &str) -> Option<i64> {
    data.get(key).and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
}

fn float(data: &Map<String, Value>, key: &str) -> Option<f64> {
    data.get(key).and_then(Value::as_f64)
}

fn text(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn object(data: &Map<String, Value>, key: &str) -> Option<Map<String, Value>> {
    data.get(key).and_then(Value::as_object).cloned()
}

impl ProbeStatusSnapshot {
    /// Overwrites every recognized field present in `data`.
    pub fn merge(&mut self, data: &Map<String, Value>) {
        if let Some(v) = int(data, "uptime") {
            self.uptime = Some(v);
        }
        if let Some(v) = int(data, "free_heap") {
            self.free_heap = Some(v);
        }
        if let Some(v) = int(data, "rssi") {
            self.rssi = Some(v as i32);
        }
        if let Some(v) = text(data, "ip") {
            self.ip = Some(v);
        }
        if let Some(v) = text(data, "ssid") {
            self.ssid = Some(v);
        }
        if let Some(v) = float(data, "temp_c") {
            self.temp_c = Some(v);
        }
        if let Some(v) = text(data, "timestamp") {
            self.timestamp = Some(v);
        }
    }
}

impl ProbeConfigSnapshot {
    pub fn merge(&mut self, data: &Map<String, Value>) {
        if let Some(v) = object(data, "wifi") {
            self.wifi = Some(v);
        }
        if let Some(v) = object(data, "mqtt") {
            self.mqtt = Some(v);
        }
        if let Some(v) = int(data, "heap_free") {
            self.heap_free = Some(v);
        }
        if let Some(v) = int(data, "uptime") {
            self.uptime = Some(v);
        }
        if let Some(v) = float(data, "temp_c") {
            self.temp_c = Some(v);
        }
        if let Some(v) = text(data, "timestamp") {
            self.timestamp = Some(v);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub statuses_evicted: usize,
    pub configs_evicted: usize,
    pub marked_offline: usize,
}

/// Advisory mirror of device broadcasts. A miss means "unknown".
#[derive(Default)]
pub struct ProbeCache {
    status: DashMap<String, Cached<ProbeStatusSnapshot>>,
    config: DashMap<String, Cached<ProbeConfigSnapshot>>,
    liveness: DashMap<String, Liveness>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_status(&self, device_id: &str, data: &Map<String, Value>, now: OffsetDateTime) {
        let mut entry = self.status.entry(device_id.to_string()).or_insert_with(|| Cached {
            value: ProbeStatusSnapshot::default(),
            updated_at: now,
        });
        entry.value.merge(data);
        entry.updated_at = now;
    }

    pub fn record_config(&self, device_id: &str, data: &Map<String, Value>, now: OffsetDateTime) {
        let mut entry = self.config.entry(device_id.to_string()).or_insert_with(|| Cached {
            value: ProbeConfigSnapshot::default(),
            updated_at: now,
        });
        entry.value.merge(data);
        entry.updated_at = now;
    }

    pub fn mark_online(&self, device_id: &str, now: OffsetDateTime) {
        self.liveness.insert(
            device_id.to_string(),
            Liveness {
                online: true,
                last_seen: now,
                updated_at: now,
            },
        );
    }

    pub fn status(&self, device_id: &str) -> Option<Cached<ProbeStatusSnapshot>> {
        self.status.get(device_id).map(|e| e.clone())
    }

    pub fn config(&self, device_id: &str) -> Option<Cached<ProbeConfigSnapshot>> {
        self.config.get(device_id).map(|e| e.clone())
    }

    pub fn liveness(&self, device_id: &str) -> Option<Liveness> {
        self.liveness.get(device_id).map(|e| *e)
    }

    /// Evicts snapshots older than `stale` and flips liveness to offline past `offline`.
    pub fn sweep(&self, now: OffsetDateTime, stale: Duration, offline: Duration) -> SweepReport {
        let older_than = |t: OffsetDateTime, limit: Duration| {
            (now - t).whole_milliseconds() > limit.as_millis() as i128
        };
        let mut report = SweepReport::default();

        let before = self.status.len();
        self.status.retain(|_, e| !older_than(e.updated_at, stale));
        report.statuses_evicted = before - self.status.len();

        let before = self.config.len();
        self.config.retain(|_, e| !older_than(e.updated_at, stale));
        report.configs_evicted = before - self.config.len();

        for mut entry in self.liveness.iter_mut() {
            if entry.online && older_than(entry.last_seen, offline) {
                entry.online = false;
                entry.updated_at = now;
                report.marked_offline += 1;
            }
        }

        report
    }
}
