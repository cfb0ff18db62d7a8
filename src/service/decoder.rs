use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;

use crate::domain::{EnhancedMetrics, LinkMetrics, Params, TelemetryRecord, TelemetryVariant};
use crate::error::DecodeError;

const IDENTITY_KEY: &str = "pid";
const TIMESTAMP_KEY: &str = "epoch";
const VARIANT_KEY: &str = "type";

const LINK_KEYS: &[&str] = &[
    "rssi", "lat", "loss", "dns", "ch", "cong", "bssid", "neighbors", "overlap",
];
const ENHANCED_KEYS: &[&str] = &["snr", "qual", "util", "phy", "tput", "noise", "up"];

fn whole(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Values outside the i32 range stay unset rather than wrapping.
fn int(data: &Map<String, Value>, key: &str) -> Option<i32> {
    data.get(key)
        .and_then(whole)
        .and_then(|v| i32::try_from(v).ok())
}

fn float(data: &Map<String, Value>, key: &str) -> Option<f64> {
    data.get(key).and_then(Value::as_f64)
}

fn text(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn link_metrics(data: &Map<String, Value>) -> LinkMetrics {
    LinkMetrics {
        rssi: int(data, "rssi"),
        latency: int(data, "lat"),
        packet_loss: float(data, "loss"),
        dns_time: int(data, "dns"),
        channel: int(data, "ch"),
        bssid: text(data, "bssid"),
        neighbors: int(data, "neighbors"),
        overlap: int(data, "overlap"),
        congestion: int(data, "cong"),
    }
}

fn enhanced_metrics(data: &Map<String, Value>) -> EnhancedMetrics {
    EnhancedMetrics {
        snr: float(data, "snr"),
        link_quality: float(data, "qual"),
        utilization: float(data, "util"),
        phy_mode: text(data, "phy"),
        throughput: int(data, "tput"),
        noise_floor: int(data, "noise"),
        uptime: data
            .get("up")
            .and_then(whole),
    }
}

/// Parses one raw telemetry message.
pub fn decode(payload: &[u8], received_at: OffsetDateTime) -> Result<TelemetryRecord, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    decode_value(value, received_at)
}

pub fn decode_value(value: Value, received_at: OffsetDateTime) -> Result<TelemetryRecord, DecodeError> {
    let Value::Object(data) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let device_id = match data.get(IDENTITY_KEY).and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => return Err(DecodeError::MissingIdentity(IDENTITY_KEY)),
    };

    let epoch = data
        .get(TIMESTAMP_KEY)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or(DecodeError::MissingTimestamp(TIMESTAMP_KEY))?;
    let timestamp = OffsetDateTime::from_unix_timestamp(epoch)
        .map_err(|_| DecodeError::InvalidTimestamp(epoch))?;

    let variant = match data.get(VARIANT_KEY).and_then(Value::as_str) {
        None => return Err(DecodeError::MissingVariant),
        Some("light") => TelemetryVariant::Light,
        Some("enhanced") => TelemetryVariant::Enhanced(enhanced_metrics(&data)),
        Some(other) => return Err(DecodeError::UnknownVariant(other.to_string())),
    };

    let link = link_metrics(&data);
    let consumed = |key: &str| {
        key == IDENTITY_KEY
            || key == TIMESTAMP_KEY
            || key == VARIANT_KEY
            || LINK_KEYS.contains(&key)
            || (variant.enhanced().is_some() && ENHANCED_KEYS.contains(&key))
    };
    let metadata = data
        .iter()
        .filter(|(k, _)| !consumed(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(TelemetryRecord {
        device_id,
        timestamp,
        received_at,
        link,
        variant,
        metadata,
    })
}

/// Offline uploads may carry one record or a JSON array of them.
pub fn decode_batch(
    payload: &[u8],
    received_at: OffsetDateTime,
) -> Result<Vec<Result<TelemetryRecord, DecodeError>>, DecodeError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| decode_value(item, received_at))
            .collect()),
        single => Ok(vec![decode_value(single, received_at)]),
    }
}

/// Builds a telemetry record from a completed deep-scan result.
///
/// The result carries the usual wire keys, either at top level or under
/// `telemetry`; identity and timestamp default to the issuing device and now.
pub fn record_from_scan(
    device_id: &str,
    result: &Params,
    now: OffsetDateTime,
) -> Result<TelemetryRecord, DecodeError> {
    let mut data = match result.get("telemetry").and_then(Value::as_object) {
        Some(inner) => inner.clone(),
        None => result.clone(),
    };
    data.insert(IDENTITY_KEY.to_string(), Value::from(device_id));
    if !data.contains_key(TIMESTAMP_KEY) {
        data.insert(TIMESTAMP_KEY.to_string(), Value::from(now.unix_timestamp()));
    }
    if !data.contains_key(VARIANT_KEY) {
        let variant = if ENHANCED_KEYS.iter().any(|k| data.contains_key(*k)) {
            "enhanced"
        } else {
            "light"
        };
        data.insert(VARIANT_KEY.to_string(), Value::from(variant));
    }
    data.insert("source".to_string(), Value::from("deep_scan"));
    decode_value(Value::Object(data), now)
}
