use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{AlertConfig, Topics};
use crate::service::commands::CommandSettings;
use crate::service::monitor::MonitorSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id_prefix: String,
    pub instance_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keep_alive_secs: u64,
    pub database_url: String,
    pub db_max_connections: u32,
    pub topic_namespace: String,
    pub rssi_threshold: f64,
    pub rssi_window: usize,
    pub latency_threshold: f64,
    pub latency_window: usize,
    pub liveness_freshness_secs: u64,
    pub liveness_poll_ms: u64,
    pub liveness_deadline_secs: u64,
    pub scan_retention: i64,
    pub monitor_sweep_secs: u64,
    pub monitor_stale_secs: u64,
    pub monitor_offline_secs: u64,
    /// Zero disables the fleet pinger.
    pub fleet_ping_interval_secs: u64,
    pub worker_concurrency: usize,
    pub metrics_port: u16,
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        _ => Ok(default),
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not

        let config = AppConfig {
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: parse_or("MQTT_PORT", 1883)?,
            mqtt_client_id_prefix: env::var("MQTT_CLIENT_ID_PREFIX")
                .unwrap_or_else(|_| "probe_fleet".to_string()),
            instance_id: env::var("INSTANCE_ID").unwrap_or_else(|_| "1".to_string()),
            mqtt_username: optional("MQTT_USERNAME"),
            mqtt_password: optional("MQTT_PASSWORD"),
            mqtt_keep_alive_secs: parse_or("MQTT_KEEP_ALIVE_SECS", 30)?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 20)?,
            topic_namespace: env::var("TOPIC_NAMESPACE")
                .unwrap_or_else(|_| "campus/probes".to_string()),
            rssi_threshold: parse_or("RSSI_THRESHOLD", -85.0)?,
            rssi_window: parse_or("RSSI_WINDOW", 3)?,
            latency_threshold: parse_or("LATENCY_THRESHOLD", 500.0)?,
            latency_window: parse_or("LATENCY_WINDOW", 3)?,
            liveness_freshness_secs: parse_or("LIVENESS_FRESHNESS_SECS", 60)?,
            liveness_poll_ms: parse_or("LIVENESS_POLL_MS", 500)?,
            liveness_deadline_secs: parse_or("LIVENESS_DEADLINE_SECS", 5)?,
            scan_retention: parse_or("SCAN_RETENTION", 5)?,
            monitor_sweep_secs: parse_or("MONITOR_SWEEP_SECS", 300)?,
            monitor_stale_secs: parse_or("MONITOR_STALE_SECS", 900)?,
            monitor_offline_secs: parse_or("MONITOR_OFFLINE_SECS", 180)?,
            fleet_ping_interval_secs: parse_or("FLEET_PING_INTERVAL_SECS", 0)?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 8)?,
            metrics_port: parse_or("METRICS_PORT", 9000)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.rssi_window > 0, "RSSI_WINDOW must be at least 1");
        anyhow::ensure!(self.latency_window > 0, "LATENCY_WINDOW must be at least 1");
        anyhow::ensure!(self.liveness_poll_ms > 0, "LIVENESS_POLL_MS must be positive");
        anyhow::ensure!(self.monitor_sweep_secs > 0, "MONITOR_SWEEP_SECS must be positive");
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics::new(self.topic_namespace.clone())
    }

    pub fn alert_config(&self) -> AlertConfig {
        AlertConfig {
            rssi_threshold: self.rssi_threshold,
            rssi_window: self.rssi_window,
            latency_threshold: self.latency_threshold,
            latency_window: self.latency_window,
        }
    }

    pub fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            freshness: Duration::from_secs(self.liveness_freshness_secs),
            poll_interval: Duration::from_millis(self.liveness_poll_ms),
            deadline: Duration::from_secs(self.liveness_deadline_secs),
            scan_retention: self.scan_retention,
            ..CommandSettings::default()
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            sweep_interval: Duration::from_secs(self.monitor_sweep_secs),
            stale_after: Duration::from_secs(self.monitor_stale_secs),
            offline_after: Duration::from_secs(self.monitor_offline_secs),
            ..MonitorSettings::default()
        }
    }

    pub fn fleet_ping_interval(&self) -> Option<Duration> {
        (self.fleet_ping_interval_secs > 0).then(|| Duration::from_secs(self.fleet_ping_interval_secs))
    }
}
