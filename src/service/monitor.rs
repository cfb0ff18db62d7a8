use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use sqlx::types::time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::Topics;
use crate::error::TransportError;
use crate::ports::{DeviceRegistry, InboundMessage, MessageBroker};
use crate::service::devices::{spawn_touch, DeviceService};
use crate::state::{ProbeCache, SweepReport};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub offline_after: Duration,
    pub touch_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(15 * 60),
            offline_after: Duration::from_secs(3 * 60),
            touch_timeout: Duration::from_secs(10),
        }
    }
}

/// Mirrors unsolicited status/config broadcasts into the probe cache.
pub struct ProbeMonitor {
    cache: Arc<ProbeCache>,
    registry: Arc<dyn DeviceRegistry>,
    broker: Arc<dyn MessageBroker>,
    topics: Topics,
    settings: MonitorSettings,
}

fn parse_broadcast(kind: &str, payload: &[u8]) -> Option<(String, Map<String, Value>)> {
    let data: Map<String, Value> = match serde_json::from_slice(payload) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to parse {} broadcast: {}", kind, e);
            return None;
        }
    };
    match data.get("probe_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Some((id.to_string(), data)),
        _ => {
            warn!("{} broadcast missing probe_id", kind);
            None
        }
    }
}

impl ProbeMonitor {
    pub fn new(
        cache: Arc<ProbeCache>,
        registry: Arc<dyn DeviceRegistry>,
        broker: Arc<dyn MessageBroker>,
        topics: Topics,
        settings: MonitorSettings,
    ) -> Self {
        Self { cache, registry, broker, topics, settings }
    }

    pub fn cache(&self) -> &Arc<ProbeCache> {
        &self.cache
    }

    /// Returns the device key the broadcast was cached under.
    pub fn handle_status(&self, payload: &[u8]) -> Option<String> {
        let (device_id, data) = parse_broadcast("status", payload)?;
        let now = OffsetDateTime::now_utc();
        self.cache.record_status(&device_id, &data, now);
        self.cache.mark_online(&device_id, now);

        spawn_touch(self.registry.clone(), device_id.clone(), now, self.settings.touch_timeout);

        debug!(device_id = %device_id, "Cached status broadcast");
        Some(device_id)
    }

    pub fn handle_config(&self, payload: &[u8]) -> Option<String> {
        let (device_id, data) = parse_broadcast("config", payload)?;
        self.cache.record_config(&device_id, &data, OffsetDateTime::now_utc());
        debug!(device_id = %device_id, "Cached config broadcast");
        Some(device_id)
    }

    pub fn sweep(&self) -> SweepReport {
        let report = self.cache.sweep(
            OffsetDateTime::now_utc(),
            self.settings.stale_after,
            self.settings.offline_after,
        );
        if report != SweepReport::default() {
            info!(
                statuses = report.statuses_evicted,
                configs = report.configs_evicted,
                offline = report.marked_offline,
                "Probe cache sweep"
            );
        }
        report
    }

    /// Subscribes and spawns the status, config and sweep tasks.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let status_rx = self.broker.subscribe(&self.topics.status_pattern()).await?;
        let config_rx = self.broker.subscribe(&self.topics.config_pattern()).await?;
        info!("Probe monitor subscribed to status and config broadcasts");

        let status = {
            let monitor = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                monitor
                    .consume("status", status_rx, shutdown, |m, msg| {
                        m.handle_status(&msg.payload);
                    })
                    .await
            })
        };
        let config = {
            let monitor = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                monitor
                    .consume("config", config_rx, shutdown, |m, msg| {
                        m.handle_config(&msg.payload);
                    })
                    .await
            })
        };
        let sweeper = {
            let monitor = self.clone();
            tokio::spawn(async move { monitor.run_sweeper(shutdown).await })
        };

        Ok(vec![status, config, sweeper])
    }

    async fn consume(
        &self,
        kind: &'static str,
        mut rx: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
        handle: impl Fn(&Self, InboundMessage),
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => handle(self, msg),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("{} broadcast subscriber stopping", kind);
    }

    async fn flag_stale_devices(&self) {
        let devices = DeviceService::new(self.registry.clone());
        if let Err(e) = devices.mark_stale(self.settings.stale_after).await {
            warn!("Stale device check failed: {}", e);
        }
    }

    async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                    self.flag_stale_devices().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Stale data sweeper stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Device, DeviceStatus};
    use crate::ports::mock::{MemoryRegistry, RecordingBroker};

    fn monitor(settings: MonitorSettings) -> (Arc<ProbeMonitor>, Arc<MemoryRegistry>, Arc<RecordingBroker>) {
        let registry = Arc::new(MemoryRegistry::with_device(Device::placeholder(
            "p1",
            OffsetDateTime::now_utc() - time::Duration::hours(1),
        )));
        let broker = Arc::new(RecordingBroker::new());
        let monitor = Arc::new(ProbeMonitor::new(
            Arc::new(ProbeCache::new()),
            registry.clone(),
            broker.clone(),
            Topics::default(),
            settings,
        ));
        (monitor, registry, broker)
    }

    #[tokio::test]
    async fn test_status_without_probe_id_is_dropped() {
        let (monitor, _, _) = monitor(MonitorSettings::default());
        assert!(monitor.handle_status(br#"{"uptime": 5}"#).is_none());
        assert!(monitor.handle_status(b"not json").is_none());
        assert!(monitor.cache().status("p1").is_none());
    }

    #[tokio::test]
    async fn test_status_marks_online_and_touches_registry() {
        let (monitor, registry, _) = monitor(MonitorSettings::default());
        let id = monitor
            .handle_status(br#"{"probe_id":"p1","uptime":120,"free_heap":40000,"ip":"10.1.2.3"}"#)
            .unwrap();
        assert_eq!(id, "p1");
        assert!(monitor.cache().liveness("p1").unwrap().online);
        assert_eq!(monitor.cache().status("p1").unwrap().value.free_heap, Some(40000));

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let device = registry.get("p1").unwrap();
        assert!(device.seen_within(OffsetDateTime::now_utc(), Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_config_broadcast_is_cached() {
        let (monitor, _, _) = monitor(MonitorSettings::default());
        monitor.handle_config(br#"{"probe_id":"p1","wifi":{"ssid":"campus"},"heap_free":1024}"#);
        let config = monitor.cache().config("p1").unwrap().value;
        assert_eq!(config.wifi.unwrap()["ssid"], "campus");
        assert_eq!(config.heap_free, Some(1024));
        assert!(monitor.cache().liveness("p1").is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_entries_past_staleness() {
        let (monitor, _, _) = monitor(MonitorSettings {
            stale_after: Duration::ZERO,
            offline_after: Duration::ZERO,
            ..MonitorSettings::default()
        });
        monitor.handle_status(br#"{"probe_id":"p1","uptime":1}"#);
        monitor.handle_config(br#"{"probe_id":"p1","uptime":1}"#);
        std::thread::sleep(Duration::from_millis(5));

        let report = monitor.sweep();
        assert_eq!(report.statuses_evicted, 1);
        assert_eq!(report.configs_evicted, 1);
        assert_eq!(report.marked_offline, 1);
        assert!(monitor.cache().status("p1").is_none());
        assert!(!monitor.cache().liveness("p1").unwrap().online);
    }

    #[tokio::test]
    async fn test_subscriptions_feed_the_cache() {
        let (monitor, _, broker) = monitor(MonitorSettings::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = monitor.start(shutdown_rx).await.unwrap();

        broker
            .inject("campus/probes/p1/status", br#"{"probe_id":"p1","rssi":-58}"#)
            .await;
        broker
            .inject("campus/probes/p1/config", br#"{"probe_id":"p1","uptime":77}"#)
            .await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(monitor.cache().status("p1").unwrap().value.rssi, Some(-58));
        assert_eq!(monitor.cache().config("p1").unwrap().value.uptime, Some(77));

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_flags_silent_active_devices() {
        let (monitor, registry, _) = monitor(MonitorSettings {
            sweep_interval: Duration::from_secs(1),
            ..MonitorSettings::default()
        });
        let mut quiet = Device::placeholder("p2", OffsetDateTime::now_utc() - time::Duration::hours(1));
        quiet.status = DeviceStatus::Active;
        registry.insert(quiet);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = monitor.start(shutdown_rx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(registry.get("p2").unwrap().status, DeviceStatus::Stale);
        assert_eq!(registry.get("p1").unwrap().status, DeviceStatus::Unknown);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
