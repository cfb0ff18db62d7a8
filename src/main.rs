use std::sync::Arc;
use std::time::Duration;

use probe_fleet_ingestor::adapters::{MqttAdapter, MqttAlertNotifier, PostgresRepository};
use probe_fleet_ingestor::config::AppConfig;
use probe_fleet_ingestor::ports::MessageBroker;
use probe_fleet_ingestor::service::alerts::AlertService;
use probe_fleet_ingestor::service::commands::CommandManager;
use probe_fleet_ingestor::service::evaluator::AlertEvaluator;
use probe_fleet_ingestor::service::ingest::TelemetryPipeline;
use probe_fleet_ingestor::service::monitor::ProbeMonitor;
use probe_fleet_ingestor::service::pinger::FleetPinger;
use probe_fleet_ingestor::service::processor::{spawn_ingest_forwarders, ServiceProcessor};
use probe_fleet_ingestor::service::worker_pool::WorkerPool;
use probe_fleet_ingestor::state::ProbeCache;
use probe_fleet_ingestor::telemetry;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 0. Load Env Vars First
    dotenvy::dotenv().ok();

    // 1. Initialize Structured Logging
    telemetry::init_tracing();
    info!("Starting probe fleet ingestor...");

    // 2. Load Configuration
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {:?}", e);
            std::process::exit(1);
        }
    };
    info!(namespace = %config.topic_namespace, "Configuration loaded.");

    // 3. Initialize Metrics
    telemetry::init_metrics(config.metrics_port)?;
    info!("Prometheus Metrics listening on 0.0.0.0:{}", config.metrics_port);

    // 4. Initialize Database Pool
    info!("Connecting to Database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to DB: {:?}", e))?;
    info!("Database connection established.");
    let repo = Arc::new(PostgresRepository::new(pool));

    // 5. MQTT transport
    let topics = config.topics();
    let (mqtt, eventloop) = MqttAdapter::build(&config);
    let mqtt = Arc::new(mqtt);
    let broker: Arc<dyn MessageBroker> = mqtt.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // The transport outlives the workers so in-flight jobs can still publish.
    let (mqtt_stop_tx, mqtt_stop_rx) = watch::channel(false);
    let mqtt_for_loop = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        mqtt_for_loop.run_event_loop(eventloop, mqtt_stop_rx).await;
    });

    // 6. Services
    let notifier = Arc::new(MqttAlertNotifier::new(broker.clone(), &topics));
    let alert_service = Arc::new(AlertService::new(repo.clone(), notifier));
    let evaluator = Arc::new(AlertEvaluator::new(config.alert_config(), alert_service));
    let pipeline = Arc::new(TelemetryPipeline::new(repo.clone(), repo.clone(), evaluator));
    let cache = Arc::new(ProbeCache::new());

    let commands = Arc::new(
        CommandManager::new(
            repo.clone(),
            repo.clone(),
            broker.clone(),
            cache.clone(),
            topics.clone(),
            config.command_settings(),
            shutdown_rx.clone(),
        )
        .with_telemetry(pipeline.clone()),
    );

    match commands.pending().await {
        Ok(open) if !open.is_empty() => warn!(count = open.len(), "Commands left open by a previous run"),
        Ok(_) => {}
        Err(e) => warn!("Could not list open commands: {}", e),
    }

    // 7. Passive monitor
    let monitor = Arc::new(ProbeMonitor::new(
        cache,
        repo.clone(),
        broker.clone(),
        topics.clone(),
        config.monitor_settings(),
    ));
    let monitor_handles = monitor.start(shutdown_rx.clone()).await?;

    // 8. Ingest forwarders -> worker pool
    let processor = Arc::new(ServiceProcessor::new(topics.clone(), pipeline, commands.clone()));
    let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(10000);
    let forwarder_handles = spawn_ingest_forwarders(broker.clone(), &topics, raw_tx, shutdown_rx.clone()).await?;

    let worker_pool = WorkerPool::new(processor, config.worker_concurrency);
    let worker_handle = tokio::spawn(async move {
        worker_pool.run(raw_rx).await;
    });

    // 9. Optional fleet pinger
    let pinger_handle = config.fleet_ping_interval().map(|interval| {
        let pinger = FleetPinger::new(commands.clone(), repo.clone(), interval);
        tokio::spawn(pinger.run(shutdown_rx.clone()))
    });

    info!("System Running. Press Ctrl+C to stop.");

    // 10. Shutdown Signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown Signal Received..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    // 11. Graceful Shutdown
    let _ = shutdown_tx.send(true);

    // Forwarders exit -> senders drop -> worker pool drains and exits.
    for handle in forwarder_handles {
        let _ = handle.await;
    }

    let timeout = Duration::from_secs(20);
    info!("Waiting for Worker Pool to drain...");
    match tokio::time::timeout(timeout, worker_handle).await {
        Ok(_) => info!("Worker Pool drained."),
        Err(_) => warn!("Timeout waiting for Worker Pool."),
    }

    for handle in monitor_handles.into_iter().chain(pinger_handle) {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    let health = mqtt.health();
    info!(connected = health.connected, subscriptions = health.subscriptions, "Stopping transport");
    let _ = mqtt_stop_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), mqtt_handle).await.is_err() {
        warn!("Timeout waiting for MQTT loop.");
    }

    info!("Shutdown Complete.");
    Ok(())
}
