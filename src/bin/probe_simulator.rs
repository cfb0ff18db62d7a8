use clap::Parser;
use probe_fleet_ingestor::domain::{CommandMessage, Topics, BROADCAST_DEVICE};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulates a fleet of campus network probes", long_about = None)]
struct Args {
    /// MQTT Broker Host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Topic namespace shared with the ingestor
    #[arg(long, default_value = "campus/probes")]
    namespace: String,

    /// Number of simulated probes
    #[arg(long, default_value_t = 5)]
    probes: u32,

    /// Telemetry messages per second across all probes
    #[arg(long, default_value_t = 10)]
    rate: u64,

    /// Every Nth sample is sent as enhanced telemetry (0 = light only)
    #[arg(long, default_value_t = 4)]
    enhanced_every: u64,

    /// Seconds between status broadcasts per probe
    #[arg(long, default_value_t = 30)]
    status_interval: u64,

    /// Duration of the run in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,
}

fn probe_id(index: u64) -> String {
    format!("sim-probe-{:03}", index + 1)
}

fn telemetry_sample(device: &str, enhanced: bool) -> Value {
    let mut rng = rand::thread_rng();
    let mut sample = json!({
        "pid": device,
        "type": if enhanced { "enhanced" } else { "light" },
        "epoch": ::time::OffsetDateTime::now_utc().unix_timestamp(),
        "rssi": rng.gen_range(-92..-45),
        "lat": rng.gen_range(5..650),
        "loss": rng.gen_range(0.0..5.0),
        "dns": rng.gen_range(2..120),
        "ch": ([1, 6, 11][rng.gen_range(0..3)]),
        "neighbors": rng.gen_range(0..25),
        "cong": rng.gen_range(0..100),
    });
    if enhanced {
        if let Some(obj) = sample.as_object_mut() {
            obj.insert("snr".into(), json!(rng.gen_range(5.0..45.0)));
            obj.insert("qual".into(), json!(rng.gen_range(0.2..1.0)));
            obj.insert("util".into(), json!(rng.gen_range(0.0..90.0)));
            obj.insert("phy".into(), json!("802.11ax"));
            obj.insert("tput".into(), json!(rng.gen_range(10..600)));
            obj.insert("noise".into(), json!(rng.gen_range(-98..-85)));
            obj.insert("up".into(), json!(rng.gen_range(60..86_400)));
        }
    }
    sample
}

fn status_broadcast(device: &str, started: Instant) -> Value {
    let mut rng = rand::thread_rng();
    json!({
        "probe_id": device,
        "uptime": started.elapsed().as_secs(),
        "free_heap": rng.gen_range(80_000..200_000),
        "rssi": rng.gen_range(-90..-45),
        "ip": "10.0.0.42",
        "ssid": "campus-wifi",
        "temp_c": rng.gen_range(30.0..55.0),
        "timestamp": ::time::OffsetDateTime::now_utc().unix_timestamp(),
    })
}

/// Builds the result a real probe would send back, or None for commands it ignores.
fn answer(device: &str, command: &CommandMessage, started: Instant) -> Option<Value> {
    let result = match command.command_type.as_str() {
        "ping" => json!({ "pong": true }),
        "get_status" => status_broadcast(device, started),
        "get_config" => json!({
            "wifi": { "ssid": "campus-wifi" },
            "mqtt": { "server": "localhost", "port": 1883 },
        }),
        "deep_scan" => json!({ "telemetry": telemetry_sample(device, true) }),
        "factory_reset" | "ota_update" => return None,
        _ => json!({ "applied": true }),
    };
    Some(json!({
        "device": device,
        "command_type": command.command_type,
        "status": "completed",
        "command_id": command.correlation_id,
        "result": result,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("Starting probe simulator with config: {:?}", args);
    anyhow::ensure!(args.probes > 0 && args.rate > 0, "--probes and --rate must be positive");

    let topics = Topics::new(args.namespace.clone());
    let started = Instant::now();

    // 1. Setup MQTT Client
    let client_id = format!("probe_simulator_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    let devices: Vec<String> = (0..args.probes as u64).map(probe_id).collect();
    for device in &devices {
        client.subscribe(topics.command(device), QoS::AtLeastOnce).await?;
    }
    client.subscribe(topics.broadcast_command(), QoS::AtLeastOnce).await?;

    // 2. Command responder: answers from inside the event loop task
    let responder = client.clone();
    let responder_topics = topics.clone();
    let responder_devices = devices.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let command: CommandMessage = match serde_json::from_slice(&publish.payload) {
                        Ok(c) => c,
                        Err(e) => {
                            eprintln!("Ignoring undecodable command on {}: {}", publish.topic, e);
                            continue;
                        }
                    };
                    let targets: Vec<String> = match responder_topics.device_segment(&publish.topic) {
                        Some(device) if device != BROADCAST_DEVICE => vec![device.to_string()],
                        _ => responder_devices.clone(),
                    };
                    for device in targets {
                        let Some(reply) = answer(&device, &command, started) else {
                            continue;
                        };
                        let topic = responder_topics.result(&device);
                        let client = responder.clone();
                        // The event loop must keep polling while the reply is queued.
                        tokio::spawn(async move {
                            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, reply.to_string()).await {
                                eprintln!("Failed to publish result: {:?}", e);
                            }
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("MQTT error: {:?}. Retrying in 5s", e);
                    time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    // 3. Load Generation Loop
    let interval_duration = Duration::from_micros(1_000_000 / args.rate);
    let mut interval = time::interval(interval_duration);
    let mut status_ticker = time::interval(Duration::from_secs(args.status_interval.max(1)));
    let mut total_sent: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if args.duration > 0 && started.elapsed().as_secs() >= args.duration {
                    println!("Configured duration {:?}s elapsed. Stopping.", args.duration);
                    break;
                }

                let device = &devices[(total_sent % devices.len() as u64) as usize];
                let enhanced = args.enhanced_every > 0 && total_sent % args.enhanced_every == 0;
                let payload = telemetry_sample(device, enhanced).to_string();

                if let Err(e) = client.publish(topics.telemetry(), QoS::AtLeastOnce, false, payload).await {
                    eprintln!("Failed to publish: {:?}", e);
                }

                total_sent += 1;
                if total_sent % args.rate == 0 {
                    println!("Sent {} telemetry messages...", total_sent);
                }
            }
            _ = status_ticker.tick() => {
                for device in &devices {
                    let payload = status_broadcast(device, started).to_string();
                    if let Err(e) = client.publish(topics.status(device), QoS::AtMostOnce, false, payload).await {
                        eprintln!("Failed to publish status: {:?}", e);
                    }
                }
            }
        }
    }

    println!("Simulation complete. Total telemetry sent: {}", total_sent);
    Ok(())
}
