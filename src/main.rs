use std::time::Duration;

use accontrol::bridge::StatusBridge;
use accontrol::command::DeviceCommand;
use accontrol::config::{ensure_default_config, AppConfig};
use accontrol::mqtt::{BrokerClient, MqttTransport};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = AppConfig::default_path();
    let mut config = ensure_default_config(&path).await?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    info!("Using broker {}", config.broker.broker_url());

    let client = BrokerClient::new(MqttTransport::default(), config.reconnect);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => monitor(client, config).await,
        [verb, device_id, command] if verb == "send" => {
            let command: DeviceCommand = command
                .parse()
                .map_err(|e| eyre!("Invalid command: {}", e))?;
            send(client, config, device_id, command).await
        }
        _ => Err(eyre!(
            "usage: accontrol [send <device-id> <COMMAND[=VALUE]>]"
        )),
    }
}

/// Connects, attaches a status bridge and reports device status until Ctrl-C
async fn monitor(client: BrokerClient, config: AppConfig) -> Result<()> {
    let bridge = StatusBridge::builder(client)
        .settings(config.bridge.clone())
        .connect_with(config.broker.clone())
        .track_device_status()
        .on_connect(|| info!("Broker connection established"))
        .on_disconnect(|attempts| warn!(attempts, "Broker connection lost"))
        .on_error(|e| warn!("Broker error: {}", e))
        .attach()
        .map_err(|e| eyre!("Invalid status pattern: {}", e))?;

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = report.tick() => log_report(&bridge),
        }
    }

    bridge.detach();
    Ok(())
}

fn log_report(bridge: &StatusBridge) {
    let statuses = bridge.device_statuses();
    info!(
        state = ?bridge.connection_state(),
        reconnect_attempts = bridge.reconnect_attempts(),
        devices = statuses.len(),
        "Status report"
    );
    if let Some(error) = bridge.last_error() {
        warn!("Last error: {}", error);
    }

    let mut keys: Vec<&String> = statuses.keys().collect();
    keys.sort();
    for key in keys {
        let status = &statuses[key];
        info!(
            device = key.as_str(),
            online = ?status.online(),
            temperature = ?status.current_temperature(),
            error = ?status.error(),
            "Last update {}",
            status.received_at.format("%H:%M:%S")
        );
    }
}

async fn send(
    client: BrokerClient,
    config: AppConfig,
    device_id: &str,
    command: DeviceCommand,
) -> Result<()> {
    let lease = client.acquire();
    client
        .connect(config.broker)
        .await
        .map_err(|e| eyre!("Failed to connect: {}", e))?;
    client
        .publish_command(device_id, &command)
        .await
        .map_err(|e| eyre!("Failed to send {}: {}", command, e))?;
    info!("Sent {} to {}", command, device_id);
    lease.release();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
