pub mod config;
pub mod device;
pub mod mower;
pub mod mqtt;
pub mod protocol;

use crate::config::{BridgeConfig, Overrides};
use crate::device::{DeviceClient, DeviceHandle};
use crate::mower::StatusSnapshot;
use crate::mqtt::MqttHandler;
use crate::protocol::negotiator::SessionNegotiator;
use crate::protocol::transport::TcpConnector;
use chrono::Local;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "moebot-bridge", version)]
#[command(about = "Local-network bridge between a MoeBot mower and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, env = "DEVICE_ID")]
    device_id: Option<String>,

    #[arg(long, env = "DEVICE_IP")]
    device_ip: Option<String>,

    #[arg(long, env = "LOCAL_KEY", hide_env_values = true)]
    local_key: Option<String>,

    #[arg(long, env = "MQTT_HOST")]
    mqtt_host: Option<String>,

    #[arg(long, env = "MQTT_PORT")]
    mqtt_port: Option<u16>,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_TOPIC")]
    mqtt_topic: Option<String>,

    /// Without a mode the bridge polls once, prints the status and exits
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Clone, Copy)]
enum Mode {
    /// Print status updates pushed by the mower until interrupted
    Listen,
    /// Run the MQTT bridge
    Mqtt,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            device_id: self.device_id.clone(),
            device_ip: self.device_ip.clone(),
            local_key: self.local_key.clone(),
            mqtt_host: self.mqtt_host.clone(),
            mqtt_port: self.mqtt_port,
            mqtt_username: self.mqtt_username.clone(),
            mqtt_password: self.mqtt_password.clone(),
            mqtt_topic: self.mqtt_topic.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config = BridgeConfig::load(cli.config.as_deref(), cli.overrides())?;
    let identity = config.identity()?;
    info!("Using device {} at {}", identity.device_id, identity.address);

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let settings = config.bridge.client.clone();
    let negotiator = SessionNegotiator::new(
        Arc::new(TcpConnector::new(settings.connect_timeout())),
        settings.request_timeout(),
    );
    let mut device = DeviceHandle::spawn(identity, negotiator, settings, cancel.clone());

    let outcome = match cli.mode {
        None => poll_once(device.client()).await,
        Some(Mode::Listen) => listen(device.client(), cancel.clone()).await,
        Some(Mode::Mqtt) => run_bridge(&config, device.client(), cancel.clone()).await,
    };

    device.shutdown().await;
    outcome
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
    let builder = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald stamps every line itself
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C");
        }
        cancel.cancel();
    });
}

async fn poll_once(client: DeviceClient) -> Result<()> {
    let version = client
        .wait_connected()
        .await
        .map_err(|e| eyre!("Could not connect to the mower: {e}"))?;
    info!("Connected using protocol {version}");

    let snapshot = client.poll().await?;
    let online = client.link_status().borrow().is_online();
    print!("{}", render_report(&snapshot, online));
    Ok(())
}

async fn listen(client: DeviceClient, cancel: CancellationToken) -> Result<()> {
    client
        .wait_connected()
        .await
        .map_err(|e| eyre!("Could not connect to the mower: {e}"))?;

    let mut updates = client.subscribe();
    let link = client.link_status();
    let initial = updates.borrow_and_update().clone();
    print!("{}", render_report(&initial, link.borrow().is_online()));
    info!("Listening for updates, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                println!("---");
                print!("{}", render_report(&snapshot, link.borrow().is_online()));
            }
        }
    }
    Ok(())
}

async fn run_bridge(
    config: &BridgeConfig,
    client: DeviceClient,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Starting MQTT bridge to {}:{} under {}",
        config.mqtt.host, config.mqtt.port, config.mqtt.topic
    );
    let handler = MqttHandler::new(&config.mqtt, client, config.bridge.poll_interval());
    let status = handler.run(cancel).await?;
    info!(
        "MQTT bridge stopped after {} received and {} published messages",
        status.messages_received, status.messages_sent
    );
    Ok(())
}

fn render_report(snapshot: &StatusSnapshot, online: bool) -> String {
    fn or_unknown<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
    }

    let mut out = String::new();
    let _ = writeln!(out, "Device Online: {online}");
    let _ = writeln!(out, "Battery:      {}%", or_unknown(snapshot.battery_percent));
    let _ = writeln!(out, "State:        {}", or_unknown(snapshot.state.as_ref()));
    let _ = writeln!(out, "Mow in rain:  {}", or_unknown(snapshot.rain_mode_enabled));
    let _ = writeln!(
        out,
        "Mow time:     {} hours",
        or_unknown(snapshot.mow_duration_hours)
    );
    let _ = writeln!(out, "Work mode:    {}", or_unknown(snapshot.work_mode.as_ref()));
    let _ = writeln!(out, "PIN:          {}", or_unknown(snapshot.pin_letters()));
    let _ = writeln!(out, "Errors:       {}", snapshot.machine_errors());
    let _ = writeln!(
        out,
        "Emergency State: {}",
        snapshot.active_emergency().unwrap_or("none")
    );
    for (index, zone) in snapshot.zones.iter().enumerate() {
        if let Some(zone) = zone {
            let _ = writeln!(
                out,
                "Zone {}:       {} m, {}%",
                index + 1,
                zone.distance,
                zone.ratio
            );
        }
    }
    let _ = writeln!(
        out,
        "Last update:  {}",
        snapshot.last_updated_at.map_or_else(
            || "never".to_string(),
            |at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
        )
    );
    out
}
