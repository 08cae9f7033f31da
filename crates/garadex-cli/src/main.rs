//! Command-line runner for garadex door controllers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use garadex_cloud::{CloudSession, Credentials, DeviceRecord};
use garadex_core::EventBus;
use garadex_devices::{
    CloudTransport, CloudTransportConfig, GarageDoor, GarageDoorConfig, LocalTransport,
    LocalTransportConfig,
};

mod config;

use config::{ConnectionKind, PlatformConfig};

/// Broker used when the device directory does not name one.
const DEFAULT_BROKER: &str = "eu-iot.meross.com";

/// Garadex - networked garage door control.
#[derive(Parser, Debug)]
#[command(name = "garadex")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the platform configuration file.
    #[arg(short, long, default_value = "garadex.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controllers for every configured device.
    Run,
    /// List the devices registered to the cloud account and exit.
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let config = PlatformConfig::load(&args.config)?;

    match args.command {
        Command::Run => cmd_run(config).await,
        Command::Devices => cmd_devices(config).await,
    }
}

fn init_logging() {
    let json_logging = std::env::var("GARADEX_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn cloud_login(config: &PlatformConfig) -> Result<(CloudSession, Credentials)> {
    let username = config
        .username
        .clone()
        .ok_or_else(|| anyhow!("cloud username is not configured"))?;
    let password = config
        .password
        .clone()
        .ok_or_else(|| anyhow!("cloud password is not configured"))?;
    let mut session = CloudSession::new(username, password)?;
    let credentials = session.login().await.context("cloud login failed")?;
    Ok((session, credentials))
}

async fn cmd_devices(config: PlatformConfig) -> Result<()> {
    let (session, _credentials) = cloud_login(&config).await?;
    let devices = session.list_devices().await?;

    if devices.is_empty() {
        println!("no devices registered to this account");
        return Ok(());
    }
    for device in &devices {
        println!(
            "{}  {:<10} {:<24} {} {}",
            device.uuid,
            device.device_type,
            device.dev_name,
            if device.is_online() { "online" } else { "offline" },
            device.domain.as_deref().unwrap_or("-"),
        );
        // Hubs (msh*) carry their garage doors as sub-devices.
        if device.device_type.to_lowercase().starts_with("msh") {
            match session.list_sub_devices(&device.uuid).await {
                Ok(subs) => {
                    for sub in subs {
                        println!(
                            "    {}  {:<10} {}",
                            sub.sub_device_id,
                            sub.sub_device_type.as_deref().unwrap_or("-"),
                            sub.sub_device_name.as_deref().unwrap_or("-"),
                        );
                    }
                }
                Err(e) => warn!(hub = %device.uuid, error = %e, "sub-device lookup failed"),
            }
        }
    }
    Ok(())
}

async fn cmd_run(config: PlatformConfig) -> Result<()> {
    let bus = EventBus::new();
    spawn_event_logger(&bus);

    // One login covers every cloud device.
    let cloud = if config.needs_cloud() {
        let (session, credentials) = cloud_login(&config).await?;
        let records = session.list_devices().await?;
        Some((credentials, records))
    } else {
        None
    };

    let mut doors: Vec<GarageDoor> = Vec::new();
    let mut cloud_transports: Vec<Arc<CloudTransport>> = Vec::new();

    for device in &config.devices {
        let mut door_config = GarageDoorConfig::new(device.display_name());
        door_config.operation_time = Duration::from_secs(device.operation_time);

        let door = match device.connection {
            ConnectionKind::Local => {
                // Presence of host and key is checked at config load.
                let host = device.host.clone().unwrap_or_default();
                let key = device.key.clone().unwrap_or_default();
                door_config.poll_interval = Duration::from_secs(config.refresh_rate);

                let transport = Arc::new(LocalTransport::new(LocalTransportConfig::new(
                    host,
                    key,
                    &device.uuid,
                ))?);
                GarageDoor::new(door_config, transport, bus.clone())
            }
            ConnectionKind::Cloud => {
                let (credentials, records) = cloud
                    .as_ref()
                    .ok_or_else(|| anyhow!("cloud connection requested without an account"))?;
                let record = find_record(records, &device.uuid)
                    .ok_or_else(|| anyhow!("device {} is not in the account", device.uuid))?;
                if !record.is_online() {
                    warn!(device = %device.display_name(), "device is reported offline");
                }
                let broker = record.domain.clone().unwrap_or_else(|| DEFAULT_BROKER.to_string());
                // Pushes carry most cloud updates; the poll is a slow safety net.
                door_config.poll_interval = Duration::from_secs(config.cloud_refresh_rate);

                let transport = Arc::new(
                    CloudTransport::connect(CloudTransportConfig::new(
                        &device.uuid,
                        &credentials.user_id,
                        &credentials.key,
                        broker,
                    ))
                    .await?,
                );
                let door = GarageDoor::new(door_config, transport.clone(), bus.clone());
                door.attach_push(transport.notifications());
                cloud_transports.push(transport);
                door
            }
        };

        info!(device = %device.display_name(), uuid = %device.uuid, "controller started");
        door.start_polling();
        doors.push(door);
    }

    info!(devices = doors.len(), "garadex running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for door in &doors {
        door.shutdown();
    }
    for transport in &cloud_transports {
        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "MQTT disconnect failed");
        }
    }
    Ok(())
}

fn find_record<'a>(records: &'a [DeviceRecord], uuid: &str) -> Option<&'a DeviceRecord> {
    records.iter().find(|r| r.uuid == uuid)
}

fn spawn_event_logger(bus: &EventBus) {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Some((event, meta)) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(source = %meta.source, event = %json, "event"),
                Err(_) => info!(source = %meta.source, ?event, "event"),
            }
        }
    });
}
