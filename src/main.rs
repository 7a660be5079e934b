use anyhow::{bail, Context, Result};
use beaconwatch_core::config::{LogFormat, LoggingConfig};
use beaconwatch_core::AppConfig;
use beaconwatch_discovery::{DiscoveryEvent, DiscoveryService};
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Beaconwatch - passive discovery of devices announcing themselves over UDP multicast
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BEACONWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds of silence before a device is reported as removed
    #[arg(long)]
    timeout: Option<u64>,

    /// Seconds between sweeps for silent devices
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Local interface address used to join the multicast group
    #[arg(long)]
    interface: Option<Ipv4Addr>,

    /// Print each event as a JSON line
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_tracing(&config.logging)?;

    let service =
        DiscoveryService::new(config.discovery).context("Failed to create discovery service")?;
    let events = service.subscribe();

    let run = service
        .start()
        .await
        .context("Failed to start device discovery")?;

    info!(
        run_id = run.run_id(),
        local_addr = ?run.local_addr(),
        group = %service.config().multicast_group,
        "Watching for device beacons. Press Ctrl+C to stop"
    );

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut fault = None;
    loop {
        tokio::select! {
            received = events.recv() => {
                let Ok(event) = received else { break };
                print_event(&event, args.json)?;

                if let DiscoveryEvent::Fault(cause) = event {
                    error!(error = %cause, "Discovery stopped unexpectedly");
                    fault = Some(cause);
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    service.stop().await;

    if let Some(cause) = fault {
        bail!("Discovery failed: {}", cause);
    }

    info!("Beaconwatch stopped");
    Ok(())
}

/// Loads the configuration file and environment, then applies command line overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = AppConfig::load(args.config.as_deref())
        .with_context(|| match &args.config {
            Some(path) => format!("Failed to load config file: {:?}", path),
            None => "Failed to load configuration".to_string(),
        })?;

    if let Some(timeout) = args.timeout {
        config.discovery.liveness_timeout_secs = timeout;
    }
    if let Some(interval) = args.sweep_interval {
        config.discovery.sweep_interval_secs = interval;
    }
    if let Some(interface) = args.interface {
        config.discovery.interface = interface;
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = logging.parse_level()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    // Logs go to stderr so stdout carries only events
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.target)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(())
}

fn print_event(event: &DiscoveryEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let time = chrono::Local::now().format("%H:%M:%S");
    match event {
        DiscoveryEvent::Discovered(device) => println!(
            "{time} [DISCOVERED] {} ip={} mac={}",
            device.name, device.network_address, device.hardware_address
        ),
        DiscoveryEvent::Changed(device) => println!(
            "{time} [UPDATED] {} ip={} mac={}",
            device.name, device.network_address, device.hardware_address
        ),
        DiscoveryEvent::Removed(device) => println!(
            "{time} [REMOVED] {} ip={} mac={}",
            device.name, device.network_address, device.hardware_address
        ),
        DiscoveryEvent::Fault(cause) => println!("{time} [FAULT] {}", cause),
    }

    Ok(())
}
