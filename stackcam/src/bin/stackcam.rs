use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use env_tracing_logger::LogOptions;
use stackcam::status_store::JsonFileStore;
use stackcam::{CommandDispatcher, Device, StackcamConfig, StackcamServer, netinfo};
use stackcam_sensor::sim::SimulatedSensor;

/// Exposure server: stacks sensor frames and serves them as FITS images over TCP.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (`.toml`).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. `0.0.0.0:915`. Overrides the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Also append log output to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let buf = toml::to_string_pretty(&StackcamConfig::default())?;
        println!("{buf}");
        return Ok(());
    }

    let _guard = env_tracing_logger::initiate_logging(&LogOptions {
        default_filter: stackcam::DEFAULT_LOG_FILTER.into(),
        log_file: cli.log_file.clone(),
        console: true,
    })?;

    let mut cfg = match &cli.config {
        Some(fname) => stackcam::parse_config_file(fname)
            .with_context(|| format!("reading config file \"{}\"", fname.display()))?,
        None => StackcamConfig::default_in_cwd()?,
    };
    if let Some(listen) = cli.listen {
        cfg.server.listen_addr = listen;
    }

    let store = JsonFileStore::open(&cfg.status.store_path).with_context(|| {
        format!(
            "opening status store \"{}\"",
            cfg.status.store_path.display()
        )
    })?;
    let sensor = SimulatedSensor::new("sim0", cfg.sensor.to_simulated(&cfg.camera));
    let mut device =
        Device::open(&cfg, Box::new(sensor), Box::new(store)).context("initializing camera")?;

    let server = StackcamServer::bind(&cfg.server)
        .await
        .with_context(|| format!("listening on {}", cfg.server.listen_addr))?;
    let hostname = netinfo::local_hostname().context("getting hostname")?;
    let ip = netinfo::advertised_ip(&cfg.server.interface, server.local_addr())?;
    device.announce(&hostname, ip, server.local_addr().port())?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("waiting for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl-C");
    };
    let dispatcher = server
        .run(CommandDispatcher::new(device), shutdown)
        .await?;

    let mut device = dispatcher.into_device();
    device.mark_stopped();
    info!("done");
    Ok(())
}
