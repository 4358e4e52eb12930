//! tagsync - tag server <-> InfluxDB bridge

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tagsync::config::DriverKind;
use tagsync::device::{DeviceConnector, SimulatedDevice};
use tagsync::persist::JsonFilePersistence;
use tagsync::store::InfluxConnector;
use tagsync::{api, shutdown, ServiceConfig, Supervisor, SERVICE_NAME, SERVICE_VERSION};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service configuration file
    #[arg(long, short, default_value = ServiceConfig::DEFAULT_PATH, env = "TAGSYNC_CONFIG")]
    config: String,

    /// Do not start synchronizing from the persisted bridge configuration
    #[arg(long)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config))?;
    tagsync_libs::logging::init(&config.service.log_level).context("Failed to init logging")?;

    info!(
        "Starting {} v{} ({})",
        SERVICE_NAME, SERVICE_VERSION, config.service.name
    );

    let device: Arc<dyn DeviceConnector> = match config.device.driver {
        DriverKind::Simulated => {
            info!(
                "Using simulated device driver with {} tags",
                config.device.simulated_tags.len()
            );
            Arc::new(SimulatedDevice::with_tags(
                config.device.simulated_tags.clone(),
            ))
        },
    };

    let supervisor = Arc::new(Supervisor::new(
        device,
        Arc::new(InfluxConnector),
        Arc::new(JsonFilePersistence::new(&config.service.state_file)),
        config.sync.clone(),
        config.measurements.clone(),
    ));

    if !args.no_autostart {
        match supervisor.stored_config().await {
            Ok(Some(bridge)) => {
                info!("Resuming persisted bridge configuration");
                let outcome = supervisor.start(bridge).await;
                if !outcome.is_active() {
                    warn!("Autostart did not activate the bridge: {:?}", outcome);
                }
            },
            Ok(None) => info!("No persisted bridge configuration, waiting for /start"),
            Err(e) => error!("Failed to read persisted configuration: {}", e),
        }
    }

    let shutdown_token = CancellationToken::new();
    let api_handle = if config.service.enable_api {
        let port = config.service.api_port;
        let supervisor = Arc::clone(&supervisor);
        let token = shutdown_token.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(port, supervisor, token).await {
                error!("Control API error: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown::wait_for_signal().await;
    info!("Received shutdown signal");

    shutdown_token.cancel();
    supervisor.stop().await;
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!("Control API task failed: {}", e);
        }
    }

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
