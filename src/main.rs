//! Truck Relay CLI
//!
//! Runs the camera relay and its HTTP/WebSocket server until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use truck_relay::{
    capture::{Camera, FileConfig, MockCamera},
    relay::{Relay, StaticDetections},
    server::RelayServer,
    settings::{MemorySettingsStore, SettingsStore, TomlSettingsStore},
};

#[derive(Debug, Parser)]
#[command(name = "truck-relay", version, about = "Live camera relay for the truck-detection station")]
struct Cli {
    /// Relay configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Station settings file holding the streaming flag and camera index.
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Address to serve HTTP and WebSocket traffic on.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Camera device index, overriding the settings file.
    #[arg(short, long)]
    device: Option<u32>,

    /// Use a synthetic camera instead of real hardware.
    #[arg(long)]
    mock: bool,
}

/// Settings store with the device index pinned from the command line.
struct DeviceOverride {
    inner: Arc<dyn SettingsStore>,
    device_index: u32,
}

impl SettingsStore for DeviceOverride {
    fn streaming_enabled(&self) -> bool {
        self.inner.streaming_enabled()
    }

    fn device_index(&self) -> u32 {
        self.device_index
    }

    fn set_streaming_enabled(&self, enabled: bool) -> Result<(), truck_relay::settings::SettingsError> {
        self.inner.set_streaming_enabled(enabled)
    }
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Truck Relay v{}", truck_relay::VERSION);

    if let Err(e) = run(cli) {
        error!("Relay failed: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> truck_relay::Result<()> {
    let mut config = match &cli.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }

    let mut settings: Arc<dyn SettingsStore> = match &cli.settings {
        Some(path) => Arc::new(TomlSettingsStore::load(path)?),
        None => {
            warn!("No settings file given, streaming state will not persist");
            Arc::new(MemorySettingsStore::default())
        }
    };
    if let Some(device_index) = cli.device {
        settings = Arc::new(DeviceOverride {
            inner: settings,
            device_index,
        });
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let relay = Relay::start(
            config.capture,
            config.relay,
            settings,
            camera_factory(cli.mock),
            Box::new(StaticDetections::default()),
        )?;
        let cancel = relay.cancellation_token();

        let interrupt = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Interrupt received, shutting down");
            interrupt.cancel();
        }) {
            warn!("Failed to install Ctrl-C handler: {}", e);
        }

        let server = RelayServer::new(config.server, relay.handle());
        let server = tokio::spawn(server.serve(cancel.clone()));

        let outcome = supervise(relay, cancel).await;
        match server.await {
            Ok(result) => result?,
            Err(e) => warn!("Server task ended abnormally: {}", e),
        }
        outcome
    })
}

/// Waits for an interrupt or for the frame source to die, then shuts down.
async fn supervise(mut relay: Relay, cancel: CancellationToken) -> truck_relay::Result<()> {
    let source = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = relay.wait_source() => result,
    };
    cancel.cancel();
    relay.shutdown().await?;
    info!("Done");
    Ok(source?)
}

fn camera_factory(mock: bool) -> impl FnOnce() -> Box<dyn Camera> + Send + 'static {
    move || {
        if mock {
            return Box::new(MockCamera::new()) as Box<dyn Camera>;
        }
        device_camera()
    }
}

#[cfg(feature = "camera")]
fn device_camera() -> Box<dyn Camera> {
    Box::new(truck_relay::capture::DeviceCamera::new())
}

#[cfg(not(feature = "camera"))]
fn device_camera() -> Box<dyn Camera> {
    warn!("Built without the `camera` feature, using the synthetic camera");
    Box::new(MockCamera::new())
}
