//! Projection controller entry point.
//!
//! Headless runner that reaches devices directly over the network (helper
//! already installed and listening), opens their control channels and,
//! optionally, their image streams.  Connection events are logged until
//! Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load AppConfig            -- file from --config or the platform dir
//!  └─ ConnectionRegistry::new   -- shared bridge, forwards, sessions, pool
//!  └─ per --ip:
//!       ├─ device_attached      -- creates the DeviceConnection
//!       ├─ connect(true)        -- control channel + handshake
//!       └─ open_image_channel   -- when --image is given
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use projection_controller::infrastructure::bridge::direct::{
    DirectBridge, DirectDevice, PreinstalledAgent,
};
use projection_controller::infrastructure::device::{
    ConnectionContext, ConnectionError, ConnectionRegistry, ImageChannelListener,
};
use projection_controller::infrastructure::storage::config::{self, AppConfig};
use projection_controller::infrastructure::storage::settings::ConfigSettingsStore;

/// Connects to projection helpers running on network-reachable devices.
#[derive(Debug, Parser)]
#[command(name = "projection-controller", version)]
struct Args {
    /// Configuration file.  Defaults to the platform config directory.
    #[arg(long, env = "PROJECTION_CONFIG")]
    config: Option<PathBuf>,

    /// Device IP address; may be repeated.
    #[arg(long = "ip", required = true)]
    ips: Vec<String>,

    /// Also open the image stream of every connected device.
    #[arg(long)]
    image: bool,
}

/// Logs the outcome of image-channel opens.
struct LogImageListener;

impl ImageChannelListener for LogImageListener {
    fn on_success(&self, device_id: &str) {
        info!(device = device_id, "image stream open");
    }

    fn on_failed(&self, device_id: &str, error: &ConnectionError) {
        warn!(device = device_id, "image stream failed: {error}");
    }
}

fn load(args: &Args) -> anyhow::Result<AppConfig> {
    match &args.config {
        Some(path) => config::load_config_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => config::load_config().context("loading config"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = load(&args)?;

    // Level from the config file unless `RUST_LOG` is set.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.controller.log_level)),
        )
        .init();

    info!("projection controller starting");

    let devices: Vec<DirectDevice> = args.ips.iter().map(DirectDevice::new).collect();
    let handles: Vec<_> = devices.iter().map(|d| d.handle.clone()).collect();

    let ctx = Arc::new(ConnectionContext::new(
        Arc::new(DirectBridge::new(devices)),
        Arc::new(PreinstalledAgent),
        Arc::new(ConfigSettingsStore::from_config(&cfg)),
        &cfg,
    ));
    let registry = ConnectionRegistry::new(ctx);

    // ── Event log ─────────────────────────────────────────────────────────────
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(device = event.device_id(), "{event:?}");
        }
    });

    // ── Devices ───────────────────────────────────────────────────────────────
    let listener: Arc<dyn ImageChannelListener> = Arc::new(LogImageListener);
    for handle in handles {
        let conn = registry.device_attached(handle).await;
        if let Some(name) = cfg
            .devices
            .iter()
            .find(|d| d.id == conn.id())
            .and_then(|d| d.name.clone())
        {
            conn.set_device_name(name);
        }

        if let Err(e) = conn.connect(true).await {
            error!(device = conn.id(), "connect failed: {e}");
            continue;
        }
        let meta = conn.meta();
        info!(
            device = conn.id(),
            "connected to {} ({}x{})",
            meta.display_name(),
            meta.screen_width,
            meta.screen_height
        );

        if args.image {
            let (tx, rx) = mpsc::channel(4);
            conn.set_frame_sink(tx);
            tokio::spawn(count_frames(conn.id().to_string(), rx));
            conn.open_image_channel(Some(Arc::clone(&listener)));
        }
    }

    info!("projection controller ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    registry.shutdown().await;
    info!("projection controller stopped");
    Ok(())
}

/// Consumes frames and logs the running count every hundred frames.
async fn count_frames(device_id: String, mut frames: mpsc::Receiver<Bytes>) {
    let mut count: u64 = 0;
    let mut bytes: u64 = 0;
    while let Some(frame) = frames.recv().await {
        count += 1;
        bytes += frame.len() as u64;
        if count % 100 == 0 {
            info!(device = %device_id, frames = count, bytes, "image frames received");
        }
    }
}
