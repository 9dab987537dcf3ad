//! MJPEG streaming CLI application

use anyhow::{bail, Context, Result};
use clap::Parser;
use pi_mjpeg_streamer::capture::test_pattern::TestPatternBackend;
use pi_mjpeg_streamer::capture::CameraBackend;
use pi_mjpeg_streamer::config::{CameraConfig, CameraKind, Config, Resolution, Rotation};
use pi_mjpeg_streamer::supervisor::{Backends, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Device indices that exist in test mode
const TEST_MODE_DEVICES: std::ops::Range<u32> = 0..4;

#[derive(Parser, Debug)]
#[command(name = "mjpeg-streamer")]
#[command(about = "Multi-camera MJPEG HTTP streaming for Raspberry Pi")]
#[command(version)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, conflicts_with_all = ["cameras", "camera"])]
    config: Option<PathBuf>,

    /// Camera list in the JSON layout (all_cameras.json)
    #[arg(long, requires = "active", conflicts_with = "camera")]
    cameras: Option<PathBuf>,

    /// Active camera names in the JSON layout (active_cameras.json)
    #[arg(long, requires = "cameras")]
    active: Option<PathBuf>,

    /// Stream a single camera of this type (picamera or usbcamera)
    #[arg(long)]
    camera: Option<String>,

    /// Resolution for --camera, e.g. 640x480
    #[arg(long, default_value = "640x480")]
    resolution: Resolution,

    /// Clockwise rotation for --camera in degrees
    #[arg(long, default_value_t = 0)]
    rotation: u16,

    /// HTTP port for --camera
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Use synthetic test-pattern cameras instead of hardware
    #[arg(long)]
    test_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("MJPEG streamer starting");

    let config = load_config(&cli)?;
    let active = config.active_cameras();
    if active.is_empty() {
        info!("No active cameras configured, exiting");
        return Ok(());
    }

    info!(
        cameras = ?active.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        bind_ip = %config.server.bind_ip,
        test_mode = cli.test_mode,
        "Configuration loaded"
    );

    let supervisor = Supervisor::new(backends(cli.test_mode), config.server.clone());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    info!("Streaming started, press Ctrl+C to stop");
    let summary = supervisor
        .run_until(&active, shutdown)
        .await
        .context("Failed to start stream units")?;

    info!(
        spawned = ?summary.spawned,
        skipped = ?summary.skipped,
        failed = ?summary.failed,
        "Shutting down"
    );
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(kind) = &cli.camera {
        let rotation = Rotation::try_from(cli.rotation)?;
        let camera = CameraConfig {
            name: kind.clone(),
            kind: CameraKind::from(kind.clone()),
            resolution: cli.resolution,
            rotation,
            port: cli.port,
            fps: CameraConfig::DEFAULT_FPS,
        };
        info!(camera = %camera.name, port = camera.port, "Single camera mode");
        return Ok(Config::single(camera));
    }

    if let (Some(cameras), Some(active)) = (&cli.cameras, &cli.active) {
        info!(cameras = %cameras.display(), active = %active.display(), "Loading configuration");
        return Config::from_json_files(cameras, active).with_context(|| {
            format!(
                "Failed to load {} and {}",
                cameras.display(),
                active.display()
            )
        });
    }

    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    if !path.exists() {
        bail!(
            "Configuration file {} not found (use --config, --cameras/--active or --camera)",
            path.display()
        );
    }
    info!(config_path = %path.display(), "Loading configuration");
    Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

fn backends(test_mode: bool) -> Backends {
    if test_mode {
        warn!("Test mode: using synthetic test-pattern cameras");
        return Backends {
            builtin: Arc::new(TestPatternBackend::new()),
            external: Arc::new(TestPatternBackend::with_devices(TEST_MODE_DEVICES)),
        };
    }

    Backends {
        builtin: builtin_backend(),
        external: external_backend(),
    }
}

#[cfg(feature = "libcamera")]
fn builtin_backend() -> Arc<dyn CameraBackend> {
    Arc::new(pi_mjpeg_streamer::capture::libcamera::LibcameraBackend::new())
}

#[cfg(not(feature = "libcamera"))]
fn builtin_backend() -> Arc<dyn CameraBackend> {
    Arc::new(pi_mjpeg_streamer::capture::UnsupportedBackend {
        name: "libcamera",
        feature: "libcamera",
    })
}

#[cfg(feature = "v4l")]
fn external_backend() -> Arc<dyn CameraBackend> {
    Arc::new(pi_mjpeg_streamer::capture::usb::V4lBackend::new())
}

#[cfg(not(feature = "v4l"))]
fn external_backend() -> Arc<dyn CameraBackend> {
    Arc::new(pi_mjpeg_streamer::capture::UnsupportedBackend {
        name: "v4l",
        feature: "v4l",
    })
}
