//! Multi-camera MJPEG streaming for Raspberry Pi
//!
//! Each configured camera becomes a stream unit: a capture loop that keeps
//! the newest JPEG frame in a [`FrameBuffer`], and an HTTP server that fans
//! that frame out to any number of browsers as `multipart/x-mixed-replace`.
//!
//! - Lossy latest-frame handoff, so slow clients skip frames instead of
//!   slowing anyone else down
//! - Device leasing so two units never open the same USB camera
//! - Per-camera clockwise rotation
//!
//! # Example
//!
//! ```no_run
//! use pi_mjpeg_streamer::capture::test_pattern::TestPatternBackend;
//! use pi_mjpeg_streamer::config::Config;
//! use pi_mjpeg_streamer::supervisor::{Backends, Supervisor};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("config.toml")?;
//! let backends = Backends {
//!     builtin: Arc::new(TestPatternBackend::new()),
//!     external: Arc::new(TestPatternBackend::with_devices(0..4)),
//! };
//! Supervisor::new(backends, config.server.clone())
//!     .run(&config.active_cameras())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod frame_buffer;
pub mod lease;
pub mod server;
pub mod supervisor;
pub mod transform;

// Re-exports for convenience
pub use capture::{CameraBackend, CameraDevice, CaptureError, CaptureLoop};
pub use config::{CameraConfig, CameraKind, Config, ConfigError, Resolution, Rotation};
pub use frame_buffer::{Frame, FrameBuffer, FrameReceiver};
pub use lease::{DeviceLease, DeviceLeaseRegistry};
pub use server::StreamingServer;
pub use supervisor::{Backends, StreamUnit, Supervisor, SupervisorError, UnitError};
