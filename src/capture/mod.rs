//! Camera capture loop
//!
//! A [`CaptureLoop`] owns one opened camera device. It runs on a blocking
//! thread, pulling a JPEG frame per tick, rotating it and publishing it into
//! the unit's [`FrameBuffer`].

#[cfg(feature = "libcamera")]
pub mod libcamera;
pub mod test_pattern;
#[cfg(feature = "v4l")]
pub mod usb;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, Resolution, Rotation};
use crate::frame_buffer::FrameBuffer;
use crate::lease::DeviceLease;
use crate::transform::{self, TransformError};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open camera device {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("frame transform failed: {0}")]
    Transform(#[from] TransformError),

    #[cfg(feature = "libcamera")]
    #[error("GStreamer error: {0}")]
    Gst(#[from] gstreamer::glib::Error),

    #[cfg(feature = "libcamera")]
    #[error("GStreamer bool error: {0}")]
    GstBool(#[from] gstreamer::glib::BoolError),
}

/// Source of camera devices
///
/// Implementations open hardware (or a synthetic source) by index.
pub trait CameraBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Open the device at `index` and configure it for `resolution`
    fn open(&self, index: u32, resolution: Resolution)
        -> Result<Box<dyn CameraDevice>, CaptureError>;

    /// Whether a device is physically present at `index`
    ///
    /// The default opens and immediately closes the device.
    fn probe(&self, index: u32) -> bool {
        self.open(index, Resolution::default()).is_ok()
    }
}

/// An opened camera producing encoded JPEG frames
pub trait CameraDevice: Send {
    /// Block until the next frame is available
    fn read_frame(&mut self) -> Result<Bytes, CaptureError>;
}

/// Stand-in for a backend that was not compiled in
///
/// Every open fails, so the affected stream unit dies while the rest run.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedBackend {
    pub name: &'static str,
    pub feature: &'static str,
}

impl CameraBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self, index: u32, _resolution: Resolution) -> Result<Box<dyn CameraDevice>, CaptureError> {
        Err(CaptureError::Open {
            device: format!("{}:{}", self.name, index),
            reason: format!("support not compiled in, rebuild with --features {}", self.feature),
        })
    }

    fn probe(&self, _index: u32) -> bool {
        false
    }
}

/// Capture loop settings for one camera
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub camera: String,
    pub resolution: Resolution,
    pub rotation: Rotation,
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl CaptureConfig {
    pub fn from_camera(camera: &CameraConfig, jpeg_quality: u8) -> Self {
        Self {
            camera: camera.name.clone(),
            resolution: camera.resolution,
            rotation: camera.rotation,
            fps: camera.fps,
            jpeg_quality,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

/// Statistics for capture
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
}

/// Why a capture loop returned
#[derive(Debug)]
pub enum CaptureExit {
    /// The loop was asked to stop
    Stopped,
    /// The device stopped delivering frames
    ReadFailed(CaptureError),
}

/// Stops the capture loop when dropped
pub struct CaptureGuard {
    running: Arc<AtomicBool>,
}

impl CaptureGuard {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frame pump for one opened device
pub struct CaptureLoop {
    config: CaptureConfig,
    device: Box<dyn CameraDevice>,
    buffer: Arc<FrameBuffer>,
    // Dropped together with the loop, which returns the index to the registry.
    lease: Option<DeviceLease>,
    running: Arc<AtomicBool>,
    stats: CaptureStats,
}

impl CaptureLoop {
    /// Open and configure the device
    ///
    /// On failure the lease (if any) is dropped and so released.
    pub fn open(
        backend: &dyn CameraBackend,
        index: u32,
        lease: Option<DeviceLease>,
        config: CaptureConfig,
        buffer: Arc<FrameBuffer>,
    ) -> Result<Self, CaptureError> {
        info!(
            camera = %config.camera,
            backend = backend.name(),
            device = index,
            resolution = %config.resolution,
            rotation = config.rotation.degrees(),
            fps = config.fps,
            "Opening camera"
        );

        let device = backend.open(index, config.resolution)?;

        Ok(Self {
            config,
            device,
            buffer,
            lease,
            running: Arc::new(AtomicBool::new(true)),
            stats: CaptureStats::default(),
        })
    }

    /// Handle that stops this loop when dropped
    pub fn guard(&self) -> CaptureGuard {
        CaptureGuard {
            running: Arc::clone(&self.running),
        }
    }

    pub fn device_index(&self) -> Option<u32> {
        self.lease.as_ref().map(DeviceLease::index)
    }

    /// Run until stopped or the device fails; blocks the calling thread
    pub fn run(mut self) -> CaptureExit {
        let interval = self.config.frame_interval();
        info!(
            camera = %self.config.camera,
            interval_ms = interval.as_millis() as u64,
            "Capture loop started"
        );

        let exit = loop {
            if !self.running.load(Ordering::Acquire) {
                break CaptureExit::Stopped;
            }

            let started = Instant::now();

            let frame = match self.device.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(
                        camera = %self.config.camera,
                        device = ?self.device_index(),
                        error = %e,
                        "Can't receive frame from camera"
                    );
                    break CaptureExit::ReadFailed(e);
                }
            };

            match transform::rotate_jpeg(frame, self.config.rotation, self.config.jpeg_quality) {
                Ok(frame) => {
                    self.buffer.publish(frame);
                    self.stats.frames_captured += 1;
                }
                Err(e) => {
                    warn!(camera = %self.config.camera, error = %e, "Dropping frame");
                    self.stats.frames_dropped += 1;
                }
            }

            if self.stats.frames_captured > 0 && self.stats.frames_captured % 100 == 0 {
                debug!(
                    camera = %self.config.camera,
                    captured = self.stats.frames_captured,
                    dropped = self.stats.frames_dropped,
                    subscribers = self.buffer.subscriber_count(),
                    "Capture stats"
                );
            }

            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        };

        info!(
            camera = %self.config.camera,
            frames = self.stats.frames_captured,
            dropped = self.stats.frames_dropped,
            "Capture loop stopped"
        );

        // Dropping `self` here releases the device lease.
        exit
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }
}
