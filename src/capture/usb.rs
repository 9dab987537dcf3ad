//! USB cameras through Video4Linux
//!
//! Devices are `/dev/video<index>`. Frames are requested as MJPG so the
//! camera hands us JPEG directly and no software encode is needed.

use bytes::Bytes;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::{CameraBackend, CameraDevice, CaptureError};
use crate::config::Resolution;

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl V4lBackend {
    pub fn new() -> Self {
        Self
    }
}

fn device_path(index: u32) -> String {
    format!("/dev/video{}", index)
}

impl CameraBackend for V4lBackend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(
        &self,
        index: u32,
        resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError> {
        let open_err = |reason: String| CaptureError::Open {
            device: device_path(index),
            reason,
        };

        let device = Device::new(index as usize).map_err(|e| open_err(e.to_string()))?;

        let requested = Format::new(resolution.width, resolution.height, FourCC::new(b"MJPG"));
        let format = device
            .set_format(&requested)
            .map_err(|e| open_err(e.to_string()))?;
        if format.fourcc != FourCC::new(b"MJPG") {
            return Err(open_err(format!("MJPG not supported, got {}", format.fourcc)));
        }
        if format.width != resolution.width || format.height != resolution.height {
            tracing::warn!(
                device = %device_path(index),
                requested = %resolution,
                actual = %format!("{}x{}", format.width, format.height),
                "Camera picked a different resolution"
            );
        }
        tracing::info!(device = %device_path(index), format = %format, "Camera format set");

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| open_err(e.to_string()))?;

        Ok(Box::new(V4lDevice {
            _device: device,
            stream,
        }))
    }

    fn probe(&self, index: u32) -> bool {
        Device::new(index as usize)
            .and_then(|d| d.query_caps())
            .map(|caps| caps.capabilities.contains(Flags::VIDEO_CAPTURE))
            .unwrap_or(false)
    }
}

struct V4lDevice {
    _device: Device,
    stream: MmapStream<'static>,
}

impl CameraDevice for V4lDevice {
    fn read_frame(&mut self) -> Result<Bytes, CaptureError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(Bytes::copy_from_slice(&buf[..used]))
    }
}
