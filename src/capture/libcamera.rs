//! Built-in Pi camera through GStreamer's `libcamerasrc`
//!
//! The pipeline encodes to JPEG on the way out; an `appsink` is pulled
//! synchronously from the capture thread.

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use super::{CameraBackend, CameraDevice, CaptureError};
use crate::config::Resolution;

const JPEG_QUALITY: u32 = 85;

#[derive(Debug, Default, Clone, Copy)]
pub struct LibcameraBackend;

impl LibcameraBackend {
    pub fn new() -> Self {
        Self
    }

    fn pipeline_description(resolution: Resolution) -> String {
        format!(
            "libcamerasrc ! video/x-raw,width={w},height={h} ! videoconvert ! jpegenc quality={q} ! appsink name=sink max-buffers=2 drop=true sync=false",
            w = resolution.width,
            h = resolution.height,
            q = JPEG_QUALITY,
        )
    }
}

impl CameraBackend for LibcameraBackend {
    fn name(&self) -> &'static str {
        "libcamera"
    }

    /// The built-in camera has no index; `index` is only used in messages.
    fn open(
        &self,
        index: u32,
        resolution: Resolution,
    ) -> Result<Box<dyn CameraDevice>, CaptureError> {
        gst::init()?;

        let description = Self::pipeline_description(resolution);
        tracing::debug!(pipeline = %description, "Creating GStreamer pipeline");

        let open_err = |reason: &str| CaptureError::Open {
            device: format!("libcamera:{}", index),
            reason: reason.to_string(),
        };

        let pipeline = gst::parse::launch(&description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("parsed element is not a pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_err("element 'sink' not found"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_err("element 'sink' is not an appsink"))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_err(&format!("failed to start pipeline: {:?}", e)))?;

        Ok(Box::new(LibcameraDevice { pipeline, appsink }))
    }

    fn probe(&self, _index: u32) -> bool {
        gst::init().is_ok() && gst::ElementFactory::find("libcamerasrc").is_some()
    }
}

struct LibcameraDevice {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl CameraDevice for LibcameraDevice {
    fn read_frame(&mut self) -> Result<Bytes, CaptureError> {
        let sample = self
            .appsink
            .pull_sample()
            .map_err(|_| CaptureError::Read("failed to pull sample from appsink".into()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Read("sample had no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::Read("unable to map buffer".into()))?;

        Ok(Bytes::copy_from_slice(map.as_slice()))
    }
}

impl Drop for LibcameraDevice {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
