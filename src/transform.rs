//! Frame rotation

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use thiserror::Error;

use crate::config::Rotation;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Rotate decoded pixels clockwise
pub fn rotate_image(image: &DynamicImage, rotation: Rotation) -> DynamicImage {
    match rotation {
        Rotation::None => image.clone(),
        Rotation::Cw90 => image.rotate90(),
        Rotation::Cw180 => image.rotate180(),
        Rotation::Cw270 => image.rotate270(),
    }
}

/// Rotate an encoded JPEG frame clockwise
///
/// A zero rotation hands back the input untouched. Anything else decodes,
/// rotates and re-encodes at `quality`.
pub fn rotate_jpeg(frame: Bytes, rotation: Rotation, quality: u8) -> Result<Bytes, TransformError> {
    if rotation == Rotation::None {
        return Ok(frame);
    }

    let decoded = image::load_from_memory_with_format(&frame, ImageFormat::Jpeg)?;
    let rotated = rotate_image(&decoded, rotation);
    encode_jpeg(&rotated, quality)
}

/// Encode pixels as baseline JPEG
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Bytes, TransformError> {
    let mut out = Vec::with_capacity((image.width() * image.height() / 4) as usize);
    // JPEG has no alpha channel.
    let rgb = image.to_rgb8();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&rgb)?;
    Ok(Bytes::from(out))
}
