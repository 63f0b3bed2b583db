//! Best-effort downscaling of uploads before inference.
//!
//! A [`Resizer`] never fails: when anything goes wrong it hands back the
//! original bytes, and inference runs on the full-size image instead.

use std::borrow::Cow;
use std::io::Cursor;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::{debug, warn};

use crate::media::mimetype;

pub trait Resizer: Send + Sync {
    /// Shrinks `bytes` so neither side exceeds `max_dimension`.
    fn resize<'a>(&self, bytes: &'a [u8], max_dimension: u32) -> Cow<'a, [u8]>;
}

/// Decodes, downsizes and re-encodes with the `image` crate.
///
/// JPEG input stays JPEG; every other format is written back as PNG so
/// transparency survives.
pub struct ImageResizer {
    filter: FilterType,
}

impl ImageResizer {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }

    /// `Ok(None)` means the input is already small enough.
    fn try_resize(&self, bytes: &[u8], max_dimension: u32) -> Result<Option<Vec<u8>>> {
        if max_dimension == 0 {
            return Ok(None);
        }

        let format = mimetype::detect_image_format(bytes);
        let image = match format {
            Some(f) => image::load_from_memory_with_format(bytes, f),
            None => image::load_from_memory(bytes),
        }
        .context("Failed to decode image for resizing")?;

        let (width, height) = image.dimensions();
        if width <= max_dimension && height <= max_dimension {
            return Ok(None);
        }

        let resized = image.resize(max_dimension, max_dimension, self.filter);
        debug!(
            "Resized {}x{} to {}x{}",
            width,
            height,
            resized.width(),
            resized.height()
        );

        let mut buffer = Vec::new();
        let mut cursor = Cursor::new(&mut buffer);
        match format {
            Some(ImageFormat::Jpeg) => DynamicImage::ImageRgb8(resized.to_rgb8())
                .write_to(&mut cursor, ImageFormat::Jpeg),
            _ => resized.write_to(&mut cursor, ImageFormat::Png),
        }
        .context("Failed to encode resized image")?;

        Ok(Some(buffer))
    }
}

impl Default for ImageResizer {
    fn default() -> Self {
        Self::new(FilterType::Lanczos3)
    }
}

impl Resizer for ImageResizer {
    fn resize<'a>(&self, bytes: &'a [u8], max_dimension: u32) -> Cow<'a, [u8]> {
        match self.try_resize(bytes, max_dimension) {
            Ok(Some(resized)) => Cow::Owned(resized),
            Ok(None) => Cow::Borrowed(bytes),
            Err(e) => {
                warn!("Resize failed, using original image: {:#}", e);
                Cow::Borrowed(bytes)
            }
        }
    }
}

/// Leaves every image untouched.
pub struct PassthroughResizer;

impl Resizer for PassthroughResizer {
    fn resize<'a>(&self, bytes: &'a [u8], _max_dimension: u32) -> Cow<'a, [u8]> {
        Cow::Borrowed(bytes)
    }
}
