use std::io::Cursor;

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use ndarray::{Array, Array4, ArrayViewD};

/// Per-channel mean/std applied after scaling pixels into `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// Resizes to `size`x`size` and lays the pixels out as a `1x3xHxW` tensor.
///
/// Pixels are divided by the brightest channel value of the resized image
/// rather than by 255, which is what the U²-Net family was trained on.
pub fn normalize_for_model(image: &DynamicImage, size: u32, norm: &Normalization) -> Array4<f32> {
    let resized = image
        .resize_exact(size, size, FilterType::Lanczos3)
        .to_rgb8();
    let side = size as usize;
    let mut array = Array::zeros((1, 3, side, side));

    let brightest = resized.as_raw().iter().copied().max().unwrap_or(0);
    let scale = f32::from(brightest).max(1e-6);

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel[c]) / scale;
            array[[0, c, y as usize, x as usize]] = (value - norm.mean[c]) / norm.std[c];
        }
    }

    array
}

/// Turns a raw prediction into an 8-bit mask of `width`x`height`.
///
/// The first `HxW` plane of the output is min-max scaled to `0..=255`; a flat
/// prediction yields an all-transparent mask.
pub fn mask_from_prediction(
    prediction: ArrayViewD<'_, f32>,
    width: u32,
    height: u32,
) -> Result<GrayImage> {
    let shape = prediction.shape();
    if shape.len() < 2 {
        bail!("Unexpected prediction shape {:?}", shape);
    }
    let mask_height = shape[shape.len() - 2];
    let mask_width = shape[shape.len() - 1];
    let plane_len = mask_height * mask_width;

    let plane: Vec<f32> = prediction.iter().take(plane_len).copied().collect();
    if plane.len() != plane_len || plane_len == 0 {
        bail!("Prediction is missing mask values (shape {:?})", shape);
    }

    let (min, max) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let pixels: Vec<u8> = plane
        .iter()
        .map(|&v| {
            if range > f32::EPSILON {
                ((v - min) / range * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    let mask = GrayImage::from_raw(mask_width as u32, mask_height as u32, pixels)
        .ok_or_else(|| anyhow!("Failed to build mask image"))?;

    if mask.dimensions() == (width, height) {
        Ok(mask)
    } else {
        Ok(imageops::resize(&mask, width, height, FilterType::Lanczos3))
    }
}

/// Uses the mask as alpha, scaling any alpha the source already had.
pub fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> Result<RgbaImage> {
    let mut rgba = image.to_rgba8();
    if rgba.dimensions() != mask.dimensions() {
        bail!(
            "Mask is {:?} but image is {:?}",
            mask.dimensions(),
            rgba.dimensions()
        );
    }

    for (x, y, pixel) in rgba.enumerate_pixels_mut() {
        let coverage = u16::from(mask.get_pixel(x, y)[0]);
        pixel[3] = (u16::from(pixel[3]) * coverage / 255) as u8;
    }

    Ok(rgba)
}

pub fn encode_png(image: RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(buffer)
}
