use std::io::Cursor;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

pub const PLACEHOLDER_SIZE: u32 = 1024;

/// Raster to bytes and back.
pub trait ImageCodec: Send + Sync {
    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage>;
}

/// Encodes PNG, decodes any format the `image` crate can sniff.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngCodec;

impl ImageCodec for PngCodec {
    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("PNG encode failed")?;
        Ok(out.into_inner())
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            anyhow::bail!("image payload is empty");
        }
        image::load_from_memory(bytes).context("bytes are not a decodable raster image")
    }
}

pub fn blank_placeholder() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(
        PLACEHOLDER_SIZE,
        PLACEHOLDER_SIZE,
        Rgb([255, 255, 255]),
    ))
}
