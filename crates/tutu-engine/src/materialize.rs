use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use tracing::{debug, warn};

use crate::codec::ImageCodec;
use crate::errors::{error_chain_text, push_unique_warning};
use crate::extract::ImageReference;
use crate::transport::Transport;

/// A decoded image and the reference it came from.
#[derive(Debug, Clone)]
pub struct MaterializedImage {
    pub image: DynamicImage,
    pub reference: ImageReference,
}

/// Resolves references one by one in discovery order. A reference that fails
/// is logged and skipped.
pub fn materialize(
    references: &[ImageReference],
    transport: &dyn Transport,
    codec: &dyn ImageCodec,
    timeout: Duration,
    warnings: &mut Vec<String>,
) -> Vec<MaterializedImage> {
    let mut out = Vec::with_capacity(references.len());
    for (idx, reference) in references.iter().enumerate() {
        match resolve(reference, transport, codec, timeout) {
            Ok(image) => {
                debug!(
                    index = idx + 1,
                    reference = %reference.describe(),
                    width = image.width(),
                    height = image.height(),
                    "image materialized"
                );
                out.push(MaterializedImage {
                    image,
                    reference: reference.clone(),
                });
            }
            Err(err) => {
                let detail = error_chain_text(&err, 300);
                warn!(index = idx + 1, reference = %reference.describe(), "image dropped: {detail}");
                push_unique_warning(
                    warnings,
                    format!("Image {} could not be decoded: {detail}", idx + 1),
                );
            }
        }
    }
    out
}

fn resolve(
    reference: &ImageReference,
    transport: &dyn Transport,
    codec: &dyn ImageCodec,
    timeout: Duration,
) -> Result<DynamicImage> {
    let bytes = match reference {
        ImageReference::InlineData { payload, .. } => decode_inline_payload(payload)?,
        ImageReference::RemoteUrl(url) => transport.fetch(url, timeout)?,
    };
    codec.decode(&bytes)
}

/// Base64 with stray whitespace or missing padding.
pub fn decode_inline_payload(payload: &str) -> Result<Vec<u8>> {
    let mut cleaned: String = payload
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    let trimmed_len = cleaned.trim_end_matches('=').len();
    cleaned.truncate(trimmed_len);
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    BASE64
        .decode(cleaned.as_bytes())
        .context("inline image base64 decode failed")
}
