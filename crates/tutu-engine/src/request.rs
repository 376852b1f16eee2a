use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use tutu_contracts::providers::{ProviderSelector, Route};

use crate::codec::ImageCodec;
use crate::errors::{push_unique_warning, truncate_text};
use crate::upload::ImageUploader;

pub const MAX_REFERENCE_IMAGES: usize = 5;
pub const MAX_TOKENS: u64 = 8192;
pub const SYNC_IMAGE_SIZE: &str = "1x1";

const SAMPLE_RANGE: (u32, u32) = (1, 4);
const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);
const TIMEOUT_RANGE: (u64, u64) = (10, 600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
        }
    }
}

/// Everything one generation call needs.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub instruction: String,
    /// Referenced positionally as "image N" in the instruction.
    pub reference_images: Vec<DynamicImage>,
    pub sample_count: u32,
    pub sampling: SamplingParams,
    pub provider: ProviderSelector,
    /// Tagged (`[Tag] id`) or untagged model name.
    pub model: String,
    pub timeout_seconds: u64,
    /// Used instead of the configured key when non-blank.
    pub api_key_override: Option<String>,
    /// Keep whatever was decoded when the stream times out.
    pub accept_partial_on_timeout: bool,
}

impl GenerationRequest {
    pub fn new(
        instruction: impl Into<String>,
        provider: ProviderSelector,
        model: impl Into<String>,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            reference_images: Vec::new(),
            sample_count: 1,
            sampling: SamplingParams::default(),
            provider,
            model: model.into(),
            timeout_seconds: 120,
            api_key_override: None,
            accept_partial_on_timeout: false,
        }
    }
}

/// Request parameters after clamping.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveParams {
    pub sample_count: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub timeout: Duration,
}

pub fn effective_params(request: &GenerationRequest, warnings: &mut Vec<String>) -> EffectiveParams {
    let sample_count = request.sample_count.clamp(SAMPLE_RANGE.0, SAMPLE_RANGE.1);
    if sample_count != request.sample_count {
        push_unique_warning(
            warnings,
            format!(
                "num_images {} is outside {}..={}; using {sample_count}.",
                request.sample_count, SAMPLE_RANGE.0, SAMPLE_RANGE.1
            ),
        );
    }
    let temperature = clamp_float(
        "temperature",
        request.sampling.temperature,
        TEMPERATURE_RANGE,
        1.0,
        warnings,
    );
    let top_p = clamp_float("top_p", request.sampling.top_p, TOP_P_RANGE, 0.95, warnings);
    let timeout_seconds = request
        .timeout_seconds
        .clamp(TIMEOUT_RANGE.0, TIMEOUT_RANGE.1);
    if timeout_seconds != request.timeout_seconds {
        push_unique_warning(
            warnings,
            format!(
                "timeout {}s is outside {}..={}s; using {timeout_seconds}s.",
                request.timeout_seconds, TIMEOUT_RANGE.0, TIMEOUT_RANGE.1
            ),
        );
    }
    EffectiveParams {
        sample_count,
        temperature,
        top_p,
        timeout: Duration::from_secs(timeout_seconds),
    }
}

fn clamp_float(
    name: &str,
    value: f64,
    (min, max): (f64, f64),
    default: f64,
    warnings: &mut Vec<String>,
) -> f64 {
    if !value.is_finite() {
        push_unique_warning(warnings, format!("{name} is not a number; using {default}."));
        return default;
    }
    let clamped = value.clamp(min, max);
    if clamped != value {
        push_unique_warning(
            warnings,
            format!("{name} {value} is outside {min}..={max}; using {clamped}."),
        );
    }
    clamped
}

/// Reference images actually sent, in order.
pub fn usable_reference_images<'a>(
    request: &'a GenerationRequest,
    warnings: &mut Vec<String>,
) -> &'a [DynamicImage] {
    let images = request.reference_images.as_slice();
    if images.len() > MAX_REFERENCE_IMAGES {
        push_unique_warning(
            warnings,
            format!(
                "{} reference images supplied; only the first {MAX_REFERENCE_IMAGES} are used.",
                images.len()
            ),
        );
        return &images[..MAX_REFERENCE_IMAGES];
    }
    images
}

/// Directive appended after any reference images.
pub fn instruction_text(
    provider: ProviderSelector,
    prompt: &str,
    sample_count: u32,
    has_images: bool,
) -> String {
    let distinct = if sample_count > 1 {
        format!(
            "\n\nReturn {sample_count} DIFFERENT images. Each image must be visually different."
        )
    } else {
        String::new()
    };
    if has_images {
        if provider == ProviderSelector::Comfly {
            return format!(
                "CRITICAL INSTRUCTION: You MUST generate and return an actual image, not just text description.\n\n\
                 Task: {prompt}\n\n\
                 Image References:\n\
                 - When I mention \"image 1\", I mean the first image provided above\n\
                 - When I mention \"image 2\", I mean the second image provided above\n\
                 - And so on, in the order provided\n\n\
                 REQUIREMENTS:\n\
                 1. GENERATE a new image based on my request\n\
                 2. DO NOT just describe what the image should look like\n\
                 3. RETURN the actual image file/data\n\
                 4. The output MUST be a visual image, not text{distinct}\n\n\
                 Execute the image editing task now and return the generated image."
            );
        }
        return format!(
            "IMPORTANT: Generate an actual image, not just a description.\n\n\
             Task: {prompt}\n\n\
             Image references: image 1, image 2, image 3, etc. refer to the images provided above in order.{distinct}\n\n\
             MUST return a generated image, not text description."
        );
    }
    if sample_count <= 1 {
        format!(
            "GENERATE AN IMAGE: Create a high-quality, detailed image.\n\n\
             Description: {prompt}\n\n\
             CRITICAL: You MUST return an actual image, not just text description. \
             Use your image generation capabilities to create the visual content."
        )
    } else {
        format!(
            "GENERATE {sample_count} DIFFERENT IMAGES: Create {sample_count} unique, high-quality images \
             with VARIED content, each with distinct visual elements.\n\n\
             Description: {prompt}\n\n\
             CRITICAL: You MUST return actual {sample_count} images, not text descriptions. \
             Each image must be visually different."
        )
    }
}

/// Chat-completion payload: one user message of labelled inline images
/// followed by the instruction.
pub fn build_chat_payload(
    route: &Route,
    request: &GenerationRequest,
    params: &EffectiveParams,
    codec: &dyn ImageCodec,
    warnings: &mut Vec<String>,
) -> Result<Value> {
    let images = usable_reference_images(request, warnings);
    let mut content = Vec::with_capacity(images.len() * 2 + 1);
    for (idx, image) in images.iter().enumerate() {
        let bytes = codec
            .encode(image)
            .with_context(|| format!("failed to encode reference image {}", idx + 1))?;
        content.push(json!({
            "type": "text",
            "text": format!("[This is image {}]", idx + 1),
        }));
        content.push(json!({
            "type": "image_url",
            "image_url": {"url": format!("data:image/png;base64,{}", BASE64.encode(bytes))},
        }));
    }
    content.push(json!({
        "type": "text",
        "text": instruction_text(
            route.profile.selector,
            &request.instruction,
            params.sample_count,
            !images.is_empty(),
        ),
    }));
    Ok(json!({
        "model": route.model.model_id,
        "messages": [{"role": "user", "content": content}],
        "temperature": params.temperature,
        "top_p": params.top_p,
        "max_tokens": MAX_TOKENS,
        "n": params.sample_count,
        "stream": true,
    }))
}

/// Image-generation payload. Reference images are hosted first and their
/// URLs prepended to the prompt; hosting failures fall back to text only.
pub fn build_sync_payload(
    route: &Route,
    request: &GenerationRequest,
    params: &EffectiveParams,
    uploader: &dyn ImageUploader,
    warnings: &mut Vec<String>,
) -> Value {
    let images = usable_reference_images(request, warnings);
    let mut urls = Vec::new();
    for (idx, image) in images.iter().enumerate() {
        match uploader.upload(image) {
            Some(url) => urls.push(url),
            None => {
                warn!(image = idx + 1, "reference image could not be hosted");
                push_unique_warning(
                    warnings,
                    format!("Reference image {} could not be uploaded and was skipped.", idx + 1),
                );
            }
        }
    }
    if !images.is_empty() && urls.is_empty() {
        push_unique_warning(
            warnings,
            "No reference image could be hosted; sending the prompt as text only.".to_string(),
        );
    }
    let prompt = if urls.is_empty() {
        request.instruction.clone()
    } else {
        format!("{} {}", urls.join(" "), request.instruction)
    };
    debug!(hosted = urls.len(), "sync payload prepared");
    json!({
        "prompt": prompt,
        "model": route.model.model_id,
        "size": SYNC_IMAGE_SIZE,
        "n": params.sample_count,
    })
}

/// Copy of a payload safe to log: image data replaced, long text shortened.
pub fn sanitize_for_log(payload: &Value) -> Value {
    match payload {
        Value::Object(object) => {
            let mut out = Map::new();
            for (key, value) in object {
                let sanitized = if key == "image_url" {
                    json!("[IMAGE_DATA]")
                } else {
                    sanitize_for_log(value)
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_for_log).collect()),
        Value::String(text) if text.starts_with("data:") => json!("[IMAGE_DATA]"),
        Value::String(text) => Value::String(truncate_text(text, 100)),
        other => other.clone(),
    }
}
