use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::DynamicImage;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::{ImageCodec, PngCodec};
use crate::errors::{error_chain_text, truncate_text};
use crate::transport::USER_AGENT;

/// Publishes an image somewhere reachable by URL.
pub trait ImageUploader: Send + Sync {
    /// `None` when every backend failed. Never raises.
    fn upload(&self, image: &DynamicImage) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostedResponse {
    PlainText,
    /// `{"data": {"url": ...}}`
    NestedDataUrl,
    /// `[{"url": ...}]` or `{"url": ...}`, with `files` wrappers tolerated.
    UrlList,
}

#[derive(Debug, Clone)]
struct HostingBackend {
    name: String,
    url: String,
    field: String,
    response: HostedResponse,
}

impl HostingBackend {
    fn new(name: &str, url: &str, field: &str, response: HostedResponse) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            field: field.to_string(),
            response,
        }
    }
}

const UPLOAD_ATTEMPTS: usize = 3;
const UPLOAD_PAUSE: Duration = Duration::from_secs(1);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn default_backends() -> Vec<HostingBackend> {
    vec![
        HostingBackend::new("0x0.st", "https://0x0.st", "file", HostedResponse::PlainText),
        HostingBackend::new(
            "tmpfiles.org",
            "https://tmpfiles.org/api/v1/upload",
            "file",
            HostedResponse::NestedDataUrl,
        ),
        HostingBackend::new(
            "uguu.se",
            "https://uguu.se/upload",
            "files[]",
            HostedResponse::UrlList,
        ),
        HostingBackend::new("x0.at", "https://x0.at", "file", HostedResponse::PlainText),
    ]
}

/// Tries each public file host in order with a bounded number of attempts.
pub struct HostingUploader {
    http: HttpClient,
    backends: Vec<HostingBackend>,
    attempts: usize,
    pause: Duration,
    timeout: Duration,
}

impl HostingUploader {
    pub fn new() -> Result<Self> {
        Self::with_backends(default_backends(), UPLOAD_ATTEMPTS, UPLOAD_PAUSE)
    }

    fn with_backends(
        backends: Vec<HostingBackend>,
        attempts: usize,
        pause: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build upload HTTP client")?;
        Ok(Self {
            http,
            backends,
            attempts: attempts.max(1),
            pause,
            timeout: UPLOAD_TIMEOUT,
        })
    }

    fn try_backend(&self, backend: &HostingBackend, png: &[u8]) -> Result<String> {
        let part = MultipartPart::bytes(png.to_vec())
            .file_name("image.png")
            .mime_str("image/png")?;
        let form = MultipartForm::new().part(backend.field.clone(), part);
        let response = self
            .http
            .post(&backend.url)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .with_context(|| format!("{} upload request failed", backend.name))?;
        let status = response.status();
        let body = response
            .text()
            .with_context(|| format!("{} response body read failed", backend.name))?;
        if !status.is_success() {
            anyhow::bail!(
                "{} upload failed ({}): {}",
                backend.name,
                status.as_u16(),
                truncate_text(body.trim(), 200)
            );
        }
        hosted_url(backend.response, &body).ok_or_else(|| {
            anyhow::anyhow!(
                "{} returned an unexpected response: {}",
                backend.name,
                truncate_text(body.trim(), 200)
            )
        })
    }
}

impl ImageUploader for HostingUploader {
    fn upload(&self, image: &DynamicImage) -> Option<String> {
        let png = match PngCodec.encode(image) {
            Ok(png) => png,
            Err(err) => {
                warn!("cannot encode image for upload: {err:#}");
                return None;
            }
        };
        for backend in &self.backends {
            for attempt in 1..=self.attempts {
                debug!(backend = %backend.name, attempt, "uploading image");
                match self.try_backend(backend, &png) {
                    Ok(url) => {
                        info!(backend = %backend.name, %url, "image uploaded");
                        return Some(url);
                    }
                    Err(err) => {
                        warn!(
                            backend = %backend.name,
                            attempt,
                            "upload failed: {}",
                            error_chain_text(&err, 300)
                        );
                        if attempt < self.attempts {
                            thread::sleep(self.pause);
                        }
                    }
                }
            }
        }
        warn!("all image hosts failed");
        None
    }
}

/// Pulls the hosted URL out of a backend response; only `http...` values count.
fn hosted_url(kind: HostedResponse, body: &str) -> Option<String> {
    let trimmed = body.trim();
    let url = match kind {
        HostedResponse::PlainText => Some(trimmed.to_string()),
        HostedResponse::NestedDataUrl => serde_json::from_str::<Value>(trimmed)
            .ok()
            .and_then(|value| {
                value
                    .get("data")
                    .and_then(|data| data.get("url"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
        HostedResponse::UrlList => match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                let listed = value.get("files").unwrap_or(&value);
                let first = match listed {
                    Value::Array(items) => items.first(),
                    other => Some(other),
                };
                first
                    .and_then(|item| item.get("url"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            Err(_) => Some(trimmed.to_string()),
        },
    }?;
    let url = url.trim();
    if url.starts_with("http") {
        Some(url.to_string())
    } else {
        None
    }
}
