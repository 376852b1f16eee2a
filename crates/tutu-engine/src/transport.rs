use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::Value;
use tracing::debug;

use crate::errors::{truncate_text, GenerationError};

pub const USER_AGENT: &str = concat!("tutu-rs/", env!("CARGO_PKG_VERSION"));

/// One outbound provider call.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub payload: Value,
    pub timeout: Duration,
}

/// The network. Faked in tests.
pub trait Transport: Send + Sync {
    /// Sends the call and returns the body as a line reader. Non-2xx
    /// responses fail with `GenerationError::HttpStatus`.
    fn open_stream(&self, call: &OutboundCall) -> Result<Box<dyn BufRead + Send>>;
    /// Sends the call and returns the whole body.
    fn post_json(&self, call: &OutboundCall) -> Result<String>;
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    fn request(&self, call: &OutboundCall) -> RequestBuilder {
        let mut request = self
            .http
            .post(&call.endpoint)
            .timeout(call.timeout)
            .json(&call.payload);
        for (name, value) in &call.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn send(&self, call: &OutboundCall) -> Result<HttpResponse> {
        debug!(endpoint = %call.endpoint, timeout_s = call.timeout.as_secs(), "sending request");
        let response = self
            .request(call)
            .send()
            .with_context(|| format!("request to {} failed", call.endpoint))?;
        ensure_success(response)
    }
}

impl Transport for HttpTransport {
    fn open_stream(&self, call: &OutboundCall) -> Result<Box<dyn BufRead + Send>> {
        let response = self.send(call)?;
        Ok(Box::new(BufReader::new(response)))
    }

    fn post_json(&self, call: &OutboundCall) -> Result<String> {
        let response = self.send(call)?;
        response.text().context("response body read failed")
    }

    fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        let response = ensure_success(response)?;
        Ok(response
            .bytes()
            .context("image bytes read failed")?
            .to_vec())
    }
}

fn ensure_success(response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(GenerationError::HttpStatus {
        status: status.as_u16(),
        body: truncate_text(body.trim(), 500),
    }
    .into())
}
