pub mod classify;
pub mod codec;
pub mod errors;
pub mod extract;
pub mod materialize;
pub mod request;
pub mod strategy;
pub mod stream;
pub mod transport;
pub mod upload;

use anyhow::{Context, Result};
use chrono::Local;
use image::DynamicImage;
use tracing::{debug, info, warn};
use tutu_contracts::config::{validate_credential, CredentialIssue, CredentialProvider};
use tutu_contracts::models::ModelSelection;
use tutu_contracts::providers::{ProviderRouter, ProviderSelector};

pub use classify::GenerationFailure;
pub use errors::{FailureKind, GenerationError};
pub use extract::ImageReference;
pub use materialize::MaterializedImage;
pub use request::{GenerationRequest, SamplingParams};
pub use stream::DecodeStats;

use classify::{classify, connection_failure, fallback_image, FailureContext};
use codec::{ImageCodec, PngCodec};
use errors::{error_chain_text, push_unique_warning};
use extract::truncate_base64;
use materialize::materialize;
use request::{effective_params, sanitize_for_log, EffectiveParams};
use strategy::{strategy_for, StrategyContext};
use transport::{HttpTransport, OutboundCall, Transport};
use upload::{HostingUploader, ImageUploader};

#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Decoded images in discovery order; may be fewer than requested.
    pub images: Vec<MaterializedImage>,
    pub transcript: String,
    /// First materialized reference, rendered as a URL or data URI.
    pub primary_image_reference: String,
    pub model: ModelSelection,
    pub stats: DecodeStats,
    pub warnings: Vec<String>,
}

/// What the host pipeline receives. `images` is never empty.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub images: Vec<DynamicImage>,
    pub transcript: String,
    pub primary_image_url: String,
    pub failure: Option<FailureKind>,
    pub warnings: Vec<String>,
}

pub struct GenerationEngine {
    router: ProviderRouter,
    credentials: Box<dyn CredentialProvider>,
    transport: Box<dyn Transport>,
    uploader: Box<dyn ImageUploader>,
    codec: Box<dyn ImageCodec>,
}

impl GenerationEngine {
    /// Engine wired to the real network.
    pub fn new(credentials: Box<dyn CredentialProvider>) -> Result<Self> {
        Ok(Self::with_collaborators(
            ProviderRouter::new(),
            credentials,
            Box::new(HttpTransport::new()?),
            Box::new(HostingUploader::new()?),
            Box::new(PngCodec),
        ))
    }

    pub fn with_collaborators(
        router: ProviderRouter,
        credentials: Box<dyn CredentialProvider>,
        transport: Box<dyn Transport>,
        uploader: Box<dyn ImageUploader>,
        codec: Box<dyn ImageCodec>,
    ) -> Self {
        Self {
            router,
            credentials,
            transport,
            uploader,
            codec,
        }
    }

    /// Replaces the routing table, e.g. to point a provider at a relay.
    pub fn with_router(mut self, router: ProviderRouter) -> Self {
        self.router = router;
        self
    }

    pub fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResult, GenerationFailure> {
        let mut warnings = Vec::new();
        let params = effective_params(request, &mut warnings);
        match self.run(request, &params, &mut warnings) {
            Ok(mut result) => {
                for warning in &warnings {
                    warn!("{warning}");
                }
                result.warnings = warnings;
                Ok(result)
            }
            Err(err) => {
                let context = FailureContext {
                    provider: request.provider,
                    model: &request.model,
                    timeout_seconds: params.timeout.as_secs(),
                    catalog: &self.router.model_selector().catalog,
                };
                let (kind, user_message) = classify(&err, &context);
                warn!(
                    provider = %request.provider,
                    kind = %kind,
                    "generation failed: {}",
                    error_chain_text(&err, 600)
                );
                Err(GenerationFailure {
                    kind,
                    user_message,
                    fallback_image: fallback_image(&request.reference_images),
                    warnings,
                })
            }
        }
    }

    /// Never fails: on error the fallback image and the diagnostic text take
    /// the place of the result.
    pub fn process(&self, request: &GenerationRequest) -> NodeOutput {
        match self.generate(request) {
            Ok(result) => NodeOutput {
                images: result.images.into_iter().map(|item| item.image).collect(),
                transcript: result.transcript,
                primary_image_url: result.primary_image_reference,
                failure: None,
                warnings: result.warnings,
            },
            Err(failure) => NodeOutput {
                images: vec![failure.fallback_image],
                transcript: failure.user_message,
                primary_image_url: String::new(),
                failure: Some(failure.kind),
                warnings: failure.warnings,
            },
        }
    }

    fn run(
        &self,
        request: &GenerationRequest,
        params: &EffectiveParams,
        warnings: &mut Vec<String>,
    ) -> Result<GenerationResult> {
        let route = self
            .router
            .route(request.provider, &request.model)
            .map_err(GenerationError::ModelMismatch)?;
        if let Some(note) = route.model.note.as_deref() {
            debug!(model = %route.model.model_id, "{note}");
        }
        let api_key = self
            .resolve_credential(request.provider, request.api_key_override.as_deref())
            .map_err(|issue| GenerationError::Credential { issue })?;

        let strategy = strategy_for(route.profile.payload_shape);
        info!(
            provider = %request.provider,
            model = %route.model.model_id,
            strategy = strategy.name(),
            samples = params.sample_count,
            reference_images = request.reference_images.len(),
            "starting generation"
        );
        let context = StrategyContext {
            route: &route,
            request,
            params,
            codec: self.codec.as_ref(),
            uploader: self.uploader.as_ref(),
        };
        let payload = strategy.build_payload(&context, warnings)?;
        debug!(payload = %sanitize_for_log(&payload), "request payload");

        let call = OutboundCall {
            endpoint: route.profile.endpoint_url.clone(),
            headers: route.profile.auth_headers(&api_key),
            payload,
            timeout: params.timeout,
        };
        let decoded = strategy
            .exchange(self.transport.as_ref(), &call, &context, warnings)
            .with_context(|| format!("{} request failed", request.provider))?;
        for warning in &decoded.warnings {
            push_unique_warning(warnings, warning.clone());
        }
        info!(
            references = decoded.references.len(),
            transcript_chars = decoded.transcript.len(),
            stats = ?decoded.stats,
            "response decoded"
        );

        if decoded.references.is_empty() {
            if let Some(message) = decoded.upstream_error {
                return Err(GenerationError::UpstreamMessage { message }.into());
            }
            return Err(GenerationError::NoImage {
                transcript: decoded.transcript,
            }
            .into());
        }

        let images = materialize(
            &decoded.references,
            self.transport.as_ref(),
            self.codec.as_ref(),
            params.timeout,
            warnings,
        );
        let Some(primary) = images.first().map(|item| item.reference.render()) else {
            return Err(GenerationError::NoImage {
                transcript: decoded.transcript,
            }
            .into());
        };
        let received = images.len();
        let requested = params.sample_count as usize;
        if received != requested {
            push_unique_warning(
                warnings,
                format!(
                    "{}: requested {requested} image(s) but received {received}.",
                    FailureKind::PartialImageFailure
                ),
            );
        }
        info!(images = received, requested, "generation finished");

        Ok(GenerationResult {
            images,
            transcript: format_transcript(&request.instruction, &decoded.transcript),
            primary_image_reference: primary,
            model: route.model,
            stats: decoded.stats,
            warnings: Vec::new(),
        })
    }

    fn resolve_credential(
        &self,
        provider: ProviderSelector,
        override_key: Option<&str>,
    ) -> std::result::Result<String, CredentialIssue> {
        let override_key = override_key
            .map(str::trim)
            .filter(|key| !key.is_empty() && !key.ends_with("_here"));
        match override_key {
            Some(key) => {
                validate_credential(provider, key)?;
                Ok(key.to_string())
            }
            None => self.credentials.credential(provider),
        }
    }
}

/// Output for a request whose engine could not be built, e.g. when the HTTP
/// client fails to initialise. Shaped like any other failed `process` call.
pub fn unavailable_output(request: &GenerationRequest, err: &anyhow::Error) -> NodeOutput {
    let (kind, user_message) = connection_failure(request.provider.display_name(), err);
    warn!(provider = %request.provider, "engine unavailable: {}", error_chain_text(err, 600));
    NodeOutput {
        images: vec![fallback_image(&request.reference_images)],
        transcript: user_message,
        primary_image_url: String::new(),
        failure: Some(kind),
        warnings: Vec::new(),
    }
}

pub fn format_transcript(instruction: &str, decoded: &str) -> String {
    format!(
        "**User prompt**: {instruction}\n\n**Response** ({}):\n{}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        truncate_base64(decoded, 100)
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{self, BufRead, BufReader, Cursor, Read};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use serde_json::json;
    use tutu_contracts::config::{CredentialIssue, CredentialProvider};
    use tutu_contracts::providers::{ProviderRouter, ProviderSelector};

    use super::{unavailable_output, FailureKind, GenerationEngine, GenerationRequest};
    use crate::codec::{ImageCodec, PngCodec};
    use crate::errors::GenerationError;
    use crate::transport::{OutboundCall, Transport};
    use crate::upload::ImageUploader;

    const COMFLY_KEY: &str = "comfly-test-key-0001";
    const APICORE_KEY: &str = "sk-apicore-test-key-000001";

    #[derive(Clone)]
    enum Reply {
        Stream(String),
        StreamThenTimeout(String),
        Body(String),
        Status(u16, String),
    }

    #[derive(Default)]
    struct Log {
        calls: Vec<OutboundCall>,
        fetches: Vec<String>,
    }

    struct FakeTransport {
        reply: Reply,
        files: HashMap<String, Vec<u8>>,
        log: Arc<Mutex<Log>>,
    }

    struct TimingOut(Cursor<Vec<u8>>);

    impl Read for TimingOut {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
                n => Ok(n),
            }
        }
    }

    impl FakeTransport {
        fn respond(&self, call: &OutboundCall) -> anyhow::Result<Reply> {
            if let Ok(mut log) = self.log.lock() {
                log.calls.push(call.clone());
            }
            if let Reply::Status(status, body) = &self.reply {
                return Err(GenerationError::HttpStatus {
                    status: *status,
                    body: body.clone(),
                }
                .into());
            }
            Ok(self.reply.clone())
        }
    }

    impl Transport for FakeTransport {
        fn open_stream(&self, call: &OutboundCall) -> anyhow::Result<Box<dyn BufRead + Send>> {
            match self.respond(call)? {
                Reply::Stream(body) => Ok(Box::new(Cursor::new(body.into_bytes()))),
                Reply::StreamThenTimeout(body) => Ok(Box::new(BufReader::new(TimingOut(
                    Cursor::new(body.into_bytes()),
                )))),
                _ => anyhow::bail!("unexpected streaming call"),
            }
        }

        fn post_json(&self, call: &OutboundCall) -> anyhow::Result<String> {
            match self.respond(call)? {
                Reply::Body(body) => Ok(body),
                _ => anyhow::bail!("unexpected synchronous call"),
            }
        }

        fn fetch(&self, url: &str, _timeout: Duration) -> anyhow::Result<Vec<u8>> {
            if let Ok(mut log) = self.log.lock() {
                log.fetches.push(url.to_string());
            }
            self.files.get(url).cloned().ok_or_else(|| {
                GenerationError::HttpStatus {
                    status: 404,
                    body: "missing".to_string(),
                }
                .into()
            })
        }
    }

    struct FixedCredentials(HashMap<ProviderSelector, String>);

    impl CredentialProvider for FixedCredentials {
        fn credential(&self, provider: ProviderSelector) -> Result<String, CredentialIssue> {
            self.0
                .get(&provider)
                .cloned()
                .ok_or(CredentialIssue::Missing)
        }
    }

    struct StaticUploader;

    impl ImageUploader for StaticUploader {
        fn upload(&self, _image: &DynamicImage) -> Option<String> {
            Some("https://host.example.com/ref.png".to_string())
        }
    }

    fn png(width: u32) -> Vec<u8> {
        PngCodec
            .encode(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
                width,
                width,
                Rgb([200, 10, 10]),
            )))
            .unwrap_or_default()
    }

    fn engine(
        reply: Reply,
        files: &[(&str, Vec<u8>)],
        keys: &[(ProviderSelector, &str)],
    ) -> (GenerationEngine, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let transport = FakeTransport {
            reply,
            files: files
                .iter()
                .map(|(url, bytes)| (url.to_string(), bytes.clone()))
                .collect(),
            log: Arc::clone(&log),
        };
        let credentials = FixedCredentials(
            keys.iter()
                .map(|(provider, key)| (*provider, key.to_string()))
                .collect(),
        );
        let engine = GenerationEngine::with_collaborators(
            ProviderRouter::new(),
            Box::new(credentials),
            Box::new(transport),
            Box::new(StaticUploader),
            Box::new(PngCodec),
        );
        (engine, log)
    }

    fn sse(lines: &[String]) -> String {
        let mut body = String::new();
        for line in lines {
            body.push_str(line);
            body.push_str("\n\n");
        }
        body
    }

    fn delta(text: &str) -> String {
        format!(
            "data: {}",
            json!({"id": "x", "object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": text}}]})
        )
    }

    fn call_count(log: &Arc<Mutex<Log>>) -> usize {
        log.lock().map(|log| log.calls.len()).unwrap_or(usize::MAX)
    }

    #[test]
    fn scenario_a_streamed_markdown_link_yields_one_image() -> anyhow::Result<()> {
        let body = sse(&[
            delta("Here is your cat: "),
            delta("![cat](https://cdn.example.com/cat.png)"),
            "data: [DONE]".to_string(),
        ]);
        let (engine, log) = engine(
            Reply::Stream(body),
            &[("https://cdn.example.com/cat.png", png(4))],
            &[(ProviderSelector::Comfly, COMFLY_KEY)],
        );
        let request = GenerationRequest::new(
            "draw a cat",
            ProviderSelector::Comfly,
            "[Comfly] gemini-2.5-flash-image-preview",
        );
        let result = engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;

        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].image.dimensions(), (4, 4));
        assert_eq!(result.primary_image_reference, "https://cdn.example.com/cat.png");
        assert!(result.transcript.starts_with("**User prompt**: draw a cat\n\n**Response** ("));
        assert!(result.transcript.contains("Here is your cat"));
        assert!(result.warnings.is_empty());

        let log = log.lock().map_err(|_| anyhow::anyhow!("log poisoned"))?;
        let call = &log.calls[0];
        assert_eq!(call.endpoint, "https://ai.comfly.chat/v1/chat/completions");
        assert!(call
            .headers
            .contains(&("Authorization".to_string(), format!("Bearer {COMFLY_KEY}"))));
        assert_eq!(call.payload["model"], json!("gemini-2.5-flash-image-preview"));
        assert_eq!(call.payload["stream"], json!(true));
        Ok(())
    }

    #[test]
    fn scenario_b_sync_json_keeps_image_order() -> anyhow::Result<()> {
        let (engine, log) = engine(
            Reply::Body(r#"{"data":[{"url":"https://x/1.png"},{"url":"https://x/2.png"}]}"#.to_string()),
            &[("https://x/1.png", png(1)), ("https://x/2.png", png(2))],
            &[(ProviderSelector::ApiCore, APICORE_KEY)],
        );
        let mut request = GenerationRequest::new(
            "two dogs",
            ProviderSelector::ApiCore,
            "[APICore] gemini-2.5-flash-image",
        );
        request.sample_count = 2;
        let result = engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;

        let widths: Vec<u32> = result
            .images
            .iter()
            .map(|item| item.image.dimensions().0)
            .collect();
        assert_eq!(widths, vec![1, 2]);
        assert_eq!(result.primary_image_reference, "https://x/1.png");

        let log = log.lock().map_err(|_| anyhow::anyhow!("log poisoned"))?;
        assert_eq!(log.fetches, vec!["https://x/1.png", "https://x/2.png"]);
        assert_eq!(
            log.calls[0].payload,
            json!({"prompt": "two dogs", "model": "gemini-2.5-flash-image", "size": "1x1", "n": 2})
        );
        Ok(())
    }

    #[test]
    fn scenario_c_missing_credential_fails_before_any_call() {
        let (engine, log) = engine(Reply::Stream(String::new()), &[], &[]);
        let reference = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 3, Rgb([0, 0, 0])));
        let mut request = GenerationRequest::new("edit", ProviderSelector::OpenRouter, "");
        request.reference_images = vec![reference];

        let Err(failure) = engine.generate(&request) else {
            panic!("expected an auth failure");
        };
        assert_eq!(failure.kind, FailureKind::Auth);
        assert!(failure.user_message.contains("API key is empty"));
        assert_eq!(failure.fallback_image.dimensions(), (6, 3));
        assert_eq!(call_count(&log), 0);
    }

    #[test]
    fn scenario_d_done_marker_mid_buffer_uses_earlier_data() -> anyhow::Result<()> {
        let body = [
            delta("![out](https://cdn.example.com/out.png)"),
            "data: {\"choices\":[{\"delta\":{\"content\":\"unfinished".to_string(),
            "data: [DONE]".to_string(),
        ]
        .join("\n");
        let (engine, _log) = engine(
            Reply::Stream(body),
            &[("https://cdn.example.com/out.png", png(3))],
            &[(ProviderSelector::Comfly, COMFLY_KEY)],
        );
        let request = GenerationRequest::new("draw", ProviderSelector::Comfly, "");
        let result = engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.stats.fragments_discarded, 1);
        assert!(!result.transcript.contains("unfinished"));
        Ok(())
    }

    #[test]
    fn model_mismatch_short_circuits_without_network() {
        let (engine, log) = engine(
            Reply::Stream(String::new()),
            &[],
            &[(ProviderSelector::OpenRouter, "sk-or-v1-0123456789abcdefghij")],
        );
        for model in [
            "[Comfly] gemini-2.5-flash-image-preview",
            "[APICore] gemini-2.5-flash-image",
            "[Midjourney] v6",
        ] {
            let request = GenerationRequest::new("x", ProviderSelector::OpenRouter, model);
            let Err(failure) = engine.generate(&request) else {
                panic!("expected a mismatch for {model}");
            };
            assert_eq!(failure.kind, FailureKind::ModelMismatch);
            assert!(failure.user_message.contains("[OpenRouter]"));
            assert_eq!(failure.fallback_image.dimensions(), (1024, 1024));
        }
        assert_eq!(call_count(&log), 0);
    }

    #[test]
    fn request_override_key_is_validated_and_used() -> anyhow::Result<()> {
        let body = sse(&[delta("![a](https://cdn.example.com/a.png)")]);
        let (engine, log) = engine(
            Reply::Stream(body),
            &[("https://cdn.example.com/a.png", png(2))],
            &[],
        );
        let mut request = GenerationRequest::new("a", ProviderSelector::Comfly, "");
        request.api_key_override = Some("short".to_string());
        let Err(failure) = engine.generate(&request) else {
            panic!("expected a short-key failure");
        };
        assert!(failure.user_message.contains("too short (5 characters)"));

        request.api_key_override = Some(COMFLY_KEY.to_string());
        engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;
        assert_eq!(call_count(&log), 1);
        Ok(())
    }

    #[test]
    fn partial_batch_is_a_warning_not_a_failure() -> anyhow::Result<()> {
        let inline = BASE64.encode(png(5));
        let content = format!(
            "![1](https://x/ok.png) ![2](https://x/404.png) ![3](data:image/png;base64,{inline})"
        );
        let (engine, _log) = engine(
            Reply::Stream(sse(&[delta(&content)])),
            &[("https://x/ok.png", png(1))],
            &[(ProviderSelector::Comfly, COMFLY_KEY)],
        );
        let mut request = GenerationRequest::new("three", ProviderSelector::Comfly, "");
        request.sample_count = 3;
        let result = engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;
        let widths: Vec<u32> = result
            .images
            .iter()
            .map(|item| item.image.dimensions().0)
            .collect();
        assert_eq!(widths, vec![1, 5]);
        assert!(result
            .warnings
            .iter()
            .any(|warning| warning.starts_with("partial_image_failure")));
        assert_eq!(result.primary_image_reference, "https://x/ok.png");
        Ok(())
    }

    #[test]
    fn text_only_reply_is_no_image_found() {
        let (engine, _log) = engine(
            Reply::Stream(sse(&[delta("I can only describe it: a fluffy cat.")])),
            &[],
            &[(ProviderSelector::Comfly, COMFLY_KEY)],
        );
        let request = GenerationRequest::new("cat", ProviderSelector::Comfly, "");
        let Err(failure) = engine.generate(&request) else {
            panic!("expected no image");
        };
        assert_eq!(failure.kind, FailureKind::NoImageFound);
        assert!(failure.user_message.contains("a fluffy cat"));
    }

    #[test]
    fn unreachable_images_are_no_image_found() {
        let (engine, _log) = engine(
            Reply::Stream(sse(&[delta("![x](https://x/gone.png)")])),
            &[],
            &[(ProviderSelector::Comfly, COMFLY_KEY)],
        );
        let request = GenerationRequest::new("cat", ProviderSelector::Comfly, "");
        let Err(failure) = engine.generate(&request) else {
            panic!("expected no image");
        };
        assert_eq!(failure.kind, FailureKind::NoImageFound);
    }

    #[test]
    fn stream_timeout_is_hard_failure_unless_partial_accepted() -> anyhow::Result<()> {
        let body = format!("{}\n", delta("![x](https://x/early.png)"));
        let files = [("https://x/early.png", png(2))];
        let keys = [(ProviderSelector::Comfly, COMFLY_KEY)];

        let (engine_a, _log) = engine(Reply::StreamThenTimeout(body.clone()), &files, &keys);
        let mut request = GenerationRequest::new("cat", ProviderSelector::Comfly, "");
        request.timeout_seconds = 30;
        let Err(failure) = engine_a.generate(&request) else {
            panic!("expected a timeout");
        };
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.user_message.contains("30s"));

        let (engine_b, _log) = engine(Reply::StreamThenTimeout(body), &files, &keys);
        request.accept_partial_on_timeout = true;
        let result = engine_b
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;
        assert_eq!(result.images.len(), 1);
        assert!(result.warnings.iter().any(|warning| warning.contains("timed out")));
        Ok(())
    }

    #[test]
    fn http_errors_are_classified() {
        let keys = [(ProviderSelector::OpenRouter, "sk-or-v1-0123456789abcdefghij")];
        let (engine_a, _log) = engine(Reply::Status(403, "forbidden".to_string()), &[], &keys);
        let request = GenerationRequest::new("x", ProviderSelector::OpenRouter, "");
        let Err(failure) = engine_a.generate(&request) else {
            panic!("expected auth failure");
        };
        assert_eq!(failure.kind, FailureKind::Auth);

        let (engine_b, _log) = engine(
            Reply::Status(404, "No endpoints found for model".to_string()),
            &[],
            &keys,
        );
        let Err(failure) = engine_b.generate(&request) else {
            panic!("expected upstream failure");
        };
        assert_eq!(failure.kind, FailureKind::Upstream);
        assert!(failure.user_message.contains("Suggested models"));
    }

    #[test]
    fn sync_body_that_is_not_json_is_response_format() {
        let (engine, _log) = engine(
            Reply::Body("<html>gateway</html>".to_string()),
            &[],
            &[(ProviderSelector::ApiCore, APICORE_KEY)],
        );
        let request = GenerationRequest::new("x", ProviderSelector::ApiCore, "");
        let Err(failure) = engine.generate(&request) else {
            panic!("expected format failure");
        };
        assert_eq!(failure.kind, FailureKind::ResponseFormat);
    }

    #[test]
    fn sync_reference_images_are_hosted_and_prepended() -> anyhow::Result<()> {
        let (engine, log) = engine(
            Reply::Body(r#"{"data":[{"url":"https://x/1.png"}]}"#.to_string()),
            &[("https://x/1.png", png(1))],
            &[(ProviderSelector::ApiCore, APICORE_KEY)],
        );
        let mut request = GenerationRequest::new("restyle", ProviderSelector::ApiCore, "");
        request.reference_images = vec![DynamicImage::ImageRgb8(RgbImage::new(2, 2))];
        engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;
        let log = log.lock().map_err(|_| anyhow::anyhow!("log poisoned"))?;
        assert_eq!(
            log.calls[0].payload["prompt"],
            json!("https://host.example.com/ref.png restyle")
        );
        Ok(())
    }

    #[test]
    fn process_always_returns_an_image() {
        let (engine, _log) = engine(Reply::Stream(String::new()), &[], &[]);
        let request = GenerationRequest::new("x", ProviderSelector::Comfly, "");
        let output = engine.process(&request);
        assert_eq!(output.images.len(), 1);
        assert_eq!(output.failure, Some(FailureKind::Auth));
        assert!(output.primary_image_url.is_empty());
        assert!(output.transcript.contains("API key problem"));
    }

    #[test]
    fn engine_setup_failure_still_yields_a_fallback_image() {
        let reference = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 7, Rgb([9, 9, 9])));
        let mut request = GenerationRequest::new("x", ProviderSelector::OpenRouter, "");
        request.reference_images = vec![reference];
        let err = anyhow::anyhow!("tls backend unavailable").context("failed to build HTTP client");
        let output = unavailable_output(&request, &err);
        assert_eq!(output.failure, Some(FailureKind::Connection));
        assert_eq!(output.images.len(), 1);
        assert_eq!(output.images[0].dimensions(), (5, 7));
        assert!(output.transcript.contains("OpenRouter"));
        assert!(output.transcript.contains("tls backend unavailable"));
    }

    #[test]
    fn custom_router_endpoint_receives_the_call() -> anyhow::Result<()> {
        let body = sse(&[delta("![a](https://cdn.example.com/a.png)")]);
        let (engine, log) = engine(
            Reply::Stream(body),
            &[("https://cdn.example.com/a.png", png(2))],
            &[(ProviderSelector::Comfly, COMFLY_KEY)],
        );
        let engine = engine.with_router(ProviderRouter::new().with_profile(
            ProviderSelector::Comfly
                .profile()
                .with_endpoint("http://relay.local/v1/chat/completions"),
        ));
        let request = GenerationRequest::new("a", ProviderSelector::Comfly, "");
        engine
            .generate(&request)
            .map_err(|failure| anyhow::anyhow!(failure.user_message))?;
        let log = log.lock().map_err(|_| anyhow::anyhow!("log poisoned"))?;
        assert_eq!(log.calls[0].endpoint, "http://relay.local/v1/chat/completions");
        Ok(())
    }
}
