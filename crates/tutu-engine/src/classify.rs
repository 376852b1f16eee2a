use std::io;

use image::DynamicImage;
use tutu_contracts::config::CredentialIssue;
use tutu_contracts::models::ModelCatalog;
use tutu_contracts::providers::ProviderSelector;

use crate::codec::blank_placeholder;
use crate::errors::{error_chain_text, truncate_text, FailureKind, GenerationError};
use crate::extract::truncate_base64;

/// Terminal outcome handed to the caller instead of a result.
#[derive(Debug, Clone)]
pub struct GenerationFailure {
    pub kind: FailureKind,
    pub user_message: String,
    pub fallback_image: DynamicImage,
    pub warnings: Vec<String>,
}

/// Request facts used to phrase a failure.
#[derive(Debug, Clone)]
pub struct FailureContext<'a> {
    pub provider: ProviderSelector,
    pub model: &'a str,
    pub timeout_seconds: u64,
    pub catalog: &'a ModelCatalog,
}

pub fn fallback_image(reference_images: &[DynamicImage]) -> DynamicImage {
    reference_images
        .first()
        .cloned()
        .unwrap_or_else(blank_placeholder)
}

/// Maps an error chain onto the failure taxonomy and a remediation message.
pub fn classify(err: &anyhow::Error, context: &FailureContext<'_>) -> (FailureKind, String) {
    let provider = context.provider.display_name();
    for cause in err.chain() {
        if let Some(generation) = cause.downcast_ref::<GenerationError>() {
            return classify_generation_error(generation, context);
        }
        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            if reqwest_err.is_timeout() {
                return timeout_failure(context);
            }
            if reqwest_err.is_connect() || reqwest_err.is_request() {
                return connection_failure(provider, err);
            }
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            // Blocking body reads wrap the reqwest error as the io payload,
            // which `source()` skips over.
            if let Some(inner) = io_err
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            {
                if inner.is_timeout() {
                    return timeout_failure(context);
                }
                if inner.is_connect() || inner.is_request() || inner.is_body() {
                    return connection_failure(provider, err);
                }
            }
            match io_err.kind() {
                io::ErrorKind::TimedOut => return timeout_failure(context),
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return connection_failure(provider, err),
                _ => {}
            }
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return (
                FailureKind::ResponseFormat,
                format!(
                    "❌ {provider} returned an invalid response format.\n\n**Detail**: {}",
                    error_chain_text(err, 500)
                ),
            );
        }
    }
    (
        FailureKind::Upstream,
        format!(
            "❌ {provider} service error: {}",
            error_chain_text(err, 800)
        ),
    )
}

fn classify_generation_error(
    err: &GenerationError,
    context: &FailureContext<'_>,
) -> (FailureKind, String) {
    let provider = context.provider.display_name();
    match err {
        GenerationError::ModelMismatch(message) => (FailureKind::ModelMismatch, message.clone()),
        GenerationError::Credential { issue } => (
            FailureKind::Auth,
            credential_help(context.provider, &credential_state(issue)),
        ),
        GenerationError::HttpStatus { status, body } if matches!(*status, 401 | 403) => (
            FailureKind::Auth,
            credential_help(
                context.provider,
                &format!(
                    "API key rejected by the server (HTTP {status}): {}",
                    truncate_text(body, 200)
                ),
            ),
        ),
        GenerationError::HttpStatus { status: 404, body } if body.contains("No endpoints found") => (
            FailureKind::Upstream,
            format!(
                "❌ **Model not available**\n\n\
                 **Selected model**: `{}`\n\
                 **Error**: this model is not available on {provider}\n\n\
                 **💡 Suggested models**:\n{}\n\n\
                 **How to fix**:\n\
                 1. Switch to one of the models above\n\
                 2. Check the model name for typos\n\
                 3. Check the {provider} documentation for currently supported models",
                context.model.trim(),
                context.catalog.suggestions(context.provider)
            ),
        ),
        GenerationError::HttpStatus { status, body } => (
            FailureKind::Upstream,
            format!(
                "❌ {provider} returned HTTP {status}: {}",
                truncate_text(body, 500)
            ),
        ),
        GenerationError::StreamTimeout { .. } => timeout_failure(context),
        GenerationError::ResponseFormat { detail } => (
            FailureKind::ResponseFormat,
            format!(
                "❌ {provider} returned an invalid response format.\n\n**Detail**: {}",
                truncate_text(detail, 500)
            ),
        ),
        GenerationError::UpstreamMessage { message } => (
            FailureKind::Upstream,
            format!(
                "❌ {provider} reported an error: {}",
                truncate_text(message, 500)
            ),
        ),
        GenerationError::NoImage { transcript } => (
            FailureKind::NoImageFound,
            format!(
                "⚠️ No image was found in the {provider} response.\n\n\
                 The model may have answered with text only; try rephrasing the prompt \
                 or picking an image-capable model.\n\n\
                 **Decoded response**:\n{}",
                truncate_text(&truncate_base64(transcript, 100), 2000)
            ),
        ),
    }
}

fn timeout_failure(context: &FailureContext<'_>) -> (FailureKind, String) {
    (
        FailureKind::Timeout,
        format!(
            "⏰ {} did not respond within {}s. Increase the timeout or retry later.",
            context.provider.display_name(),
            context.timeout_seconds
        ),
    )
}

pub(crate) fn connection_failure(provider: &str, err: &anyhow::Error) -> (FailureKind, String) {
    (
        FailureKind::Connection,
        format!(
            "❌ Could not connect to {provider}. Check your network connection.\n\n**Detail**: {}",
            error_chain_text(err, 400)
        ),
    )
}

fn credential_state(issue: &CredentialIssue) -> String {
    match issue {
        CredentialIssue::Missing => "API key is empty".to_string(),
        CredentialIssue::TooShort { length } => {
            format!("API key is too short ({length} characters)")
        }
        CredentialIssue::Malformed { reason } => format!("API key is malformed ({reason})"),
    }
}

fn credential_help(provider: ProviderSelector, state: &str) -> String {
    let hint = match provider {
        ProviderSelector::Comfly => {
            "Get a key at https://ai.comfly.chat/. The legacy \"api_key\" field is also accepted."
        }
        ProviderSelector::OpenRouter => {
            "Get a key at https://openrouter.ai/. Keys look like sk-or-v1-..."
        }
        ProviderSelector::ApiCore => "Get a key from the APICore.ai console. Keys start with sk-.",
    };
    format!(
        "❌ **{} API key problem**\n\n\
         **Current state**: {state}\n\n\
         **How to configure**:\n\
         1. Pass the key for this run with --api-key\n\
         2. Or store it with `tutu-rs config set-key {} <KEY>`, which writes \"{}\" in the config file\n\n\
         {hint}",
        provider.display_name(),
        provider.id(),
        provider.credential_field()
    )
}
