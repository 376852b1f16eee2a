use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;
use tutu_contracts::providers::{PayloadShape, Route};

use crate::codec::ImageCodec;
use crate::errors::{push_unique_warning, GenerationError};
use crate::request::{build_chat_payload, build_sync_payload, EffectiveParams, GenerationRequest};
use crate::stream::{decode_document, DecodeOutcome, StreamDecoder};
use crate::transport::{OutboundCall, Transport};
use crate::upload::ImageUploader;

/// Inputs shared by payload construction and response handling.
pub struct StrategyContext<'a> {
    pub route: &'a Route,
    pub request: &'a GenerationRequest,
    pub params: &'a EffectiveParams,
    pub codec: &'a dyn ImageCodec,
    pub uploader: &'a dyn ImageUploader,
}

/// How one payload shape is requested and decoded.
pub trait ProviderStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn build_payload(&self, context: &StrategyContext<'_>, warnings: &mut Vec<String>)
        -> Result<Value>;
    fn exchange(
        &self,
        transport: &dyn Transport,
        call: &OutboundCall,
        context: &StrategyContext<'_>,
        warnings: &mut Vec<String>,
    ) -> Result<DecodeOutcome>;
}

pub struct StreamingChatStrategy;

impl ProviderStrategy for StreamingChatStrategy {
    fn name(&self) -> &'static str {
        "streaming_chat"
    }

    fn build_payload(
        &self,
        context: &StrategyContext<'_>,
        warnings: &mut Vec<String>,
    ) -> Result<Value> {
        build_chat_payload(
            context.route,
            context.request,
            context.params,
            context.codec,
            warnings,
        )
    }

    fn exchange(
        &self,
        transport: &dyn Transport,
        call: &OutboundCall,
        context: &StrategyContext<'_>,
        warnings: &mut Vec<String>,
    ) -> Result<DecodeOutcome> {
        let reader = transport.open_stream(call)?;
        let decoder = StreamDecoder::new(context.route.profile.field_rules.clone());
        match decoder.decode_reader(reader) {
            Ok(outcome) => Ok(outcome),
            Err(interrupted) if interrupted.timed_out => {
                if context.request.accept_partial_on_timeout {
                    warn!(
                        transcript_chars = interrupted.partial.transcript.len(),
                        references = interrupted.partial.references.len(),
                        "stream timed out; keeping partial response"
                    );
                    push_unique_warning(
                        warnings,
                        "The response stream timed out; using the partial response.".to_string(),
                    );
                    return Ok(interrupted.partial);
                }
                Err(GenerationError::StreamTimeout {
                    seconds: context.params.timeout.as_secs(),
                }
                .into())
            }
            Err(interrupted) => {
                Err(anyhow::Error::new(interrupted.source).context("response stream read failed"))
            }
        }
    }
}

pub struct SyncJsonStrategy;

impl ProviderStrategy for SyncJsonStrategy {
    fn name(&self) -> &'static str {
        "sync_json"
    }

    fn build_payload(
        &self,
        context: &StrategyContext<'_>,
        warnings: &mut Vec<String>,
    ) -> Result<Value> {
        Ok(build_sync_payload(
            context.route,
            context.request,
            context.params,
            context.uploader,
            warnings,
        ))
    }

    fn exchange(
        &self,
        transport: &dyn Transport,
        call: &OutboundCall,
        context: &StrategyContext<'_>,
        _warnings: &mut Vec<String>,
    ) -> Result<DecodeOutcome> {
        let body = transport.post_json(call)?;
        let outcome = decode_document(&body, &context.route.profile.field_rules)
            .context("response body could not be decoded")?;
        Ok(outcome)
    }
}

pub fn strategy_for(shape: PayloadShape) -> &'static dyn ProviderStrategy {
    match shape {
        PayloadShape::ChatStream => &StreamingChatStrategy,
        PayloadShape::SyncJson => &SyncJsonStrategy,
    }
}
