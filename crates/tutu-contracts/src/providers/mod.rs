use std::fmt;
use std::str::FromStr;

use crate::models::{ModelSelection, ModelSelector};

/// One of the three upstream image APIs a generation request can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderSelector {
    Comfly,
    OpenRouter,
    ApiCore,
}

impl ProviderSelector {
    pub const ALL: [ProviderSelector; 3] = [
        ProviderSelector::Comfly,
        ProviderSelector::OpenRouter,
        ProviderSelector::ApiCore,
    ];

    pub fn id(self) -> &'static str {
        match self {
            ProviderSelector::Comfly => "comfly",
            ProviderSelector::OpenRouter => "openrouter",
            ProviderSelector::ApiCore => "apicore",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderSelector::Comfly => "ai.comfly.chat",
            ProviderSelector::OpenRouter => "OpenRouter",
            ProviderSelector::ApiCore => "APICore.ai",
        }
    }

    /// Bracketed tag carried by model names that belong to this provider.
    pub fn model_tag(self) -> &'static str {
        match self {
            ProviderSelector::Comfly => "Comfly",
            ProviderSelector::OpenRouter => "OpenRouter",
            ProviderSelector::ApiCore => "APICore",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|selector| selector.model_tag() == tag.trim())
    }

    /// Field of the configuration document holding this provider's key.
    pub fn credential_field(self) -> &'static str {
        match self {
            ProviderSelector::Comfly => "comfly_api_key",
            ProviderSelector::OpenRouter => "openrouter_api_key",
            ProviderSelector::ApiCore => "apicore_api_key",
        }
    }

    pub fn profile(self) -> ProviderProfile {
        match self {
            ProviderSelector::Comfly => ProviderProfile {
                selector: self,
                endpoint_url: "https://ai.comfly.chat/v1/chat/completions".to_string(),
                payload_shape: PayloadShape::ChatStream,
                field_rules: FieldRules::chat_stream(),
                extra_headers: Vec::new(),
            },
            ProviderSelector::OpenRouter => ProviderProfile {
                selector: self,
                endpoint_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                payload_shape: PayloadShape::ChatStream,
                field_rules: FieldRules::chat_stream(),
                extra_headers: vec![
                    ("HTTP-Referer", "https://comfyui.com"),
                    ("X-Title", "ComfyUI Tutu Nano Banana"),
                ],
            },
            ProviderSelector::ApiCore => ProviderProfile {
                selector: self,
                endpoint_url: "https://ismaque.org/v1/images/generations".to_string(),
                payload_shape: PayloadShape::SyncJson,
                field_rules: FieldRules::sync_json(),
                extra_headers: Vec::new(),
            },
        }
    }
}

impl fmt::Display for ProviderSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ProviderSelector {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|selector| {
                selector.id() == normalized
                    || selector.display_name().to_ascii_lowercase() == normalized
            })
            .ok_or_else(|| {
                format!(
                    "Unsupported API provider '{}'. Expected one of: {}.",
                    raw.trim(),
                    Self::ALL
                        .iter()
                        .map(|selector| selector.display_name())
                        .collect::<Vec<&str>>()
                        .join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Chat-completion request answered by an SSE stream.
    ChatStream,
    /// Single image-generation call answered by one JSON body.
    SyncJson,
}

/// Where a provider's responses keep their images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRules {
    pub ignored_top_level_keys: &'static [&'static str],
    pub ignored_choice_keys: &'static [&'static str],
    /// Ordered `a[].b` style paths tried against a synchronous body.
    pub candidate_paths: &'static [&'static str],
}

impl FieldRules {
    fn chat_stream() -> Self {
        Self {
            ignored_top_level_keys: &[
                "id",
                "object",
                "created",
                "model",
                "system_fingerprint",
                "choices",
                "usage",
            ],
            ignored_choice_keys: &["index", "finish_reason", "native_finish_reason", "logprobs"],
            candidate_paths: &[],
        }
    }

    fn sync_json() -> Self {
        Self {
            ignored_top_level_keys: &[],
            ignored_choice_keys: &[],
            candidate_paths: &[
                "data[].url",
                "data[].image_url",
                "data[].generated_image",
                "data[].b64_json",
                "data[]",
                "data.url",
                "data.image_url",
                "data.generated_image",
                "images[]",
                "images[].url",
                "images[].image_url",
                "url",
                "image_url",
                "generated_image",
                "choices[].url",
                "choices[].image_url",
                "choices[].generated_image",
                "choices[].message.content",
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub selector: ProviderSelector,
    pub endpoint_url: String,
    pub payload_shape: PayloadShape,
    pub field_rules: FieldRules,
    extra_headers: Vec<(&'static str, &'static str)>,
}

impl ProviderProfile {
    pub fn with_endpoint(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = endpoint_url.into();
        self
    }

    pub fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), format!("Bearer {api_key}")),
        ];
        for (name, value) in &self.extra_headers {
            headers.push(((*name).to_string(), (*value).to_string()));
        }
        headers
    }
}

pub trait NamedProvider {
    fn name(&self) -> &str;
}

impl NamedProvider for ProviderProfile {
    fn name(&self) -> &str {
        self.selector.id()
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRegistry<T: NamedProvider> {
    providers: Vec<T>,
}

impl<T: NamedProvider> ProviderRegistry<T> {
    pub fn new(providers: Vec<T>) -> Self {
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.providers
            .iter()
            .find(|provider| provider.name() == name)
    }

    fn replace(&mut self, provider: T) {
        let name = provider.name().to_string();
        self.providers.retain(|existing| existing.name() != name);
        self.providers.push(provider);
    }
}

/// Provider profile and validated model for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub profile: ProviderProfile,
    pub model: ModelSelection,
}

/// Maps a provider selector and a tagged model name onto an endpoint.
#[derive(Debug, Clone)]
pub struct ProviderRouter {
    registry: ProviderRegistry<ProviderProfile>,
    selector: ModelSelector,
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self {
            registry: ProviderRegistry::new(
                ProviderSelector::ALL
                    .into_iter()
                    .map(ProviderSelector::profile)
                    .collect(),
            ),
            selector: ModelSelector::new(None),
        }
    }
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a custom profile, e.g. a relay endpoint.
    pub fn with_profile(mut self, profile: ProviderProfile) -> Self {
        self.registry.replace(profile);
        self
    }

    pub fn profile(&self, provider: ProviderSelector) -> ProviderProfile {
        self.registry
            .get(provider.id())
            .cloned()
            .unwrap_or_else(|| provider.profile())
    }

    pub fn model_selector(&self) -> &ModelSelector {
        &self.selector
    }

    /// Fails with a user-facing message when the model's tag belongs to a
    /// different provider.
    pub fn route(&self, provider: ProviderSelector, model: &str) -> Result<Route, String> {
        let model = self.selector.select(provider, model)?;
        Ok(Route {
            profile: self.profile(provider),
            model,
        })
    }
}
