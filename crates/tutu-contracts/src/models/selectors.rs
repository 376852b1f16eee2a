use super::registry::ModelCatalog;
use crate::providers::ProviderSelector;

/// Model identifier with an optional `[Tag] ` provider prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedModel {
    pub tag: Option<String>,
    pub model_id: String,
}

impl TaggedModel {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let untagged = || Self {
            tag: None,
            model_id: trimmed.to_string(),
        };
        let Some(rest) = trimmed.strip_prefix('[') else {
            return untagged();
        };
        let Some((tag, model)) = rest.split_once(']') else {
            return untagged();
        };
        Self {
            tag: Some(tag.to_string()),
            model_id: model.strip_prefix(' ').unwrap_or(model).to_string(),
        }
    }

    pub fn render(&self) -> String {
        match self.tag.as_deref() {
            Some(tag) => format!("[{tag}] {}", self.model_id),
            None => self.model_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    /// Bare identifier sent upstream.
    pub model_id: String,
    pub tag: Option<String>,
    pub requested: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub catalog: ModelCatalog,
}

impl ModelSelector {
    pub fn new(catalog: Option<ModelCatalog>) -> Self {
        Self {
            catalog: catalog.unwrap_or_else(|| ModelCatalog::new(None)),
        }
    }

    pub fn select(
        &self,
        provider: ProviderSelector,
        requested: &str,
    ) -> Result<ModelSelection, String> {
        if requested.trim().is_empty() {
            let candidates = self.catalog.by_provider(provider);
            let Some(model) = candidates.first() else {
                return Err(format!(
                    "No models available for provider '{}'.",
                    provider.display_name()
                ));
            };
            return Ok(ModelSelection {
                model_id: model.model_id.clone(),
                tag: Some(provider.model_tag().to_string()),
                requested: None,
                note: Some("No model specified; using default.".to_string()),
            });
        }

        let parsed = TaggedModel::parse(requested);
        let Some(tag) = parsed.tag.clone() else {
            return Ok(ModelSelection {
                model_id: parsed.model_id,
                tag: None,
                requested: Some(requested.to_string()),
                note: Some("Untagged model passed through unchanged.".to_string()),
            });
        };

        if ProviderSelector::from_tag(&tag) != Some(provider) {
            return Err(self.mismatch_message(provider, requested));
        }
        if parsed.model_id.trim().is_empty() {
            return Err(format!(
                "Model name '{}' has a [{tag}] tag but no model id.",
                requested.trim()
            ));
        }
        Ok(ModelSelection {
            model_id: parsed.model_id,
            tag: Some(tag),
            requested: Some(requested.to_string()),
            note: None,
        })
    }

    pub fn mismatch_message(&self, provider: ProviderSelector, requested: &str) -> String {
        format!(
            "❌ Model selection error!\n\nSelected model: '{}'\nAPI provider: '{}'\n\n💡 Suggested models:\n{}\n\nPlease pick a model tagged [{}].",
            requested.trim(),
            provider.display_name(),
            self.catalog.suggestions(provider),
            provider.model_tag()
        )
    }
}
