use indexmap::IndexMap;

use crate::providers::ProviderSelector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Tagged display name, e.g. `[Comfly] gemini-2.5-flash-image-preview`.
    pub name: String,
    pub provider: ProviderSelector,
    pub model_id: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_provider(&self, provider: ProviderSelector) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider)
            .cloned()
            .collect()
    }

    /// Bullet list of recommended models, used in mismatch diagnostics.
    pub fn suggestions(&self, provider: ProviderSelector) -> String {
        self.by_provider(provider)
            .iter()
            .map(|model| match model.note.as_deref() {
                Some(note) => format!("• {} ({note})", model.name),
                None => format!("• {}", model.name),
            })
            .collect::<Vec<String>>()
            .join("\n")
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |provider: ProviderSelector, model_id: &str, note: Option<&str>| {
        let name = format!("[{}] {model_id}", provider.model_tag());
        map.insert(
            name.clone(),
            ModelSpec {
                name,
                provider,
                model_id: model_id.to_string(),
                note: note.map(str::to_string),
            },
        );
    };

    insert(
        ProviderSelector::Comfly,
        "gemini-2.5-flash-image-preview",
        Some("recommended"),
    );
    insert(
        ProviderSelector::Comfly,
        "gemini-2.0-flash-preview-image-generation",
        None,
    );
    insert(
        ProviderSelector::OpenRouter,
        "google/gemini-2.5-flash-image-preview",
        Some("recommended, supports image output"),
    );
    insert(
        ProviderSelector::ApiCore,
        "gemini-2.5-flash-image",
        Some("standard"),
    );
    insert(
        ProviderSelector::ApiCore,
        "gemini-2.5-flash-image-hd",
        Some("high definition, recommended"),
    );

    map
}
