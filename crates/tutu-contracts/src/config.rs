use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::providers::ProviderSelector;

pub const CONFIG_VERSION: &str = "2.0";
pub const DEFAULT_CONFIG_FILE: &str = "Tutuapi.json";

/// On-disk configuration: one API key per provider plus schema metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default = "placeholder_comfly")]
    pub comfly_api_key: String,
    #[serde(default = "placeholder_openrouter")]
    pub openrouter_api_key: String,
    #[serde(default = "placeholder_apicore")]
    pub apicore_api_key: String,
    #[serde(default = "current_version")]
    pub config_version: String,
    #[serde(default = "default_provider_name")]
    pub default_provider: String,
    /// Unknown keys survive a load/save cycle.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            comfly_api_key: placeholder_comfly(),
            openrouter_api_key: placeholder_openrouter(),
            apicore_api_key: placeholder_apicore(),
            config_version: current_version(),
            default_provider: default_provider_name(),
            extra: Map::new(),
        }
    }
}

impl ConfigDocument {
    /// Stored key for `provider`, empty when unset or still a placeholder.
    pub fn raw_credential(&self, provider: ProviderSelector) -> &str {
        let value = match provider {
            ProviderSelector::Comfly => {
                if is_unset(&self.comfly_api_key) {
                    self.extra
                        .get("api_key")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                } else {
                    self.comfly_api_key.as_str()
                }
            }
            ProviderSelector::OpenRouter => self.openrouter_api_key.as_str(),
            ProviderSelector::ApiCore => self.apicore_api_key.as_str(),
        };
        if is_unset(value) {
            ""
        } else {
            value.trim()
        }
    }

    pub fn set_credential(&mut self, provider: ProviderSelector, key: &str) {
        let key = key.trim().to_string();
        match provider {
            ProviderSelector::Comfly => self.comfly_api_key = key,
            ProviderSelector::OpenRouter => self.openrouter_api_key = key,
            ProviderSelector::ApiCore => self.apicore_api_key = key,
        }
    }

    pub fn default_provider(&self) -> Option<ProviderSelector> {
        self.default_provider.parse().ok()
    }

    /// Copy safe to log: every `*key*` field is masked.
    pub fn redacted(&self) -> Map<String, Value> {
        let mut out = Map::new();
        let full = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();
        for (key, value) in full {
            let masked = match value.as_str() {
                Some(text) if key.to_ascii_lowercase().contains("key") => {
                    Value::String(mask_secret(text))
                }
                _ => value,
            };
            out.insert(key, masked);
        }
        out
    }
}

fn placeholder_comfly() -> String {
    "your_comfly_api_key_here".to_string()
}

fn placeholder_openrouter() -> String {
    "your_openrouter_api_key_here".to_string()
}

fn placeholder_apicore() -> String {
    "your_apicore_api_key_here".to_string()
}

fn current_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_provider_name() -> String {
    ProviderSelector::Comfly.display_name().to_string()
}

fn is_unset(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.ends_with("_here")
}

/// Shows the first and last four characters of long secrets.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialIssue {
    Missing,
    TooShort { length: usize },
    Malformed { reason: String },
}

impl fmt::Display for CredentialIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialIssue::Missing => f.write_str("API key is empty"),
            CredentialIssue::TooShort { length } => {
                write!(f, "API key is too short ({length} characters)")
            }
            CredentialIssue::Malformed { reason } => write!(f, "API key is malformed: {reason}"),
        }
    }
}

/// Checks the key shape each provider is known to issue.
pub fn validate_credential(provider: ProviderSelector, key: &str) -> Result<(), CredentialIssue> {
    let key = key.trim();
    if is_unset(key) {
        return Err(CredentialIssue::Missing);
    }
    let length = key.chars().count();
    match provider {
        ProviderSelector::Comfly => {
            if length <= 10 {
                return Err(CredentialIssue::TooShort { length });
            }
        }
        ProviderSelector::OpenRouter | ProviderSelector::ApiCore => {
            if length <= 20 {
                return Err(CredentialIssue::TooShort { length });
            }
            if !key.starts_with("sk-") {
                return Err(CredentialIssue::Malformed {
                    reason: "expected an 'sk-' prefix".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Source of per-provider API keys.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, provider: ProviderSelector) -> Result<String, CredentialIssue>;
}

/// File location of the configuration document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing file is created with defaults, a broken one
    /// is replaced in memory only.
    pub fn load(&self) -> ConfigDocument {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "config file missing; writing defaults");
                let document = ConfigDocument::default();
                if let Err(err) = self.save(&document) {
                    warn!(path = %self.path.display(), "failed to write default config: {err:#}");
                }
                return document;
            }
            Err(err) => {
                warn!(path = %self.path.display(), "failed to read config: {err}");
                return ConfigDocument::default();
            }
        };

        let Ok(Value::Object(mut payload)) = serde_json::from_str::<Value>(&raw) else {
            warn!(path = %self.path.display(), "config is not a JSON object; using defaults");
            return ConfigDocument::default();
        };

        let version = payload
            .get("config_version")
            .and_then(Value::as_str)
            .unwrap_or("1.0")
            .to_string();
        let migrated = version_is_older(&version, CONFIG_VERSION);
        if migrated {
            migrate_to_v2(&mut payload);
        }

        let document = match serde_json::from_value::<ConfigDocument>(Value::Object(payload)) {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %self.path.display(), "config fields have unexpected types: {err}");
                return ConfigDocument::default();
            }
        };
        if migrated {
            info!(from = %version, to = CONFIG_VERSION, "migrated config document");
            if let Err(err) = self.save(&document) {
                warn!(path = %self.path.display(), "failed to persist migrated config: {err:#}");
            }
        }
        info!(config = ?document.redacted(), "config loaded");
        document
    }

    pub fn save(&self, document: &ConfigDocument) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(document)?)?;
        Ok(())
    }
}

fn migrate_to_v2(payload: &mut Map<String, Value>) {
    payload.insert(
        "config_version".to_string(),
        Value::String(CONFIG_VERSION.to_string()),
    );
    if !payload.contains_key("default_provider") {
        payload.insert(
            "default_provider".to_string(),
            Value::String(default_provider_name()),
        );
    }
    if !payload.contains_key("comfly_api_key") {
        if let Some(legacy) = payload.get("api_key").cloned() {
            payload.insert("comfly_api_key".to_string(), legacy);
        }
    }
    for (field, placeholder) in [
        ("comfly_api_key", placeholder_comfly()),
        ("openrouter_api_key", placeholder_openrouter()),
        ("apicore_api_key", placeholder_apicore()),
    ] {
        if !payload.contains_key(field) {
            payload.insert(field.to_string(), Value::String(placeholder));
        }
    }
}

fn version_is_older(version: &str, target: &str) -> bool {
    fn parts(raw: &str) -> Option<(u64, u64)> {
        let (major, minor) = raw.trim().split_once('.').unwrap_or((raw.trim(), "0"));
        Some((major.parse().ok()?, minor.parse().ok()?))
    }
    match (parts(version), parts(target)) {
        (Some(current), Some(wanted)) => current < wanted,
        _ => true,
    }
}

/// Configuration captured at one point in time. Reloads only on `refresh`.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    store: ConfigStore,
    document: ConfigDocument,
    loaded_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn load(store: ConfigStore) -> Self {
        let document = store.load();
        Self {
            store,
            document,
            loaded_at: Utc::now(),
        }
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn refresh(&mut self) {
        self.document = self.store.load();
        self.loaded_at = Utc::now();
    }
}

impl CredentialProvider for ConfigSnapshot {
    fn credential(&self, provider: ProviderSelector) -> Result<String, CredentialIssue> {
        let key = self.document.raw_credential(provider);
        validate_credential(provider, key)?;
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn missing_file_writes_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("Tutuapi.json");
        let document = ConfigStore::new(&path).load();
        assert_eq!(document, ConfigDocument::default());

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(written["config_version"], json!("2.0"));
        assert_eq!(written["comfly_api_key"], json!("your_comfly_api_key_here"));
        Ok(())
    }

    #[test]
    fn malformed_file_falls_back_without_overwriting() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("Tutuapi.json");
        std::fs::write(&path, "{not json")?;
        let document = ConfigStore::new(&path).load();
        assert_eq!(document, ConfigDocument::default());
        assert_eq!(std::fs::read_to_string(&path)?, "{not json");
        Ok(())
    }

    #[test]
    fn v1_document_migrates_legacy_key_and_persists() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("Tutuapi.json");
        std::fs::write(&path, r#"{"api_key": "legacy-comfly-key-123"}"#)?;

        let document = ConfigStore::new(&path).load();
        assert_eq!(document.comfly_api_key, "legacy-comfly-key-123");
        assert_eq!(document.openrouter_api_key, "your_openrouter_api_key_here");
        assert_eq!(document.config_version, "2.0");
        assert_eq!(document.default_provider, "ai.comfly.chat");

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(written["config_version"], json!("2.0"));
        assert_eq!(written["api_key"], json!("legacy-comfly-key-123"));
        Ok(())
    }

    #[test]
    fn placeholders_count_as_missing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let snapshot = ConfigSnapshot::load(ConfigStore::new(temp.path().join("Tutuapi.json")));
        for provider in ProviderSelector::ALL {
            assert_eq!(
                snapshot.credential(provider),
                Err(CredentialIssue::Missing)
            );
        }
        assert_eq!(snapshot.store().path(), temp.path().join("Tutuapi.json"));
        Ok(())
    }

    #[test]
    fn credential_shape_rules_per_provider() {
        assert_eq!(
            validate_credential(ProviderSelector::Comfly, "short"),
            Err(CredentialIssue::TooShort { length: 5 })
        );
        assert_eq!(
            validate_credential(ProviderSelector::Comfly, "comfly-key-12345"),
            Ok(())
        );
        assert_eq!(
            validate_credential(ProviderSelector::OpenRouter, "sk-or-v1-short"),
            Err(CredentialIssue::TooShort { length: 14 })
        );
        assert!(matches!(
            validate_credential(ProviderSelector::ApiCore, "abcdefghijklmnopqrstuvwxyz"),
            Err(CredentialIssue::Malformed { .. })
        ));
        assert_eq!(
            validate_credential(ProviderSelector::ApiCore, "sk-abcdefghijklmnopqrstuvwxyz"),
            Ok(())
        );
    }

    #[test]
    fn snapshot_only_sees_changes_after_refresh() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ConfigStore::new(temp.path().join("Tutuapi.json"));
        let mut snapshot = ConfigSnapshot::load(store.clone());
        assert!(snapshot.credential(ProviderSelector::Comfly).is_err());

        let mut document = store.load();
        document.set_credential(ProviderSelector::Comfly, "comfly-key-12345");
        store.save(&document)?;
        assert!(snapshot.credential(ProviderSelector::Comfly).is_err());

        snapshot.refresh();
        assert_eq!(
            snapshot.credential(ProviderSelector::Comfly),
            Ok("comfly-key-12345".to_string())
        );
        Ok(())
    }

    #[test]
    fn redacted_masks_key_fields_only() {
        let mut document = ConfigDocument::default();
        document.set_credential(ProviderSelector::OpenRouter, "sk-or-v1-0123456789abcdef");
        document.set_credential(ProviderSelector::ApiCore, "short");
        let redacted = document.redacted();
        assert_eq!(redacted["openrouter_api_key"], json!("sk-o...cdef"));
        assert_eq!(redacted["apicore_api_key"], json!("***"));
        assert_eq!(redacted["default_provider"], json!("ai.comfly.chat"));
    }

    #[test]
    fn version_comparison_handles_minor_versions() {
        assert!(version_is_older("1.0", "2.0"));
        assert!(version_is_older("1.9", "2.0"));
        assert!(!version_is_older("2.0", "2.0"));
        assert!(!version_is_older("2.1", "2.0"));
        assert!(version_is_older("garbage", "2.0"));
    }
}
