use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_PRESET_FILE: &str = "presets.json";
pub const DEFAULT_CATEGORY: &str = "gemini";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const NAME_SUFFIX_FORMAT: &str = "_%Y%m%d_%H%M%S";

/// Named, reusable bundle of generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub created_time: i64,
    #[serde(default)]
    pub created_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_date: Option<String>,
}

/// Preset document keyed by category. Every mutation rewrites the whole file.
#[derive(Debug, Clone)]
pub struct PresetLibrary {
    path: PathBuf,
    categories: Map<String, Value>,
}

impl PresetLibrary {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut library = Self {
            path,
            categories: default_document(),
        };
        let raw = match std::fs::read_to_string(&library.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %library.path.display(), "preset file missing; writing defaults");
                if let Err(err) = library.save() {
                    warn!(path = %library.path.display(), "failed to write default presets: {err:#}");
                }
                return library;
            }
            Err(err) => {
                warn!(path = %library.path.display(), "failed to read presets: {err}");
                return library;
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(categories)) => library.categories = categories,
            _ => warn!(path = %library.path.display(), "preset file is not a JSON object; using defaults"),
        }
        library
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(self.categories.clone()))?,
        )?;
        Ok(())
    }

    /// Presets of `category`; entries that fail to parse are skipped.
    pub fn list(&self, category: &str) -> Vec<Preset> {
        self.categories
            .get(category)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<Preset>(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn names(&self, category: &str) -> Vec<String> {
        self.list(category)
            .into_iter()
            .map(|preset| preset.name)
            .collect()
    }

    pub fn get_by_name(&self, category: &str, name: &str) -> Option<Preset> {
        self.list(category)
            .into_iter()
            .find(|preset| preset.name == name)
    }

    pub fn get_by_id(&self, category: &str, id: &str) -> Option<Preset> {
        self.list(category).into_iter().find(|preset| preset.id == id)
    }

    /// Stores a new preset and returns its id.
    pub fn save_preset(
        &mut self,
        category: &str,
        name: &str,
        config: Map<String, Value>,
        description: &str,
    ) -> anyhow::Result<String> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("preset name must not be empty");
        }
        let now = Local::now();
        let name = if self.get_by_name(category, name).is_some() {
            format!("{name}{}", now.format(NAME_SUFFIX_FORMAT))
        } else {
            name.to_string()
        };
        let preset = Preset {
            id: Uuid::new_v4().to_string(),
            name,
            description: description.to_string(),
            config,
            created_time: now.timestamp(),
            created_date: now.format(DATE_FORMAT).to_string(),
            updated_time: None,
            updated_date: None,
        };
        let id = preset.id.clone();
        let mut presets = self.list(category);
        presets.push(preset);
        self.store(category, presets)?;
        info!(category, id = %id, "preset saved");
        Ok(id)
    }

    pub fn delete_preset(&mut self, category: &str, id: &str) -> anyhow::Result<bool> {
        let mut presets = self.list(category);
        let before = presets.len();
        presets.retain(|preset| preset.id != id);
        if presets.len() == before {
            return Ok(false);
        }
        self.store(category, presets)?;
        Ok(true)
    }

    pub fn update_preset(
        &mut self,
        category: &str,
        id: &str,
        config: Option<Map<String, Value>>,
        name: Option<&str>,
        description: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut presets = self.list(category);
        let Some(preset) = presets.iter_mut().find(|preset| preset.id == id) else {
            return Ok(false);
        };
        if let Some(config) = config {
            preset.config = config;
        }
        if let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) {
            preset.name = name.to_string();
        }
        if let Some(description) = description {
            preset.description = description.to_string();
        }
        stamp_update(preset, Local::now());
        self.store(category, presets)?;
        Ok(true)
    }

    fn store(&mut self, category: &str, presets: Vec<Preset>) -> anyhow::Result<()> {
        let items = presets
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()?;
        self.categories
            .insert(category.to_string(), Value::Array(items));
        self.save()
    }
}

fn default_document() -> Map<String, Value> {
    let mut document = Map::new();
    document.insert(DEFAULT_CATEGORY.to_string(), Value::Array(Vec::new()));
    document
}

fn stamp_update(preset: &mut Preset, now: DateTime<Local>) {
    preset.updated_time = Some(now.timestamp());
    preset.updated_date = Some(now.format(DATE_FORMAT).to_string());
}

/// Request fields a preset may set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresetOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub num_images: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub timeout: Option<u64>,
    pub prompt_template: Option<String>,
}

impl PresetOverrides {
    pub fn from_config(config: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            config
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            provider: text("provider"),
            model: text("model"),
            num_images: config
                .get("num_images")
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok()),
            temperature: config.get("temperature").and_then(Value::as_f64),
            top_p: config.get("top_p").and_then(Value::as_f64),
            timeout: config.get("timeout").and_then(Value::as_u64),
            prompt_template: text("prompt_template"),
        }
    }

    /// Expands `{prompt}` in the template, or prepends the template when it
    /// has no placeholder.
    pub fn render_prompt(&self, prompt: &str) -> String {
        let Some(template) = self.prompt_template.as_deref() else {
            return prompt.to_string();
        };
        if template.contains("{prompt}") {
            template.replace("{prompt}", prompt)
        } else if prompt.trim().is_empty() {
            template.to_string()
        } else {
            format!("{template}\n\n{prompt}")
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};
    use serde_json::{json, Map, Value};

    use super::*;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn missing_file_writes_default_category() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("presets.json");
        let library = PresetLibrary::load(&path);
        assert!(library.names(DEFAULT_CATEGORY).is_empty());
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(written, json!({"gemini": []}));
        Ok(())
    }

    #[test]
    fn save_get_update_delete_cycle() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("presets.json");
        let mut library = PresetLibrary::load(&path);

        let id = library.save_preset(
            DEFAULT_CATEGORY,
            "portrait",
            config(json!({"temperature": 0.4})),
            "soft light",
        )?;
        let reloaded = PresetLibrary::load(&path);
        let preset = reloaded
            .get_by_name(DEFAULT_CATEGORY, "portrait")
            .ok_or_else(|| anyhow::anyhow!("preset missing"))?;
        assert_eq!(preset.id, id);
        assert_eq!(preset.description, "soft light");
        assert_eq!(preset.created_date.len(), 19);
        assert_eq!(preset.updated_time, None);

        assert!(library.update_preset(
            DEFAULT_CATEGORY,
            &id,
            Some(config(json!({"temperature": 0.9}))),
            Some("portrait-v2"),
            None,
        )?);
        let updated = library
            .get_by_id(DEFAULT_CATEGORY, &id)
            .ok_or_else(|| anyhow::anyhow!("preset missing"))?;
        assert_eq!(updated.name, "portrait-v2");
        assert_eq!(updated.config["temperature"], json!(0.9));
        assert!(updated.updated_date.is_some());

        assert!(library.delete_preset(DEFAULT_CATEGORY, &id)?);
        assert!(!library.delete_preset(DEFAULT_CATEGORY, &id)?);
        assert!(PresetLibrary::load(&path).names(DEFAULT_CATEGORY).is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_names_get_a_timestamp_suffix() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut library = PresetLibrary::load(temp.path().join("presets.json"));
        library.save_preset(DEFAULT_CATEGORY, "night", Map::new(), "")?;
        library.save_preset(DEFAULT_CATEGORY, "night", Map::new(), "")?;
        let names = library.names(DEFAULT_CATEGORY);
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "night");
        assert!(names[1].starts_with("night_"));
        assert_eq!(names[1].len(), "night_20240101_120000".len());
        Ok(())
    }

    #[test]
    fn blank_names_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut library = PresetLibrary::load(temp.path().join("presets.json"));
        assert!(library
            .save_preset(DEFAULT_CATEGORY, "   ", Map::new(), "")
            .is_err());
        Ok(())
    }

    #[test]
    fn stamp_update_uses_fixed_format() {
        let mut preset = Preset {
            id: "p1".to_string(),
            name: "n".to_string(),
            description: String::new(),
            config: Map::new(),
            created_time: 0,
            created_date: String::new(),
            updated_time: None,
            updated_date: None,
        };
        let Some(now) = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).single() else {
            return;
        };
        stamp_update(&mut preset, now);
        assert_eq!(preset.updated_date.as_deref(), Some("2024-03-05 07:08:09"));
    }

    #[test]
    fn overrides_read_known_keys_and_render_templates() {
        let overrides = PresetOverrides::from_config(&config(json!({
            "provider": "OpenRouter",
            "model": "[OpenRouter] google/gemini-2.5-flash-image-preview",
            "num_images": 3,
            "temperature": 0.7,
            "top_p": 0.5,
            "timeout": 200,
            "prompt_template": "cinematic still, {prompt}, 35mm",
            "unrelated": true,
        })));
        assert_eq!(overrides.provider.as_deref(), Some("OpenRouter"));
        assert_eq!(overrides.num_images, Some(3));
        assert_eq!(overrides.timeout, Some(200));
        assert_eq!(
            overrides.render_prompt("a red fox"),
            "cinematic still, a red fox, 35mm"
        );

        let prefix = PresetOverrides {
            prompt_template: Some("watercolor style".to_string()),
            ..PresetOverrides::default()
        };
        assert_eq!(prefix.render_prompt("a cat"), "watercolor style\n\na cat");
        assert_eq!(PresetOverrides::default().render_prompt("a cat"), "a cat");
    }
}
