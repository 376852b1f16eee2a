use std::sync::OnceLock;

use regex::{Captures, Regex};

/// An image found in a response, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    InlineData { mime_type: String, payload: String },
    RemoteUrl(String),
}

impl ImageReference {
    /// Accepts `data:image/<type>;base64,<payload>` and `http(s)://` strings.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix("data:") {
            let (meta, payload) = rest.split_once(',')?;
            let mut params = meta.split(';');
            let mime_type = params.next().map(str::trim).unwrap_or_default();
            if !mime_type.starts_with("image/") {
                return None;
            }
            if !params.any(|param| param.trim().eq_ignore_ascii_case("base64")) {
                return None;
            }
            let payload = payload.trim();
            if payload.is_empty() {
                return None;
            }
            return Some(ImageReference::InlineData {
                mime_type: mime_type.to_string(),
                payload: payload.to_string(),
            });
        }
        if (trimmed.starts_with("http://") || trimmed.starts_with("https://"))
            && !trimmed.chars().any(char::is_whitespace)
            && trimmed.len() > "https://".len()
        {
            return Some(ImageReference::RemoteUrl(trimmed.to_string()));
        }
        None
    }

    /// Bare base64 such as a `b64_json` field.
    pub fn from_base64(payload: &str, mime_type: &str) -> Option<Self> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("data:") {
            return Self::parse(trimmed);
        }
        Some(ImageReference::InlineData {
            mime_type: mime_type.to_string(),
            payload: trimmed.to_string(),
        })
    }

    pub fn render(&self) -> String {
        match self {
            ImageReference::InlineData { mime_type, payload } => {
                format!("data:{mime_type};base64,{payload}")
            }
            ImageReference::RemoteUrl(url) => url.clone(),
        }
    }

    /// Short form for logs.
    pub fn describe(&self) -> String {
        match self {
            ImageReference::InlineData { mime_type, payload } => {
                format!("inline {mime_type} ({} base64 chars)", payload.len())
            }
            ImageReference::RemoteUrl(url) => url.clone(),
        }
    }
}

/// One independent extraction pattern. `capture` selects the group holding
/// the reference.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorRule {
    pub name: &'static str,
    pattern: &'static str,
    capture: usize,
}

const DATA_URI_PATTERN: &str = r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=]+";

/// Rules for free text such as an assembled transcript, highest priority first.
const TRANSCRIPT_RULES: [ExtractorRule; 4] = [
    ExtractorRule {
        name: "markdown_image",
        pattern: r"!\[[^\]]*\]\(\s*([^)\s]+)[^)]*\)",
        capture: 1,
    },
    ExtractorRule {
        name: "image_extension_url",
        pattern: r#"(?i)https?://[^\s)"'<>\]]+\.(?:jpe?g|png|gif|webp)\b"#,
        capture: 0,
    },
    ExtractorRule {
        name: "any_url",
        pattern: r#"https?://[^\s)"'<>\]]+"#,
        capture: 0,
    },
    ExtractorRule {
        name: "data_uri",
        pattern: DATA_URI_PATTERN,
        capture: 0,
    },
];

/// Same priorities for a serialized JSON document, where quotes and escape
/// backslashes delimit values.
const DOCUMENT_RULES: [ExtractorRule; 4] = [
    ExtractorRule {
        name: "markdown_image",
        pattern: r#"!\[[^\]"]*\]\(\s*([^)\s"\\]+)[^)"]*\)"#,
        capture: 1,
    },
    ExtractorRule {
        name: "image_extension_url",
        pattern: r#"(?i)https?://[^\s"\\<>]+\.(?:jpe?g|png|gif|webp)\b"#,
        capture: 0,
    },
    ExtractorRule {
        name: "any_url",
        pattern: r#"https?://[^\s"\\<>]+"#,
        capture: 0,
    },
    ExtractorRule {
        name: "data_uri",
        pattern: DATA_URI_PATTERN,
        capture: 0,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSet {
    Transcript,
    Document,
}

impl RuleSet {
    fn compiled(self) -> &'static [(ExtractorRule, Regex)] {
        static TRANSCRIPT: OnceLock<Vec<(ExtractorRule, Regex)>> = OnceLock::new();
        static DOCUMENT: OnceLock<Vec<(ExtractorRule, Regex)>> = OnceLock::new();
        match self {
            RuleSet::Transcript => TRANSCRIPT.get_or_init(|| compile(&TRANSCRIPT_RULES)),
            RuleSet::Document => DOCUMENT.get_or_init(|| compile(&DOCUMENT_RULES)),
        }
    }
}

fn compile(rules: &[ExtractorRule]) -> Vec<(ExtractorRule, Regex)> {
    rules
        .iter()
        .filter_map(|rule| match Regex::new(rule.pattern) {
            Ok(regex) => Some((*rule, regex)),
            Err(err) => {
                tracing::error!(rule = rule.name, "extractor pattern failed to compile: {err}");
                None
            }
        })
        .collect()
}

/// Runs the rules in priority order and returns the matches of the first rule
/// that finds anything.
pub fn extract_references(text: &str, rules: RuleSet) -> Vec<ImageReference> {
    for (rule, regex) in rules.compiled() {
        let found = apply_rule(text, rule, regex);
        if !found.is_empty() {
            tracing::debug!(rule = rule.name, count = found.len(), "extractor matched");
            return found;
        }
    }
    Vec::new()
}

fn apply_rule(text: &str, rule: &ExtractorRule, regex: &Regex) -> Vec<ImageReference> {
    let mut out: Vec<ImageReference> = Vec::new();
    for captures in regex.captures_iter(text) {
        let Some(matched) = captures.get(rule.capture) else {
            continue;
        };
        let candidate = matched
            .as_str()
            .trim()
            .trim_end_matches(['.', ',', ';', ':', '!', '?']);
        let Some(reference) = ImageReference::parse(candidate) else {
            continue;
        };
        if !out.contains(&reference) {
            out.push(reference);
        }
    }
    out
}

/// Every embedded data URI, in order.
pub fn embedded_data_uris(text: &str) -> Vec<ImageReference> {
    let mut out: Vec<ImageReference> = Vec::new();
    let Some(regex) = data_uri_regex() else {
        return out;
    };
    for matched in regex.find_iter(text) {
        if let Some(reference) = ImageReference::parse(matched.as_str()) {
            if !out.contains(&reference) {
                out.push(reference);
            }
        }
    }
    out
}

/// Shortens every base64 payload beyond `max_chars`, keeping the
/// `data:image/...;base64,` prefix.
pub fn truncate_base64(text: &str, max_chars: usize) -> String {
    let Some(regex) = data_uri_regex() else {
        return text.to_string();
    };
    regex
        .replace_all(text, |captures: &Captures<'_>| {
            let full = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
            let Some((prefix, payload)) = full.split_once(',') else {
                return full.to_string();
            };
            if payload.len() <= max_chars {
                return full.to_string();
            }
            format!(
                "{prefix},{}... [truncated {} chars]",
                &payload[..max_chars],
                payload.len() - max_chars
            )
        })
        .into_owned()
}

fn data_uri_regex() -> Option<&'static Regex> {
    static DATA_URI: OnceLock<Option<Regex>> = OnceLock::new();
    DATA_URI
        .get_or_init(|| Regex::new(DATA_URI_PATTERN).ok())
        .as_ref()
}
