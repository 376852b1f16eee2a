use std::io::{self, BufRead};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use tutu_contracts::providers::FieldRules;

use crate::errors::{push_unique_warning, truncate_text, GenerationError};
use crate::extract::{embedded_data_uris, extract_references, ImageReference, RuleSet};

/// Upper bound for a pending partial-JSON buffer.
pub const MAX_PENDING_BYTES: usize = 64 * 1024 * 1024;

/// One physical line of an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// `data:` line; the payload is a JSON fragment.
    DataPayload(String),
    /// `data: [DONE]`
    Terminator,
    /// A line without the event prefix.
    ContinuationFragment(String),
    /// Empty lines, and SSE comments or fields that carry no data.
    Blank,
}

impl StreamEvent {
    pub fn classify(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return StreamEvent::Blank;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let payload = rest.strip_prefix(' ').unwrap_or(rest);
            if payload.trim() == "[DONE]" {
                return StreamEvent::Terminator;
            }
            return StreamEvent::DataPayload(payload.to_string());
        }
        if line.starts_with(':')
            || ["event:", "id:", "retry:"]
                .iter()
                .any(|field| line.starts_with(field))
        {
            return StreamEvent::Blank;
        }
        StreamEvent::ContinuationFragment(line.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub lines_seen: usize,
    pub data_events: usize,
    pub continuation_events: usize,
    pub blank_events: usize,
    pub objects_parsed: usize,
    pub fragments_discarded: usize,
    pub buffer_overflows: usize,
    pub terminated_by_marker: bool,
}

/// Normalized decode result shared by every payload shape.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutcome {
    pub transcript: String,
    pub references: Vec<ImageReference>,
    pub stats: DecodeStats,
    pub warnings: Vec<String>,
    /// `error.message` from an upstream error object, if one was streamed.
    pub upstream_error: Option<String>,
}

/// The stream failed before it was fully read.
#[derive(Debug)]
pub struct StreamInterrupted {
    pub partial: DecodeOutcome,
    pub timed_out: bool,
    pub source: io::Error,
}

enum Drain {
    Complete,
    Pending,
    Invalid,
}

/// Incremental decoder for chat-completion event streams.
///
/// Every `data:` fragment is appended to a pending buffer which is drained of
/// complete JSON values after each line. A value split across several lines
/// is therefore decoded once its last piece arrives, and several values on one
/// line are all decoded.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    rules: FieldRules,
    buffer: String,
    transcript: String,
    references: Vec<ImageReference>,
    stats: DecodeStats,
    warnings: Vec<String>,
    upstream_error: Option<String>,
    done: bool,
}

impl StreamDecoder {
    pub fn new(rules: FieldRules) -> Self {
        Self {
            rules,
            buffer: String::new(),
            transcript: String::new(),
            references: Vec::new(),
            stats: DecodeStats::default(),
            warnings: Vec::new(),
            upstream_error: None,
            done: false,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.trim().is_empty()
    }

    pub fn feed_line(&mut self, line: &str) -> Flow {
        if self.done {
            return Flow::Done;
        }
        self.stats.lines_seen += 1;
        // A physical line break can land right before an inline data URI
        // inside a pending JSON string.
        let event = if self.has_pending() && line.starts_with("data:image/") {
            StreamEvent::ContinuationFragment(line.trim_end_matches(['\n', '\r']).to_string())
        } else {
            StreamEvent::classify(line)
        };
        match event {
            StreamEvent::Blank => {
                self.stats.blank_events += 1;
            }
            StreamEvent::Terminator => {
                if self.has_pending() {
                    debug!(
                        pending = self.buffer.len(),
                        "discarding unfinished fragment at end marker"
                    );
                    self.stats.fragments_discarded += 1;
                    self.buffer.clear();
                }
                self.stats.terminated_by_marker = true;
                self.done = true;
                return Flow::Done;
            }
            StreamEvent::DataPayload(fragment) => {
                self.stats.data_events += 1;
                self.absorb(&fragment);
            }
            StreamEvent::ContinuationFragment(fragment) => {
                self.stats.continuation_events += 1;
                // A stray line only matters when it extends a pending value or
                // opens a bare JSON body.
                if self.has_pending() || fragment.trim_start().starts_with(['{', '[']) {
                    self.absorb(&fragment);
                } else {
                    debug!(
                        line = %truncate_text(&fragment, 120),
                        "ignoring line outside any event"
                    );
                }
            }
        }
        Flow::Continue
    }

    /// Reads lines until the end marker or end of input.
    pub fn decode_reader<R: BufRead>(
        mut self,
        mut reader: R,
    ) -> Result<DecodeOutcome, StreamInterrupted> {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    if self.feed_line(&line) == Flow::Done {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let timed_out = is_timeout(&err);
                    return Err(StreamInterrupted {
                        partial: self.finish(),
                        timed_out,
                        source: err,
                    });
                }
            }
        }
        Ok(self.finish())
    }

    pub fn finish(mut self) -> DecodeOutcome {
        if self.has_pending() {
            debug!(
                pending = self.buffer.len(),
                "discarding unfinished fragment at end of stream"
            );
            self.stats.fragments_discarded += 1;
            self.buffer.clear();
        }
        let mut references = self.references;
        for reference in extract_references(&self.transcript, RuleSet::Transcript) {
            if !references.contains(&reference) {
                references.push(reference);
            }
        }
        debug!(stats = ?self.stats, references = references.len(), "stream decoded");
        DecodeOutcome {
            transcript: self.transcript,
            references,
            stats: self.stats,
            warnings: self.warnings,
            upstream_error: self.upstream_error,
        }
    }

    fn absorb(&mut self, fragment: &str) {
        let stale_len = self.buffer.len();
        self.buffer.push_str(fragment);
        if self.buffer.len() > MAX_PENDING_BYTES {
            warn!(bytes = self.buffer.len(), "pending fragment exceeded limit");
            push_unique_warning(
                &mut self.warnings,
                "Discarded an oversized partial response fragment.".to_string(),
            );
            self.stats.buffer_overflows += 1;
            self.stats.fragments_discarded += 1;
            self.buffer.clear();
            return;
        }
        let (consumed, drain) = self.drain();
        match drain {
            Drain::Complete => self.buffer.clear(),
            Drain::Pending => {
                self.buffer.drain(..consumed);
            }
            Drain::Invalid if stale_len > 0 && consumed < stale_len => {
                // The old pending text never completed; retry with the new
                // fragment on its own.
                self.stats.fragments_discarded += 1;
                self.buffer = fragment.to_string();
                let (consumed, drain) = self.drain();
                match drain {
                    Drain::Complete => self.buffer.clear(),
                    Drain::Pending => {
                        self.buffer.drain(..consumed);
                    }
                    Drain::Invalid => self.discard_invalid(),
                }
            }
            Drain::Invalid => self.discard_invalid(),
        }
    }

    /// Parses every complete value at the front of the buffer. Returns the
    /// byte offset after the last complete value.
    fn drain(&mut self) -> (usize, Drain) {
        let mut values = Vec::new();
        let mut consumed = 0;
        let state = {
            let mut stream = serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        values.push(value);
                        consumed = stream.byte_offset();
                    }
                    Some(Err(err)) if err.is_eof() => break Drain::Pending,
                    Some(Err(_)) => break Drain::Invalid,
                    None => break Drain::Complete,
                }
            }
        };
        for value in values {
            self.process_value(value);
        }
        (consumed, state)
    }

    fn discard_invalid(&mut self) {
        debug!(
            fragment = %truncate_text(&self.buffer, 120),
            "discarding fragment that is not JSON"
        );
        self.stats.fragments_discarded += 1;
        self.buffer.clear();
    }

    fn process_value(&mut self, value: Value) {
        self.stats.objects_parsed += 1;
        let Value::Object(object) = value else {
            return;
        };

        if let Some(choices) = object.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(choice) = choice.as_object() {
                    self.process_choice(choice);
                }
            }
        }

        if let Some(error) = object.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .unwrap_or("unknown error")
                .to_string();
            warn!(message = %truncate_text(&message, 300), "upstream error in stream");
            self.upstream_error.get_or_insert(message);
        }

        for (key, nested) in &object {
            if key == "error" || self.rules.ignored_top_level_keys.contains(&key.as_str()) {
                continue;
            }
            self.scan_markers(nested);
        }
    }

    fn process_choice(&mut self, choice: &Map<String, Value>) {
        for (key, nested) in choice {
            if self.rules.ignored_choice_keys.contains(&key.as_str()) {
                continue;
            }
            match (key.as_str(), nested) {
                ("delta" | "message", Value::Object(container)) => {
                    for (field, value) in container {
                        if field == "content" {
                            self.take_content(value);
                        } else {
                            self.scan_markers(value);
                        }
                    }
                }
                _ => self.scan_markers(nested),
            }
        }
    }

    /// Text content goes to the transcript; it is searched for images only
    /// once complete.
    fn take_content(&mut self, content: &Value) {
        match content {
            Value::String(text) => self.transcript.push_str(text),
            Value::Array(parts) => {
                for part in parts {
                    let is_text = part.get("type").and_then(Value::as_str) == Some("text");
                    match part.get("text").and_then(Value::as_str) {
                        Some(text) if is_text || part.get("type").is_none() => {
                            self.transcript.push_str(text);
                        }
                        _ => self.scan_markers(part),
                    }
                }
            }
            other => self.scan_markers(other),
        }
    }

    fn scan_markers(&mut self, value: &Value) {
        match value {
            Value::String(raw) => {
                let trimmed = raw.trim();
                if trimmed.starts_with("data:image/")
                    || trimmed.starts_with("http://")
                    || trimmed.starts_with("https://")
                {
                    if let Some(reference) = ImageReference::parse(trimmed) {
                        self.record(reference);
                        return;
                    }
                }
                if trimmed.contains("data:image/") {
                    for reference in embedded_data_uris(trimmed) {
                        self.record(reference);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.scan_markers(item);
                }
            }
            Value::Object(object) => {
                for nested in object.values() {
                    self.scan_markers(nested);
                }
            }
            _ => {}
        }
    }

    fn record(&mut self, reference: ImageReference) {
        if !self.references.contains(&reference) {
            debug!(reference = %reference.describe(), "image reference found in stream");
            self.references.push(reference);
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .map(reqwest::Error::is_timeout)
        .unwrap_or(false)
}

/// Decodes a synchronous JSON body. Every candidate path contributes, in path
/// order and without duplicates; when none matches, the serialized body is
/// swept with the document extractors.
pub fn decode_document(body: &str, rules: &FieldRules) -> Result<DecodeOutcome, GenerationError> {
    let value: Value =
        serde_json::from_str(body.trim()).map_err(|err| GenerationError::ResponseFormat {
            detail: format!("{err}; body: {}", truncate_text(body.trim(), 300)),
        })?;
    let mut stats = DecodeStats {
        objects_parsed: 1,
        ..DecodeStats::default()
    };
    stats.lines_seen = body.lines().count();

    let upstream_error = value.get("error").map(|error| {
        error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("unknown error")
            .to_string()
    });

    let mut references: Vec<ImageReference> = Vec::new();
    for path in rules.candidate_paths {
        let found = references_at_path(&value, path);
        if found.is_empty() {
            continue;
        }
        debug!(path, count = found.len(), "candidate path matched");
        for reference in found {
            if !references.contains(&reference) {
                references.push(reference);
            }
        }
    }
    if references.is_empty() {
        let serialized = serde_json::to_string(&value).unwrap_or_else(|_| body.to_string());
        references = extract_references(&serialized, RuleSet::Document);
    }

    let transcript = if references.is_empty() {
        body.to_string()
    } else {
        references
            .iter()
            .map(ImageReference::render)
            .collect::<Vec<String>>()
            .join(" ")
    };
    Ok(DecodeOutcome {
        transcript,
        references,
        stats,
        warnings: Vec::new(),
        upstream_error,
    })
}

/// Resolves an `a[].b` style path. `[]` iterates an array; a segment without
/// it descends into an object.
fn references_at_path(value: &Value, path: &str) -> Vec<ImageReference> {
    let mut current = vec![value];
    let mut leaf_key = "";
    for segment in path.split('.') {
        let (key, iterate) = match segment.strip_suffix("[]") {
            Some(key) => (key, true),
            None => (segment, false),
        };
        leaf_key = key;
        let mut next = Vec::new();
        for node in current {
            let Some(child) = node.get(key) else {
                continue;
            };
            if iterate {
                if let Value::Array(items) = child {
                    next.extend(items.iter());
                }
            } else {
                next.push(child);
            }
        }
        current = next;
    }

    let mut out: Vec<ImageReference> = Vec::new();
    for leaf in current {
        let Value::String(raw) = leaf else {
            continue;
        };
        let found = if leaf_key == "b64_json" {
            ImageReference::from_base64(raw, "image/png")
                .into_iter()
                .collect()
        } else if let Some(reference) = ImageReference::parse(raw) {
            vec![reference]
        } else {
            extract_references(raw, RuleSet::Transcript)
        };
        for reference in found {
            if !out.contains(&reference) {
                out.push(reference);
            }
        }
    }
    out
}
