//! Schema-driven repair of malformed agent output.
//!
//! Agents are asked for JSON but models wrap it in fences, add prose, emit
//! trailing commas, or return the wrong shapes. The normaliser applies a
//! fixed ladder of repairs — each tried at most once, each logged — and
//! either returns a value matching the target schema or raises
//! [`NormaliserError`] for the caller to convert into a node-specific
//! failure.
//!
//! Repair ladder:
//!
//! 1. JSON extraction — strip code fences, locate the outermost object
//! 2. Lenient parse — trailing commas, `//` and `/* */` comments
//! 3. Type coercion — string↔list, numeric strings, value→singleton list
//! 4. Default insertion for missing optional fields
//! 5. Length truncation — summariser role when >2× over the limit, else a
//!    sentence-boundary hard truncate
//! 6. List deduplication

use miette::Diagnostic;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::chat::{ChatMessage, ChatModel, ChatRequest};
use crate::state::clamp_chars;

/// Field kinds the normaliser understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Bool,
    Float,
    /// A list of strings.
    StrList,
    /// A list of arbitrary JSON values (parsed further by the caller).
    List,
}

/// Declared expectation for one output field.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Character limit for strings (and for each string-list item).
    pub max_len: Option<usize>,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required_str(name: &'static str, max_len: usize) -> Self {
        Self {
            name,
            kind: FieldKind::Str,
            required: true,
            max_len: Some(max_len),
            default: None,
        }
    }

    pub fn optional_str(name: &'static str, max_len: usize) -> Self {
        Self {
            name,
            kind: FieldKind::Str,
            required: false,
            max_len: Some(max_len),
            default: Some(Value::String(String::new())),
        }
    }

    pub fn required_bool(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Bool,
            required: true,
            max_len: None,
            default: None,
        }
    }

    pub fn str_list(name: &'static str, item_max: usize) -> Self {
        Self {
            name,
            kind: FieldKind::StrList,
            required: false,
            max_len: Some(item_max),
            default: Some(Value::Array(Vec::new())),
        }
    }

    pub fn list(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::List,
            required: false,
            max_len: None,
            default: Some(Value::Array(Vec::new())),
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self.default = None;
        self
    }
}

/// The target shape for one agent's structured output.
#[derive(Clone, Debug)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

/// A normalised value together with the repair log.
#[derive(Clone, Debug)]
pub struct Normalised {
    pub fields: Map<String, Value>,
    pub repairs: Vec<String>,
}

impl Normalised {
    #[must_use]
    pub fn str_field(&self, name: &str) -> &str {
        self.fields.get(name).and_then(Value::as_str).unwrap_or("")
    }

    #[must_use]
    pub fn bool_field(&self, name: &str) -> bool {
        self.fields
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn str_list_field(&self, name: &str) -> Vec<String> {
        self.fields
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Raised when all repairs fail.
#[derive(Debug, Error, Diagnostic)]
pub enum NormaliserError {
    #[error("{schema}: could not locate JSON in agent output")]
    #[diagnostic(
        code(gaffer::normaliser::no_json),
        help("The model returned prose without a JSON object; tighten the output instructions.")
    )]
    NoJson { schema: &'static str },

    #[error("{schema}: JSON unparseable even after lenient repairs")]
    #[diagnostic(code(gaffer::normaliser::unparseable))]
    Unparseable { schema: &'static str },

    #[error("{schema}: missing required field `{field}`")]
    #[diagnostic(code(gaffer::normaliser::missing_field))]
    MissingField {
        schema: &'static str,
        field: &'static str,
    },
}

/// Extract the JSON object embedded in raw agent output.
fn extract_json(raw: &str, repairs: &mut Vec<String>) -> Option<String> {
    // Fenced ```json block first.
    if let Some(start) = raw.find("```json") {
        let rest = &raw[start + 7..];
        if let Some(end) = rest.find("```") {
            repairs.push("extracted from ```json fence".into());
            return Some(rest[..end].trim().to_string());
        }
    }
    // Any fenced block containing an object.
    if let Some(start) = raw.find("```") {
        let rest = &raw[start + 3..];
        if let Some(end) = rest.find("```") {
            let block = rest[..end].trim();
            if block.contains('{') {
                repairs.push("extracted from ``` fence".into());
                return Some(block.to_string());
            }
        }
    }
    // Outermost balanced object, ignoring braces inside string literals.
    let first = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[first..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if first > 0 || first + offset + 1 < raw.len() {
                        repairs.push("extracted object from surrounding text".into());
                    }
                    return Some(raw[first..first + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse with lenient recovery for trailing commas and comments.
fn parse_lenient(json: &str, repairs: &mut Vec<String>) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(json) {
        return Some(value);
    }
    let mut fixed = String::with_capacity(json.len());
    // Strip // and /* */ comments outside strings.
    let mut chars = json.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(ch) = chars.next() {
        if in_string {
            fixed.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                fixed.push(ch);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        fixed.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut last = ' ';
                for next in chars.by_ref() {
                    if last == '*' && next == '/' {
                        break;
                    }
                    last = next;
                }
            }
            _ => fixed.push(ch),
        }
    }
    // Remove trailing commas before } or ].
    let mut cleaned = String::with_capacity(fixed.len());
    let bytes: Vec<char> = fixed.chars().collect();
    for (i, ch) in bytes.iter().enumerate() {
        if *ch == ',' {
            let next_meaningful = bytes[i + 1..].iter().find(|c| !c.is_whitespace()).copied();
            if matches!(next_meaningful, Some('}') | Some(']')) {
                continue;
            }
        }
        cleaned.push(*ch);
    }
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => {
            repairs.push("lenient parse: stripped comments/trailing commas".into());
            Some(value)
        }
        Err(_) => None,
    }
}

/// Coerce a value to the declared field kind. Returns `None` when coercion
/// is impossible; the repair log records what happened.
fn coerce(value: Value, kind: FieldKind, name: &str, repairs: &mut Vec<String>) -> Option<Value> {
    match (kind, value) {
        (FieldKind::Str, Value::String(s)) => Some(Value::String(s)),
        (FieldKind::Str, Value::Array(items)) => {
            let joined = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            repairs.push(format!("joined list `{name}` into string"));
            Some(Value::String(joined))
        }
        (FieldKind::Str, other) => {
            repairs.push(format!("stringified `{name}`"));
            Some(Value::String(other.to_string()))
        }
        (FieldKind::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
        (FieldKind::Bool, Value::String(s)) => {
            let parsed = matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1");
            repairs.push(format!("parsed `{name}` string into bool"));
            Some(Value::Bool(parsed))
        }
        (FieldKind::Float, Value::Number(n)) => Some(Value::Number(n)),
        (FieldKind::Float, Value::String(s)) => {
            let parsed: f64 = s.trim().parse().ok()?;
            repairs.push(format!("parsed numeric string `{name}`"));
            serde_json::Number::from_f64(parsed).map(Value::Number)
        }
        (FieldKind::StrList, Value::Array(items)) => {
            let strings: Vec<Value> = items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Value::String(s),
                    other => Value::String(other.to_string()),
                })
                .collect();
            Some(Value::Array(strings))
        }
        (FieldKind::StrList, Value::String(s)) => {
            // A JSON-encoded array, or a delimited enumeration.
            if s.trim_start().starts_with('[') {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&s) {
                    repairs.push(format!("parsed `{name}` JSON string into list"));
                    return coerce(Value::Array(items), FieldKind::StrList, name, repairs);
                }
            }
            let items: Vec<Value> = s
                .split([',', ';', '\n'])
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect();
            repairs.push(format!("split `{name}` string into list"));
            Some(Value::Array(items))
        }
        (FieldKind::StrList, other) => {
            repairs.push(format!("wrapped `{name}` in singleton list"));
            Some(Value::Array(vec![Value::String(other.to_string())]))
        }
        (FieldKind::List, Value::Array(items)) => Some(Value::Array(items)),
        (FieldKind::List, other) => {
            repairs.push(format!("wrapped `{name}` in singleton list"));
            Some(Value::Array(vec![other]))
        }
        (FieldKind::Bool, _) | (FieldKind::Float, _) => None,
    }
}

/// Normaliser with an optional summariser for over-length fields.
pub struct Normaliser {
    summarizer: Option<Arc<dyn ChatModel>>,
}

impl Normaliser {
    #[must_use]
    pub fn new(summarizer: Option<Arc<dyn ChatModel>>) -> Self {
        Self { summarizer }
    }

    /// Compress text to a character budget with the summariser role,
    /// falling back to hard truncation when the model fails or overruns.
    pub async fn compress(&self, text: &str, max_chars: usize, context: &str) -> (String, bool) {
        let Some(summarizer) = &self.summarizer else {
            return (clamp_chars(text, max_chars), false);
        };
        let prompt = format!(
            "Compress this {context} to under {max_chars} characters, preserving concrete \
             details (paths, names, outcomes). Reply with the compressed text only.\n\n{text}"
        );
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)]);
        match summarizer.complete(request).await {
            Ok(response) if !response.content.trim().is_empty() => {
                let compressed = response.content.trim().to_string();
                if compressed.chars().count() > max_chars {
                    (clamp_chars(&compressed, max_chars), true)
                } else {
                    (compressed, true)
                }
            }
            _ => (clamp_chars(text, max_chars), false),
        }
    }

    /// Normalise raw agent output against a schema.
    pub async fn normalise(
        &self,
        raw: &str,
        schema: &Schema,
    ) -> Result<Normalised, NormaliserError> {
        let mut repairs = Vec::new();

        let json = extract_json(raw, &mut repairs)
            .ok_or(NormaliserError::NoJson { schema: schema.name })?;
        let parsed = parse_lenient(&json, &mut repairs)
            .ok_or(NormaliserError::Unparseable { schema: schema.name })?;
        let object = match parsed {
            Value::Object(map) => map,
            other => {
                repairs.push("wrapped non-object output".into());
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };

        let mut fields = Map::new();
        for spec in &schema.fields {
            let value = match object.get(spec.name) {
                Some(value) if !value.is_null() => {
                    coerce(value.clone(), spec.kind, spec.name, &mut repairs)
                }
                _ => None,
            };
            let mut value = match (value, &spec.default, spec.required) {
                (Some(value), _, _) => value,
                (None, Some(default), _) => {
                    repairs.push(format!("inserted default for `{}`", spec.name));
                    default.clone()
                }
                (None, None, true) => {
                    return Err(NormaliserError::MissingField {
                        schema: schema.name,
                        field: spec.name,
                    });
                }
                (None, None, false) => continue,
            };

            if let Some(max_len) = spec.max_len {
                value = self
                    .enforce_length(value, spec, max_len, &mut repairs)
                    .await;
            }
            if matches!(spec.kind, FieldKind::StrList) {
                if let Value::Array(items) = &mut value {
                    let before = items.len();
                    let mut seen = Vec::new();
                    items.retain(|item| {
                        let key = item.as_str().unwrap_or_default().to_string();
                        if seen.contains(&key) {
                            false
                        } else {
                            seen.push(key);
                            true
                        }
                    });
                    if items.len() < before {
                        repairs.push(format!("deduplicated `{}`", spec.name));
                    }
                }
            }
            fields.insert(spec.name.to_string(), value);
        }

        let extra: Vec<&String> = object
            .keys()
            .filter(|key| !schema.fields.iter().any(|f| f.name == key.as_str()))
            .collect();
        if !extra.is_empty() {
            repairs.push(format!(
                "ignored extra fields: {}",
                extra
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        for repair in &repairs {
            debug!(schema = schema.name, repair = repair.as_str(), "normaliser repair");
        }
        if repairs.len() > 3 {
            warn!(
                schema = schema.name,
                repairs = repairs.len(),
                "extensive repairs applied; consider tightening the prompt"
            );
        }

        Ok(Normalised { fields, repairs })
    }

    async fn enforce_length(
        &self,
        value: Value,
        spec: &FieldSpec,
        max_len: usize,
        repairs: &mut Vec<String>,
    ) -> Value {
        match value {
            Value::String(s) => {
                let len = s.chars().count();
                if len <= max_len {
                    return Value::String(s);
                }
                let (shortened, summarised) = if len > max_len * 2 {
                    self.compress(&s, max_len, spec.name).await
                } else {
                    (clamp_chars(&s, max_len), false)
                };
                repairs.push(format!(
                    "{} `{}` from {} to {} chars",
                    if summarised { "summarised" } else { "truncated" },
                    spec.name,
                    len,
                    shortened.chars().count()
                ));
                Value::String(shortened)
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut clamped = false;
                for item in items {
                    match item {
                        Value::String(s) if s.chars().count() > max_len => {
                            out.push(Value::String(clamp_chars(&s, max_len)));
                            clamped = true;
                        }
                        other => out.push(other),
                    }
                }
                if clamped {
                    repairs.push(format!("truncated over-length items in `{}`", spec.name));
                }
                Value::Array(out)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema {
            name: "test_output",
            fields: vec![
                FieldSpec::required_str("action", 50),
                FieldSpec::optional_str("notes", 20),
                FieldSpec::str_list("items", 30),
                FieldSpec::required_bool("passed"),
            ],
        }
    }

    fn normaliser() -> Normaliser {
        Normaliser::new(None)
    }

    #[tokio::test]
    async fn clean_json_passes_without_repairs() {
        let raw = r#"{"action": "implement", "notes": "ok", "items": ["a"], "passed": true}"#;
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert!(out.repairs.is_empty());
        assert_eq!(out.str_field("action"), "implement");
        assert!(out.bool_field("passed"));
    }

    #[tokio::test]
    async fn fenced_json_is_extracted() {
        let raw = "Here you go:\n```json\n{\"action\": \"skip\", \"passed\": false}\n```\nDone.";
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert_eq!(out.str_field("action"), "skip");
        assert!(out.repairs.iter().any(|r| r.contains("fence")));
    }

    #[tokio::test]
    async fn embedded_object_is_located() {
        let raw = "I think the answer is {\"action\": \"abort\", \"passed\": false} overall.";
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert_eq!(out.str_field("action"), "abort");
    }

    #[tokio::test]
    async fn trailing_commas_and_comments_are_tolerated() {
        let raw = r#"{
            "action": "implement", // chosen action
            "passed": true,
        }"#;
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert_eq!(out.str_field("action"), "implement");
    }

    #[tokio::test]
    async fn string_is_split_into_list() {
        let raw = r#"{"action": "implement", "items": "one, two; three", "passed": true}"#;
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert_eq!(out.str_list_field("items"), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn bool_string_is_coerced() {
        let raw = r#"{"action": "implement", "passed": "true"}"#;
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert!(out.bool_field("passed"));
    }

    #[tokio::test]
    async fn over_length_string_is_truncated() {
        let long = "An over-long note. ".repeat(3);
        let raw = json!({"action": "implement", "notes": long, "passed": true}).to_string();
        let out = normaliser().normalise(&raw, &schema()).await.unwrap();
        assert!(out.str_field("notes").chars().count() <= 20);
        assert!(out.repairs.iter().any(|r| r.contains("notes")));
    }

    #[tokio::test]
    async fn duplicate_list_items_are_removed() {
        let raw = r#"{"action": "implement", "items": ["a", "a", "b"], "passed": true}"#;
        let out = normaliser().normalise(raw, &schema()).await.unwrap();
        assert_eq!(out.str_list_field("items"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_required_field_fails() {
        let raw = r#"{"passed": true}"#;
        let err = normaliser().normalise(raw, &schema()).await.unwrap_err();
        assert!(matches!(err, NormaliserError::MissingField { field: "action", .. }));
    }

    #[tokio::test]
    async fn prose_without_json_fails() {
        let err = normaliser()
            .normalise("no structure here at all", &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, NormaliserError::NoJson { .. }));
    }
}
