//! Payload sanitization for audit records.
//!
//! Before an input or output lands in an audit entry it passes through the
//! [`Sanitizer`], which deep-walks the value, replaces values under
//! sensitive-looking keys, and truncates oversized strings. Matching is on
//! key names (case-insensitive substring), never on value shape — fast and
//! predictable. Token-accounting keys are allow-listed so the `token`
//! pattern cannot destroy usage data.
//!
//! The sanitizer is total: it never fails, whatever the input looks like.

use serde_json::Value;

/// Replacement for redacted values.
pub const DEFAULT_REDACT_VALUE: &str = "[REDACTED]";
/// Character cap applied to input strings.
pub const DEFAULT_MAX_INPUT_SIZE: usize = 10_000;
/// Character cap applied to output strings.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 10_000;
/// Marker appended to truncated strings.
pub const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

/// Key substrings redacted by default.
const DEFAULT_PATTERNS: &[&str] = &[
    "password",
    "apikey",
    "api_key",
    "token",
    "secret",
    "credential",
    "authorization",
    "bearer",
];

/// Exact keys that are never redacted.
const SAFE_KEYS: &[&str] = &[
    "tokens",
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "cached_tokens",
];

/// Recursive redactor/truncator for entry payloads.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    /// Lowercased substring patterns, in match order.
    patterns: Vec<String>,
    redact_value: String,
    max_input_size: usize,
    max_output_size: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sanitizer {
    pub fn new() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            redact_value: DEFAULT_REDACT_VALUE.into(),
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
        }
    }

    /// Replace the pattern list entirely (patterns are lowercased).
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns
            .into_iter()
            .map(|p| p.into().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    pub fn with_max_sizes(mut self, max_input_size: usize, max_output_size: usize) -> Self {
        self.max_input_size = max_input_size;
        self.max_output_size = max_output_size;
        self
    }

    /// Add a pattern; matching is case-insensitive substring on keys.
    pub fn add_pattern(&mut self, pattern: impl Into<String>) -> &mut Self {
        let pattern = pattern.into().to_lowercase();
        if !pattern.is_empty() && !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
        self
    }

    pub fn remove_pattern(&mut self, pattern: &str) -> &mut Self {
        let pattern = pattern.to_lowercase();
        self.patterns.retain(|p| *p != pattern);
        self
    }

    pub fn set_redact_value(&mut self, value: impl Into<String>) -> &mut Self {
        self.redact_value = value.into();
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn redact_value(&self) -> &str {
        &self.redact_value
    }

    /// Sanitize a payload. `is_output` selects which size cap applies.
    pub fn sanitize(&self, value: &Value, is_output: bool) -> Value {
        let cap = if is_output {
            self.max_output_size
        } else {
            self.max_input_size
        };
        self.walk(value, cap)
    }

    /// Sanitize with the input-side size cap.
    pub fn sanitize_input(&self, value: &Value) -> Value {
        self.sanitize(value, false)
    }

    /// Sanitize with the output-side size cap.
    pub fn sanitize_output(&self, value: &Value) -> Value {
        self.sanitize(value, true)
    }

    fn walk(&self, value: &Value, cap: usize) -> Value {
        match value {
            Value::String(s) => Value::String(truncate(s, cap)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.walk(item, cap)).collect())
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, nested) in map {
                    if self.should_redact(key) {
                        out.insert(key.clone(), Value::String(self.redact_value.clone()));
                    } else {
                        out.insert(key.clone(), self.walk(nested, cap));
                    }
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn should_redact(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        if is_safe_key(&lower) {
            return false;
        }
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}

fn is_safe_key(lower: &str) -> bool {
    lower.ends_with("_tokens")
        || SAFE_KEYS.contains(&lower)
        || (lower.starts_with("token") && lower.ends_with("_count"))
}

fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    let mut out: String = s.chars().take(cap).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}
