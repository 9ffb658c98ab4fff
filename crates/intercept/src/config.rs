//! Audit configuration with environment overrides.
//!
//! Resolution happens once at interceptor construction. Precedence:
//! explicit configuration, then environment variables, then built-in
//! defaults. Runtime mutation is not supported.

use std::collections::HashMap;

use serde_json::{Map, Value};

use tracevault_sanitize::Sanitizer;

/// Prefix of the recognized environment variables, e.g.
/// `BOXLANG_MODULES_BXAI_AUDIT_ENABLED` or
/// `BOXLANG_MODULES_BXAI_AUDIT_STORE`.
pub const ENV_PREFIX: &str = "BOXLANG_MODULES_BXAI_AUDIT_";

/// Resolved interceptor configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Master switch; disabled interceptors record nothing.
    pub enabled: bool,
    /// Store name resolved through the registry (`memory`, `file`,
    /// `jdbc`, the `database`/`db` aliases, or a custom factory name).
    pub store: String,
    /// Nested configuration handed to the store factory.
    pub store_config: Value,
    pub capture_messages: bool,
    pub capture_tool_args: bool,
    pub capture_input: bool,
    pub capture_output: bool,
    /// Overrides the sanitizer's default pattern list when set.
    pub sanitize_patterns: Option<Vec<String>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store: "memory".into(),
            store_config: Value::Object(Map::new()),
            capture_messages: true,
            capture_tool_args: true,
            capture_input: true,
            capture_output: true,
            sanitize_patterns: None,
        }
    }
}

/// `1`, `true`, and `yes` (case-insensitive) enable a boolean; anything
/// else disables it.
fn truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl AuditConfig {
    /// Resolve from an explicit JSON map and an environment snapshot.
    /// Explicit keys win over environment variables, which win over the
    /// defaults.
    pub fn resolve(explicit: Option<&Value>, env: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        let env_var = |name: &str| env.get(&format!("{ENV_PREFIX}{name}")).cloned();
        if let Some(raw) = env_var("ENABLED") {
            config.enabled = truthy(&raw);
        }
        if let Some(raw) = env_var("STORE")
            && !raw.is_empty()
        {
            config.store = raw;
        }
        if let Some(raw) = env_var("STORE_CONFIG")
            && let Ok(value) = serde_json::from_str::<Value>(&raw)
        {
            config.store_config = value;
        }
        for (name, target) in [
            ("CAPTURE_MESSAGES", &mut config.capture_messages),
            ("CAPTURE_TOOL_ARGS", &mut config.capture_tool_args),
            ("CAPTURE_INPUT", &mut config.capture_input),
            ("CAPTURE_OUTPUT", &mut config.capture_output),
        ] {
            if let Some(raw) = env_var(name) {
                *target = truthy(&raw);
            }
        }
        if let Some(raw) = env_var("SANITIZE_PATTERNS") {
            let patterns: Vec<String> = raw
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if !patterns.is_empty() {
                config.sanitize_patterns = Some(patterns);
            }
        }

        if let Some(Value::Object(map)) = explicit {
            config.apply_explicit(map);
        }
        config
    }

    /// Resolve from an explicit map plus the process environment.
    pub fn from_env(explicit: Option<&Value>) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::resolve(explicit, &env)
    }

    fn apply_explicit(&mut self, map: &Map<String, Value>) {
        fn bool_option(value: &Value) -> Option<bool> {
            match value {
                Value::Bool(b) => Some(*b),
                Value::String(s) => Some(truthy(s)),
                Value::Number(n) => Some(n.as_i64() == Some(1)),
                _ => None,
            }
        }

        if let Some(value) = map.get("enabled").and_then(bool_option) {
            self.enabled = value;
        }
        if let Some(value) = map.get("store").and_then(Value::as_str)
            && !value.is_empty()
        {
            self.store = value.to_string();
        }
        if let Some(value) = map.get("storeConfig") {
            self.store_config = value.clone();
        }
        for (key, target) in [
            ("captureMessages", &mut self.capture_messages),
            ("captureToolArgs", &mut self.capture_tool_args),
            ("captureInput", &mut self.capture_input),
            ("captureOutput", &mut self.capture_output),
        ] {
            if let Some(value) = map.get(key).and_then(bool_option) {
                *target = value;
            }
        }
        if let Some(Value::Array(items)) = map.get("sanitizePatterns") {
            let patterns: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .filter(|p| !p.is_empty())
                .collect();
            if !patterns.is_empty() {
                self.sanitize_patterns = Some(patterns);
            }
        }
    }

    /// The sanitizer this configuration describes.
    pub fn sanitizer(&self) -> Sanitizer {
        match &self.sanitize_patterns {
            Some(patterns) => Sanitizer::new().with_patterns(patterns.clone()),
            None => Sanitizer::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_disabled_memory() {
        let config = AuditConfig::resolve(None, &HashMap::new());
        assert!(!config.enabled);
        assert_eq!(config.store, "memory");
        assert!(config.capture_messages);
        assert!(config.capture_output);
        assert!(config.sanitize_patterns.is_none());
    }

    #[test]
    fn env_enables_and_picks_store() {
        let config = AuditConfig::resolve(
            None,
            &env(&[("ENABLED", "true"), ("STORE", "jdbc"), ("CAPTURE_MESSAGES", "no")]),
        );
        assert!(config.enabled);
        assert_eq!(config.store, "jdbc");
        assert!(!config.capture_messages);
    }

    #[test]
    fn truthy_values_are_case_insensitive() {
        for value in ["1", "true", "TRUE", "Yes", "yes"] {
            assert!(
                AuditConfig::resolve(None, &env(&[("ENABLED", value)])).enabled,
                "{value}"
            );
        }
        for value in ["0", "false", "off", "nope", ""] {
            assert!(
                !AuditConfig::resolve(None, &env(&[("ENABLED", value)])).enabled,
                "{value}"
            );
        }
    }

    #[test]
    fn explicit_beats_environment() {
        let explicit = json!({
            "enabled": false,
            "store": "file",
            "storeConfig": {"path": "/tmp/audit"},
        });
        let config = AuditConfig::resolve(
            Some(&explicit),
            &env(&[("ENABLED", "true"), ("STORE", "jdbc")]),
        );
        assert!(!config.enabled);
        assert_eq!(config.store, "file");
        assert_eq!(config.store_config["path"], "/tmp/audit");
    }

    #[test]
    fn explicit_accepts_truthy_strings() {
        let config = AuditConfig::resolve(Some(&json!({"enabled": "yes"})), &HashMap::new());
        assert!(config.enabled);
    }

    #[test]
    fn env_store_config_parses_json() {
        let config = AuditConfig::resolve(
            None,
            &env(&[("STORE_CONFIG", r#"{"maxSize": 500}"#)]),
        );
        assert_eq!(config.store_config["maxSize"], 500);
    }

    #[test]
    fn sanitize_patterns_from_both_layers() {
        let config = AuditConfig::resolve(None, &env(&[("SANITIZE_PATTERNS", "ssn, pin")]));
        assert_eq!(
            config.sanitize_patterns,
            Some(vec!["ssn".to_string(), "pin".to_string()])
        );

        let config = AuditConfig::resolve(
            Some(&json!({"sanitizePatterns": ["card"]})),
            &env(&[("SANITIZE_PATTERNS", "ssn")]),
        );
        assert_eq!(config.sanitize_patterns, Some(vec!["card".to_string()]));
    }

    #[test]
    fn configured_sanitizer_uses_patterns() {
        let config = AuditConfig::resolve(
            Some(&json!({"sanitizePatterns": ["ssn"]})),
            &HashMap::new(),
        );
        let sanitized = config
            .sanitizer()
            .sanitize_input(&json!({"ssn": "123-45-6789", "password": "left-alone"}));
        assert_eq!(sanitized["ssn"], "[REDACTED]");
        assert_eq!(sanitized["password"], "left-alone");
    }
}
