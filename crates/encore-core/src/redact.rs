//! Secret redaction for logs and error surfaces.

use std::sync::LazyLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

const REDACTED: &str = "[REDACTED]";

/// Provider credential shapes. Longer prefixes come first so `sk-ant-` is
/// not half-consumed by the generic `sk-` pattern.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"sk-ant-[A-Za-z0-9_\-]{8,}",
        r"sk-proj-[A-Za-z0-9_\-]{8,}",
        r"sk-[A-Za-z0-9_\-]{16,}",
        r"AIza[0-9A-Za-z_\-]{20,}",
        r"gsk_[A-Za-z0-9]{16,}",
        r"xai-[A-Za-z0-9]{16,}",
        r"hf_[A-Za-z0-9]{16,}",
        r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Object keys whose values are always redacted in structured context.
const SENSITIVE_KEYS: &[&str] = &["apikey", "api_key", "authorization", "password", "secret", "token"];

/// Replace every known provider key shape in `text` with `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_owned();
    for re in SECRET_PATTERNS.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, REDACTED).into_owned();
        }
    }
    out
}

/// Redact a JSON value recursively: sensitive keys are blanked and every
/// string is scrubbed with [`redact_secrets`].
pub fn redact_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, v) in map {
                let lower = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                    let _ = redacted.insert(key.clone(), serde_json::json!(REDACTED));
                } else {
                    let _ = redacted.insert(key.clone(), redact_value(v));
                }
            }
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_value).collect())
        }
        serde_json::Value::String(s) => serde_json::Value::String(redact_secrets(s)),
        other => other.clone(),
    }
}

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Wrap a raw key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// Expose the raw key for the outbound request.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}
