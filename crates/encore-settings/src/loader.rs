//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`EncoreSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `ENCORE_*` environment variable overrides (highest priority)
//! 4. [`EncoreSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::EncoreSettings;

/// Resolve the path to the settings file (`~/.encore/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".encore").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<EncoreSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. Invalid JSON or unknown
/// keys are an error.
pub fn load_settings_from_path(path: &Path) -> Result<EncoreSettings> {
    load_settings_with_env(path, |name| std::env::var(name).ok())
}

/// Load settings using `env` in place of the process environment.
pub fn load_settings_with_env<F>(path: &Path, env: F) -> Result<EncoreSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(EncoreSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: EncoreSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides<F>(settings: &mut EncoreSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let reader = EnvReader { env: &env };

    // ── Embedding ───────────────────────────────────────────────────
    if let Some(v) = reader.usize("ENCORE_BATCH_SIZE", 1, 100_000) {
        settings.embedding.batch_size = v;
    }
    if let Some(v) = reader.u64("ENCORE_INLINE_THRESHOLD_BYTES", 1, u64::MAX) {
        settings.embedding.inline_threshold_bytes = v;
    }

    // ── Retry / budgets ─────────────────────────────────────────────
    if let Some(v) = reader.u64("ENCORE_MAX_RETRIES", 0, 20) {
        settings.retry.max_retries = v as u32;
    }
    if let Some(v) = reader.u64("ENCORE_LLM_TURN_MS", 100, 3_600_000) {
        settings.budgets.llm_turn_ms = v;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = reader.u64("ENCORE_SMALL_QUOTA_BYTES", 1024, u64::MAX) {
        settings.storage.small_quota_bytes = v;
    }
    if let Some(v) = reader.string("ENCORE_LARGE_DB") {
        settings.storage.large_db_path = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = reader.string("ENCORE_LOG_LEVEL") {
        if parse_level(&v).is_some() {
            settings.logging.level = v.to_lowercase();
        } else {
            tracing::warn!(key = "ENCORE_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
    if let Some(v) = reader.bool("ENCORE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Accept a `tracing` level name.
pub fn parse_level(val: &str) -> Option<&'static str> {
    match val.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a, F> {
    env: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.env)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.env)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.env)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
