//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TallySettings::default()`]
//! 2. If a settings file is given and exists, deep-merge it over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Apply development mode, then validate

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{LogFormat, TallySettings};

/// Load settings, reading overrides from the process environment.
pub fn load_settings(path: Option<&Path>) -> Result<TallySettings> {
    load_settings_with_env(path, |key| std::env::var(key).ok())
}

/// Load settings with an explicit env lookup.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_with_env<F>(path: Option<&Path>, env: F) -> Result<TallySettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(TallySettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: TallySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.apply_development();
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut TallySettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("PORT") {
        match parse_u16_range(&v, 0, 65535) {
            Some(port) => settings.server.port = port,
            None => invalid("PORT", &v),
        }
    }
    if let Some(v) = read("HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("ALLOWED_ORIGINS") {
        let origins = parse_list(&v);
        if origins.is_empty() {
            invalid("ALLOWED_ORIGINS", &v);
        } else {
            settings.server.allowed_origins = origins;
        }
    }
    if let Some(v) = read("MAX_MESSAGE_SIZE") {
        match parse_u64_range(&v, 1, 16 * 1024 * 1024) {
            Some(n) => settings.server.max_message_size = n as usize,
            None => invalid("MAX_MESSAGE_SIZE", &v),
        }
    }
    if let Some(v) = read("SESSION_TIMEOUT") {
        match parse_duration_ms(&v).filter(|ms| (1_000_u64..=30 * 24 * 3_600_000).contains(ms)) {
            Some(ms) => settings.server.session_timeout_ms = ms,
            None => invalid("SESSION_TIMEOUT", &v),
        }
    }
    if let Some(v) = read("SHUTDOWN_TIMEOUT") {
        match parse_duration_ms(&v).filter(|ms| (1_u64..=3_600_000).contains(ms)) {
            Some(ms) => settings.server.shutdown_timeout_ms = ms,
            None => invalid("SHUTDOWN_TIMEOUT", &v),
        }
    }
    if let Some(v) = read("LOG_LEVEL") {
        match parse_level(&v) {
            Some(level) => settings.logging.level = level,
            None => invalid("LOG_LEVEL", &v),
        }
    }
    if let Some(v) = read("LOG_FORMAT") {
        match parse_format(&v) {
            Some(format) => settings.logging.format = format,
            None => invalid("LOG_FORMAT", &v),
        }
    }
    if let Some(v) = read("DEVELOPMENT") {
        match parse_bool(&v) {
            Some(flag) => settings.development = flag,
            None => invalid("DEVELOPMENT", &v),
        }
    }
}

/// Reject values that deserialize fine but would break the server.
pub fn validate(settings: &TallySettings) -> Result<()> {
    let server = &settings.server;
    let checks = [
        (server.max_message_size == 0, "maxMessageSize must be > 0"),
        (server.send_queue_size == 0, "sendQueueSize must be > 0"),
        (server.heartbeat_interval_ms == 0, "heartbeatIntervalMs must be > 0"),
        (server.reap_interval_ms == 0, "reapIntervalMs must be > 0"),
        (server.allowed_origins.is_empty(), "allowedOrigins must not be empty"),
        (parse_level(&settings.logging.level).is_none(), "logging.level is not a known level"),
    ];
    match checks.iter().find(|(failed, _)| *failed) {
        Some((_, reason)) => Err(SettingsError::InvalidValue((*reason).to_string())),
        None => Ok(()),
    }
}

fn invalid(key: &str, value: &str) {
    warn!(key, value, "invalid env var, ignoring");
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Duration in milliseconds. A bare number is seconds; otherwise a sequence
/// of `<number><unit>` terms with units `ms`, `s`, `m` or `h`, as in `24h`,
/// `1h30m` or `1.5s`.
pub fn parse_duration_ms(val: &str) -> Option<u64> {
    let val = val.trim();
    if let Ok(secs) = val.parse::<u64>() {
        return secs.checked_mul(1000);
    }
    let mut rest = val;
    let mut total = 0.0_f64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let amount: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total += amount * scale;
    }
    (total.is_finite() && total < u64::MAX as f64 && !val.is_empty()).then(|| total.round() as u64)
}

/// Comma-separated list, trimmed, empty entries dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_level(val: &str) -> Option<String> {
    let level = val.trim().to_lowercase();
    matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error").then_some(level)
}

pub fn parse_format(val: &str) -> Option<LogFormat> {
    match val.trim().to_lowercase().as_str() {
        "text" | "pretty" => Some(LogFormat::Text),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}
