//! Layered settings loading.
//!
//! Compiled defaults are serialized to JSON, the settings file (when present)
//! is overlaid on top, and `GROUPCAST_*` variables are applied last. Only
//! keys present in a layer replace the layer below; objects recurse, `null`
//! leaves the lower value alone.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use groupcast_core::logging::LogFormat;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{BrokerKind, GroupcastSettings};

/// `~/.groupcast/settings.json`, falling back to `/tmp` without `HOME`.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".groupcast")
        .join("settings.json")
}

/// Load from [`settings_path`] with process environment overrides.
pub fn load_settings() -> Result<GroupcastSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with process environment overrides.
///
/// A missing file is not an error.
pub fn load_settings_from_path(path: &Path) -> Result<GroupcastSettings> {
    load_settings_with_env(path, |key| std::env::var(key).ok())
}

/// Load from `path`, resolving `GROUPCAST_*` keys through `lookup`.
pub fn load_settings_with_env<F>(path: &Path, lookup: F) -> Result<GroupcastSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layered = serde_json::to_value(GroupcastSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "settings file found");
            overlay(&mut layered, serde_json::from_str(&text)?);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file");
        }
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let mut settings: GroupcastSettings = serde_json::from_value(layered)?;
    let applied = apply_env(&mut settings, lookup);
    if applied > 0 {
        debug!(applied, "environment overrides applied");
    }
    settings.validate()?;
    Ok(settings)
}

/// Overlay `layer` onto `base` in place.
pub fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(lower), Value::Object(upper)) => overlay_map(lower, upper),
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

fn overlay_map(lower: &mut Map<String, Value>, upper: Map<String, Value>) {
    for (key, value) in upper {
        match lower.get_mut(&key) {
            Some(slot) => overlay(slot, value),
            None if value.is_null() => {}
            None => {
                let _ = lower.insert(key, value);
            }
        }
    }
}

/// Recognized variables, applied in this order.
pub const ENV_KEYS: &[&str] = &[
    "GROUPCAST_HOST",
    "GROUPCAST_PORT",
    "GROUPCAST_MAX_CONNECTIONS",
    "GROUPCAST_OUTBOUND_CAPACITY",
    "GROUPCAST_ECHO_TO_SENDER",
    "GROUPCAST_BROKER",
    "GROUPCAST_REDIS_URL",
    "GROUPCAST_TOPIC_PREFIX",
    "GROUPCAST_LOG_LEVEL",
    "GROUPCAST_LOG_FORMAT",
];

/// Apply every recognized variable `lookup` yields. Rejected values are
/// logged and leave the earlier layer in place.
///
/// Returns how many overrides took effect.
pub fn apply_env<F>(settings: &mut GroupcastSettings, lookup: F) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = 0;
    for key in ENV_KEYS {
        let Some(raw) = lookup(key) else { continue };
        if set_from_env(settings, key, &raw) {
            applied += 1;
        } else {
            warn!(key, value = %raw, "ignoring unusable environment override");
        }
    }
    applied
}

/// Returns `false` when `raw` is unusable for `key`.
fn set_from_env(s: &mut GroupcastSettings, key: &str, raw: &str) -> bool {
    match key {
        "GROUPCAST_HOST" => non_empty(raw).map(|v| s.server.host = v).is_some(),
        "GROUPCAST_PORT" => bounded(raw, 1..=u16::MAX)
            .map(|v| s.server.port = v)
            .is_some(),
        "GROUPCAST_MAX_CONNECTIONS" => bounded(raw, 1..=1_000_000)
            .map(|v| s.server.max_connections = v)
            .is_some(),
        "GROUPCAST_OUTBOUND_CAPACITY" => bounded(raw, 1..=1_000_000)
            .map(|v| s.session.outbound_capacity = v)
            .is_some(),
        "GROUPCAST_ECHO_TO_SENDER" => flag(raw).map(|v| s.session.echo_to_sender = v).is_some(),
        "GROUPCAST_BROKER" => raw
            .parse::<BrokerKind>()
            .map(|v| s.broker.kind = v)
            .is_ok(),
        "GROUPCAST_REDIS_URL" => non_empty(raw).map(|v| s.broker.url = v).is_some(),
        "GROUPCAST_TOPIC_PREFIX" => {
            // empty is a valid prefix
            s.broker.topic_prefix = raw.to_owned();
            true
        }
        "GROUPCAST_LOG_LEVEL" => non_empty(raw).map(|v| s.logging.level = v).is_some(),
        "GROUPCAST_LOG_FORMAT" => raw
            .parse::<LogFormat>()
            .map(|v| s.logging.format = v)
            .is_ok(),
        _ => false,
    }
}

fn non_empty(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_owned())
}

/// `true`/`1`/`yes`/`on` and their negatives, any case.
pub fn flag(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    ["true", "1", "yes", "on"]
        .iter()
        .any(|t| raw.eq_ignore_ascii_case(t))
        .then_some(true)
        .or_else(|| {
            ["false", "0", "no", "off"]
                .iter()
                .any(|f| raw.eq_ignore_ascii_case(f))
                .then_some(false)
        })
}

/// Parse `raw` and keep it only inside `range`.
pub fn bounded<T>(raw: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| range.contains(n))
}
