use std::{fs, io::ErrorKind, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::{SyncError, SyncResult},
    live::ReconnectPolicy,
};

pub const DEFAULT_CONFIG_FILE: &str = "portal_sync.toml";
const ENV_PREFIX: &str = "PORTAL_SYNC__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    /// Push endpoint base; derived from `api_base_url` when unset.
    pub live_base_url: Option<String>,
    pub reconnect_delay_ms: u64,
    /// When set, reconnect delays double per failed attempt up to this cap.
    pub reconnect_max_delay_ms: Option<u64>,
    pub request_timeout_secs: u64,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".into(),
            live_base_url: None,
            reconnect_delay_ms: 5_000,
            reconnect_max_delay_ms: None,
            request_timeout_secs: 30,
            event_buffer: 256,
        }
    }
}

impl SyncSettings {
    pub fn live_base(&self) -> &str {
        self.live_base_url.as_deref().unwrap_or(&self.api_base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = Duration::from_millis(self.reconnect_delay_ms);
        match self.reconnect_max_delay_ms {
            Some(max) => ReconnectPolicy::Exponential {
                initial,
                max: Duration::from_millis(max).max(initial),
            },
            None => ReconnectPolicy::Fixed(initial),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        let api = self.api_base_url.trim();
        if !(api.starts_with("http://") || api.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "api_base_url must start with http:// or https://: {api}"
            )));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event_buffer must be positive".into()));
        }
        Ok(())
    }
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE), |key| std::env::var(key).ok())
}

/// Reads `path` when present, then applies `PORTAL_SYNC__*` overrides
/// resolved through `lookup`.
pub fn load_settings_from(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<SyncSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), %err, "ignoring unparseable settings file");
                SyncSettings::default()
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => SyncSettings::default(),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable settings file");
            SyncSettings::default()
        }
    };
    apply_env_overrides(&mut settings, lookup);
    settings
}

fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("LIVE_BASE_URL") {
        settings.live_base_url = Some(v);
    }
    if let Some(v) = var("RECONNECT_DELAY_MS") {
        match v.parse() {
            Ok(parsed) => settings.reconnect_delay_ms = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid RECONNECT_DELAY_MS"),
        }
    }
    if let Some(v) = var("RECONNECT_MAX_DELAY_MS") {
        match v.parse() {
            Ok(parsed) => settings.reconnect_max_delay_ms = Some(parsed),
            Err(_) => warn!(value = %v, "ignoring invalid RECONNECT_MAX_DELAY_MS"),
        }
    }
    if let Some(v) = var("REQUEST_TIMEOUT_SECS") {
        match v.parse() {
            Ok(parsed) => settings.request_timeout_secs = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid REQUEST_TIMEOUT_SECS"),
        }
    }
    if let Some(v) = var("EVENT_BUFFER") {
        match v.parse() {
            Ok(parsed) => settings.event_buffer = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid EVENT_BUFFER"),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
