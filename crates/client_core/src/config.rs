use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{poller::PollSettings, push_channel::ReconnectPolicy, store::ReconcilePolicy};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8001/api";
pub const DEFAULT_CONFIG_FILE: &str = "monitor.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub api_base_url: String,
    pub poll: PollSettings,
    pub reconnect: ReconnectPolicy,
    pub reconcile: ReconcilePolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            poll: PollSettings::default(),
            reconnect: ReconnectPolicy::default(),
            reconcile: ReconcilePolicy::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    api_base_url: Option<String>,
    poll_interval_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_cap_ms: Option<u64>,
    intent_max_retries: Option<u32>,
    delete_timeout_secs: Option<u64>,
    fetch_server_stats: Option<bool>,
}

/// Defaults, then `path` if it exists, then the process environment.
pub fn load_settings(path: impl AsRef<Path>) -> MonitorSettings {
    let mut settings = MonitorSettings::default();
    let path = path.as_ref();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed config file")
            }
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut MonitorSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.poll_interval_secs.filter(|secs| *secs > 0) {
        settings.poll.interval = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.reconnect_base_ms.filter(|ms| *ms > 0) {
        settings.reconnect.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_cap_ms.filter(|ms| *ms > 0) {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.intent_max_retries {
        settings.reconcile.max_retries = v;
    }
    if let Some(v) = file_cfg.delete_timeout_secs {
        settings.reconcile.delete_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.fetch_server_stats {
        settings.poll.fetch_stats = v;
    }
}

/// Environment overrides. `lookup` is `std::env::var` outside of tests.
pub(crate) fn apply_env<F>(settings: &mut MonitorSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("MONITOR_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(secs) = parsed::<u64>(&lookup, "APP__POLL_INTERVAL_SECS").filter(|s| *s > 0) {
        settings.poll.interval = Duration::from_secs(secs);
    }
    if let Some(ms) = parsed::<u64>(&lookup, "APP__RECONNECT_BASE_MS").filter(|ms| *ms > 0) {
        settings.reconnect.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = parsed::<u64>(&lookup, "APP__RECONNECT_CAP_MS").filter(|ms| *ms > 0) {
        settings.reconnect.max_delay = Duration::from_millis(ms);
    }
    if let Some(retries) = parsed::<u32>(&lookup, "APP__INTENT_MAX_RETRIES") {
        settings.reconcile.max_retries = retries;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "APP__DELETE_TIMEOUT_SECS") {
        settings.reconcile.delete_timeout = Duration::from_secs(secs);
    }
    if let Some(enabled) = parsed::<bool>(&lookup, "APP__FETCH_SERVER_STATS") {
        settings.poll.fetch_stats = enabled;
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
