use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use shared::preferences::{GroupingPreferences, SwimlanePreferences};
use tracing::warn;

use crate::hub::HubConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub initial_snapshot_limit: u32,
    pub tick_interval_ms: u64,
    pub subscriber_buffer: usize,
    pub send_timeout_ms: u64,
    pub max_lane_entries: usize,
    pub grouping: GroupingPreferences,
    pub swimlanes: SwimlanePreferences,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:4000".into(),
            database_url: "sqlite://./data/events.db".into(),
            initial_snapshot_limit: 200,
            tick_interval_ms: 1_000,
            subscriber_buffer: 256,
            send_timeout_ms: 5_000,
            max_lane_entries: grouping::swimlanes::DEFAULT_MAX_LANE_ENTRIES,
            grouping: GroupingPreferences::default(),
            swimlanes: SwimlanePreferences::default(),
        }
    }
}

impl Settings {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            initial_snapshot_limit: self.initial_snapshot_limit.max(1),
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            max_lane_entries: self.max_lane_entries,
            swimlanes: self.swimlanes.clone(),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    database_url: Option<String>,
    initial_snapshot_limit: Option<u32>,
    tick_interval_ms: Option<u64>,
    subscriber_buffer: Option<usize>,
    send_timeout_ms: Option<u64>,
    max_lane_entries: Option<usize>,
    grouping: Option<GroupingPreferences>,
    swimlanes: Option<SwimlanePreferences>,
}

pub fn load_settings() -> Settings {
    let raw = fs::read_to_string("server.toml").ok();
    load_settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

/// Layers `raw_file` (the contents of `server.toml`, if any) and then the variables
/// yielded by `env` over the defaults.
pub fn load_settings_from(
    raw_file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = raw_file {
        match toml::from_str::<FileConfig>(raw) {
            Ok(file_cfg) => apply_file_config(&mut settings, file_cfg),
            Err(err) => warn!(%err, "ignoring malformed server.toml"),
        }
    }

    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = env(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }

    override_parsed(&env, "APP__INITIAL_SNAPSHOT_LIMIT", &mut settings.initial_snapshot_limit);
    override_parsed(&env, "APP__TICK_INTERVAL_MS", &mut settings.tick_interval_ms);
    override_parsed(&env, "APP__SUBSCRIBER_BUFFER", &mut settings.subscriber_buffer);
    override_parsed(&env, "APP__SEND_TIMEOUT_MS", &mut settings.send_timeout_ms);
    override_parsed(&env, "APP__MAX_LANE_ENTRIES", &mut settings.max_lane_entries);

    override_parsed(&env, "APP__GROUPING_ENABLED", &mut settings.grouping.enabled);
    override_parsed(&env, "APP__GROUPING_TIME_WINDOW_MS", &mut settings.grouping.time_window);
    override_parsed(
        &env,
        "APP__GROUPING_MIN_EVENTS",
        &mut settings.grouping.min_events_to_group,
    );
    override_parsed(
        &env,
        "APP__GROUPING_MAX_GROUP_SIZE",
        &mut settings.grouping.max_group_size,
    );

    settings
}

fn apply_file_config(settings: &mut Settings, file_cfg: FileConfig) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.initial_snapshot_limit {
        settings.initial_snapshot_limit = v;
    }
    if let Some(v) = file_cfg.tick_interval_ms {
        settings.tick_interval_ms = v;
    }
    if let Some(v) = file_cfg.subscriber_buffer {
        settings.subscriber_buffer = v;
    }
    if let Some(v) = file_cfg.send_timeout_ms {
        settings.send_timeout_ms = v;
    }
    if let Some(v) = file_cfg.max_lane_entries {
        settings.max_lane_entries = v;
    }
    if let Some(v) = file_cfg.grouping {
        settings.grouping = v;
    }
    if let Some(v) = file_cfg.swimlanes {
        settings.swimlanes = v;
    }
}

fn override_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_drive_prefix(path) {
            return format!("sqlite:{path}");
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if has_drive_prefix(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
