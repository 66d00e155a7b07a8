use super::{load_settings_from, normalize_database_url, prepare_database_url, Settings};

use std::{
    collections::HashMap,
    env, fs,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = load_settings_from(None, env_from(&[]));
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.server_bind, "127.0.0.1:4000");
    assert_eq!(settings.initial_snapshot_limit, 200);
    assert_eq!(settings.grouping.time_window, 3_000);
    assert_eq!(settings.grouping.min_events_to_group, 3);
    assert_eq!(settings.hub_config().tick_interval, Duration::from_secs(1));
}

#[test]
fn file_values_override_defaults() {
    let raw = r#"
bind_addr = "0.0.0.0:9000"
tick_interval_ms = 250
max_lane_entries = 20

[grouping]
timeWindow = 10000
groupByTool = false

[swimlanes]
pinnedLanes = ["api"]
"#;
    let settings = load_settings_from(Some(raw), env_from(&[]));
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.tick_interval_ms, 250);
    assert_eq!(settings.max_lane_entries, 20);
    assert_eq!(settings.grouping.time_window, 10_000);
    assert!(!settings.grouping.group_by_tool);
    assert!(settings.grouping.enabled, "unset keys keep their defaults");
    assert_eq!(settings.swimlanes.pinned_lanes, vec!["api"]);
}

#[test]
fn prefixed_env_wins_over_plain_env_and_file() {
    let settings = load_settings_from(
        Some(r#"database_url = "sqlite://./file.db""#),
        env_from(&[
            ("DATABASE_URL", "sqlite://./plain.db"),
            ("APP__DATABASE_URL", "sqlite://./prefixed.db"),
            ("SERVER_BIND", "127.0.0.1:1"),
            ("APP__GROUPING_MIN_EVENTS", "5"),
            ("APP__GROUPING_ENABLED", "false"),
        ]),
    );
    assert_eq!(settings.database_url, "sqlite://./prefixed.db");
    assert_eq!(settings.server_bind, "127.0.0.1:1");
    assert_eq!(settings.grouping.min_events_to_group, 5);
    assert!(!settings.grouping.enabled);
}

#[test]
fn unparsable_values_are_ignored() {
    let settings = load_settings_from(
        Some("this is = not [toml"),
        env_from(&[
            ("APP__TICK_INTERVAL_MS", "soon"),
            ("APP__GROUPING_MAX_GROUP_SIZE", "-3"),
        ]),
    );
    assert_eq!(settings.tick_interval_ms, 1_000);
    assert_eq!(settings.grouping.max_group_size, 50);
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), "sqlite://./data/events.db");
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\events.db"),
        "sqlite:C:/Users/alice/events.db"
    );
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/events.db"),
        "sqlite:C:/Users/alice/events.db"
    );
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("hook_events_server_test_{suffix}"));
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("hook_events_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("events.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    storage.close().await;

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
