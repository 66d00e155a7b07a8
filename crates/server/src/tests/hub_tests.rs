use super::*;
use serde_json::{json, Value};
use shared::domain::hook_event_types;

async fn setup(
    prefs: GroupingPreferences,
    config: HubConfig,
) -> (HubHandle, Storage, watch::Sender<GroupingPreferences>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (grouping, grouping_rx) = watch::channel(prefs);
    let hub = spawn(storage.clone(), grouping_rx, config);
    (hub, storage, grouping)
}

fn ungrouped() -> GroupingPreferences {
    GroupingPreferences {
        enabled: false,
        ..GroupingPreferences::default()
    }
}

fn event(tool: &str) -> HookEvent {
    HookEvent::new(
        "X",
        "S1",
        hook_event_types::PRE_TOOL_USE,
        json!({ "tool_input": { "file_path": "src/a.ts" } }),
    )
    .with_tool(tool)
}

fn next_frame(frames: &mut mpsc::Receiver<Arc<str>>) -> Value {
    let frame = frames.try_recv().expect("frame queued");
    serde_json::from_str(&frame).expect("json frame")
}

async fn subscribe(hub: &HubHandle, capacity: usize) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
    let (connection, frames) = Connection::new(capacity);
    let id = connection.id();
    hub.register(connection).await.expect("register");
    (id, frames)
}

#[tokio::test]
async fn register_sends_initial_snapshot_first() {
    let (hub, storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    storage.insert_event(&event("Read").at(10)).await.expect("insert");
    storage.insert_event(&event("Bash").at(20)).await.expect("insert");

    let (_id, mut frames) = subscribe(&hub, 8).await;
    let initial = next_frame(&mut frames);
    assert_eq!(initial["type"], "initial");
    let data = initial["data"].as_array().expect("events");
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["timestamp"], 10);
    assert_eq!(data[1]["timestamp"], 20);
}

#[tokio::test]
async fn initial_snapshot_is_bounded() {
    let config = HubConfig {
        initial_snapshot_limit: 2,
        ..HubConfig::default()
    };
    let (hub, storage, _grouping) = setup(ungrouped(), config).await;
    for timestamp in 1..=5 {
        storage
            .insert_event(&event("Read").at(timestamp))
            .await
            .expect("insert");
    }

    let (_id, mut frames) = subscribe(&hub, 8).await;
    let initial = next_frame(&mut frames);
    let stamps: Vec<i64> = initial["data"]
        .as_array()
        .expect("events")
        .iter()
        .map(|event| event["timestamp"].as_i64().expect("timestamp"))
        .collect();
    assert_eq!(stamps, vec![4, 5]);
}

#[tokio::test]
async fn subscriber_sees_publishes_in_call_order() {
    let (hub, _storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    let (_id, mut frames) = subscribe(&hub, 16).await;
    next_frame(&mut frames);

    for tool in ["A", "B", "C"] {
        hub.ingest(event(tool)).await.expect("ingest");
    }

    let tools: Vec<String> = (0..3)
        .map(|_| {
            let frame = next_frame(&mut frames);
            assert_eq!(frame["type"], "event");
            frame["data"]["tool_name"].as_str().expect("tool").to_string()
        })
        .collect();
    assert_eq!(tools, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn closed_subscriber_is_removed_without_affecting_others() {
    let (hub, _storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    let (_gone, gone_frames) = subscribe(&hub, 8).await;
    let (_kept, mut kept_frames) = subscribe(&hub, 8).await;
    next_frame(&mut kept_frames);
    drop(gone_frames);

    hub.ingest(event("Read")).await.expect("ingest");
    assert_eq!(hub.stats().await.expect("stats").subscribers, 1);

    hub.ingest(event("Bash")).await.expect("ingest");
    assert_eq!(next_frame(&mut kept_frames)["data"]["tool_name"], "Read");
    assert_eq!(next_frame(&mut kept_frames)["data"]["tool_name"], "Bash");
}

#[tokio::test]
async fn overflowing_subscriber_is_dropped() {
    let (hub, _storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    // The initial snapshot fills the single slot.
    let (_id, mut frames) = subscribe(&hub, 1).await;

    hub.ingest(event("Read")).await.expect("ingest");
    assert_eq!(hub.stats().await.expect("stats").subscribers, 0);

    assert_eq!(next_frame(&mut frames)["type"], "initial");
    assert!(frames.recv().await.is_none(), "hub released the connection");
}

#[tokio::test]
async fn unregister_is_idempotent_and_stops_ticker() {
    let (hub, _storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    assert!(!hub.stats().await.expect("stats").ticker_running);

    let (id, _frames) = subscribe(&hub, 8).await;
    let stats = hub.stats().await.expect("stats");
    assert_eq!(stats.subscribers, 1);
    assert!(stats.ticker_running);

    hub.unregister(id).await;
    hub.unregister(id).await;
    let stats = hub.stats().await.expect("stats");
    assert_eq!(stats.subscribers, 0);
    assert!(!stats.ticker_running);
}

#[tokio::test]
async fn ticks_reach_subscribers_while_connected() {
    let config = HubConfig {
        tick_interval: Duration::from_millis(20),
        ..HubConfig::default()
    };
    let (hub, _storage, _grouping) = setup(ungrouped(), config).await;
    hub.ingest(event("Read")).await.expect("ingest");

    let (_id, mut frames) = subscribe(&hub, 8).await;
    next_frame(&mut frames);

    let frame = time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("tick within timeout")
        .expect("frame");
    let tick: Value = serde_json::from_str(&frame).expect("json");
    assert_eq!(tick["type"], "tick");
    assert_eq!(tick["data"]["subscribers"], 1);
    assert_eq!(tick["data"]["lanes"][0]["sourceApp"], "X");
    assert_eq!(tick["data"]["lanes"][0]["eventCount"], 1);
}

#[tokio::test]
async fn store_failure_is_not_broadcast() {
    let (hub, storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    let (_id, mut frames) = subscribe(&hub, 8).await;
    next_frame(&mut frames);

    storage.close().await;
    let err = hub.ingest(event("Read")).await.expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Store);
    assert!(frames.try_recv().is_err());
    assert!(hub.lanes().await.expect("lanes").is_empty());
}

#[tokio::test]
async fn invalid_event_is_rejected_with_validation_code() {
    let (hub, storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    let err = hub
        .ingest(HookEvent::default())
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(storage.count_events().await.expect("count"), 0);
}

#[tokio::test]
async fn preference_changes_apply_to_the_next_event() {
    let (hub, _storage, grouping) = setup(ungrouped(), HubConfig::default()).await;
    let (_id, mut frames) = subscribe(&hub, 16).await;
    next_frame(&mut frames);

    hub.ingest(event("Read")).await.expect("ingest");
    assert_eq!(next_frame(&mut frames)["type"], "event");

    grouping.send_replace(GroupingPreferences {
        min_events_to_group: 2,
        ..GroupingPreferences::default()
    });
    hub.ingest(event("Read")).await.expect("ingest");
    hub.ingest(event("Read")).await.expect("ingest");
    hub.ingest(event("Read")).await.expect("ingest");

    assert_eq!(next_frame(&mut frames)["type"], "event");
    let started = next_frame(&mut frames);
    assert_eq!(started["type"], "groupStarted");
    assert_eq!(started["data"]["isGroup"], true);
    assert_eq!(started["data"]["groupMeta"]["count"], 2);
    let updated = next_frame(&mut frames);
    assert_eq!(updated["type"], "groupUpdated");
    assert_eq!(updated["data"]["groupMeta"]["count"], 3);

    assert_eq!(hub.stats().await.expect("stats").tracked_groups, 1);
    let lanes = hub.lanes().await.expect("lanes");
    assert_eq!(lanes.len(), 1);
    assert_eq!(lanes[0].event_count, 4);
    assert_eq!(lanes[0].events.len(), 2);
}

#[tokio::test]
async fn lane_controls_go_through_the_hub() {
    let (hub, _storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    for app in ["api", "web"] {
        hub.ingest(HookEvent::new(app, "S1", hook_event_types::STOP, json!({})))
            .await
            .expect("ingest");
    }

    hub.reorder(vec!["web".to_string()]).await.expect("reorder");
    hub.set_collapsed("api".to_string(), true)
        .await
        .expect("collapse");
    let lanes = hub.lanes().await.expect("lanes");
    let order: Vec<&str> = lanes.iter().map(|lane| lane.source_app.as_str()).collect();
    assert_eq!(order, vec!["web", "api"]);
    assert!(lanes[1].is_collapsed);

    hub.set_pinned("api".to_string(), true).await.expect("pin");
    let lanes = hub.lanes().await.expect("lanes");
    assert_eq!(lanes[0].source_app, "api");
}

#[tokio::test]
async fn shutdown_releases_subscribers_and_rejects_later_calls() {
    let (hub, _storage, _grouping) = setup(ungrouped(), HubConfig::default()).await;
    let (_id, mut frames) = subscribe(&hub, 8).await;
    next_frame(&mut frames);

    hub.shutdown().await;
    assert!(frames.recv().await.is_none());

    let err = hub.ingest(event("Read")).await.expect_err("hub stopped");
    assert_eq!(err.code, ErrorCode::Unavailable);
}

#[test]
fn connection_send_reports_closed_and_overflow() {
    let (connection, frames) = Connection::new(1);
    let id = connection.id();
    connection.send(Arc::from("one")).expect("first fits");
    assert_eq!(
        connection.send(Arc::from("two")),
        Err(SendError::Overflow(id))
    );
    drop(frames);
    assert_eq!(
        connection.send(Arc::from("three")),
        Err(SendError::Closed(id))
    );
}
