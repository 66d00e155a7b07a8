use super::*;
use serde_json::json;

async fn setup() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    ApiContext { storage }
}

fn event_at(timestamp: i64) -> HookEvent {
    HookEvent::new("X", "S1", "PreToolUse", json!({ "file": "a.ts" }))
        .with_tool("Read")
        .at(timestamp)
}

#[test]
fn validation_names_every_missing_field() {
    let err = validate_event(&HookEvent::default()).expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Validation);
    for field in ["source_app", "session_id", "hook_event_type", "payload"] {
        assert!(err.message.contains(field), "{field} missing from message");
    }
    validate_event(&event_at(1)).expect("complete event");
}

#[test]
fn cursor_accepts_rfc3339_and_epoch_millis() {
    assert_eq!(
        parse_cursor("1970-01-01T00:00:01.500Z").expect("rfc3339"),
        1_500
    );
    assert_eq!(
        parse_cursor("2024-05-01T10:00:00+02:00").expect("offset"),
        1_714_550_400_000
    );
    assert_eq!(parse_cursor("1714550400000").expect("millis"), 1_714_550_400_000);
}

#[test]
fn cursor_rejects_garbage() {
    let err = parse_cursor("yesterday-ish").expect_err("should fail");
    assert_eq!(err.code, ErrorCode::InvalidCursor);
}

#[tokio::test]
async fn historical_requires_a_cursor() {
    let ctx = setup().await;
    let err = historical_events(&ctx, None, None)
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::InvalidCursor);

    let err = historical_events(&ctx, Some("not-a-date"), Some(10))
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::InvalidCursor);
}

#[tokio::test]
async fn historical_pages_with_iso_cursor() {
    let ctx = setup().await;
    for timestamp in [1_000, 2_000, 3_000] {
        ctx.storage
            .insert_event(&event_at(timestamp))
            .await
            .expect("insert");
    }

    let page = historical_events(&ctx, Some("1970-01-01T00:00:03Z"), Some(1))
        .await
        .expect("page");
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].timestamp, 2_000);
    assert!(page.has_more);
}

#[tokio::test]
async fn recent_limit_is_clamped() {
    let ctx = setup().await;
    for timestamp in 1..=3 {
        ctx.storage
            .insert_event(&event_at(timestamp))
            .await
            .expect("insert");
    }

    let events = recent_events(&ctx, Some(0)).await.expect("recent");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].timestamp, 3);

    let events = recent_events(&ctx, None).await.expect("recent");
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn filter_options_reflect_stored_events() {
    let ctx = setup().await;
    ctx.storage
        .insert_event(&event_at(1))
        .await
        .expect("insert");
    let options = filter_options(&ctx).await.expect("options");
    assert_eq!(options.source_apps, vec!["X"]);
    assert_eq!(options.tool_names, vec!["Read"]);
}

#[tokio::test]
async fn store_validation_keeps_its_code() {
    let ctx = setup().await;
    let err = ctx
        .storage
        .insert_event(&HookEvent::default())
        .await
        .map_err(store_error)
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Validation);

    let generic = store_error(anyhow::anyhow!("disk full"));
    assert_eq!(generic.code, ErrorCode::Store);
}
