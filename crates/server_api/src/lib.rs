use chrono::DateTime;
use shared::{
    error::{ApiError, ApiException, ErrorCode},
    protocol::{FilterOptions, HistoricalPage, HookEvent, StoredEvent},
};
use storage::Storage;
use tracing::error;

pub const DEFAULT_RECENT_LIMIT: u32 = 100;
pub const MAX_RECENT_LIMIT: u32 = 1_000;
pub const DEFAULT_HISTORICAL_LIMIT: u32 = 50;
pub const MAX_HISTORICAL_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Rejects an event missing any field the pipeline depends on.
pub fn validate_event(event: &HookEvent) -> Result<(), ApiError> {
    let missing = event.missing_fields();
    if missing.is_empty() {
        return Ok(());
    }
    Err(ApiError::new(
        ErrorCode::Validation,
        format!("missing required fields: {}", missing.join(", ")),
    ))
}

/// Parses a paging cursor given as an RFC 3339 instant or as epoch milliseconds.
pub fn parse_cursor(raw: &str) -> Result<i64, ApiError> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|instant| instant.timestamp_millis())
        .map_err(|_| {
            ApiError::new(
                ErrorCode::InvalidCursor,
                "invalid timestamp format, use ISO 8601",
            )
        })
}

pub async fn recent_events(
    ctx: &ApiContext,
    limit: Option<u32>,
) -> Result<Vec<StoredEvent>, ApiError> {
    let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
    ctx.storage.recent_events(limit).await.map_err(store_error)
}

pub async fn historical_events(
    ctx: &ApiContext,
    before: Option<&str>,
    limit: Option<u32>,
) -> Result<HistoricalPage, ApiError> {
    let before = before.filter(|raw| !raw.trim().is_empty()).ok_or_else(|| {
        ApiError::new(
            ErrorCode::InvalidCursor,
            "missing required parameter: before (ISO timestamp)",
        )
    })?;
    let before = parse_cursor(before)?;
    let limit = limit.unwrap_or(DEFAULT_HISTORICAL_LIMIT).clamp(1, MAX_HISTORICAL_LIMIT);
    ctx.storage
        .historical_events(before, limit)
        .await
        .map_err(store_error)
}

pub async fn filter_options(ctx: &ApiContext) -> Result<FilterOptions, ApiError> {
    ctx.storage.filter_options().await.map_err(store_error)
}

pub async fn health_check(ctx: &ApiContext) -> Result<(), ApiError> {
    ctx.storage
        .health_check()
        .await
        .map_err(|err| ApiError::new(ErrorCode::Unavailable, err.to_string()))
}

/// Maps a storage failure to the request error surface, preserving typed rejections.
pub fn store_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<ApiException>() {
        Ok(exception) => exception.into(),
        Err(err) => {
            error!(error = %format!("{err:#}"), "event store operation failed");
            ApiError::new(ErrorCode::Store, err.to_string())
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
