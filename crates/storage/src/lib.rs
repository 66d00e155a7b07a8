use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::EventId,
    error::{ApiException, ErrorCode},
    protocol::{FilterOptions, HistoricalPage, HookEvent, StoredEvent},
};

const EVENT_COLUMNS: &str =
    "id, source_app, session_id, hook_event_type, tool_name, payload, chat, summary, timestamp";

/// Append-only event store. Readers may share it freely; only the ingestion
/// dispatcher writes.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persists `event`, assigning an id and, when absent, the current time.
    pub async fn insert_event(&self, event: &HookEvent) -> Result<StoredEvent> {
        let missing = event.missing_fields();
        if !missing.is_empty() {
            return Err(ApiException::new(
                ErrorCode::Validation,
                format!("missing required fields: {}", missing.join(", ")),
            )
            .into());
        }

        let timestamp = event
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let tool_name = event.resolved_tool_name();
        let payload =
            serde_json::to_string(&event.payload).context("failed to encode event payload")?;
        let chat = event
            .chat
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode event chat")?;

        let rec = sqlx::query(
            "INSERT INTO events (source_app, session_id, hook_event_type, tool_name, payload, chat, summary, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&event.source_app)
        .bind(&event.session_id)
        .bind(&event.hook_event_type)
        .bind(tool_name.as_deref())
        .bind(&payload)
        .bind(chat.as_deref())
        .bind(event.summary.as_deref())
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert event")?;

        Ok(StoredEvent {
            id: EventId(rec.get::<i64, _>(0)),
            source_app: event.source_app.clone(),
            session_id: event.session_id.clone(),
            hook_event_type: event.hook_event_type.clone(),
            tool_name,
            payload: event.payload.clone(),
            chat: event.chat.clone(),
            summary: event.summary.clone(),
            timestamp,
        })
    }

    /// The newest `limit` events, returned oldest first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             ORDER BY timestamp DESC, id DESC
             LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to load recent events")?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    /// Up to `limit` events strictly older than `before` (epoch ms), newest first.
    pub async fn historical_events(&self, before: i64, limit: u32) -> Result<HistoricalPage> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             WHERE timestamp < ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ?"
        ))
        .bind(before)
        .bind(i64::from(limit) + 1)
        .fetch_all(&self.pool)
        .await
        .context("failed to load historical events")?;

        let has_more = rows.len() > limit as usize;
        let events = rows
            .iter()
            .take(limit as usize)
            .map(event_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(HistoricalPage { events, has_more })
    }

    pub async fn filter_options(&self) -> Result<FilterOptions> {
        Ok(FilterOptions {
            source_apps: self.distinct("source_app").await?,
            session_ids: self.distinct("session_id").await?,
            hook_event_types: self.distinct("hook_event_type").await?,
            tool_names: self.distinct("tool_name").await?,
        })
    }

    pub async fn count_events(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .context("failed to count events")
    }

    // `column` is always one of the fixed names above, never caller input.
    async fn distinct(&self, column: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {column} FROM events WHERE {column} IS NOT NULL ORDER BY {column} ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list distinct {column}"))?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }
}

fn event_from_row(row: &SqliteRow) -> Result<StoredEvent> {
    let id = row.get::<i64, _>(0);
    let payload: Value = serde_json::from_str(&row.get::<String, _>(5))
        .with_context(|| format!("event {id} has a malformed payload"))?;
    let chat = row
        .get::<Option<String>, _>(6)
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .with_context(|| format!("event {id} has a malformed chat"))?;

    Ok(StoredEvent {
        id: EventId(id),
        source_app: row.get::<String, _>(1),
        session_id: row.get::<String, _>(2),
        hook_event_type: row.get::<String, _>(3),
        tool_name: row.get::<Option<String>, _>(4),
        payload,
        chat,
        summary: row.get::<Option<String>, _>(7),
        timestamp: row.get::<i64, _>(8),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
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
#[path = "tests/lib_tests.rs"]
mod tests;
