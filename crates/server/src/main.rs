use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use server_api::{filter_options, historical_events, recent_events, validate_event, ApiContext};
use shared::{
    error::{ApiError, ErrorCode},
    preferences::GroupingPreferences,
    protocol::{FilterOptions, HistoricalPage, HookEvent, ProjectLane, StoredEvent},
};
use storage::Storage;
use tokio::{sync::watch, time};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod hub;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use hub::{Connection, HubHandle};

const MAX_BODY_BYTES: usize = 1024 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    before: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LaneOrderRequest {
    order: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    value: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (grouping, grouping_rx) = watch::channel(settings.grouping.clone());
    let hub = hub::spawn(storage.clone(), grouping_rx, settings.hub_config());
    let state = AppState {
        api: ApiContext {
            storage: storage.clone(),
        },
        hub: hub.clone(),
        grouping,
        subscriber_buffer: settings.subscriber_buffer,
        send_timeout: settings.send_timeout(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    storage.close().await;
    info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl-C once the hub has stopped its ticker and released subscribers.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    hub.shutdown().await;
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/events", post(http_ingest_event))
        .route("/events/recent", get(http_recent_events))
        .route("/events/historical", get(http_historical_events))
        .route("/events/filter-options", get(http_filter_options))
        .route(
            "/preferences/grouping",
            get(http_get_grouping).put(http_put_grouping),
        )
        .route("/lanes", get(http_lanes))
        .route("/lanes/order", put(http_reorder_lanes))
        .route("/lanes/:source_app/pinned", put(http_pin_lane))
        .route("/lanes/:source_app/collapsed", put(http_collapse_lane))
        .route("/stream", get(ws_handler))
        .fallback(not_found)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation | ErrorCode::InvalidCursor => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Store => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

/// Reports an unreadable JSON body in the same error shape as every other failure.
fn rejected(rejection: JsonRejection) -> (StatusCode, Json<ApiError>) {
    let body = ApiError::new(ErrorCode::Validation, rejection.body_text());
    (rejection.status(), Json(body))
}

async fn not_found() -> (StatusCode, Json<ApiError>) {
    failure(ApiError::new(ErrorCode::NotFound, "no such route"))
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    server_api::health_check(&state.api).await.map_err(failure)?;
    Ok("ok")
}

async fn http_ingest_event(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<HookEvent>, JsonRejection>,
) -> ApiResult<Json<StoredEvent>> {
    let Json(event) = payload.map_err(rejected)?;
    validate_event(&event).map_err(failure)?;
    let stored = state.hub.ingest(event).await.map_err(failure)?;
    Ok(Json(stored))
}

async fn http_recent_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecentQuery>,
) -> ApiResult<Json<Vec<StoredEvent>>> {
    let events = recent_events(&state.api, q.limit).await.map_err(failure)?;
    Ok(Json(events))
}

async fn http_historical_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoricalQuery>,
) -> ApiResult<Json<HistoricalPage>> {
    let page = historical_events(&state.api, q.before.as_deref(), q.limit)
        .await
        .map_err(failure)?;
    Ok(Json(page))
}

async fn http_filter_options(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<FilterOptions>> {
    let options = filter_options(&state.api).await.map_err(failure)?;
    Ok(Json(options))
}

async fn http_get_grouping(State(state): State<Arc<AppState>>) -> Json<GroupingPreferences> {
    Json(state.grouping.borrow().clone())
}

async fn http_put_grouping(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GroupingPreferences>, JsonRejection>,
) -> ApiResult<Json<GroupingPreferences>> {
    let Json(prefs) = payload.map_err(rejected)?;
    if prefs.max_group_size == 0 {
        return Err(failure(ApiError::new(
            ErrorCode::Validation,
            "maxGroupSize must be at least 1",
        )));
    }
    info!(
        enabled = prefs.enabled,
        time_window = prefs.time_window,
        min_events = prefs.min_events_to_group,
        "grouping preferences updated"
    );
    state.grouping.send_replace(prefs.clone());
    Ok(Json(prefs))
}

async fn http_lanes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ProjectLane>>> {
    let lanes = state.hub.lanes().await.map_err(failure)?;
    Ok(Json(lanes))
}

async fn http_reorder_lanes(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LaneOrderRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = payload.map_err(rejected)?;
    state.hub.reorder(req.order).await.map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_pin_lane(
    State(state): State<Arc<AppState>>,
    Path(source_app): Path<String>,
    payload: Result<Json<ToggleRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = payload.map_err(rejected)?;
    state
        .hub
        .set_pinned(source_app, req.value)
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_collapse_lane(
    State(state): State<Arc<AppState>>,
    Path(source_app): Path<String>,
    payload: Result<Json<ToggleRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(req) = payload.map_err(rejected)?;
    state
        .hub
        .set_collapsed(source_app, req.value)
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let (connection, mut frames) = Connection::new(state.subscriber_buffer);
    let connection_id = connection.id();
    if let Err(err) = state.hub.register(connection).await {
        warn!(%connection_id, message = %err.message, "subscriber rejected");
        return;
    }

    let (mut sender, mut receiver) = socket.split();
    let send_timeout = state.send_timeout;

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match time::timeout(send_timeout, sender.send(Message::Text(frame.to_string()))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%connection_id, %err, "subscriber write failed");
                    break;
                }
                Err(_) => {
                    warn!(%connection_id, "subscriber write timed out");
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
            debug!(%connection_id, "ignoring inbound subscriber message");
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(connection_id).await;
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
