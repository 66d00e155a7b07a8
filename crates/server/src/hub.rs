//! Single-writer dispatcher that owns the grouping engine, the swimlane organizer and
//! the live subscriber set. Every mutation goes through its command channel, so
//! ingestion, registration and ticks never interleave.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use grouping::{GroupingEngine, SwimlaneOrganizer};
use server_api::store_error;
use shared::{
    domain::ConnectionId,
    error::{ApiError, ErrorCode},
    preferences::{GroupingPreferences, SwimlanePreferences},
    protocol::{HookEvent, ProjectLane, ServerMessage, StoredEvent, TickPayload},
};
use storage::Storage;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 1_024;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub initial_snapshot_limit: u32,
    pub tick_interval: Duration,
    pub max_lane_entries: usize,
    pub swimlanes: SwimlanePreferences,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            initial_snapshot_limit: 200,
            tick_interval: Duration::from_secs(1),
            max_lane_entries: grouping::swimlanes::DEFAULT_MAX_LANE_ENTRIES,
            swimlanes: SwimlanePreferences::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("subscriber {0} is closed")]
    Closed(ConnectionId),
    #[error("subscriber {0} fell behind")]
    Overflow(ConnectionId),
}

/// Hub-side end of one subscriber. Frames are queued into a bounded buffer drained by
/// the subscriber's writer task; a full buffer counts as a failed send.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    frames: mpsc::Sender<Arc<str>>,
}

impl Connection {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (frames, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::new(),
                frames,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.frames.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Overflow(self.id),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub ticker_running: bool,
    pub tracked_groups: usize,
}

enum HubCommand {
    Ingest {
        event: HookEvent,
        reply: oneshot::Sender<Result<StoredEvent, ApiError>>,
    },
    Register {
        connection: Connection,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
    },
    Tick,
    Lanes {
        reply: oneshot::Sender<Vec<ProjectLane>>,
    },
    SetPinned {
        source_app: String,
        value: bool,
        reply: oneshot::Sender<()>,
    },
    SetCollapsed {
        source_app: String,
        value: bool,
        reply: oneshot::Sender<()>,
    },
    Reorder {
        order: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the dispatcher task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

fn unavailable() -> ApiError {
    ApiError::new(ErrorCode::Unavailable, "event hub is not running")
}

impl HubHandle {
    pub async fn ingest(&self, event: HookEvent) -> Result<StoredEvent, ApiError> {
        self.request(|reply| HubCommand::Ingest { event, reply }).await?
    }

    /// Adds `connection` to the live set once its initial snapshot has been queued.
    pub async fn register(&self, connection: Connection) -> Result<(), ApiError> {
        self.request(|reply| HubCommand::Register { connection, reply }).await
    }

    /// Safe to call for connections already removed after a failed send.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.commands.send(HubCommand::Unregister { id }).await;
    }

    pub async fn lanes(&self) -> Result<Vec<ProjectLane>, ApiError> {
        self.request(|reply| HubCommand::Lanes { reply }).await
    }

    pub async fn set_pinned(&self, source_app: String, value: bool) -> Result<(), ApiError> {
        self.request(|reply| HubCommand::SetPinned {
            source_app,
            value,
            reply,
        })
        .await
    }

    pub async fn set_collapsed(&self, source_app: String, value: bool) -> Result<(), ApiError> {
        self.request(|reply| HubCommand::SetCollapsed {
            source_app,
            value,
            reply,
        })
        .await
    }

    pub async fn reorder(&self, order: Vec<String>) -> Result<(), ApiError> {
        self.request(|reply| HubCommand::Reorder { order, reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, ApiError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }

    /// Stops the ticker and drops every subscriber. The store stays open for the caller
    /// to close afterwards.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| HubCommand::Shutdown { reply }).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| unavailable())?;
        rx.await.map_err(|_| unavailable())
    }
}

pub fn spawn(
    storage: Storage,
    grouping: watch::Receiver<GroupingPreferences>,
    config: HubConfig,
) -> HubHandle {
    let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
    let hub = Hub {
        organizer: SwimlaneOrganizer::new(&config.swimlanes, config.max_lane_entries),
        engine: GroupingEngine::new(),
        connections: HashMap::new(),
        ticker: None,
        storage,
        grouping,
        config,
        commands: commands.downgrade(),
    };
    tokio::spawn(hub.run(rx));
    HubHandle { commands }
}

struct Hub {
    storage: Storage,
    grouping: watch::Receiver<GroupingPreferences>,
    config: HubConfig,
    engine: GroupingEngine,
    organizer: SwimlaneOrganizer,
    connections: HashMap<ConnectionId, Connection>,
    ticker: Option<JoinHandle<()>>,
    commands: mpsc::WeakSender<HubCommand>,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Ingest { event, reply } => {
                    let _ = reply.send(self.ingest(event).await);
                }
                HubCommand::Register { connection, reply } => {
                    self.register(connection).await;
                    let _ = reply.send(());
                }
                HubCommand::Unregister { id } => self.unregister(id),
                HubCommand::Tick => self.tick(),
                HubCommand::Lanes { reply } => {
                    let lanes = self.organizer.lanes().into_iter().cloned().collect();
                    let _ = reply.send(lanes);
                }
                HubCommand::SetPinned {
                    source_app,
                    value,
                    reply,
                } => {
                    self.organizer.set_pinned(&source_app, value);
                    let _ = reply.send(());
                }
                HubCommand::SetCollapsed {
                    source_app,
                    value,
                    reply,
                } => {
                    self.organizer.set_collapsed(&source_app, value);
                    let _ = reply.send(());
                }
                HubCommand::Reorder { order, reply } => {
                    self.organizer.reorder(&order);
                    let _ = reply.send(());
                }
                HubCommand::Stats { reply } => {
                    let _ = reply.send(HubStats {
                        subscribers: self.connections.len(),
                        ticker_running: self.ticker.is_some(),
                        tracked_groups: self.engine.len(),
                    });
                }
                HubCommand::Shutdown { reply } => {
                    self.stop_ticker();
                    let dropped = self.connections.len();
                    self.connections.clear();
                    info!(dropped, "event hub stopped");
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.stop_ticker();
    }

    /// Store, classify, publish, organise. Nothing is broadcast unless the insert
    /// succeeded.
    async fn ingest(&mut self, event: HookEvent) -> Result<StoredEvent, ApiError> {
        let stored = self.storage.insert_event(&event).await.map_err(|err| {
            let err = store_error(err);
            warn!(source_app = %event.source_app, code = ?err.code, "event rejected");
            err
        })?;

        let prefs = self.grouping.borrow().clone();
        let emission = self.engine.classify(stored.clone(), &prefs);
        debug!(id = %stored.id, source_app = %emission.source_app(), "event ingested");
        self.publish(&emission.to_message());
        self.organizer.on_emission(&emission);
        Ok(stored)
    }

    async fn register(&mut self, connection: Connection) {
        let snapshot = match self
            .storage
            .recent_events(self.config.initial_snapshot_limit)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load initial snapshot");
                Vec::new()
            }
        };

        let Some(frame) = encode(&ServerMessage::Initial(snapshot)) else {
            return;
        };
        if let Err(err) = connection.send(frame) {
            warn!(%err, "subscriber dropped before initial snapshot");
            return;
        }

        let id = connection.id();
        self.connections.insert(id, connection);
        info!(connection_id = %id, subscribers = self.connections.len(), "subscriber connected");
        self.start_ticker();
    }

    fn unregister(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            info!(connection_id = %id, subscribers = self.connections.len(), "subscriber disconnected");
        }
        if self.connections.is_empty() {
            self.stop_ticker();
        }
    }

    fn tick(&mut self) {
        if self.connections.is_empty() {
            self.stop_ticker();
            return;
        }

        let now = Utc::now().timestamp_millis();
        let prefs = self.grouping.borrow().clone();
        let pruned = self.engine.prune_expired(now, &prefs);
        if pruned > 0 {
            debug!(pruned, "expired groups pruned");
        }

        let payload = TickPayload {
            timestamp: now,
            subscribers: self.connections.len(),
            open_groups: self.engine.open_group_count(now, &prefs),
            lanes: self.organizer.summaries(),
        };
        self.publish(&ServerMessage::Tick(payload));
    }

    fn publish(&mut self, message: &ServerMessage) {
        let Some(frame) = encode(message) else {
            return;
        };

        let failed: Vec<SendError> = self
            .connections
            .values()
            .filter_map(|connection| connection.send(Arc::clone(&frame)).err())
            .collect();
        for err in failed {
            let id = match err {
                SendError::Closed(id) | SendError::Overflow(id) => id,
            };
            warn!(%err, "removing subscriber");
            self.unregister(id);
        }
    }

    fn start_ticker(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let commands = self.commands.clone();
        let period = self.config.tick_interval;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands.send(HubCommand::Tick).await.is_err() {
                    break;
                }
            }
        }));
        debug!("ticker started");
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            debug!("ticker stopped");
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            error!(%err, "failed to encode hub message");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
