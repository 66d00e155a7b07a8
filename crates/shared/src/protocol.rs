use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::EventId;

/// An event as submitted by a producer. Required fields default to empty so that an
/// incomplete submission reaches validation instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    #[serde(default, alias = "sourceApp")]
    pub source_app: String,
    #[serde(default, alias = "sessionId")]
    pub session_id: String,
    #[serde(default, alias = "hookEventType")]
    pub hook_event_type: String,
    #[serde(default, alias = "toolName", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Epoch milliseconds; the store assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl HookEvent {
    pub fn new(
        source_app: impl Into<String>,
        session_id: impl Into<String>,
        hook_event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            source_app: source_app.into(),
            session_id: session_id.into(),
            hook_event_type: hook_event_type.into(),
            payload,
            ..Self::default()
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Names of required fields that are blank or absent.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.source_app.trim().is_empty() {
            missing.push("source_app");
        }
        if self.session_id.trim().is_empty() {
            missing.push("session_id");
        }
        if self.hook_event_type.trim().is_empty() {
            missing.push("hook_event_type");
        }
        if self.payload.is_null() {
            missing.push("payload");
        }
        missing
    }

    /// Explicit `tool_name`, falling back to `payload.tool_name` as hook scripts send it.
    pub fn resolved_tool_name(&self) -> Option<String> {
        self.tool_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.payload
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    pub source_app: String,
    pub session_id: String,
    pub hook_event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    #[default]
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMeta {
    pub group: GroupKind,
    pub count: usize,
    pub time_range: (i64, i64),
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub chips: Vec<String>,
    #[serde(default)]
    pub chip_overflow: usize,
    pub children: Vec<StoredEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Immutable snapshot of a group, shaped like an event so lanes can hold either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedEvent {
    pub source_app: String,
    pub session_id: String,
    pub hook_event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: i64,
    #[serde(rename = "isGroup")]
    pub is_group: bool,
    #[serde(rename = "groupMeta")]
    pub group_meta: GroupMeta,
}

impl GroupedEvent {
    pub fn key(&self) -> &str {
        &self.group_meta.key
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.group_meta.children.iter().any(|child| child.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LaneEntry {
    Group(GroupedEvent),
    Event(StoredEvent),
}

impl LaneEntry {
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Group(group) => group.group_meta.time_range.1,
            Self::Event(event) => event.timestamp,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectLane {
    pub source_app: String,
    pub events: Vec<LaneEntry>,
    pub last_activity: i64,
    pub event_count: usize,
    pub is_pinned: bool,
    pub is_collapsed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneSummary {
    pub source_app: String,
    pub last_activity: i64,
    pub event_count: usize,
    pub entry_count: usize,
    pub is_pinned: bool,
    pub is_collapsed: bool,
}

impl From<&ProjectLane> for LaneSummary {
    fn from(lane: &ProjectLane) -> Self {
        Self {
            source_app: lane.source_app.clone(),
            last_activity: lane.last_activity,
            event_count: lane.event_count,
            entry_count: lane.events.len(),
            is_pinned: lane.is_pinned,
            is_collapsed: lane.is_collapsed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickPayload {
    pub timestamp: i64,
    pub subscribers: usize,
    pub open_groups: usize,
    pub lanes: Vec<LaneSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub source_apps: Vec<String>,
    pub session_ids: Vec<String>,
    pub hook_event_types: Vec<String>,
    pub tool_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalPage {
    /// Newest first.
    pub events: Vec<StoredEvent>,
    pub has_more: bool,
}

/// Frames pushed to subscribers on the stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Initial(Vec<StoredEvent>),
    Event(StoredEvent),
    GroupStarted(GroupedEvent),
    GroupUpdated(GroupedEvent),
    Tick(TickPayload),
}
