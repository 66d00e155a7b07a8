use serde::{Deserialize, Serialize};

pub const DEFAULT_TIME_WINDOW_MS: u64 = 3_000;
pub const DEFAULT_MIN_EVENTS_TO_GROUP: usize = 3;
pub const DEFAULT_MAX_GROUP_SIZE: usize = 50;

/// Grouping settings supplied by the settings layer. The engine never caches these;
/// callers hand the current value in with every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupingPreferences {
    pub enabled: bool,
    /// Milliseconds a group stays open after its last member.
    pub time_window: u64,
    pub min_events_to_group: usize,
    pub group_by_tool: bool,
    pub group_by_session: bool,
    pub group_by_event_type: bool,
    pub max_group_size: usize,
}

impl Default for GroupingPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            time_window: DEFAULT_TIME_WINDOW_MS,
            min_events_to_group: DEFAULT_MIN_EVENTS_TO_GROUP,
            group_by_tool: true,
            group_by_session: true,
            group_by_event_type: true,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwimlanePreferences {
    pub enabled: bool,
    pub show_empty_lanes: bool,
    /// Source apps in display order.
    pub lane_order: Vec<String>,
    pub pinned_lanes: Vec<String>,
    pub collapsed_lanes: Vec<String>,
}

impl Default for SwimlanePreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            show_empty_lanes: false,
            lane_order: Vec::new(),
            pinned_lanes: Vec::new(),
            collapsed_lanes: Vec::new(),
        }
    }
}
