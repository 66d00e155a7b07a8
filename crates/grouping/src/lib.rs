//! Windowed aggregation of hook events.
//!
//! [`GroupingEngine`] folds each arriving event into the open group for its
//! criteria key, or passes it through. [`SwimlaneOrganizer`] consumes the resulting
//! [`Emission`] stream and keeps per-source-app lanes.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use shared::{
    preferences::GroupingPreferences,
    protocol::{GroupKind, GroupMeta, GroupedEvent, ServerMessage, StoredEvent},
};
use tracing::debug;

pub mod chips;
pub mod swimlanes;

pub use swimlanes::SwimlaneOrganizer;

/// Chips kept per group; further distinct chips only bump the overflow count.
pub const MAX_CHIPS: usize = 8;

const WILDCARD: &str = "*";

/// The fields two events must share to be grouped. A field switched off in the
/// preferences is `None` and matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupingCriteria {
    pub source_app: String,
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub tool_name: Option<String>,
}

impl GroupingCriteria {
    pub fn for_event(event: &StoredEvent, prefs: &GroupingPreferences) -> Self {
        Self {
            source_app: event.source_app.clone(),
            session_id: prefs.group_by_session.then(|| event.session_id.clone()),
            event_type: prefs
                .group_by_event_type
                .then(|| event.hook_event_type.clone()),
            tool_name: if prefs.group_by_tool {
                event.tool_name.clone()
            } else {
                None
            },
        }
    }

    pub fn key(&self) -> String {
        [
            self.session_id.as_deref().unwrap_or(WILDCARD),
            self.source_app.as_str(),
            self.event_type.as_deref().unwrap_or(WILDCARD),
            self.tool_name.as_deref().unwrap_or(WILDCARD),
        ]
        .join("|")
    }
}

#[derive(Debug, Clone)]
pub struct EventGroup {
    id: String,
    criteria: GroupingCriteria,
    events: Vec<StoredEvent>,
    start_time: i64,
    end_time: i64,
    last_updated: i64,
    count: usize,
    chips: Vec<String>,
    overflow_chips: HashSet<String>,
    summary: Option<String>,
    closed: bool,
}

impl EventGroup {
    fn seed(criteria: GroupingCriteria, event: StoredEvent, max_group_size: usize) -> Self {
        // Keyed by the seeding event so same-millisecond reseeds stay distinct.
        let id = format!("{}#{}", criteria.key(), event.id);
        let mut group = Self {
            id,
            criteria,
            events: Vec::new(),
            start_time: event.timestamp,
            end_time: event.timestamp,
            last_updated: event.timestamp,
            count: 0,
            chips: Vec::new(),
            overflow_chips: HashSet::new(),
            summary: None,
            closed: false,
        };
        group.push(event, max_group_size);
        group
    }

    fn push(&mut self, event: StoredEvent, max_group_size: usize) {
        self.start_time = self.start_time.min(event.timestamp);
        self.end_time = self.end_time.max(event.timestamp);
        self.last_updated = self.end_time;

        if let Some(chip) = chips::derive_chip(&event.payload) {
            if !self.chips.contains(&chip) {
                if self.chips.len() < MAX_CHIPS {
                    self.chips.push(chip);
                } else {
                    self.overflow_chips.insert(chip);
                }
            }
        }
        if let Some(summary) = event
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|summary| !summary.is_empty())
        {
            self.summary = Some(summary.to_string());
        }

        self.events.push(event);
        self.count = self.events.len();
        if self.count >= max_group_size {
            self.closed = true;
        }
    }

    /// Whether the group may still take a member arriving at `now`.
    pub fn is_open(&self, now: i64, prefs: &GroupingPreferences) -> bool {
        !self.closed
            && self.count < prefs.max_group_size.max(1)
            && now.saturating_sub(self.last_updated) <= window_ms(prefs)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn criteria(&self) -> &GroupingCriteria {
        &self.criteria
    }

    pub fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    pub fn last_updated(&self) -> i64 {
        self.last_updated
    }

    pub fn chips(&self) -> &[String] {
        &self.chips
    }

    pub fn chip_overflow(&self) -> usize {
        self.overflow_chips.len()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// A fresh immutable projection of the group as it stands.
    pub fn snapshot(&self) -> GroupedEvent {
        // Groups are seeded with one event and never shrink.
        let latest = &self.events[self.events.len() - 1];
        GroupedEvent {
            source_app: latest.source_app.clone(),
            session_id: latest.session_id.clone(),
            hook_event_type: latest.hook_event_type.clone(),
            tool_name: latest.tool_name.clone(),
            payload: latest.payload.clone(),
            summary: self.summary.clone(),
            timestamp: self.start_time,
            is_group: true,
            group_meta: GroupMeta {
                group: GroupKind::Aggregate,
                count: self.count,
                time_range: (self.start_time, self.end_time),
                key: self.id.clone(),
                tool: self.criteria.tool_name.clone(),
                chips: self.chips.clone(),
                chip_overflow: self.chip_overflow(),
                children: self.events.clone(),
                summary: self.summary.clone(),
            },
        }
    }
}

/// Outcome of classifying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Passthrough(StoredEvent),
    /// The group just reached the visibility threshold; it supersedes the member
    /// events passed through before it.
    GroupStarted(GroupedEvent),
    GroupUpdated(GroupedEvent),
}

impl Emission {
    pub fn source_app(&self) -> &str {
        match self {
            Self::Passthrough(event) => &event.source_app,
            Self::GroupStarted(group) | Self::GroupUpdated(group) => &group.source_app,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        match self {
            Self::Passthrough(event) => ServerMessage::Event(event.clone()),
            Self::GroupStarted(group) => ServerMessage::GroupStarted(group.clone()),
            Self::GroupUpdated(group) => ServerMessage::GroupUpdated(group.clone()),
        }
    }
}

/// Holds at most one group per criteria key. Groups that are no longer open stay in
/// the map until the next lookup for their key replaces them, or until
/// [`GroupingEngine::prune_expired`] runs.
#[derive(Debug, Default)]
pub struct GroupingEngine {
    groups: HashMap<GroupingCriteria, EventGroup>,
}

impl GroupingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, event: StoredEvent, prefs: &GroupingPreferences) -> Emission {
        self.classify_at(event, prefs, Utc::now().timestamp_millis())
    }

    /// Classifies `event` as arriving at `now` (epoch ms). Events are taken in call
    /// order; their own timestamps never reorder or split groups.
    pub fn classify_at(
        &mut self,
        event: StoredEvent,
        prefs: &GroupingPreferences,
        now: i64,
    ) -> Emission {
        if !prefs.enabled {
            return Emission::Passthrough(event);
        }

        let criteria = GroupingCriteria::for_event(&event, prefs);
        let min_events = prefs.min_events_to_group.max(1);
        let max_group_size = prefs.max_group_size.max(1);

        if let Some(group) = self
            .groups
            .get_mut(&criteria)
            .filter(|group| group.is_open(now, prefs))
        {
            let was_visible = group.count >= min_events;
            group.push(event.clone(), max_group_size);

            if was_visible {
                return Emission::GroupUpdated(group.snapshot());
            }
            if group.count >= min_events {
                debug!(group = %group.id, count = group.count, "group started");
                return Emission::GroupStarted(group.snapshot());
            }
            return Emission::Passthrough(event);
        }

        let group = EventGroup::seed(criteria.clone(), event.clone(), max_group_size);
        let emission = if min_events <= 1 {
            debug!(group = %group.id, "group started");
            Emission::GroupStarted(group.snapshot())
        } else {
            Emission::Passthrough(event)
        };
        self.groups.insert(criteria, group);
        emission
    }

    pub fn group(&self, criteria: &GroupingCriteria) -> Option<&EventGroup> {
        self.groups.get(criteria)
    }

    pub fn groups(&self) -> impl Iterator<Item = &EventGroup> {
        self.groups.values()
    }

    pub fn open_group_count(&self, now: i64, prefs: &GroupingPreferences) -> usize {
        self.groups
            .values()
            .filter(|group| group.is_open(now, prefs))
            .count()
    }

    /// Drops groups that can no longer accept members. Returns how many were removed.
    pub fn prune_expired(&mut self, now: i64, prefs: &GroupingPreferences) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| group.is_open(now, prefs));
        before - self.groups.len()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn window_ms(prefs: &GroupingPreferences) -> i64 {
    i64::try_from(prefs.time_window).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
