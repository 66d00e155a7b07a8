//! Per-source-app lanes built from the emission stream.

use std::collections::{HashMap, HashSet};

use shared::{
    preferences::SwimlanePreferences,
    protocol::{GroupedEvent, LaneEntry, LaneSummary, ProjectLane, StoredEvent},
};

use crate::Emission;

pub const DEFAULT_MAX_LANE_ENTRIES: usize = 500;

#[derive(Debug)]
pub struct SwimlaneOrganizer {
    lanes: HashMap<String, ProjectLane>,
    /// Display order; may name apps that have no lane yet.
    order: Vec<String>,
    pinned: HashSet<String>,
    collapsed: HashSet<String>,
    max_entries: usize,
}

impl Default for SwimlaneOrganizer {
    fn default() -> Self {
        Self::new(&SwimlanePreferences::default(), DEFAULT_MAX_LANE_ENTRIES)
    }
}

impl SwimlaneOrganizer {
    pub fn new(prefs: &SwimlanePreferences, max_entries: usize) -> Self {
        let mut organizer = Self {
            lanes: HashMap::new(),
            order: Vec::new(),
            pinned: prefs.pinned_lanes.iter().cloned().collect(),
            collapsed: prefs.collapsed_lanes.iter().cloned().collect(),
            max_entries: max_entries.max(1),
        };
        organizer.reorder(&prefs.lane_order);
        organizer
    }

    /// Each emission accounts for exactly one newly arrived event.
    pub fn on_emission(&mut self, emission: &Emission) {
        match emission {
            Emission::Passthrough(event) => self.append_event(event),
            Emission::GroupStarted(group) | Emission::GroupUpdated(group) => {
                self.upsert_group(group)
            }
        }
    }

    pub fn set_pinned(&mut self, source_app: &str, pinned: bool) {
        if pinned {
            self.pinned.insert(source_app.to_string());
        } else {
            self.pinned.remove(source_app);
        }
        if let Some(lane) = self.lanes.get_mut(source_app) {
            lane.is_pinned = pinned;
        }
    }

    pub fn set_collapsed(&mut self, source_app: &str, collapsed: bool) {
        if collapsed {
            self.collapsed.insert(source_app.to_string());
        } else {
            self.collapsed.remove(source_app);
        }
        if let Some(lane) = self.lanes.get_mut(source_app) {
            lane.is_collapsed = collapsed;
        }
    }

    /// Puts the named apps first, in the given order; the rest keep their relative order.
    pub fn reorder(&mut self, source_app_order: &[String]) {
        let mut seen = HashSet::new();
        let mut order: Vec<String> = source_app_order
            .iter()
            .filter(|app| seen.insert(app.as_str()))
            .cloned()
            .collect();
        order.extend(
            self.order
                .iter()
                .filter(|app| !seen.contains(app.as_str()))
                .cloned(),
        );
        self.order = order;
    }

    pub fn lane(&self, source_app: &str) -> Option<&ProjectLane> {
        self.lanes.get(source_app)
    }

    /// Lanes in display order: pinned lanes first, each part in lane order.
    pub fn lanes(&self) -> Vec<&ProjectLane> {
        let (mut pinned, rest): (Vec<&ProjectLane>, Vec<&ProjectLane>) = self
            .order
            .iter()
            .filter_map(|app| self.lanes.get(app))
            .partition(|lane| lane.is_pinned);
        pinned.extend(rest);
        pinned
    }

    pub fn summaries(&self) -> Vec<LaneSummary> {
        self.lanes().into_iter().map(LaneSummary::from).collect()
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    fn lane_mut(&mut self, source_app: &str) -> &mut ProjectLane {
        if !self.order.iter().any(|app| app == source_app) {
            self.order.push(source_app.to_string());
        }
        let is_pinned = self.pinned.contains(source_app);
        let is_collapsed = self.collapsed.contains(source_app);
        self.lanes
            .entry(source_app.to_string())
            .or_insert_with(|| ProjectLane {
                source_app: source_app.to_string(),
                events: Vec::new(),
                last_activity: 0,
                event_count: 0,
                is_pinned,
                is_collapsed,
            })
    }

    fn append_event(&mut self, event: &StoredEvent) {
        let max_entries = self.max_entries;
        let lane = self.lane_mut(&event.source_app);
        lane.events.push(LaneEntry::Event(event.clone()));
        lane.event_count += 1;
        lane.last_activity = lane.last_activity.max(event.timestamp);
        trim(lane, max_entries);
    }

    fn upsert_group(&mut self, group: &GroupedEvent) {
        let max_entries = self.max_entries;
        let lane = self.lane_mut(&group.source_app);

        let existing = lane.events.iter().position(|entry| {
            matches!(entry, LaneEntry::Group(current) if current.key() == group.key())
        });
        if let Some(position) = existing {
            lane.events[position] = LaneEntry::Group(group.clone());
        } else {
            // Replace the members already shown individually, keeping the slot of the
            // earliest one.
            let is_member = |entry: &LaneEntry| match entry {
                LaneEntry::Event(event) => group.contains(event.id),
                LaneEntry::Group(_) => false,
            };
            let first_member = lane.events.iter().position(is_member);
            lane.events.retain(|entry| !is_member(entry));
            let position = first_member.unwrap_or(lane.events.len());
            lane.events.insert(position, LaneEntry::Group(group.clone()));
        }

        lane.event_count += 1;
        lane.last_activity = lane.last_activity.max(group.group_meta.time_range.1);
        trim(lane, max_entries);
    }
}

fn trim(lane: &mut ProjectLane, max_entries: usize) {
    if lane.events.len() > max_entries {
        let excess = lane.events.len() - max_entries;
        lane.events.drain(..excess);
    }
}

#[cfg(test)]
#[path = "tests/swimlanes_tests.rs"]
mod tests;
