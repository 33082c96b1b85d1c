//! Raw diff engine.
//!
//! Turns successive "who is online" snapshots into edge-triggered raw
//! observations. [`diff`] and [`selector_dropouts`] are pure; [`SiteDiff`]
//! carries the per-site snapshot between cycles.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::StatusKind;
use crate::sites::CheckResults;

/// One raw observation derived from a poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusEvent {
    pub entity_id: String,
    pub status: StatusKind,
}

impl StatusEvent {
    pub fn new(entity_id: impl Into<String>, status: StatusKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            status,
        }
    }
}

fn sorted_difference<'a>(a: &'a HashSet<String>, b: &HashSet<String>) -> Vec<&'a String> {
    let mut ids: Vec<&'a String> = a.iter().filter(|id| !b.contains(*id)).collect();
    ids.sort();
    ids
}

/// Offline for every id that left the online set, then Online for every id
/// that entered it. Each group is sorted by id.
pub fn diff(previous: &HashSet<String>, current: &HashSet<String>) -> Vec<StatusEvent> {
    let went_offline = sorted_difference(previous, current);
    let went_online = sorted_difference(current, previous);

    went_offline
        .into_iter()
        .map(|id| StatusEvent::new(id.clone(), StatusKind::Offline))
        .chain(
            went_online
                .into_iter()
                .map(|id| StatusEvent::new(id.clone(), StatusKind::Online)),
        )
        .collect()
}

/// Unknown for every id that was explicitly tracked and no longer is.
pub fn selector_dropouts(
    previous: &HashSet<String>,
    current: &HashSet<String>,
) -> Vec<StatusEvent> {
    sorted_difference(previous, current)
        .into_iter()
        .map(|id| StatusEvent::new(id.clone(), StatusKind::Unknown))
        .collect()
}

/// Per-site diff state.
#[derive(Debug, Clone, Default)]
pub struct SiteDiff {
    online: HashSet<String>,
    /// Ids whose last reported status was not-found, denied or ambiguous.
    detailed: HashMap<String, StatusKind>,
    selector: HashSet<String>,
}

impl SiteDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted raw statuses.
    pub fn from_raw(raw: HashMap<String, StatusKind>) -> Self {
        let mut state = Self::new();
        for (id, status) in raw {
            if status.is_online() {
                state.online.insert(id);
            } else if status.is_detailed() {
                state.detailed.insert(id, status);
            }
        }
        state
    }

    pub fn online(&self) -> &HashSet<String> {
        &self.online
    }

    /// Fold one cycle's results into the snapshot and return the observations
    /// to record.
    ///
    /// `selector` is the set of explicitly tracked ids for selective sites;
    /// ids that leave it are reported as unknown.
    pub fn observe(
        &mut self,
        results: &CheckResults,
        selector: Option<&HashSet<String>>,
    ) -> Vec<StatusEvent> {
        self.observe_partial(results, selector, &HashSet::new())
    }

    /// Like [`observe`](Self::observe), for a cycle in which the ids in
    /// `unanswered` could not be queried.
    ///
    /// An unanswered id keeps its previous online membership or detailed
    /// status and produces no event.
    pub fn observe_partial(
        &mut self,
        results: &CheckResults,
        selector: Option<&HashSet<String>>,
        unanswered: &HashSet<String>,
    ) -> Vec<StatusEvent> {
        let is_unanswered =
            |id: &String| unanswered.contains(id) && !results.statuses.contains_key(id);

        let mut current: HashSet<String> = results.online_ids().cloned().collect();
        current.extend(self.online.iter().filter(|id| is_unanswered(*id)).cloned());
        let mut events = diff(&self.online, &current);

        // Refine "left online" into the specific reason when one was reported.
        for event in &mut events {
            if event.status == StatusKind::Offline {
                if let Some(status) = results.statuses.get(&event.entity_id) {
                    if status.is_detailed() || *status == StatusKind::Unknown {
                        event.status = *status;
                    }
                }
            }
        }

        let mut seen: HashSet<String> = events.iter().map(|e| e.entity_id.clone()).collect();

        // Detailed statuses are reported every cycle so consecutive samples
        // can be counted.
        let current_detailed: BTreeMap<&String, StatusKind> = results
            .statuses
            .iter()
            .filter(|(_, status)| status.is_detailed())
            .map(|(id, status)| (id, *status))
            .collect();
        for (id, status) in &current_detailed {
            if seen.insert((*id).clone()) {
                events.push(StatusEvent::new((*id).clone(), *status));
            }
        }

        // Ids that stopped being detailed without coming online.
        let mut recovered: Vec<&String> = self
            .detailed
            .keys()
            .filter(|id| !current_detailed.contains_key(id) && !is_unanswered(*id))
            .collect();
        recovered.sort();
        for id in recovered {
            if seen.insert(id.clone()) {
                let status = match results.statuses.get(id) {
                    Some(StatusKind::Unknown) => StatusKind::Unknown,
                    _ => StatusKind::Offline,
                };
                events.push(StatusEvent::new(id.clone(), status));
            }
        }

        let carried: Vec<(String, StatusKind)> = self
            .detailed
            .iter()
            .filter(|(id, _)| is_unanswered(*id))
            .map(|(id, status)| (id.clone(), *status))
            .collect();

        self.online = current;
        self.detailed = current_detailed
            .into_iter()
            .map(|(id, status)| (id.clone(), status))
            .chain(carried)
            .collect();

        if let Some(selector) = selector {
            let dropouts = selector_dropouts(&self.selector, selector);
            for event in &dropouts {
                self.online.remove(&event.entity_id);
                self.detailed.remove(&event.entity_id);
            }
            events.retain(|e| !dropouts.iter().any(|d| d.entity_id == e.entity_id));
            events.extend(dropouts);
            self.selector = selector.clone();
        }

        events
    }
}
