//! Bounded, deduplicated, newest-first incident list.
//!
//! The feed is the single owner of the incident list and its dedup id
//! set. All mutation goes through [`IncidentFeed::apply`],
//! [`IncidentFeed::set_state`], or [`IncidentFeed::bootstrap`];
//! consumers only ever see cloned snapshots.

use std::collections::HashSet;

use green_sentinel_incident_models::{Incident, IncidentState, StreamEvent};

/// In-memory view of the most recent incidents.
///
/// Invariants, held after every operation:
/// - at most `capacity` entries;
/// - no two entries share an id;
/// - newest-first order: fresh inserts go to the head, eviction removes
///   from the tail, and evicted ids leave the dedup set so the incident
///   can reappear later.
#[derive(Debug)]
pub struct IncidentFeed {
    capacity: usize,
    incidents: Vec<Incident>,
    ids: HashSet<i64>,
}

impl IncidentFeed {
    /// Creates an empty feed retaining at most `capacity` incidents.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            incidents: Vec::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Number of incidents currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    /// Whether the feed is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    /// Whether an incident with the given id is currently held.
    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// The incidents, newest first.
    #[must_use]
    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    /// Cloned snapshot of the incidents, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Incident> {
        self.incidents.clone()
    }

    /// Replaces the feed contents from a bootstrap page, deduplicating
    /// by id and applying the bound. Server order (newest first) is
    /// preserved.
    pub fn bootstrap(&mut self, page: Vec<Incident>) {
        self.incidents.clear();
        self.ids.clear();
        for incident in page {
            if self.incidents.len() >= self.capacity {
                break;
            }
            if self.ids.insert(incident.id) {
                self.incidents.push(incident);
            }
        }
    }

    /// Applies one stream event.
    ///
    /// Create and update share upsert semantics: an unseen id is
    /// prepended (evicting from the tail if the bound is exceeded), a
    /// known id is replaced in place, preserving its position. Whichever
    /// event for an id arrives last wins. Deletes of unknown ids are
    /// no-ops.
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Created(incident) | StreamEvent::Updated(incident) => {
                self.upsert(incident);
            }
            StreamEvent::Deleted { id } => self.remove(id),
        }
    }

    /// Optimistic local state change, used when the consumer has issued
    /// a transition request and does not wait for server confirmation.
    /// Unknown ids are ignored.
    pub fn set_state(&mut self, id: i64, state: IncidentState) {
        if let Some(incident) = self.incidents.iter_mut().find(|incident| incident.id == id) {
            incident.state = state;
        }
    }

    fn upsert(&mut self, incident: Incident) {
        if self.ids.contains(&incident.id) {
            if let Some(existing) = self
                .incidents
                .iter_mut()
                .find(|existing| existing.id == incident.id)
            {
                *existing = incident;
            }
            return;
        }

        self.ids.insert(incident.id);
        self.incidents.insert(0, incident);
        while self.incidents.len() > self.capacity {
            if let Some(evicted) = self.incidents.pop() {
                self.ids.remove(&evicted.id);
            }
        }
    }

    fn remove(&mut self, id: i64) {
        if self.ids.remove(&id) {
            self.incidents.retain(|incident| incident.id != id);
        }
    }
}
