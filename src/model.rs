//! Broadcaster models.
//!
//! A model is one broadcaster, identified by `uid`. The service reports
//! several partially-overlapping session snapshots per model; the model
//! keeps them all, keyed by `sid`, and selects a single "best" session as
//! the authoritative view.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::state::SessionState;

/// One observed property change on a model's best session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PropertyChange {
    pub property: String,
    pub previous: Option<Value>,
    pub next: Option<Value>,
}

/// A broadcaster and everything the server has told us about her.
#[derive(Debug, Clone)]
pub struct Model {
    uid: i64,
    sessions: BTreeMap<i64, SessionState>,
    best_session_id: i64,
    tags: BTreeSet<String>,
}

impl Model {
    pub(crate) fn new(uid: i64) -> Model {
        let mut sessions = BTreeMap::new();
        sessions.insert(0, SessionState::offline());
        Model { uid, sessions, best_session_id: 0, tags: BTreeSet::new() }
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn sessions(&self) -> &BTreeMap<i64, SessionState> {
        &self.sessions
    }

    pub fn best_session_id(&self) -> i64 {
        self.best_session_id
    }

    /// The authoritative session view. The synthetic offline session
    /// guarantees there is always one.
    pub fn best_session(&self) -> &SessionState {
        self.sessions
            .get(&self.best_session_id)
            .unwrap_or_else(|| &self.sessions[&0])
    }

    pub fn is_online(&self) -> bool {
        self.best_session_id != 0 && self.best_session().is_online()
    }

    pub fn name(&self) -> Option<&str> {
        self.best_session().name()
    }

    /// Overlay a session snapshot and report the property changes that
    /// became visible on the best session.
    ///
    /// The incoming `sid` keys the target slot (0 when absent, which is
    /// the synthetic offline slot). Offline sessions stay in the table
    /// through selection and are dropped afterwards unless still best.
    pub(crate) fn merge_session(&mut self, incoming: &SessionState) -> Vec<PropertyChange> {
        let previous_best = self.best_session().clone();

        let sid = incoming.sid();
        self.sessions
            .entry(sid)
            .or_default()
            .overlay(incoming);

        self.recompute_best_session();
        let current_best = self.best_session();

        let mut properties: Vec<String> = previous_best.effective_keys();
        properties.extend(current_best.effective_keys());
        properties.sort();
        properties.dedup();

        let changes = properties
            .into_iter()
            .filter_map(|property| {
                let previous = previous_best.effective(&property).cloned();
                let next = current_best.effective(&property).cloned();
                (previous != next).then_some(PropertyChange { property, previous, next })
            })
            .collect();

        self.drop_stale_sessions();
        changes
    }

    /// Union-insert tags; true when the set grew.
    pub(crate) fn merge_tags<I, S>(&mut self, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.tags.len();
        for tag in tags {
            self.tags.insert(tag.into());
        }
        self.tags.len() != before
    }

    // Best session: lexicographic max of (is_online, camscore, sid). The
    // synthetic sid-0 slot only wins when it is the sole session.
    fn recompute_best_session(&mut self) {
        self.best_session_id = self
            .sessions
            .iter()
            .filter(|(sid, _)| **sid != 0)
            .max_by(|(a_sid, a), (b_sid, b)| {
                rank_cmp(&session_rank(**a_sid, a), &session_rank(**b_sid, b))
            })
            .map(|(sid, _)| *sid)
            .unwrap_or(0);
    }

    fn drop_stale_sessions(&mut self) {
        let best = self.best_session_id;
        self.sessions
            .retain(|sid, session| *sid == 0 || *sid == best || session.is_online());
    }
}

// Ranking tuple: online beats offline, then camscore, then newest sid.
pub(crate) fn session_rank(sid: i64, session: &SessionState) -> (bool, f64, i64) {
    (session.is_online(), session.camscore(), sid)
}

pub(crate) fn rank_cmp(a: &(bool, f64, i64), b: &(bool, f64, i64)) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| a.1.total_cmp(&b.1))
        .then_with(|| a.2.cmp(&b.2))
}
