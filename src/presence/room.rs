//! Collaboration rooms and membership events
//!
//! Membership changes are monotonic events, appended and broadcast,
//! never overwritten: the event log is the source of truth and the
//! member set is derived from it.

use crate::{DocumentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A join or leave, as it is broadcast to other participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MembershipEvent {
    Joined { user_id: UserId, at: DateTime<Utc> },
    Left { user_id: UserId, at: DateTime<Utc> },
}

impl MembershipEvent {
    pub fn user_id(&self) -> &str {
        match self {
            MembershipEvent::Joined { user_id, .. } | MembershipEvent::Left { user_id, .. } => {
                user_id
            }
        }
    }
}

/// One collaboration session scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub document_ids: BTreeSet<DocumentId>,
    pub settings: serde_json::Value,
    events: Vec<MembershipEvent>,
    members: BTreeSet<UserId>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document_ids: BTreeSet::new(),
            settings: serde_json::Value::Null,
            events: Vec::new(),
            members: BTreeSet::new(),
        }
    }

    pub fn members(&self) -> &BTreeSet<UserId> {
        &self.members
    }

    /// Full membership history, oldest first
    pub fn events(&self) -> &[MembershipEvent] {
        &self.events
    }

    /// Add a member. Returns the event to broadcast, or `None` if the
    /// user was already present (joins are not double-counted).
    pub fn join(&mut self, user_id: impl Into<UserId>, at: DateTime<Utc>) -> Option<MembershipEvent> {
        let user_id = user_id.into();
        if !self.members.insert(user_id.clone()) {
            return None;
        }
        let event = MembershipEvent::Joined { user_id, at };
        self.events.push(event.clone());
        Some(event)
    }

    /// Remove a member. Returns the event to broadcast, or `None` if the
    /// user was not a member.
    pub fn leave(&mut self, user_id: &str, at: DateTime<Utc>) -> Option<MembershipEvent> {
        if !self.members.remove(user_id) {
            return None;
        }
        let event = MembershipEvent::Left {
            user_id: user_id.to_string(),
            at,
        };
        self.events.push(event.clone());
        Some(event)
    }
}
