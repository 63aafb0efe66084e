//! Per-room presence roster and cursor coalescing

use super::clock::PresenceClock;
use super::{AWAY_AFTER, CURSOR_COALESCE_WINDOW, REMOVE_AFTER};
use crate::{NodeId, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a user's cursor sits: a node in the design document, plus an
/// optional field offset for text-bearing attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub node_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// An id-addressed selection (never index-based)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Away,
}

/// Live awareness state of one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub last_seen: DateTime<Utc>,
    /// LWW clock; higher wins
    pub clock: u64,
}

/// Broadcastable presence change. `presence: None` means the user left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub presence: Option<UserPresence>,
    pub clock: u64,
}

/// Result of a staleness sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepOutcome {
    pub marked_away: Vec<UserId>,
    pub removed: Vec<UserId>,
}

/// Tracks presence for every participant in one room.
/// One record per (room, user); updates are LWW by clock.
#[derive(Debug)]
pub struct PresenceTracker {
    user_id: UserId,
    roster: HashMap<UserId, UserPresence>,
    clock: PresenceClock,
}

impl PresenceTracker {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            roster: HashMap::new(),
            clock: PresenceClock::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn roster(&self) -> &HashMap<UserId, UserPresence> {
        &self.roster
    }

    pub fn get(&self, user_id: &str) -> Option<&UserPresence> {
        self.roster.get(user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.roster.len()
    }

    /// Record a local heartbeat with optional cursor/selection; returns
    /// the update to broadcast
    pub fn heartbeat(
        &mut self,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        now: DateTime<Utc>,
    ) -> PresenceUpdate {
        let clock = self.clock.tick();
        let presence = UserPresence {
            user_id: self.user_id.clone(),
            status: PresenceStatus::Active,
            cursor,
            selection,
            last_seen: now,
            clock,
        };
        self.roster.insert(self.user_id.clone(), presence.clone());
        PresenceUpdate {
            user_id: self.user_id.clone(),
            presence: Some(presence),
            clock,
        }
    }

    /// Apply a remote presence update; stale clocks are ignored
    pub fn apply_update(&mut self, update: PresenceUpdate) {
        self.clock.observe(update.clock);

        match update.presence {
            Some(presence) => {
                let newer = self
                    .roster
                    .get(&update.user_id)
                    .map(|existing| update.clock > existing.clock)
                    .unwrap_or(true);
                if newer {
                    self.roster.insert(update.user_id, presence);
                }
            }
            None => {
                self.roster.remove(&update.user_id);
            }
        }
    }

    /// Update to broadcast when the local user leaves the room
    pub fn leave_update(&self) -> PresenceUpdate {
        PresenceUpdate {
            user_id: self.user_id.clone(),
            presence: None,
            clock: self.clock.tick(),
        }
    }

    /// Time-driven staleness pass: 30 s of silence marks a user away,
    /// 5 min drops them from the roster
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepOutcome {
        let away_cutoff = ChronoDuration::from_std(AWAY_AFTER).unwrap_or(ChronoDuration::zero());
        let remove_cutoff =
            ChronoDuration::from_std(REMOVE_AFTER).unwrap_or(ChronoDuration::zero());

        let mut outcome = SweepOutcome::default();

        self.roster.retain(|user_id, presence| {
            let silence = now.signed_duration_since(presence.last_seen);
            if silence >= remove_cutoff {
                outcome.removed.push(user_id.clone());
                return false;
            }
            if silence >= away_cutoff && presence.status == PresenceStatus::Active {
                presence.status = PresenceStatus::Away;
                outcome.marked_away.push(user_id.clone());
            }
            true
        });

        outcome.marked_away.sort();
        outcome.removed.sort();
        if !outcome.removed.is_empty() {
            tracing::debug!(removed = outcome.removed.len(), "presence sweep removed users");
        }
        outcome
    }
}

/// Source-side rate limiter for cursor/selection updates.
/// At most one update leaves per window; intermediate updates are
/// coalesced, last write kept.
#[derive(Debug)]
pub struct CursorCoalescer {
    window: ChronoDuration,
    last_sent: Option<DateTime<Utc>>,
    held: Option<PresenceUpdate>,
}

impl CursorCoalescer {
    pub fn new() -> Self {
        Self {
            window: ChronoDuration::from_std(CURSOR_COALESCE_WINDOW)
                .unwrap_or(ChronoDuration::zero()),
            last_sent: None,
            held: None,
        }
    }

    /// Offer an update; returns it when the window allows transmission,
    /// otherwise holds it (replacing any previously held one)
    pub fn offer(&mut self, update: PresenceUpdate, now: DateTime<Utc>) -> Option<PresenceUpdate> {
        let ready = match self.last_sent {
            Some(sent) => now.signed_duration_since(sent) >= self.window,
            None => true,
        };
        if ready {
            self.last_sent = Some(now);
            self.held = None;
            Some(update)
        } else {
            self.held = Some(update);
            None
        }
    }

    /// Release the held update once the window has elapsed
    pub fn flush(&mut self, now: DateTime<Utc>) -> Option<PresenceUpdate> {
        let update = self.held.take()?;
        match self.last_sent {
            Some(sent) if now.signed_duration_since(sent) < self.window => {
                self.held = Some(update);
                None
            }
            _ => {
                self.last_sent = Some(now);
                Some(update)
            }
        }
    }
}

impl Default for CursorCoalescer {
    fn default() -> Self {
        Self::new()
    }
}
