//! Presence - live awareness of who is editing what
//!
//! Presence is ephemeral and separate from document content:
//! - who is in the room
//! - cursor positions and selections
//! - active/away status
//!
//! Key differences from document sync:
//! - no persistence, no operation log
//! - last-write-wins per user via a simple increasing clock
//! - staleness is time-driven: 30 s without a heartbeat marks a user
//!   away, 5 min removes them from the roster
//! - cursor/selection updates are coalesced at the source (~50 ms)
//!   before they ever reach the transport

mod clock;
mod room;
mod roster;

pub use clock::PresenceClock;
pub use room::{MembershipEvent, Room};
pub use roster::{
    CursorCoalescer, CursorPosition, PresenceStatus, PresenceTracker, PresenceUpdate,
    SelectionRange, SweepOutcome, UserPresence,
};

use std::time::Duration;

/// No heartbeat for this long marks a user away
pub const AWAY_AFTER: Duration = Duration::from_secs(30);

/// No heartbeat for this long removes the user from the roster
pub const REMOVE_AFTER: Duration = Duration::from_secs(300);

/// Minimum spacing between transmitted cursor/selection updates
pub const CURSOR_COALESCE_WINDOW: Duration = Duration::from_millis(50);
