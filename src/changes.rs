// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-notification fan-out.
//!
//! Each database owns one [`ChangeBroker`]. The store posts a
//! [`ChangeEvent`] for every committed revision; subscribers (the
//! `_changes` feeds, the pusher's inbox, continuous `_active_tasks`
//! observers hang off a different channel) receive owned copies in commit
//! order. Unsubscribing is dropping the receiver — long-lived HTTP
//! responses detach by letting their receiver fall out of scope when the
//! connection closes.
//!
//! A slow subscriber that falls more than the channel capacity behind is
//! lagged rather than blocking the store; feed handlers recover by
//! re-reading `changes_since` from their last seen sequence.

use crate::revision::Revision;
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per subscriber before lagging kicks in.
const BROKER_CAPACITY: usize = 1024;

/// A committed change, broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The revision that was committed (bodiless stub plus sequence).
    pub revision: Revision,
    /// The document's winning revision ID after this commit.
    pub winning_rev_id: String,
    /// Whether the document is in conflict after this commit.
    pub in_conflict: bool,
    /// Set when the change arrived via replication rather than a local
    /// write (pullers tag their inserts so pushers can skip echoes).
    pub source: Option<String>,
}

impl ChangeEvent {
    /// Whether this change moved the document's winning revision.
    pub fn is_winner(&self) -> bool {
        self.revision.rev_id == self.winning_rev_id
    }
}

/// Per-database broadcast channel for change events.
pub struct ChangeBroker {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROKER_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future changes. Events posted before this call are not
    /// replayed; catch up with `Database::changes_since` first.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Post a change to all current subscribers.
    pub fn post(&self, event: ChangeEvent) {
        trace!(
            doc_id = %event.revision.doc_id,
            rev_id = %event.revision.rev_id,
            seq = event.revision.sequence_or_zero(),
            "Change posted"
        );
        // Err means no subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBroker {
    fn default() -> Self {
        Self::new()
    }
}
