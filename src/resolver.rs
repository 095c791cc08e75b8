use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EventType, Trackable};

/// An incoming version that lost to the local one. Informational only: the
/// pass still succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSkipped {
    pub id: EntityId,
    pub local_update_time: DateTime<Utc>,
    pub incoming_update_time: DateTime<Utc>,
}

/// What to do with an incoming record for an entity that already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Replace attributes and relationships with the incoming version.
    ApplyIncoming,
    /// Keep local attributes; relationship targets are still merged in.
    KeepLocal(ConflictSkipped),
}

/// Whole-entity last-write-wins by update time.
///
/// Deletions win eagerly: an incoming deletion beats a local update
/// regardless of timestamps, and a local deletion that has not been
/// propagated yet is never undone by an incoming update.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        id: EntityId,
        local: &Trackable,
        incoming_time: DateTime<Utc>,
        incoming_event: EventType,
    ) -> Resolution {
        let skipped = || {
            Resolution::KeepLocal(ConflictSkipped {
                id,
                local_update_time: local.update_time(),
                incoming_update_time: incoming_time,
            })
        };

        if incoming_event == EventType::Deleted {
            if local.event_type() == EventType::Updated || local.flagged_as_deleted() {
                return Resolution::ApplyIncoming;
            }
        } else if local.flagged_as_deleted() {
            return skipped();
        }

        if incoming_time < local.update_time() {
            skipped()
        } else {
            Resolution::ApplyIncoming
        }
    }
}
