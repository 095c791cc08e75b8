//! Change tracking: what goes into an outbound delta, how an inbound delta is
//! applied, and when soft-deleted entities are finally removed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::identity::{new_id, IdentityRegistry};
use crate::persistence::LocalStore;
use crate::protocol::Record;
use crate::resolver::ConflictSkipped;
use crate::serializer::{GraphSerializer, MergeContext};
use crate::types::{Entity, EntityId, SyncState, Trackable};

/// Outcome of merging one inbound delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub conflicts: Vec<ConflictSkipped>,
    /// Entities deleted by the remote side during this merge.
    pub remote_deletions: Vec<EntityId>,
    /// Every entity an incoming record was merged into, in merge order.
    pub touched: Vec<EntityId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeTracker {
    serializer: GraphSerializer,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            serializer: GraphSerializer::new(),
        }
    }

    pub fn serializer(&self) -> &GraphSerializer {
        &self.serializer
    }

    // ========== Local mutations ==========

    /// Create a new entity with a fresh identity.
    pub fn create<S: LocalStore + ?Sized>(&self, store: &mut S, type_name: &str) -> Result<EntityId> {
        self.create_at(store, type_name, Utc::now())
    }

    pub fn create_at<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        type_name: &str,
        at: DateTime<Utc>,
    ) -> Result<EntityId> {
        let id = new_id();
        store.create_entity(id, type_name, Trackable::new_local(at))?;
        Ok(id)
    }

    /// Soft-delete an entity. It disappears from application queries but is
    /// kept until a sync acknowledges the deletion. Returns `false` if the
    /// identity is unknown.
    pub fn delete<S: LocalStore + ?Sized>(&self, store: &mut S, id: &EntityId) -> bool {
        self.delete_at(store, id, Utc::now())
    }

    pub fn delete_at<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        id: &EntityId,
        at: DateTime<Utc>,
    ) -> bool {
        match store.entity_by_id_mut(id) {
            Some(entity) => {
                entity.tracking_mut().mark_deleted(at);
                true
            }
            None => false,
        }
    }

    // ========== Outbound ==========

    /// Entities the remote side has not yet seen: never-sent (`Fresh`)
    /// entities, local changes (`Dirty`), soft deletions still awaiting
    /// purge, and in-flight entities changed after `since`. Entities whose
    /// last mutation was a merge stay `Clean` and are never echoed back,
    /// whatever their update time. Ordered by update time, then identity.
    pub fn collect_dirty<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        since: DateTime<Utc>,
    ) -> Vec<EntityId> {
        let mut dirty: Vec<(DateTime<Utc>, EntityId)> = store
            .keys()
            .into_iter()
            .filter_map(|key| store.entity(key))
            .filter(|entity| {
                let tracking = entity.tracking();
                match tracking.state() {
                    SyncState::Fresh | SyncState::Dirty | SyncState::Deleted => true,
                    SyncState::Syncing => tracking.update_time() > since,
                    SyncState::Clean | SyncState::Purged => false,
                }
            })
            .map(|entity| (entity.tracking().update_time(), entity.id()))
            .collect();
        dirty.sort();
        dirty.into_iter().map(|(_, id)| id).collect()
    }

    /// Move the given entities into `Syncing`. Identities are resolved
    /// through `registry`; ids it does not know are skipped.
    pub fn begin_sync<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        registry: &IdentityRegistry,
        ids: &[EntityId],
    ) {
        for id in ids {
            if let Some(entity) = resolve_mut(store, registry, id) {
                entity.tracking_mut().begin_sync();
            }
        }
    }

    /// Resolve `Syncing` to `Clean` (acknowledged) or back to `Dirty`.
    pub fn finish_sync<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        registry: &IdentityRegistry,
        ids: &[EntityId],
        acknowledged: bool,
    ) {
        for id in ids {
            if let Some(entity) = resolve_mut(store, registry, id) {
                entity.tracking_mut().finish_sync(acknowledged);
            }
        }
    }

    /// Return entities stranded in `Syncing` by an interrupted pass to
    /// `Dirty`.
    pub fn recover_interrupted<S: LocalStore + ?Sized>(&self, store: &mut S) -> usize {
        let mut recovered = 0;
        for key in store.keys() {
            if let Some(entity) = store.entity_mut(key) {
                if entity.tracking().state() == SyncState::Syncing {
                    entity.tracking_mut().finish_sync(false);
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            warn!(recovered, "Recovered entities from an interrupted sync pass");
        }
        recovered
    }

    // ========== Inbound ==========

    /// Validate and apply an inbound delta atomically: on any error the store
    /// and `registry` are left exactly as they were.
    pub fn apply_incoming<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        registry: &mut IdentityRegistry,
        records: &[Record],
    ) -> Result<ApplyReport> {
        store.begin()?;
        match self.merge(store, registry, records) {
            Ok(report) => match store.commit() {
                Ok(()) => Ok(report),
                Err(err) => {
                    store.rollback()?;
                    Err(err.into())
                }
            },
            Err(err) => {
                store.rollback()?;
                Err(err)
            }
        }
    }

    /// Apply an inbound delta inside a transaction the caller owns.
    ///
    /// The payload is validated before anything is written. `registry` is
    /// only updated if the whole merge succeeds.
    pub fn merge<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        registry: &mut IdentityRegistry,
        records: &[Record],
    ) -> Result<ApplyReport> {
        self.serializer.validate(records)?;

        let mut staged = registry.clone();
        let mut ctx = MergeContext::new(&mut staged);
        for record in records {
            self.serializer.deserialize_record(store, record, &mut ctx)?;
        }
        let report = ctx.into_report();

        // Remote origin only marks entities while their delta is applied.
        for id in &report.touched {
            if let Some(entity) = resolve_mut(store, &staged, id) {
                entity.tracking_mut().clear_remote_origin();
            }
        }
        *registry = staged;

        if !report.conflicts.is_empty() {
            info!(
                skipped = report.conflicts.len(),
                "Kept newer local versions over incoming records"
            );
        }
        debug!(
            created = report.created,
            updated = report.updated,
            deleted = report.remote_deletions.len(),
            "Merged inbound delta"
        );
        Ok(report)
    }

    /// Physically remove soft-deleted entities whose deletion the remote side
    /// acknowledged, and drop every edge that pointed at them. Entities that
    /// are not flagged as deleted are left alone.
    pub fn purge<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        registry: &mut IdentityRegistry,
        acknowledged: &HashSet<EntityId>,
    ) -> Result<Vec<EntityId>> {
        let mut purged = Vec::new();
        for id in acknowledged {
            let Some(key) = registry.resolve(id) else {
                continue;
            };
            let Some(entity) = store.entity_mut(key) else {
                continue;
            };
            if !entity.is_deleted() {
                continue;
            }
            entity.tracking_mut().mark_purged();
            store.physically_delete(key).map_err(SyncError::Storage)?;
            registry.forget(id);
            purged.push(*id);
        }

        if purged.is_empty() {
            return Ok(purged);
        }

        let gone: HashSet<EntityId> = purged.iter().copied().collect();
        for key in store.keys() {
            if let Some(entity) = store.entity_mut(key) {
                entity.strip_references(&gone);
            }
        }
        purged.sort();
        info!(purged = purged.len(), "Purged acknowledged deletions");
        Ok(purged)
    }
}

fn resolve_mut<'a, S: LocalStore + ?Sized>(
    store: &'a mut S,
    registry: &IdentityRegistry,
    id: &EntityId,
) -> Option<&'a mut Entity> {
    registry
        .resolve(id)
        .and_then(|key| store.entity_mut(key))
        .filter(|entity| entity.id() == *id)
}
