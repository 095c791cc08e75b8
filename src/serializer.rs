//! Graph serializer: local entity graph to record trees and back.
//!
//! Walk order is fixed (relationship names lexically, targets in insertion
//! order) on both sides, so an unchanged graph always serializes to the same
//! bytes and the receiver sees every inline definition before any bare
//! reference to it.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::identity::IdentityRegistry;
use crate::persistence::LocalStore;
use crate::protocol::{Record, RecordRef};
use crate::resolver::{ConflictResolver, Resolution};
use crate::tracker::ApplyReport;
use crate::types::{EntityId, EventType, Trackable};

/// Per-transmission state used while merging incoming records.
pub struct MergeContext<'a> {
    registry: &'a mut IdentityRegistry,
    resolver: ConflictResolver,
    defined: HashSet<EntityId>,
    report: ApplyReport,
}

impl<'a> MergeContext<'a> {
    pub fn new(registry: &'a mut IdentityRegistry) -> Self {
        Self {
            registry,
            resolver: ConflictResolver::new(),
            defined: HashSet::new(),
            report: ApplyReport::default(),
        }
    }

    pub fn report(&self) -> &ApplyReport {
        &self.report
    }

    pub fn into_report(self) -> ApplyReport {
        self.report
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphSerializer;

impl GraphSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Serialize the graph reachable from `root`.
    ///
    /// Entities already in `visited` come back as bare references, which both
    /// breaks cycles and collapses shared children to a single inline record.
    pub fn serialize<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        registry: &IdentityRegistry,
        root: EntityId,
        visited: &mut HashSet<EntityId>,
    ) -> Result<RecordRef> {
        if visited.contains(&root) {
            return Ok(RecordRef::Reference(root));
        }

        let entity = registry
            .resolve(&root)
            .and_then(|key| store.entity(key))
            .ok_or(SyncError::UnresolvedReference(root))?;
        visited.insert(root);

        let mut relationships = BTreeMap::new();
        for (name, targets) in entity.relationships() {
            let mut refs = Vec::with_capacity(targets.len());
            for target in targets {
                if !registry.is_known(target) {
                    warn!(
                        entity = %root,
                        relationship = %name,
                        target = %target,
                        "Skipping relationship target missing from the store"
                    );
                    continue;
                }
                refs.push(self.serialize(store, registry, *target, visited)?);
            }
            if !refs.is_empty() {
                relationships.insert(name.clone(), refs);
            }
        }

        Ok(RecordRef::Inline(Box::new(Record {
            id: entity.id(),
            type_name: entity.type_name().to_string(),
            update_time: entity.tracking().update_time(),
            event_type: entity.tracking().event_type(),
            attributes: entity.attributes().clone(),
            relationships,
        })))
    }

    /// Serialize a set of changed roots into one transmission. Roots already
    /// emitted inline under an earlier root are not repeated.
    pub fn serialize_delta<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        registry: &IdentityRegistry,
        roots: &[EntityId],
    ) -> Result<Vec<Record>> {
        let mut visited = HashSet::new();
        let mut records = Vec::with_capacity(roots.len());
        for root in roots {
            if visited.contains(root) {
                continue;
            }
            if let RecordRef::Inline(record) = self.serialize(store, registry, *root, &mut visited)? {
                records.push(*record);
            }
        }
        debug!(
            roots = roots.len(),
            records = records.len(),
            entities = visited.len(),
            "Serialized delta"
        );
        Ok(records)
    }

    /// Check a whole transmission before any of it is applied: every bare
    /// reference must follow the inline definition of its target, and no
    /// entity may be defined inline twice.
    pub fn validate(&self, records: &[Record]) -> Result<()> {
        let mut defined = HashSet::new();
        for record in records {
            Self::validate_record(record, &mut defined)?;
        }
        Ok(())
    }

    fn validate_record(record: &Record, defined: &mut HashSet<EntityId>) -> Result<()> {
        if !defined.insert(record.id) {
            return Err(SyncError::MalformedPayload(format!(
                "entity {} is defined inline more than once",
                record.id
            )));
        }
        for refs in record.relationships.values() {
            for item in refs {
                match item {
                    RecordRef::Reference(id) if !defined.contains(id) => {
                        return Err(SyncError::UnresolvedReference(*id));
                    }
                    RecordRef::Reference(_) => {}
                    RecordRef::Inline(child) => Self::validate_record(child, defined)?,
                }
            }
        }
        Ok(())
    }

    /// Merge one record tree into the store and return the identity of its
    /// root.
    ///
    /// Known identities are updated in place under the conflict policy;
    /// unknown ones are created with the incoming identity and marked as
    /// remote-origin. Callers should [`validate`](Self::validate) the whole
    /// transmission first and run this inside a store transaction.
    pub fn deserialize<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        item: &RecordRef,
        ctx: &mut MergeContext<'_>,
    ) -> Result<EntityId> {
        match item {
            RecordRef::Reference(id) => {
                if ctx.defined.contains(id) && ctx.registry.is_known(id) {
                    Ok(*id)
                } else {
                    Err(SyncError::UnresolvedReference(*id))
                }
            }
            RecordRef::Inline(record) => self.merge_record(store, record, ctx),
        }
    }

    /// [`deserialize`](Self::deserialize) for a top-level record.
    pub fn deserialize_record<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        record: &Record,
        ctx: &mut MergeContext<'_>,
    ) -> Result<EntityId> {
        self.merge_record(store, record, ctx)
    }

    fn merge_record<S: LocalStore + ?Sized>(
        &self,
        store: &mut S,
        record: &Record,
        ctx: &mut MergeContext<'_>,
    ) -> Result<EntityId> {
        let id = record.id;
        if !ctx.defined.insert(id) {
            return Err(SyncError::MalformedPayload(format!(
                "entity {} is defined inline more than once",
                id
            )));
        }

        // Bind the identity before walking children so that a cycle closing
        // back on this record resolves to it.
        let (key, existing) = match ctx.registry.resolve(&id) {
            Some(key) => {
                let entity = store.entity(key).ok_or_else(|| {
                    SyncError::Storage(anyhow::anyhow!("Registered entity {} is missing", id))
                })?;
                if entity.type_name() != record.type_name {
                    return Err(SyncError::MalformedPayload(format!(
                        "entity {} is a {} locally but arrived as a {}",
                        id,
                        entity.type_name(),
                        record.type_name
                    )));
                }
                (key, Some(entity.tracking().clone()))
            }
            None => {
                let key = store.create_entity(
                    id,
                    &record.type_name,
                    Trackable::new_remote(record.update_time, record.event_type),
                )?;
                ctx.registry.register(id, key)?;
                (key, None)
            }
        };

        let mut relationships = BTreeMap::new();
        for (name, refs) in &record.relationships {
            let mut targets = Vec::with_capacity(refs.len());
            for item in refs {
                let target = self.deserialize(store, item, ctx)?;
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            if !targets.is_empty() {
                relationships.insert(name.clone(), targets);
            }
        }

        let resolution = match &existing {
            None => Resolution::ApplyIncoming,
            Some(local) => {
                ctx.resolver
                    .resolve(id, local, record.update_time, record.event_type)
            }
        };

        let entity = store.entity_mut(key).ok_or_else(|| {
            SyncError::Storage(anyhow::anyhow!("Registered entity {} is missing", id))
        })?;
        match resolution {
            Resolution::ApplyIncoming => {
                entity.replace_contents(record.attributes.clone(), relationships);
                entity
                    .tracking_mut()
                    .apply_remote(record.update_time, record.event_type);
                if existing.is_some() {
                    ctx.report.updated += 1;
                } else {
                    ctx.report.created += 1;
                }
                if record.event_type == EventType::Deleted {
                    ctx.report.remote_deletions.push(id);
                }
            }
            Resolution::KeepLocal(conflict) => {
                debug!(
                    entity = %id,
                    local = %conflict.local_update_time,
                    incoming = %conflict.incoming_update_time,
                    "Incoming attributes older than local version, keeping local"
                );
                entity.union_relationships(relationships);
                ctx.report.conflicts.push(conflict);
            }
        }
        ctx.report.touched.push(id);

        Ok(id)
    }
}
