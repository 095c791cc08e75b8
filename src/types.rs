//! Entity and tracking types for the local object graph.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::identity::is_identity_token;

/// Stable, globally unique identity of an entity.
///
/// Parsing only accepts the canonical 8-4-4-4-12 hex form, so a string read
/// off the wire is either a well-formed identity or rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate a fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_identity_token(s) {
            return Err(format!("'{}' is not a canonical UUID", s));
        }
        Uuid::parse_str(s).map(Self).map_err(|e| e.to_string())
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Handle assigned by a local store to one stored entity. Distinct from the
/// entity's [`EntityId`], which is what travels between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalKey(pub u64);

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A typed scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Interpret a text value as an embedded identity reference.
    ///
    /// Attribute types are not declared on the wire, so callers use this to
    /// tell a cross-reference apart from an ordinary string.
    pub fn as_identity(&self) -> Option<EntityId> {
        match self {
            AttributeValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Kind of the last mutation applied to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

/// Where an entity sits in the sync lifecycle.
///
/// `Fresh → Dirty → Syncing → Clean`, with `Deleted → Purged` as the
/// alternate terminal path. A failed pass moves `Syncing` back to `Dirty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Fresh,
    Dirty,
    Syncing,
    Clean,
    Deleted,
    Purged,
}

/// Change-tracking metadata carried by every entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trackable {
    update_time: DateTime<Utc>,
    event_type: EventType,
    is_remote_origin: bool,
    flagged_as_deleted: bool,
    state: SyncState,
}

impl Trackable {
    /// Metadata for an entity created by a local action.
    pub fn new_local(at: DateTime<Utc>) -> Self {
        Self {
            update_time: at,
            event_type: EventType::Created,
            is_remote_origin: false,
            flagged_as_deleted: false,
            state: SyncState::Fresh,
        }
    }

    /// Metadata for an entity first seen in an incoming record.
    pub fn new_remote(at: DateTime<Utc>, event_type: EventType) -> Self {
        let deleted = event_type == EventType::Deleted;
        Self {
            update_time: at,
            event_type,
            is_remote_origin: true,
            flagged_as_deleted: deleted,
            state: if deleted {
                SyncState::Deleted
            } else {
                SyncState::Clean
            },
        }
    }

    pub fn update_time(&self) -> DateTime<Utc> {
        self.update_time
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn is_remote_origin(&self) -> bool {
        self.is_remote_origin
    }

    pub fn flagged_as_deleted(&self) -> bool {
        self.flagged_as_deleted
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Record a local mutation.
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.advance(at);
        self.is_remote_origin = false;
        if self.flagged_as_deleted {
            return;
        }
        // A created entity that never reached the remote stays `created`.
        let unsynced_create = self.event_type == EventType::Created
            && matches!(
                self.state,
                SyncState::Fresh | SyncState::Dirty | SyncState::Syncing
            );
        if !unsynced_create {
            self.event_type = EventType::Updated;
        }
        if self.state != SyncState::Fresh {
            self.state = SyncState::Dirty;
        }
    }

    /// Record a local deletion request. The entity stays stored until a
    /// successful sync acknowledges the deletion.
    pub(crate) fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.advance(at);
        self.is_remote_origin = false;
        self.flagged_as_deleted = true;
        self.event_type = EventType::Deleted;
        self.state = SyncState::Deleted;
    }

    /// Record the effect of an accepted incoming record.
    pub(crate) fn apply_remote(&mut self, at: DateTime<Utc>, event_type: EventType) {
        self.advance(at);
        self.is_remote_origin = true;
        self.event_type = event_type;
        if event_type == EventType::Deleted {
            self.flagged_as_deleted = true;
            self.state = SyncState::Deleted;
        } else {
            self.state = SyncState::Clean;
        }
    }

    pub(crate) fn clear_remote_origin(&mut self) {
        self.is_remote_origin = false;
    }

    /// `Fresh | Dirty → Syncing`. Deleted entities keep their state.
    pub(crate) fn begin_sync(&mut self) {
        if matches!(self.state, SyncState::Fresh | SyncState::Dirty) {
            self.state = SyncState::Syncing;
        }
    }

    /// `Syncing → Clean` on acknowledged success, `Syncing → Dirty` otherwise.
    pub(crate) fn finish_sync(&mut self, acknowledged: bool) {
        if self.state == SyncState::Syncing {
            self.state = if acknowledged {
                SyncState::Clean
            } else {
                SyncState::Dirty
            };
        }
    }

    pub(crate) fn mark_purged(&mut self) {
        self.state = SyncState::Purged;
    }

    fn advance(&mut self, at: DateTime<Utc>) {
        if at > self.update_time {
            self.update_time = at;
        }
    }
}

/// A synchronizable object in the local graph.
///
/// Relationships are stored as lists of identities rather than owning
/// pointers, so shared children and cycles need no special handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    id: EntityId,
    type_name: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    relationships: BTreeMap<String, Vec<EntityId>>,
    tracking: Trackable,
}

impl Entity {
    pub fn new(id: EntityId, type_name: impl Into<String>, tracking: Trackable) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            tracking,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn relationships(&self) -> &BTreeMap<String, Vec<EntityId>> {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> &[EntityId] {
        self.relationships
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn tracking(&self) -> &Trackable {
        &self.tracking
    }

    pub fn is_deleted(&self) -> bool {
        self.tracking.flagged_as_deleted
    }

    /// Text attributes that look like identities of other entities.
    pub fn embedded_references(&self) -> Vec<(&str, EntityId)> {
        self.attributes
            .iter()
            .filter_map(|(name, value)| value.as_identity().map(|id| (name.as_str(), id)))
            .collect()
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.set_attribute_at(name, value, Utc::now());
    }

    pub fn set_attribute_at(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
        at: DateTime<Utc>,
    ) {
        self.attributes.insert(name.into(), value.into());
        self.tracking.touch(at);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        let removed = self.attributes.remove(name);
        if removed.is_some() {
            self.tracking.touch(Utc::now());
        }
        removed
    }

    /// Append `target` to the named relationship, keeping insertion order.
    pub fn relate(&mut self, name: impl Into<String>, target: EntityId) {
        self.relate_at(name, target, Utc::now());
    }

    pub fn relate_at(&mut self, name: impl Into<String>, target: EntityId, at: DateTime<Utc>) {
        let targets = self.relationships.entry(name.into()).or_default();
        if !targets.contains(&target) {
            targets.push(target);
            self.tracking.touch(at);
        }
    }

    pub fn unrelate(&mut self, name: &str, target: EntityId) -> bool {
        let Some(targets) = self.relationships.get_mut(name) else {
            return false;
        };
        let before = targets.len();
        targets.retain(|t| *t != target);
        let removed = targets.len() != before;
        if targets.is_empty() {
            self.relationships.remove(name);
        }
        if removed {
            self.tracking.touch(Utc::now());
        }
        removed
    }

    pub(crate) fn tracking_mut(&mut self) -> &mut Trackable {
        &mut self.tracking
    }

    /// Overwrite the whole content with an accepted incoming version.
    pub(crate) fn replace_contents(
        &mut self,
        attributes: BTreeMap<String, AttributeValue>,
        relationships: BTreeMap<String, Vec<EntityId>>,
    ) {
        self.attributes = attributes;
        self.relationships = relationships;
    }

    /// Add relationship targets from a stale incoming version without
    /// dropping anything the local version has.
    pub(crate) fn union_relationships(&mut self, incoming: BTreeMap<String, Vec<EntityId>>) {
        for (name, targets) in incoming {
            let local = self.relationships.entry(name).or_default();
            for target in targets {
                if !local.contains(&target) {
                    local.push(target);
                }
            }
        }
    }

    /// Drop edges to entities that no longer exist. Does not count as a
    /// mutation: the remote already knows the targets are gone.
    pub(crate) fn strip_references(&mut self, gone: &std::collections::HashSet<EntityId>) {
        for targets in self.relationships.values_mut() {
            targets.retain(|t| !gone.contains(t));
        }
        self.relationships.retain(|_, targets| !targets.is_empty());
    }
}
