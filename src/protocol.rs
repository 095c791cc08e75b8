//! Wire types exchanged with the remote endpoint.
//!
//! A transmission is a flat list of [`Record`] trees. Inside one transmission
//! each entity appears inline exactly once; every later mention of it is a
//! bare identity string.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AttributeValue, EntityId, EventType};

/// Value of `sync_response` signalling that the remote accepted the delta.
pub const DATA_SUCCESS: &str = "data_success";

/// Serialized form of one entity and its immediate relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: EntityId,
    pub type_name: String,
    pub update_time: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Vec<RecordRef>>,
}

impl Record {
    /// Identities of the direct relationship targets, per relationship.
    pub fn relationship_ids(&self) -> BTreeMap<String, Vec<EntityId>> {
        self.relationships
            .iter()
            .map(|(name, refs)| (name.clone(), refs.iter().map(RecordRef::id).collect()))
            .collect()
    }
}

/// A relationship target: the full record on first occurrence, the bare
/// identity afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordRef {
    Reference(EntityId),
    Inline(Box<Record>),
}

impl RecordRef {
    pub fn id(&self) -> EntityId {
        match self {
            RecordRef::Reference(id) => *id,
            RecordRef::Inline(record) => record.id,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, RecordRef::Reference(_))
    }

    pub fn as_inline(&self) -> Option<&Record> {
        match self {
            RecordRef::Inline(record) => Some(record),
            RecordRef::Reference(_) => None,
        }
    }
}

impl From<Record> for RecordRef {
    fn from(record: Record) -> Self {
        RecordRef::Inline(Box::new(record))
    }
}

/// Outbound delta: the local changes plus the cursor they were collected
/// against, so the remote knows which of its own changes to send back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub since: DateTime<Utc>,
    pub records: Vec<Record>,
}

/// First element of every response array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

impl ResponseStatus {
    pub fn success() -> Self {
        Self {
            sync_response: Some(DATA_SUCCESS.to_string()),
            sync_error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            sync_response: None,
            sync_error: Some(message.into()),
        }
    }

    /// A sync is rejected when an error is present and the remote did not
    /// also confirm the data.
    pub fn rejection(&self) -> Option<&str> {
        match (&self.sync_error, self.sync_response.as_deref()) {
            (Some(_), Some(DATA_SUCCESS)) => None,
            (Some(error), _) => Some(error),
            (None, _) => None,
        }
    }
}

/// Second element of a sync response: the remote delta and the new cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncData {
    pub sync_time: DateTime<Utc>,
    #[serde(default)]
    pub sync_data: Vec<Record>,
    /// Identities the remote confirms it stored. Absent means the whole
    /// transmitted delta was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged: Option<Vec<EntityId>>,
}

/// Body of a login response: `[status]`.
pub type LoginResponse = (ResponseStatus,);

/// Body of a sync response: `[status, data]`. The data element may be missing
/// when the remote rejects the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Complete(ResponseStatus, SyncData),
    StatusOnly((ResponseStatus,)),
}

impl SyncResponse {
    pub fn status(&self) -> &ResponseStatus {
        match self {
            SyncResponse::Complete(status, _) => status,
            SyncResponse::StatusOnly((status,)) => status,
        }
    }

    pub fn data(&self) -> Option<&SyncData> {
        match self {
            SyncResponse::Complete(_, data) => Some(data),
            SyncResponse::StatusOnly(_) => None,
        }
    }

    pub fn into_data(self) -> Option<SyncData> {
        match self {
            SyncResponse::Complete(_, data) => Some(data),
            SyncResponse::StatusOnly(_) => None,
        }
    }
}
