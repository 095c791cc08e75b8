//! Fixtures shared by unit tests and by downstream crates that enable the
//! `test-utils` feature.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};
use crate::persistence::{LocalStore, MemoryStore};
use crate::protocol::{Record, ResponseStatus, SyncData, SyncPayload, SyncResponse};
use crate::transport::Transport;
use crate::types::{AttributeValue, Entity, EntityId, EventType, Trackable};

/// Insert a locally created entity stamped at `at`.
pub fn entity_at(store: &mut MemoryStore, type_name: &str, at: DateTime<Utc>) -> EntityId {
    let id = EntityId::new();
    store.insert(Entity::new(id, type_name, Trackable::new_local(at)));
    id
}

/// A bare record with no attributes and no relationships.
pub fn record_for(id: EntityId, type_name: &str, at: DateTime<Utc>, event: EventType) -> Record {
    Record {
        id,
        type_name: type_name.to_string(),
        update_time: at,
        event_type: event,
        attributes: BTreeMap::new(),
        relationships: BTreeMap::new(),
    }
}

pub type EntitySnapshot = (
    String,
    BTreeMap<String, AttributeValue>,
    BTreeMap<String, Vec<EntityId>>,
);

/// Graph contents keyed by identity, ignoring local keys and tracking
/// metadata. Two stores holding the same graph produce equal snapshots.
pub fn snapshot<S: LocalStore + ?Sized>(store: &S) -> BTreeMap<EntityId, EntitySnapshot> {
    store
        .keys()
        .into_iter()
        .filter_map(|key| store.entity(key))
        .map(|entity| {
            (
                entity.id(),
                (
                    entity.type_name().to_string(),
                    entity.attributes().clone(),
                    entity.relationships().clone(),
                ),
            )
        })
        .collect()
}

/// One scripted answer to a `send`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Successful response with the given data.
    Data(SyncData),
    /// Response whose status carries `sync_error` and no data.
    Rejected(String),
    /// Raw body, returned verbatim.
    Raw(Vec<u8>),
    /// Transport failure.
    Fail(String),
    /// Never answers; only cancellation ends the call.
    Hang,
}

/// In-process remote that answers from a script and records what it was
/// sent. When the script runs out it accepts everything and returns no
/// remote changes.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    reject_login: AtomicBool,
    replies: Mutex<VecDeque<Reply>>,
    received: Mutex<Vec<SyncPayload>>,
    logins: AtomicUsize,
    logouts: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_logins(&self, reject: bool) {
        self.reject_login.store(reject, Ordering::SeqCst);
    }

    pub fn push(&self, reply: Reply) {
        self.lock_replies().push_back(reply);
    }

    /// Payloads received so far, in order.
    pub fn received(&self) -> Vec<SyncPayload> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn send_count(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Reply>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Data element for a reply, stamped now.
pub fn reply_data(records: Vec<Record>) -> SyncData {
    SyncData {
        sync_time: Utc::now(),
        sync_data: records,
        acknowledged: None,
    }
}

#[async_trait]
impl Transport for ScriptedRemote {
    async fn authenticate(&self, _url: &str, _username: &str, _password: &str) -> Result<bool> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(!self.reject_login.load(Ordering::SeqCst))
    }

    async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let decoded: SyncPayload = serde_json::from_slice(&payload)?;
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(decoded);

        let reply = self.lock_replies().pop_front();
        let response = match reply {
            None => SyncResponse::Complete(ResponseStatus::success(), reply_data(Vec::new())),
            Some(Reply::Data(data)) => SyncResponse::Complete(ResponseStatus::success(), data),
            Some(Reply::Rejected(reason)) => {
                SyncResponse::StatusOnly((ResponseStatus::failure(reason),))
            }
            Some(Reply::Raw(body)) => return Ok(body),
            Some(Reply::Fail(reason)) => return Err(SyncError::Transport(reason)),
            Some(Reply::Hang) => std::future::pending().await,
        };
        Ok(serde_json::to_vec(&response)?)
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
