//! One authenticated conversation with the remote endpoint and the sync
//! passes run through it.
//!
//! A pass has three phases. Collection and serialization run under the store
//! write lock. The network exchange holds no lock and can be cancelled. The
//! apply phase takes the write lock again and runs to completion without
//! yielding, inside a single store transaction: merge the inbound delta,
//! settle tracking states, purge acknowledged deletions, advance the cursor.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{ErrorKind, Result, SyncError};
use crate::identity::IdentityRegistry;
use crate::persistence::LocalStore;
use crate::protocol::{SyncData, SyncPayload, SyncResponse};
use crate::resolver::ConflictSkipped;
use crate::tracker::{ApplyReport, ChangeTracker};
use crate::transport::Transport;
use crate::types::EntityId;

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session settings derived from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    /// Consecutive transport failures tolerated before the application is
    /// told the session is unusable.
    pub max_transport_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            max_transport_failures: 3,
        }
    }
}

impl From<&SyncConfig> for SessionConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            max_transport_failures: config.max_transport_failures,
        }
    }
}

/// Summary of a successful pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Changed entities the outbound delta was built from.
    pub sent: usize,
    /// Records received at the top level of the inbound delta.
    pub received: usize,
    pub created: usize,
    pub updated: usize,
    pub conflicts: Vec<ConflictSkipped>,
    pub purged: Vec<EntityId>,
    /// Transmitted entities the remote did not confirm. They stay dirty and
    /// go out again with the next pass.
    pub unacknowledged: Vec<EntityId>,
    /// New value of the `since` cursor.
    pub synced_at: DateTime<Utc>,
}

/// Completion notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn,
    SyncSucceeded(SyncReport),
    SyncFailed { kind: ErrorKind, message: String },
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub logged_in: bool,
    pub in_flight: bool,
    pub last_sync: DateTime<Utc>,
    pub pending_changes: usize,
    pub consecutive_failures: u32,
}

struct SessionInner<S, T> {
    store: Arc<RwLock<S>>,
    transport: T,
    tracker: ChangeTracker,
    config: SessionConfig,
    credentials: Mutex<Option<Credentials>>,
    logged_in: AtomicBool,
    in_flight: PassSlot,
    consecutive_failures: AtomicU32,
    events: broadcast::Sender<SessionEvent>,
}

/// Cancellation state of one pass. A request made before the pass reaches
/// the network is remembered and honoured there.
#[derive(Default)]
struct PassCancel {
    requested: AtomicBool,
    notify: Notify,
}

impl PassCancel {
    fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        // Register before checking the flag so a request in between still wakes us.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// The pass in flight, if any.
type PassSlot = Arc<std::sync::Mutex<Option<Arc<PassCancel>>>>;

fn lock_slot(slot: &PassSlot) -> std::sync::MutexGuard<'_, Option<Arc<PassCancel>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the single-flight slot for the duration of a pass and releases it
/// however the pass ends.
struct PassGuard {
    slot: PassSlot,
    cancel: Arc<PassCancel>,
}

impl PassGuard {
    fn acquire(slot: &PassSlot) -> Result<Self> {
        let mut current = lock_slot(slot);
        if current.is_some() {
            return Err(SyncError::Busy);
        }
        let cancel = Arc::new(PassCancel::default());
        *current = Some(cancel.clone());
        Ok(Self {
            slot: slot.clone(),
            cancel,
        })
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        *lock_slot(&self.slot) = None;
    }
}

/// Handle to a sync session. Cheap to clone; clones share state.
pub struct SyncSession<S, T> {
    inner: Arc<SessionInner<S, T>>,
}

impl<S, T> Clone for SyncSession<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> SyncSession<S, T>
where
    S: LocalStore + 'static,
    T: Transport + 'static,
{
    pub fn new(store: Arc<RwLock<S>>, transport: T, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                store,
                transport,
                tracker: ChangeTracker::new(),
                config,
                credentials: Mutex::new(None),
                logged_in: AtomicBool::new(false),
                in_flight: PassSlot::default(),
                consecutive_failures: AtomicU32::new(0),
                events,
            }),
        }
    }

    /// The store shared with the application.
    pub fn store(&self) -> Arc<RwLock<S>> {
        self.inner.store.clone()
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.inner.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ========== Authentication ==========

    /// Dispatch authentication in the background. Returns `false` without
    /// dispatching when the endpoint or username is empty, or when called
    /// outside a tokio runtime. The outcome arrives as a [`SessionEvent`].
    pub fn login(&self, credentials: Credentials) -> bool {
        if let Err(e) = self.check_credentials(&credentials) {
            warn!("Login not dispatched: {}", e);
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Login not dispatched: no async runtime");
            return false;
        };

        let session = self.clone();
        handle.spawn(async move {
            let _ = session.authenticate(credentials).await;
        });
        true
    }

    /// Authenticate and wait for the outcome. Credentials are kept for
    /// automatic re-login on later passes.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<()> {
        self.check_credentials(&credentials)?;
        let result = self.authenticate_with(&credentials).await;
        match &result {
            Ok(()) => {
                *self.inner.credentials.lock().await = Some(credentials);
                self.emit(SessionEvent::LoggedIn);
            }
            Err(e) => self.report_failure(e),
        }
        result
    }

    pub async fn logout(&self) -> Result<()> {
        self.inner.logged_in.store(false, Ordering::SeqCst);
        *self.inner.credentials.lock().await = None;
        self.inner.transport.logout().await?;
        info!("Logged out of {}", self.inner.config.endpoint);
        self.emit(SessionEvent::LoggedOut);
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.logged_in.load(Ordering::SeqCst)
    }

    fn check_credentials(&self, credentials: &Credentials) -> Result<()> {
        if self.inner.config.endpoint.trim().is_empty() {
            return Err(SyncError::Config("endpoint URL is empty".to_string()));
        }
        if credentials.username.trim().is_empty() {
            return Err(SyncError::Config("username is empty".to_string()));
        }
        Ok(())
    }

    async fn authenticate_with(&self, credentials: &Credentials) -> Result<()> {
        let endpoint = &self.inner.config.endpoint;
        debug!("Authenticating {} against {}", credentials.username, endpoint);
        let accepted = self
            .inner
            .transport
            .authenticate(endpoint, &credentials.username, &credentials.password)
            .await?;
        self.inner.logged_in.store(accepted, Ordering::SeqCst);
        if !accepted {
            return Err(SyncError::Authentication(format!(
                "{} rejected credentials for {}",
                endpoint, credentials.username
            )));
        }
        info!("Authenticated {} against {}", credentials.username, endpoint);
        Ok(())
    }

    // ========== Sync passes ==========

    /// Run one pass and wait for it. A second caller while a pass is in
    /// flight gets [`SyncError::Busy`] immediately.
    pub async fn sync(&self) -> Result<SyncReport> {
        let guard = PassGuard::acquire(&self.inner.in_flight)?;
        self.run_pass(guard).await
    }

    /// Start a pass in the background. Returns `false` if one is already in
    /// flight or no runtime is available.
    pub fn spawn_sync(&self) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let Ok(guard) = PassGuard::acquire(&self.inner.in_flight) else {
            debug!("Sync already in flight");
            return false;
        };
        let session = self.clone();
        handle.spawn(async move {
            let _ = session.run_pass(guard).await;
        });
        true
    }

    /// Cancel the pass in flight, if any. A pass still collecting its delta
    /// stops before transmitting; one on the wire abandons the exchange.
    /// Either way it fails with [`SyncError::Cancelled`] and local changes
    /// stay dirty. Once the response is being applied the pass completes.
    pub fn cancel(&self) {
        if let Some(pass) = lock_slot(&self.inner.in_flight).as_ref() {
            debug!("Cancellation requested");
            pass.cancel();
        }
    }

    pub fn is_syncing(&self) -> bool {
        lock_slot(&self.inner.in_flight).is_some()
    }

    pub async fn status(&self) -> SessionStatus {
        let store = self.inner.store.read().await;
        let last_sync = store.last_sync();
        SessionStatus {
            logged_in: self.is_logged_in(),
            in_flight: self.is_syncing(),
            last_sync,
            pending_changes: self.inner.tracker.collect_dirty(&*store, last_sync).len(),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::SeqCst),
        }
    }

    async fn run_pass(&self, guard: PassGuard) -> Result<SyncReport> {
        let result = self.pass(&guard.cancel).await;
        match &result {
            Ok(report) => {
                self.inner.consecutive_failures.store(0, Ordering::SeqCst);
                info!(
                    sent = report.sent,
                    received = report.received,
                    purged = report.purged.len(),
                    "Sync pass completed"
                );
                self.emit(SessionEvent::SyncSucceeded(report.clone()));
            }
            Err(e) => self.report_failure(e),
        }
        result
    }

    async fn pass(&self, cancel: &PassCancel) -> Result<SyncReport> {
        if !self.is_logged_in() {
            let stored = self.inner.credentials.lock().await.clone();
            let credentials = stored.ok_or_else(|| {
                SyncError::Authentication("not logged in and no stored credentials".to_string())
            })?;
            self.authenticate_with(&credentials).await?;
        }

        let tracker = &self.inner.tracker;
        let (payload, sent, registry) = {
            let mut store = self.inner.store.write().await;
            tracker.recover_interrupted(&mut *store);
            let registry = IdentityRegistry::from_store(&*store)?;
            let since = store.last_sync();
            let sent = tracker.collect_dirty(&*store, since);
            let records = tracker
                .serializer()
                .serialize_delta(&*store, &registry, &sent)?;
            let payload = serde_json::to_vec(&SyncPayload { since, records })?;
            tracker.begin_sync(&mut *store, &registry, &sent);
            (payload, sent, registry)
        };
        debug!(dirty = sent.len(), bytes = payload.len(), "Transmitting delta");

        let data = match self.exchange(payload, cancel).await {
            Ok(data) => data,
            Err(e) => {
                let mut store = self.inner.store.write().await;
                tracker.finish_sync(&mut *store, &registry, &sent, false);
                return Err(e);
            }
        };
        let received = data.sync_data.len();

        let outcome = {
            let mut store = self.inner.store.write().await;
            let outcome = apply_response(tracker, &mut *store, &sent, data);
            if outcome.is_err() {
                tracker.finish_sync(&mut *store, &registry, &sent, false);
            }
            outcome
        };
        let (applied, settled) = outcome?;

        Ok(SyncReport {
            sent: sent.len(),
            received,
            created: applied.created,
            updated: applied.updated,
            conflicts: applied.conflicts,
            purged: settled.purged,
            unacknowledged: settled.unacknowledged,
            synced_at: settled.synced_at,
        })
    }

    /// Network phase: transmit and decode the response. Holds no lock.
    async fn exchange(&self, payload: Vec<u8>, cancel: &PassCancel) -> Result<SyncData> {
        if cancel.is_cancelled() {
            warn!("Sync cancelled before transmitting");
            return Err(SyncError::Cancelled);
        }
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Sync cancelled during network exchange");
                return Err(SyncError::Cancelled);
            }
            body = self.inner.transport.send(payload) => body?,
        };

        let response: SyncResponse = serde_json::from_slice(&body)
            .map_err(|e| SyncError::MalformedPayload(format!("Invalid sync response: {}", e)))?;
        if let Some(reason) = response.status().rejection() {
            return Err(SyncError::Remote(reason.to_string()));
        }
        response
            .into_data()
            .ok_or_else(|| SyncError::MalformedPayload("Sync response carries no data".to_string()))
    }

    fn report_failure(&self, err: &SyncError) {
        match err {
            SyncError::Busy => {}
            SyncError::Authentication(_) => {
                self.inner.logged_in.store(false, Ordering::SeqCst);
                error!("Authentication failed: {}", err);
                self.emit_failure(err);
            }
            e if e.is_session_terminal() => {
                error!("Sync pass aborted: {}", e);
                self.emit_failure(e);
            }
            e if e.is_transient() => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.inner.config.max_transport_failures {
                    error!(failures, "Sync pass failed: {}", e);
                    self.emit_failure(e);
                } else {
                    warn!(failures, "Sync pass failed, will retry: {}", e);
                }
            }
            e => error!("Sync pass failed: {}", e),
        }
    }

    fn emit_failure(&self, err: &SyncError) {
        self.emit(SessionEvent::SyncFailed {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

struct Settled {
    purged: Vec<EntityId>,
    unacknowledged: Vec<EntityId>,
    synced_at: DateTime<Utc>,
}

/// Apply phase, as one store transaction.
fn apply_response<S: LocalStore + ?Sized>(
    tracker: &ChangeTracker,
    store: &mut S,
    sent: &[EntityId],
    data: SyncData,
) -> Result<(ApplyReport, Settled)> {
    store.begin()?;
    match settle(tracker, store, sent, data) {
        Ok(outcome) => match store.commit() {
            Ok(()) => Ok(outcome),
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

fn settle<S: LocalStore + ?Sized>(
    tracker: &ChangeTracker,
    store: &mut S,
    sent: &[EntityId],
    data: SyncData,
) -> Result<(ApplyReport, Settled)> {
    let mut registry = IdentityRegistry::from_store(store)?;
    let applied = tracker.merge(store, &mut registry, &data.sync_data)?;

    let mut acknowledged: HashSet<EntityId> = match data.acknowledged {
        Some(ids) => ids.into_iter().collect(),
        None => sent.iter().copied().collect(),
    };
    let (acked, unacknowledged): (Vec<EntityId>, Vec<EntityId>) =
        sent.iter().copied().partition(|id| acknowledged.contains(id));
    tracker.finish_sync(store, &registry, &acked, true);
    tracker.finish_sync(store, &registry, &unacknowledged, false);

    acknowledged.extend(applied.remote_deletions.iter().copied());
    let purged = tracker.purge(store, &mut registry, &acknowledged)?;
    store.set_last_sync(data.sync_time)?;

    Ok((
        applied,
        Settled {
            purged,
            unacknowledged,
            synced_at: data.sync_time,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::protocol::RecordRef;
    use crate::test_utils::{entity_at, record_for, reply_data, Reply, ScriptedRemote};
    use crate::types::{Entity, EventType, SyncState, Trackable};
    use chrono::Duration;

    type TestSession = SyncSession<MemoryStore, Arc<ScriptedRemote>>;

    fn session_with(store: MemoryStore) -> (TestSession, Arc<ScriptedRemote>) {
        let remote = Arc::new(ScriptedRemote::new());
        let session = SyncSession::new(
            Arc::new(RwLock::new(store)),
            remote.clone(),
            SessionConfig {
                endpoint: "http://sync.test/endpoint".to_string(),
                max_transport_failures: 2,
            },
        );
        (session, remote)
    }

    async fn logged_in(store: MemoryStore) -> (TestSession, Arc<ScriptedRemote>) {
        let (session, remote) = session_with(store);
        session
            .authenticate(Credentials::new("ada", "secret"))
            .await
            .expect("login");
        (session, remote)
    }

    fn past() -> DateTime<Utc> {
        Utc::now() - Duration::minutes(5)
    }

    #[tokio::test]
    async fn sync_sends_dirty_entities_and_advances_cursor() {
        let mut store = MemoryStore::new();
        let a = entity_at(&mut store, "Note", past());
        let b = entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;

        let report = session.sync().await.unwrap();
        assert_eq!(report.sent, 2);
        let sent: Vec<EntityId> = remote.received()[0].records.iter().map(|r| r.id).collect();
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&a) && sent.contains(&b));

        let store = session.store();
        let store = store.read().await;
        assert_eq!(store.last_sync(), report.synced_at);
        assert_eq!(
            store.entity_by_id(&a).unwrap().tracking().state(),
            SyncState::Clean
        );
        drop(store);

        let second = session.sync().await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(remote.received()[1].since, report.synced_at);
    }

    #[tokio::test]
    async fn deleted_entity_survives_failed_pass_and_is_purged_after_success() {
        let mut store = MemoryStore::new();
        let id = entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;
        session
            .tracker()
            .delete(&mut *session.store().write().await, &id);

        remote.push(Reply::Fail("connection reset".into()));
        let err = session.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        {
            let store = session.store();
            let store = store.read().await;
            let entity = store.entity_by_id(&id).expect("still stored");
            assert!(entity.is_deleted());
            assert_eq!(store.last_sync(), DateTime::<Utc>::UNIX_EPOCH);
        }

        let report = session.sync().await.unwrap();
        assert_eq!(report.purged, vec![id]);
        let first = &remote.received()[0].records[0];
        assert_eq!(first.id, id);
        assert_eq!(first.event_type, EventType::Deleted);
        assert!(session.store().read().await.entity_by_id(&id).is_none());
    }

    #[tokio::test]
    async fn concurrent_sync_is_rejected_as_busy() {
        let mut store = MemoryStore::new();
        entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;
        remote.push(Reply::Hang);

        let mut events = session.subscribe();
        assert!(session.spawn_sync());
        while remote.send_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(session.sync().await, Err(SyncError::Busy)));
        assert!(!session.spawn_sync());
        assert!(session.is_syncing());

        session.cancel();
        while session.is_syncing() {
            tokio::task::yield_now().await;
        }
        assert!(events.try_recv().is_err());
        assert_eq!(session.status().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn cancelled_pass_leaves_changes_dirty() {
        let mut store = MemoryStore::new();
        let id = entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;
        remote.push(Reply::Hang);

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.sync().await })
        };
        while remote.send_count() == 0 {
            tokio::task::yield_now().await;
        }
        session.cancel();

        let result = running.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        let store = session.store();
        let store = store.read().await;
        assert_eq!(
            store.entity_by_id(&id).unwrap().tracking().state(),
            SyncState::Dirty
        );
        assert_eq!(store.last_sync(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn cancel_before_transmitting_stops_the_pass() {
        let mut store = MemoryStore::new();
        let id = entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;

        let shared = session.store();
        let held = shared.write().await;
        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.sync().await })
        };
        while !session.is_syncing() {
            tokio::task::yield_now().await;
        }
        session.cancel();
        drop(held);

        let result = running.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(remote.send_count(), 0);
        assert_eq!(
            shared.read().await.entity_by_id(&id).unwrap().tracking().state(),
            SyncState::Dirty
        );
    }

    #[tokio::test]
    async fn cancel_without_a_pass_does_not_affect_the_next_one() {
        let mut store = MemoryStore::new();
        entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;

        session.cancel();
        let report = session.sync().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(remote.send_count(), 1);
    }

    #[tokio::test]
    async fn rejected_login_reports_authentication_failure() {
        let (session, remote) = session_with(MemoryStore::new());
        remote.reject_logins(true);
        let mut events = session.subscribe();

        let err = session
            .authenticate(Credentials::new("ada", "wrong"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!session.is_logged_in());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::SyncFailed {
                kind: ErrorKind::Authentication,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn login_validates_input_before_dispatching() {
        let (session, _) = session_with(MemoryStore::new());
        assert!(!session.login(Credentials::new("", "secret")));

        let mut events = session.subscribe();
        assert!(session.login(Credentials::new("ada", "secret")));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedIn);
        assert!(session.is_logged_in());

        let blank = SyncSession::new(
            Arc::new(RwLock::new(MemoryStore::new())),
            Arc::new(ScriptedRemote::new()),
            SessionConfig::default(),
        );
        assert!(!blank.login(Credentials::new("ada", "secret")));
    }

    #[tokio::test]
    async fn sync_without_credentials_fails_authentication() {
        let (session, remote) = session_with(MemoryStore::new());
        let err = session.sync().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(remote.send_count(), 0);
    }

    #[tokio::test]
    async fn pass_logs_in_again_with_stored_credentials() {
        let (session, remote) = logged_in(MemoryStore::new()).await;
        session.inner.logged_in.store(false, Ordering::SeqCst);

        session.sync().await.unwrap();
        assert_eq!(remote.login_count(), 2);
        assert!(session.is_logged_in());
    }

    #[tokio::test]
    async fn logout_forgets_credentials() {
        let (session, remote) = logged_in(MemoryStore::new()).await;
        let mut events = session.subscribe();
        session.logout().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
        assert_eq!(remote.logout_count(), 1);
        assert!(session.sync().await.is_err());
    }

    #[tokio::test]
    async fn inbound_records_are_merged() {
        let (session, remote) = logged_in(MemoryStore::new()).await;
        let folder = EntityId::new();
        let note = EntityId::new();
        let now = Utc::now();
        let mut record = record_for(folder, "Folder", now, EventType::Created);
        record.relationships.insert(
            "notes".to_string(),
            vec![record_for(note, "Note", now, EventType::Created).into()],
        );
        remote.push(Reply::Data(reply_data(vec![record])));

        let report = session.sync().await.unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.created, 2);

        let store = session.store();
        let store = store.read().await;
        assert_eq!(store.entity_by_id(&folder).unwrap().relationship("notes"), &[note]);
        // Merged records are clean and do not echo back.
        assert!(session
            .tracker()
            .collect_dirty(&*store, store.last_sync())
            .is_empty());
    }

    #[tokio::test]
    async fn records_stamped_after_the_remote_sync_time_are_not_echoed() {
        let (session, remote) = logged_in(MemoryStore::new()).await;
        let now = Utc::now();
        let id = EntityId::new();
        let mut data = reply_data(vec![record_for(
            id,
            "Note",
            now + Duration::seconds(2),
            EventType::Created,
        )]);
        data.sync_time = now;
        remote.push(Reply::Data(data));

        session.sync().await.unwrap();
        let second = session.sync().await.unwrap();
        assert_eq!(second.sent, 0);
        assert!(remote.received()[1].records.is_empty());
    }

    /// Writes a note into the shared store on the first `send`, the way an
    /// application keeps working while a pass is on the wire.
    struct WritesDuringSend {
        remote: Arc<ScriptedRemote>,
        store: Arc<RwLock<MemoryStore>>,
        created: std::sync::Mutex<Option<EntityId>>,
    }

    #[async_trait::async_trait]
    impl Transport for WritesDuringSend {
        async fn authenticate(&self, url: &str, username: &str, password: &str) -> Result<bool> {
            self.remote.authenticate(url, username, password).await
        }

        async fn send(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
            let first = self.created.lock().unwrap().is_none();
            if first {
                let mut store = self.store.write().await;
                let id = ChangeTracker::new().create(&mut *store, "Note")?;
                *self.created.lock().unwrap() = Some(id);
            }
            self.remote.send(payload).await
        }
    }

    #[tokio::test]
    async fn entity_created_while_on_the_wire_goes_out_next_pass() {
        let store = Arc::new(RwLock::new(MemoryStore::new()));
        let remote = Arc::new(ScriptedRemote::new());
        let session = SyncSession::new(
            store.clone(),
            WritesDuringSend {
                remote: remote.clone(),
                store: store.clone(),
                created: std::sync::Mutex::new(None),
            },
            SessionConfig {
                endpoint: "http://sync.test/endpoint".to_string(),
                ..SessionConfig::default()
            },
        );
        session
            .authenticate(Credentials::new("ada", "secret"))
            .await
            .unwrap();

        let first = session.sync().await.unwrap();
        assert_eq!(first.sent, 0);
        let created = session.inner.transport.created.lock().unwrap().expect("created");
        {
            let store = store.read().await;
            let tracking = store.entity_by_id(&created).unwrap().tracking();
            // The remote stamped the pass after the entity was written.
            assert!(tracking.update_time() <= first.synced_at);
            assert_eq!(tracking.state(), SyncState::Fresh);
        }

        let second = session.sync().await.unwrap();
        assert_eq!(second.sent, 1);
        let ids: Vec<EntityId> = remote.received()[1].records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![created]);
        assert_eq!(
            store.read().await.entity_by_id(&created).unwrap().tracking().state(),
            SyncState::Clean
        );
    }

    #[tokio::test]
    async fn unresolvable_inbound_payload_changes_nothing() {
        let mut store = MemoryStore::new();
        let local = entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;

        let mut dangling = record_for(EntityId::new(), "Note", Utc::now(), EventType::Created);
        dangling
            .relationships
            .insert("link".to_string(), vec![RecordRef::Reference(EntityId::new())]);
        remote.push(Reply::Data(reply_data(vec![dangling])));

        let err = session.sync().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);

        let store = session.store();
        let store = store.read().await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.last_sync(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            store.entity_by_id(&local).unwrap().tracking().state(),
            SyncState::Dirty
        );
    }

    #[tokio::test]
    async fn remote_rejection_keeps_cursor() {
        let mut store = MemoryStore::new();
        entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;
        remote.push(Reply::Rejected("quota exceeded".into()));

        let err = session.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(ref reason) if reason == "quota exceeded"));
        assert_eq!(
            session.store().read().await.last_sync(),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn garbage_response_is_malformed() {
        let (session, remote) = logged_in(MemoryStore::new()).await;
        remote.push(Reply::Raw(b"<html>".to_vec()));
        let err = session.sync().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPayload);
    }

    #[tokio::test]
    async fn unacknowledged_entities_are_resent() {
        let mut store = MemoryStore::new();
        let kept = entity_at(&mut store, "Note", past());
        let dropped = entity_at(&mut store, "Note", past());
        let (session, remote) = logged_in(store).await;

        let mut data = reply_data(Vec::new());
        data.acknowledged = Some(vec![kept]);
        remote.push(Reply::Data(data));

        let report = session.sync().await.unwrap();
        assert_eq!(report.unacknowledged, vec![dropped]);

        session.sync().await.unwrap();
        let resent: Vec<EntityId> = remote.received()[1].records.iter().map(|r| r.id).collect();
        assert_eq!(resent, vec![dropped]);
    }

    #[tokio::test]
    async fn repeated_transport_failures_surface_once_threshold_is_reached() {
        let (session, remote) = logged_in(MemoryStore::new()).await;
        let mut events = session.subscribe();
        remote.push(Reply::Fail("timeout".into()));
        remote.push(Reply::Fail("timeout".into()));

        assert!(session.sync().await.is_err());
        assert!(events.try_recv().is_err());

        assert!(session.sync().await.is_err());
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::SyncFailed {
                kind: ErrorKind::Transport,
                ..
            }
        ));

        session.sync().await.unwrap();
        assert_eq!(session.status().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn duplicate_identity_aborts_the_pass() {
        let mut store = MemoryStore::new();
        let id = EntityId::new();
        store.insert(Entity::new(id, "Note", Trackable::new_local(past())));
        store.insert(Entity::new(id, "Note", Trackable::new_local(past())));
        let (session, remote) = logged_in(store).await;
        let mut events = session.subscribe();

        let err = session.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateIdentity { id: dup } if dup == id));
        assert_eq!(remote.send_count(), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::SyncFailed {
                kind: ErrorKind::DuplicateIdentity,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn two_replicas_converge_through_the_remote() {
        let (origin, origin_remote) = logged_in(MemoryStore::new()).await;
        let folder = {
            let store = origin.store();
            let mut store = store.write().await;
            let folder = origin.tracker().create(&mut *store, "Folder").unwrap();
            let note = origin.tracker().create(&mut *store, "Note").unwrap();
            let entity = store.entity_by_id_mut(&folder).unwrap();
            entity.set_attribute("name", "inbox");
            entity.relate("notes", note);
            store
                .entity_by_id_mut(&note)
                .unwrap()
                .relate("folder", folder);
            folder
        };
        origin.sync().await.unwrap();

        let (replica, replica_remote) = logged_in(MemoryStore::new()).await;
        let forwarded = origin_remote.received()[0].records.clone();
        replica_remote.push(Reply::Data(reply_data(forwarded)));
        replica.sync().await.unwrap();

        let origin_store = origin.store();
        let replica_store = replica.store();
        assert_eq!(
            crate::test_utils::snapshot(&*origin_store.read().await),
            crate::test_utils::snapshot(&*replica_store.read().await)
        );
        assert!(replica_store.read().await.entity_by_id(&folder).is_some());
    }
}
