//! Offline-first synchronization of a local object graph with a remote
//! database endpoint.
//!
//! Applications keep working against a local store while disconnected; a
//! sync pass later exchanges the accumulated changes with the remote side.
//!
//! # Features
//!
//! - **Stable Identities**: every entity carries a UUID that is the same on
//!   every replica, independent of the local storage key.
//! - **Graph Serialization**: changed entities travel as nested record trees
//!   in which every entity appears inline once and as a bare reference after
//!   that, so cycles and shared children survive the trip.
//! - **Dirty Tracking**: only entities changed since the last successful sync
//!   are sent.
//! - **Soft Deletes**: deletions are kept until the remote acknowledges them,
//!   then purged.
//! - **Last-Write-Wins**: incoming records replace local ones when their
//!   update time is not older; deletions win eagerly.
//!
//! # Usage
//!
//! Implement [`LocalStore`] for your storage (or use [`MemoryStore`] /
//! [`JsonFileStore`]), then run passes through a [`SyncSession`]:
//!
//! ```ignore
//! use std::sync::Arc;
//! use enterprise_sync::{Credentials, HttpTransport, MemoryStore, SessionConfig, SyncSession};
//! use tokio::sync::RwLock;
//!
//! let store = Arc::new(RwLock::new(MemoryStore::new()));
//! let session = SyncSession::new(
//!     store.clone(),
//!     HttpTransport::new(std::time::Duration::from_secs(30))?,
//!     SessionConfig { endpoint: "https://example.com/sync".into(), ..Default::default() },
//! );
//! session.authenticate(Credentials::new("ada", "secret")).await?;
//!
//! let note = session.tracker().create(&mut *store.write().await, "Note")?;
//! let report = session.sync().await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod protocol;
pub mod resolver;
pub mod serializer;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;

#[cfg(feature = "http")]
pub mod cli;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export main types for convenience
pub use config::SyncConfig;
pub use coordinator::{start_sync_scheduler, SchedulerConfig, SyncScheduler};
pub use error::{ErrorKind, Result, SyncError};
pub use identity::{is_identity_token, new_id, IdentityRegistry};
pub use persistence::{JsonFileStore, LocalStore, MemoryStore};
pub use protocol::{Record, RecordRef, SyncPayload, SyncResponse};
pub use resolver::{ConflictResolver, ConflictSkipped, Resolution};
pub use serializer::GraphSerializer;
pub use session::{Credentials, SessionConfig, SessionEvent, SessionStatus, SyncReport, SyncSession};
pub use tracker::{ApplyReport, ChangeTracker};
pub use transport::Transport;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use types::{AttributeValue, Entity, EntityId, EventType, LocalKey, SyncState, Trackable};
