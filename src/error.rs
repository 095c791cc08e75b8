//! Error types for the synchronization engine.

use serde::{Deserialize, Serialize};

use crate::types::EntityId;

/// Coarse classification of a [`SyncError`], handed to the application when a
/// session reports a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Transport,
    DuplicateIdentity,
    UnresolvedReference,
    MalformedPayload,
    Remote,
    Busy,
    Cancelled,
    Config,
    Storage,
    Serialization,
}

/// Error types for synchronization operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Identity {id} is shared by two distinct local entities")]
    DuplicateIdentity { id: EntityId },

    #[error("Reference to {0} precedes its definition in the payload")]
    UnresolvedReference(EntityId),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Remote rejected sync: {0}")]
    Remote(String),

    #[error("A sync pass is already in progress")]
    Busy,

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::DuplicateIdentity { .. } => ErrorKind::DuplicateIdentity,
            SyncError::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            SyncError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            SyncError::Remote(_) => ErrorKind::Remote,
            SyncError::Busy => ErrorKind::Busy,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether the next scheduled pass may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Cancelled | SyncError::Busy
        )
    }

    /// Failures that end the session and must reach the application even on
    /// the first occurrence.
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication(_) | SyncError::DuplicateIdentity { .. }
        )
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(SyncError::Busy.kind(), ErrorKind::Busy);
        assert_eq!(
            SyncError::Transport("reset".into()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            SyncError::Storage(anyhow::anyhow!("disk full")).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn only_auth_and_identity_failures_are_terminal() {
        assert!(SyncError::Authentication("bad password".into()).is_session_terminal());
        assert!(SyncError::DuplicateIdentity { id: EntityId::new() }.is_session_terminal());
        assert!(!SyncError::Transport("timeout".into()).is_session_terminal());
        assert!(SyncError::Transport("timeout".into()).is_transient());
        assert!(!SyncError::MalformedPayload("x".into()).is_transient());
    }
}
