//! Identity registry: maps stable entity identities to local store handles.
//!
//! A registry is built fresh for every sync pass from the store it serves, so
//! two sessions over two stores never share identity state.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::persistence::LocalStore;
use crate::types::{EntityId, LocalKey};

fn identity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        )
        .expect("identity pattern is valid")
    })
}

/// Whether `candidate` has the exact lexical form of an identity token.
pub fn is_identity_token(candidate: &str) -> bool {
    candidate.len() == 36 && identity_pattern().is_match(candidate)
}

/// Generate a new identity for a locally created entity.
pub fn new_id() -> EntityId {
    EntityId::new()
}

#[derive(Debug, Default, Clone)]
pub struct IdentityRegistry {
    entries: HashMap<EntityId, LocalKey>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every entity in `store`, soft-deleted ones included.
    ///
    /// Fails with [`SyncError::DuplicateIdentity`] if two stored entities
    /// carry the same identity.
    pub fn from_store<S: LocalStore + ?Sized>(store: &S) -> Result<Self> {
        let mut registry = Self::new();
        for key in store.keys() {
            if let Some(entity) = store.entity(key) {
                registry.register(entity.id(), key)?;
            }
        }
        debug!(entities = registry.len(), "Identity registry built");
        Ok(registry)
    }

    pub fn resolve(&self, id: &EntityId) -> Option<LocalKey> {
        self.entries.get(id).copied()
    }

    /// Bind `id` to `key`. Re-registering the same binding is a no-op.
    pub fn register(&mut self, id: EntityId, key: LocalKey) -> Result<()> {
        match self.entries.get(&id) {
            Some(existing) if *existing != key => Err(SyncError::DuplicateIdentity { id }),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(id, key);
                Ok(())
            }
        }
    }

    pub fn is_known(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn forget(&mut self, id: &EntityId) -> Option<LocalKey> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
