//! Storage trait for the sync engine, plus in-memory and JSON-file backends.
//!
//! The engine never talks to a database directly. Any storage that can hand
//! out entities by local key, run a transaction, and persist a sync cursor can
//! sit behind [`LocalStore`].

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Entity, EntityId, LocalKey, Trackable};

/// Storage operations required by the sync engine.
pub trait LocalStore: Send + Sync {
    // ========== Entity Operations ==========

    /// Create and store a new, empty entity.
    fn create_entity(
        &mut self,
        id: EntityId,
        type_name: &str,
        tracking: Trackable,
    ) -> Result<LocalKey>;

    fn entity(&self, key: LocalKey) -> Option<&Entity>;

    fn entity_mut(&mut self, key: LocalKey) -> Option<&mut Entity>;

    /// Every stored key, soft-deleted entities included, in ascending order.
    fn keys(&self) -> Vec<LocalKey>;

    /// Remove an entity for good. Only purge calls this.
    fn physically_delete(&mut self, key: LocalKey) -> Result<()>;

    /// Locate an entity by identity, soft-deleted entities included.
    fn find(&self, id: &EntityId) -> Option<LocalKey> {
        self.keys()
            .into_iter()
            .find(|key| self.entity(*key).map(|e| e.id() == *id).unwrap_or(false))
    }

    fn entity_by_id(&self, id: &EntityId) -> Option<&Entity> {
        self.find(id).and_then(|key| self.entity(key))
    }

    fn entity_by_id_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
        let key = self.find(id)?;
        self.entity_mut(key)
    }

    /// Application query. Soft-deleted entities are never returned.
    fn fetch(&self, predicate: &dyn Fn(&Entity) -> bool) -> Vec<&Entity> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.entity(key))
            .filter(|entity| !entity.is_deleted() && predicate(entity))
            .collect()
    }

    // ========== Transactions ==========

    fn begin(&mut self) -> Result<()>;

    /// Persist pending mutations and end any open transaction.
    fn commit(&mut self) -> Result<()>;

    /// Discard everything since [`LocalStore::begin`].
    fn rollback(&mut self) -> Result<()>;

    // ========== Sync Cursor ==========

    /// Time of the last successful sync as reported by the remote side.
    fn last_sync(&self) -> DateTime<Utc>;

    fn set_last_sync(&mut self, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Snapshot {
    entities: BTreeMap<LocalKey, Entity>,
    next_key: u64,
    last_sync: DateTime<Utc>,
}

/// Volatile store, also the working set behind [`JsonFileStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entities: BTreeMap<LocalKey, Entity>,
    next_key: u64,
    last_sync: DateTime<Utc>,
    snapshot: Option<Snapshot>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_key: 1,
            last_sync: DateTime::<Utc>::UNIX_EPOCH,
            snapshot: None,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an already-built entity under a fresh key. No identity check is
    /// made here; the registry catches duplicates at the start of a pass.
    pub fn insert(&mut self, entity: Entity) -> LocalKey {
        let key = LocalKey(self.next_key);
        self.next_key += 1;
        self.entities.insert(key, entity);
        key
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn entities_in_order(&self) -> Vec<Entity> {
        self.entities.values().cloned().collect()
    }
}

impl LocalStore for MemoryStore {
    fn create_entity(
        &mut self,
        id: EntityId,
        type_name: &str,
        tracking: Trackable,
    ) -> Result<LocalKey> {
        Ok(self.insert(Entity::new(id, type_name, tracking)))
    }

    fn entity(&self, key: LocalKey) -> Option<&Entity> {
        self.entities.get(&key)
    }

    fn entity_mut(&mut self, key: LocalKey) -> Option<&mut Entity> {
        self.entities.get_mut(&key)
    }

    fn keys(&self) -> Vec<LocalKey> {
        self.entities.keys().copied().collect()
    }

    fn physically_delete(&mut self, key: LocalKey) -> Result<()> {
        self.entities
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("No entity stored under {}", key))
    }

    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            bail!("A transaction is already open");
        }
        self.snapshot = Some(Snapshot {
            entities: self.entities.clone(),
            next_key: self.next_key,
            last_sync: self.last_sync,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| anyhow!("Rollback without an open transaction"))?;
        self.entities = snapshot.entities;
        self.next_key = snapshot.next_key;
        self.last_sync = snapshot.last_sync;
        Ok(())
    }

    fn last_sync(&self) -> DateTime<Utc> {
        self.last_sync
    }

    fn set_last_sync(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.last_sync = at;
        Ok(())
    }
}

/// On-disk layout of a [`JsonFileStore`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    last_sync: DateTime<Utc>,
    #[serde(default)]
    entities: Vec<Entity>,
}

/// A store persisted as one JSON document, rewritten atomically on commit.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = MemoryStore::new();

        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store file {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse store file {}", path.display()))?;
            inner.last_sync = file.last_sync;
            for entity in file.entities {
                inner.insert(entity);
            }
            debug!(path = %path.display(), entities = inner.len(), "Opened store");
        }

        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn save(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory {}", dir.display()))?;

        let file = StoreFile {
            last_sync: self.inner.last_sync,
            entities: self.inner.entities_in_order(),
        };
        let json = serde_json::to_vec_pretty(&file).context("Failed to encode store")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("Failed to create temporary store file")?;
        tmp.write_all(&json)
            .context("Failed to write temporary store file")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace store file {}", self.path.display()))?;
        Ok(())
    }
}

impl LocalStore for JsonFileStore {
    fn create_entity(
        &mut self,
        id: EntityId,
        type_name: &str,
        tracking: Trackable,
    ) -> Result<LocalKey> {
        self.inner.create_entity(id, type_name, tracking)
    }

    fn entity(&self, key: LocalKey) -> Option<&Entity> {
        self.inner.entity(key)
    }

    fn entity_mut(&mut self, key: LocalKey) -> Option<&mut Entity> {
        self.inner.entity_mut(key)
    }

    fn keys(&self) -> Vec<LocalKey> {
        self.inner.keys()
    }

    fn physically_delete(&mut self, key: LocalKey) -> Result<()> {
        self.inner.physically_delete(key)
    }

    fn begin(&mut self) -> Result<()> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<()> {
        self.save()?;
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn last_sync(&self) -> DateTime<Utc> {
        self.inner.last_sync()
    }

    fn set_last_sync(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.inner.set_last_sync(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeValue;
    use tempfile::tempdir;

    fn note(title: &str) -> Entity {
        let mut e = Entity::new(EntityId::new(), "Note", Trackable::new_local(Utc::now()));
        e.set_attribute("title", title);
        e
    }

    #[test]
    fn fetch_hides_soft_deleted_entities() {
        let mut store = MemoryStore::new();
        let keep = store.insert(note("keep"));
        let gone = store.insert(note("gone"));
        store
            .entity_mut(gone)
            .unwrap()
            .tracking_mut()
            .mark_deleted(Utc::now());

        let visible = store.fetch(&|_| true);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id(), store.entity(keep).unwrap().id());
        // Still reachable by identity until purged.
        let gone_id = store.entity(gone).unwrap().id();
        assert!(store.entity_by_id(&gone_id).is_some());
    }

    #[test]
    fn rollback_restores_entities_and_cursor() {
        let mut store = MemoryStore::new();
        let key = store.insert(note("before"));
        let cursor = store.last_sync();

        store.begin().unwrap();
        store
            .entity_mut(key)
            .unwrap()
            .set_attribute("title", "during");
        store.insert(note("extra"));
        store.set_last_sync(Utc::now()).unwrap();
        store.rollback().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.entity(key).unwrap().attribute("title"),
            Some(&AttributeValue::from("before"))
        );
        assert_eq!(store.last_sync(), cursor);
        assert!(!store.in_transaction());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let mut store = MemoryStore::new();
        store.begin().unwrap();
        assert!(store.begin().is_err());
        store.commit().unwrap();
        assert!(store.rollback().is_err());
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");
        let cursor = Utc::now();

        let id = {
            let mut store = JsonFileStore::open(&path).expect("open");
            assert!(store.is_empty());
            let key = store
                .create_entity(EntityId::new(), "Note", Trackable::new_local(Utc::now()))
                .unwrap();
            store.entity_mut(key).unwrap().set_attribute("title", "kept");
            store.set_last_sync(cursor).unwrap();
            store.commit().expect("commit");
            store.entity(key).unwrap().id()
        };

        let reopened = JsonFileStore::open(&path).expect("reopen");
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.last_sync(), cursor);
        let entity = reopened.entity_by_id(&id).expect("entity");
        assert_eq!(entity.attribute("title"), Some(&AttributeValue::from("kept")));
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();
        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse store file"));
    }
}
