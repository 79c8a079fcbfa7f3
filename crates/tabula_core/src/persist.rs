//! Persistence boundary for mergeable content.
//!
//! A [`Persister`] stores stamped content, not plain content, so timestamps
//! and tombstones survive a restart and a reloaded replica still merges
//! correctly. [`MemoryPersister`] is the in-memory reference used by tests;
//! real backends implement the same trait over files, databases, or
//! anything else.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::mergeable::{merge_tables_stamps, merge_values_stamps, MergeableContent, MergeableStore};
use crate::sync::BoxFuture;

/// Storage backend for stamped content.
pub trait Persister: Send + Sync {
    /// Load the persisted content, or `None` when nothing was ever saved.
    fn load<'a>(&'a self) -> BoxFuture<'a, Result<Option<MergeableContent>>>;

    /// Persist a full stamped snapshot, replacing whatever was stored.
    fn save<'a>(&'a self, content: &'a MergeableContent) -> BoxFuture<'a, Result<()>>;

    /// Fold a stamped delta into the persisted state.
    ///
    /// Later-stamped leaves win, so saving the same delta twice or saving
    /// deltas out of order converges to the same stored state.
    fn save_changes<'a>(&'a self, changes: &'a MergeableContent) -> BoxFuture<'a, Result<()>>;
}

/// Load persisted content into a store.
///
/// Returns `false` when nothing was persisted or the payload failed
/// validation; the store is left untouched in both cases.
pub async fn load_into(persister: &dyn Persister, store: &mut MergeableStore) -> Result<bool> {
    match persister.load().await? {
        Some(content) => Ok(store.set_mergeable_content(content)),
        None => Ok(false),
    }
}

/// Persist a store's full stamped snapshot.
pub async fn save_from(persister: &dyn Persister, store: &MergeableStore) -> Result<()> {
    persister.save(&store.get_mergeable_content()).await
}

/// In-memory [`Persister`] storing the content as serialized JSON.
///
/// Serializing through JSON keeps this backend honest about what a real
/// medium would round-trip.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    stored: Arc<Mutex<Option<String>>>,
}

impl MemoryPersister {
    /// Create an empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<Option<MergeableContent>> {
        match self.stored.lock().unwrap().as_deref() {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn write(&self, content: &MergeableContent) -> Result<()> {
        let json = serde_json::to_string(content)?;
        *self.stored.lock().unwrap() = Some(json);
        Ok(())
    }
}

impl Persister for MemoryPersister {
    fn load<'a>(&'a self) -> BoxFuture<'a, Result<Option<MergeableContent>>> {
        Box::pin(async move { self.read() })
    }

    fn save<'a>(&'a self, content: &'a MergeableContent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write(content) })
    }

    fn save_changes<'a>(&'a self, changes: &'a MergeableContent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut stored = self.read()?.unwrap_or_default();
            merge_tables_stamps(&mut stored.tables, changes.tables.clone());
            merge_values_stamps(&mut stored.values, changes.values.clone());
            self.write(&stored)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Cell;

    #[tokio::test]
    async fn test_load_empty_persister() {
        let persister = MemoryPersister::new();
        let mut store = MergeableStore::new("a");
        assert!(!load_into(&persister, &mut store).await.unwrap());
        assert!(store.store().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let persister = MemoryPersister::new();

        let mut store = MergeableStore::new("a");
        store.set_cell("pets", "fido", "species", "dog");
        store.del_cell("pets", "fido", "species");
        store.set_cell("pets", "felix", "species", "cat");
        store.set_value("open", true);
        save_from(&persister, &store).await.unwrap();

        let mut reloaded = MergeableStore::new("a");
        assert!(load_into(&persister, &mut reloaded).await.unwrap());

        assert_eq!(store.get_content(), reloaded.get_content());
        assert_eq!(store.get_content_hashes(), reloaded.get_content_hashes());
        // The tombstone survived the round trip.
        assert!(!reloaded.has_cell("pets", "fido", "species"));
    }

    #[tokio::test]
    async fn test_reload_preserves_merge_behavior() {
        let persister = MemoryPersister::new();
        let mut a = MergeableStore::new("a");
        a.set_cell("pets", "fido", "color", "brown");
        save_from(&persister, &a).await.unwrap();

        // A restarted replica must resolve a concurrent remote write exactly
        // as the never-restarted one would, because timestamps survived.
        let mut remote = MergeableStore::new("b");
        remote.set_cell("pets", "fido", "color", "black");
        let concurrent = remote.get_mergeable_content();
        a.apply_changes(concurrent.clone());
        let expected = a.get_cell("pets", "fido", "color").cloned();

        let mut reloaded = MergeableStore::new("a");
        load_into(&persister, &mut reloaded).await.unwrap();
        reloaded.apply_changes(concurrent);
        assert_eq!(reloaded.get_cell("pets", "fido", "color").cloned(), expected);
    }

    #[tokio::test]
    async fn test_save_changes_accumulates_deltas() {
        let persister = MemoryPersister::new();
        let mut store = MergeableStore::new("a");

        store.start_transaction();
        store.set_cell("pets", "fido", "species", "dog");
        let first = store.get_transaction_changes();
        store.finish_transaction();
        persister.save_changes(&first).await.unwrap();

        store.start_transaction();
        store.set_cell("pets", "fido", "color", "brown");
        let second = store.get_transaction_changes();
        store.finish_transaction();
        persister.save_changes(&second).await.unwrap();

        // Replaying the first delta is a no-op.
        persister.save_changes(&first).await.unwrap();

        let mut reloaded = MergeableStore::new("a");
        load_into(&persister, &mut reloaded).await.unwrap();
        assert_eq!(
            reloaded.get_cell("pets", "fido", "species"),
            Some(&Cell::from("dog"))
        );
        assert_eq!(
            reloaded.get_cell("pets", "fido", "color"),
            Some(&Cell::from("brown"))
        );
    }
}
