//! Raw event storage
//!
//! [`EventStore`] is the storage contract the persist protocol builds on.
//! It deliberately offers nothing transactional: no backend primitive is
//! assumed strong enough to both pick a version number and guarantee it is
//! the unique lowest free one. The protocol in [`crate::log`] provides that
//! guarantee on top of these primitives.

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entry::{EventEntry, SagaFlags};
use crate::error::StoreError;

/// Storage contract for event entries
///
/// Implementations can be in-memory, document-store backed, or any other
/// backend. Within one version number, entries must be returned in
/// insertion order; across versions, ascending.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append entries. Not assumed atomic across entries.
    async fn insert(&self, entries: Vec<EventEntry>) -> Result<(), StoreError>;

    /// All entries at exactly this version, in insertion order
    async fn entries_at(&self, version: i64) -> Result<Vec<EventEntry>, StoreError>;

    /// All entries with `version > after` (and `version <= max`, when given),
    /// ascending by version, insertion order within a version
    async fn load_after(
        &self,
        after: i64,
        max: Option<i64>,
    ) -> Result<Vec<EventEntry>, StoreError>;

    /// Highest version number present, 0 when empty
    async fn max_version(&self) -> Result<i64, StoreError>;

    /// Best-effort removal of orphaned entries
    async fn remove(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Look up a single entry by id
    async fn find(&self, id: Uuid) -> Result<Option<EventEntry>, StoreError>;

    /// Overwrite the saga flags of a wallet event in place
    ///
    /// The flags are the only mutable part of a persisted entry; they carry
    /// the cross-service saga state.
    async fn update_saga_flags(&self, id: Uuid, flags: SagaFlags) -> Result<(), StoreError>;
}

/// In-memory event store
///
/// Keeps entries in append order. Fast and non-persistent; the backend used
/// by every test and by single-node deployments.
#[derive(Default)]
pub struct InMemoryEventStore {
    entries: RwLock<Vec<EventEntry>>,
}

impl InMemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (tests and diagnostics)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when no entries are stored
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert(&self, mut new_entries: Vec<EventEntry>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.append(&mut new_entries);
        Ok(())
    }

    async fn entries_at(&self, version: i64) -> Result<Vec<EventEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.version_number == version)
            .cloned()
            .collect())
    }

    async fn load_after(
        &self,
        after: i64,
        max: Option<i64>,
    ) -> Result<Vec<EventEntry>, StoreError> {
        let entries = self.entries.read().await;
        let mut out: Vec<EventEntry> = entries
            .iter()
            .filter(|e| {
                e.version_number > after && max.map_or(true, |m| e.version_number <= m)
            })
            .cloned()
            .collect();
        // Stable: preserves insertion order within a version.
        out.sort_by_key(|e| e.version_number);
        Ok(out)
    }

    async fn max_version(&self) -> Result<i64, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().map(|e| e.version_number).max().unwrap_or(0))
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.retain(|e| !ids.contains(&e.id));
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<EventEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    async fn update_saga_flags(&self, id: Uuid, flags: SagaFlags) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::EntryNotFound(id))?;
        match entry.saga_flags_mut() {
            Some(saga) => {
                *saga = flags;
                Ok(())
            }
            None => Err(StoreError::NotAWalletEvent(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EventPayload;
    use assert_matches::assert_matches;

    fn commit(version: i64) -> EventEntry {
        EventEntry::new(version, EventPayload::TransactionCommit)
    }

    #[tokio::test]
    async fn test_load_after_orders_by_version() {
        let store = InMemoryEventStore::new();
        store
            .insert(vec![commit(2), commit(1), commit(3)])
            .await
            .unwrap();

        let loaded = store.load_after(0, None).await.unwrap();
        let versions: Vec<i64> = loaded.iter().map(|e| e.version_number).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let capped = store.load_after(1, Some(2)).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].version_number, 2);
    }

    #[tokio::test]
    async fn test_max_version_empty() {
        let store = InMemoryEventStore::new();
        assert_eq!(store.max_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let store = InMemoryEventStore::new();
        let doomed = commit(1);
        let doomed_id = doomed.id;
        store.insert(vec![doomed, commit(1)]).await.unwrap();

        store.remove(&[doomed_id]).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(store.find(doomed_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_saga_flags_rejected_on_non_wallet_entry() {
        let store = InMemoryEventStore::new();
        let entry = commit(1);
        let id = entry.id;
        store.insert(vec![entry]).await.unwrap();

        let result = store.update_saga_flags(id, SagaFlags::default()).await;
        assert_matches!(result, Err(StoreError::NotAWalletEvent(_)));
    }
}
