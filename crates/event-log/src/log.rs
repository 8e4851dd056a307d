//! The event log persist protocol
//!
//! The backing store offers no cross-document transaction strong enough to
//! both pick a version number and guarantee it is the unique lowest free
//! one. [`EventLog::persist`] provides exactly that guarantee optimistically:
//! reserve the number under the local version gate, insert, then re-read and
//! check whether this call's commit marker is the FIRST one at that version.
//! The first marker wins; everything after it at the same version is an
//! orphan.
//!
//! A lost race is an expected outcome, not an error: `persist` returns
//! `None` and the caller re-plans from scratch against the updated book.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::{EventEntry, EventPayload};
use crate::error::EventLogError;
use crate::store::EventStore;
use crate::version::VersionControl;

/// The append-only event log: persist protocol plus read-side filtering
pub struct EventLog {
    store: Arc<dyn EventStore>,
    version: Arc<VersionControl>,
}

impl EventLog {
    /// Create a log over a storage backend and the process's version gate
    pub fn new(store: Arc<dyn EventStore>, version: Arc<VersionControl>) -> Self {
        Self { store, version }
    }

    /// The process's version gate
    pub fn version_control(&self) -> &Arc<VersionControl> {
        &self.version
    }

    /// The raw storage backend
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Atomically append one transaction
    ///
    /// All entries must share one version number (violation is a fatal
    /// planner bug). Every entry is stamped with one commit time and a
    /// commit marker is appended. Returns the committed entries on success,
    /// `None` when the transaction lost the version race and the caller must
    /// re-plan.
    ///
    /// Pass `already_locked_version` when calling from inside
    /// [`VersionControl::execute_using_fixed_version`]; otherwise the lock
    /// is taken here.
    pub async fn persist(
        &self,
        mut transaction: Vec<EventEntry>,
        already_locked_version: Option<i64>,
    ) -> Result<Option<Vec<EventEntry>>, EventLogError> {
        let Some(first) = transaction.first() else {
            return Err(EventLogError::EmptyTransaction);
        };
        let version_number = first.version_number;
        for entry in &transaction {
            if entry.version_number != version_number {
                return Err(EventLogError::MixedVersionNumbers {
                    expected: version_number,
                    found: entry.version_number,
                });
            }
        }

        // One commit time for the whole transaction, marker included.
        let entry_time = Utc::now();
        for entry in &mut transaction {
            entry.entry_time = entry_time;
        }
        let mut commit = EventEntry::new(version_number, EventPayload::TransactionCommit);
        commit.entry_time = entry_time;
        let commit_id = commit.id;
        transaction.push(commit);

        match already_locked_version {
            Some(current) => self.persist_at(transaction, commit_id, current).await,
            None => {
                self.version
                    .execute_using_fixed_version(|current| async move {
                        self.persist_at(transaction, commit_id, current).await
                    })
                    .await
            }
        }
    }

    async fn persist_at(
        &self,
        transaction: Vec<EventEntry>,
        commit_id: Uuid,
        current_version: i64,
    ) -> Result<Option<Vec<EventEntry>>, EventLogError> {
        let version_number = transaction[0].version_number;

        // The expected optimistic race: another writer (possibly in another
        // process) got there first. Not an error.
        if version_number != current_version + 1 {
            debug!(
                version_number,
                current_version, "persist outdated: version already taken locally"
            );
            return Ok(None);
        }
        if self.store.max_version().await? > current_version {
            debug!(
                version_number,
                current_version, "persist outdated: store already past the fixed version"
            );
            return Ok(None);
        }

        self.store.insert(transaction.clone()).await?;

        // Post-hoc winner check: re-read everything at this version and find
        // the first commit marker. Only one marker can occupy first position.
        let stored = self.store.entries_at(version_number).await?;
        let first_commit_idx = stored.iter().position(|e| e.is_commit());
        let Some(idx) = first_commit_idx else {
            // Our own marker vanished: a concurrent cleanup raced us. Treat
            // as lost and remove whatever of ours is left.
            warn!(version_number, "commit marker missing after insert, treating as lost");
            self.cleanup(&transaction).await;
            return Ok(None);
        };

        if stored[idx].id == commit_id {
            // Won. Entries appended after our marker are losers.
            let orphan_ids: Vec<Uuid> = stored[idx + 1..].iter().map(|e| e.id).collect();
            if !orphan_ids.is_empty() {
                debug!(
                    version_number,
                    orphans = orphan_ids.len(),
                    "purging orphaned entries behind commit marker"
                );
                if let Err(e) = self.store.remove(&orphan_ids).await {
                    // A missed cleanup is tolerated: replay never reads past
                    // the first commit marker.
                    warn!(version_number, error = %e, "orphan cleanup failed");
                }
            }
            debug!(
                version_number,
                entries = transaction.len(),
                "transaction committed"
            );
            Ok(Some(transaction))
        } else {
            debug!(version_number, "lost commit race, removing own entries");
            self.cleanup(&transaction).await;
            Ok(None)
        }
    }

    async fn cleanup(&self, own: &[EventEntry]) {
        let ids: Vec<Uuid> = own.iter().map(|e| e.id).collect();
        if let Err(e) = self.store.remove(&ids).await {
            warn!(error = %e, "cleanup of lost transaction failed");
        }
    }

    /// Load committed events beyond `after_version`
    ///
    /// Events are grouped by version number; each group is kept only through
    /// its FIRST commit marker (inclusive). A group without a marker (a
    /// partial write still in flight) withholds itself and everything after
    /// it, so replay never applies an uncommitted transaction.
    pub async fn load_missing_events(
        &self,
        after_version: i64,
        max_version: Option<i64>,
    ) -> Result<Vec<EventEntry>, EventLogError> {
        let raw = self.store.load_after(after_version, max_version).await?;
        let mut out = Vec::with_capacity(raw.len());

        let mut group_version = None;
        let mut group_committed = false;
        for entry in raw {
            if group_version != Some(entry.version_number) {
                // Entering a new group; the previous one must have committed.
                if group_version.is_some() && !group_committed {
                    break;
                }
                group_version = Some(entry.version_number);
                group_committed = false;
            }
            if group_committed {
                // Orphan behind the winning marker (cleanup not yet run).
                continue;
            }
            let is_commit = entry.is_commit();
            out.push(entry);
            if is_commit {
                group_committed = true;
            }
        }
        // Trailing uncommitted group.
        if group_version.is_some() && !group_committed {
            while out.last().map_or(false, |e: &EventEntry| {
                Some(e.version_number) == group_version
            }) {
                out.pop();
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CreateOrder, SagaFlags, WalletGenerate};
    use crate::error::StoreError;
    use crate::store::InMemoryEventStore;
    use async_trait::async_trait;
    use common::{AccountId, DurationType, Instrument, OrderType, Side, Symbol, UserId};
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    fn create_order_entry(version: i64) -> EventEntry {
        EventEntry::new(
            version,
            EventPayload::CreateOrder(CreateOrder {
                user: UserId::new(),
                account_id: AccountId::new(),
                instrument: Instrument::new("ETH", "BTC"),
                qty: dec!(1),
                side: Side::Buy,
                order_type: OrderType::Limit,
                limit_price: Some(dec!(0.1)),
                stop_price: None,
                duration_type: DurationType::GoodTillCancel,
                duration: None,
                stop_loss: None,
                take_profit: None,
                filled_market_order_qty: None,
            }),
        )
    }

    fn wallet_entry(version: i64) -> EventEntry {
        EventEntry::new(
            version,
            EventPayload::WalletGenerate(WalletGenerate {
                user: UserId::new(),
                account_id: AccountId::new(),
                coin_symbol: Symbol::new("BTC"),
                public_key: "pk".into(),
                new_balance: dec!(0),
                saga: SagaFlags::default(),
            }),
        )
    }

    fn new_log() -> (EventLog, Arc<InMemoryEventStore>, Arc<VersionControl>) {
        let store = Arc::new(InMemoryEventStore::new());
        let version = Arc::new(VersionControl::new(0));
        let log = EventLog::new(store.clone(), version.clone());
        (log, store, version)
    }

    #[tokio::test]
    async fn test_persist_appends_commit_and_stamps_one_time() {
        let (log, store, _) = new_log();

        let committed = log
            .persist(vec![create_order_entry(1), wallet_entry(1)], None)
            .await
            .unwrap()
            .expect("first writer must win");

        assert_eq!(committed.len(), 3);
        assert!(committed[2].is_commit());
        assert!(committed.iter().all(|e| e.entry_time == committed[0].entry_time));
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_persist_rejects_mixed_versions() {
        let (log, _, _) = new_log();

        let err = log
            .persist(vec![create_order_entry(1), create_order_entry(2)], None)
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_persist_outdated_when_version_taken() {
        let (log, _, _) = new_log();

        log.persist(vec![create_order_entry(1)], None)
            .await
            .unwrap()
            .expect("first writer must win");

        // A second writer planned against the stale version 0 watermark.
        let outcome = log.persist(vec![create_order_entry(1)], None).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_persist_outdated_when_store_is_ahead_of_watermark() {
        let (log, store, _) = new_log();

        // Another process committed version 1; our watermark still says 0.
        store
            .insert(vec![
                create_order_entry(1),
                EventEntry::new(1, EventPayload::TransactionCommit),
            ])
            .await
            .unwrap();

        let outcome = log.persist(vec![create_order_entry(1)], None).await.unwrap();
        assert!(outcome.is_none());
    }

    /// Store wrapper that injects a competing committed transaction between
    /// the version check and our insert, forcing the post-hoc loser path.
    struct RacingStore {
        inner: InMemoryEventStore,
        competitor: Mutex<Option<Vec<EventEntry>>>,
    }

    #[async_trait]
    impl EventStore for RacingStore {
        async fn insert(&self, entries: Vec<EventEntry>) -> Result<(), StoreError> {
            if let Some(competitor) = self.competitor.lock().await.take() {
                self.inner.insert(competitor).await?;
            }
            self.inner.insert(entries).await
        }
        async fn entries_at(&self, version: i64) -> Result<Vec<EventEntry>, StoreError> {
            self.inner.entries_at(version).await
        }
        async fn load_after(
            &self,
            after: i64,
            max: Option<i64>,
        ) -> Result<Vec<EventEntry>, StoreError> {
            self.inner.load_after(after, max).await
        }
        async fn max_version(&self) -> Result<i64, StoreError> {
            // Pretend the competitor is not visible yet at check time.
            Ok(0)
        }
        async fn remove(&self, ids: &[Uuid]) -> Result<(), StoreError> {
            self.inner.remove(ids).await
        }
        async fn find(&self, id: Uuid) -> Result<Option<EventEntry>, StoreError> {
            self.inner.find(id).await
        }
        async fn update_saga_flags(
            &self,
            id: Uuid,
            flags: SagaFlags,
        ) -> Result<(), StoreError> {
            self.inner.update_saga_flags(id, flags).await
        }
    }

    #[tokio::test]
    async fn test_first_commit_wins_and_loser_cleans_up() {
        let competitor = vec![
            create_order_entry(1),
            EventEntry::new(1, EventPayload::TransactionCommit),
        ];
        let competitor_commit_id = competitor[1].id;

        let store = Arc::new(RacingStore {
            inner: InMemoryEventStore::new(),
            competitor: Mutex::new(Some(competitor)),
        });
        let version = Arc::new(VersionControl::new(0));
        let log = EventLog::new(store.clone(), version);

        let outcome = log.persist(vec![create_order_entry(1)], None).await.unwrap();
        assert!(outcome.is_none(), "loser must report outdated");

        // Only the competitor's transaction survives at version 1.
        let remaining = store.entries_at(1).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[1].id, competitor_commit_id);
    }

    #[tokio::test]
    async fn test_load_missing_events_truncates_at_first_commit() {
        let (log, store, _) = new_log();

        // Version 1: winner (2 entries + commit) followed by orphan leftovers.
        let winner = create_order_entry(1);
        let winner_commit = EventEntry::new(1, EventPayload::TransactionCommit);
        let orphan = create_order_entry(1);
        let orphan_commit = EventEntry::new(1, EventPayload::TransactionCommit);
        store
            .insert(vec![winner.clone(), winner_commit.clone(), orphan, orphan_commit])
            .await
            .unwrap();

        let events = log.load_missing_events(0, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, winner.id);
        assert_eq!(events[1].id, winner_commit.id);
    }

    #[tokio::test]
    async fn test_load_missing_events_withholds_uncommitted_group() {
        let (log, store, _) = new_log();

        // Version 1 committed, version 2 partially written (no marker yet),
        // version 3 committed. Replay must stop before version 2.
        store
            .insert(vec![
                create_order_entry(1),
                EventEntry::new(1, EventPayload::TransactionCommit),
                create_order_entry(2),
                create_order_entry(3),
                EventEntry::new(3, EventPayload::TransactionCommit),
            ])
            .await
            .unwrap();

        let events = log.load_missing_events(0, None).await.unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.version_number).collect();
        assert_eq!(versions, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_load_missing_events_respects_max_version() {
        let (log, _, _) = new_log();

        log.persist(vec![create_order_entry(1)], None).await.unwrap();
        log.persist(vec![create_order_entry(2)], None).await.unwrap();

        let events = log.load_missing_events(0, Some(1)).await.unwrap();
        assert!(events.iter().all(|e| e.version_number == 1));
    }
}
