//! Persistence backends for the block registry
//!
//! The registry keeps at most one active record per identity. Both backends
//! enforce that atomically: the in-memory backend through the shard lock of its
//! active-record map, Postgres through a partial unique index.

use crate::db::{queries, BlockRow};
use crate::error::GuardError;
use async_trait::async_trait;
use bastion_common::{
    constants, BlockFilter, BlockKind, BlockReason, BlockRecord, BlockStatistics, Page,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use sqlx::PgPool;
use std::sync::RwLock;

/// Stamp applied when an active record is deactivated
#[derive(Debug, Clone)]
pub struct Deactivation {
    pub at: DateTime<Utc>,
    pub by: String,
    pub reason: String,
}

impl Deactivation {
    /// Deactivation performed by the expiry sweep
    pub fn expiration(at: DateTime<Utc>) -> Self {
        Self {
            at,
            by: constants::SYSTEM_ACTOR.to_string(),
            reason: constants::EXPIRATION_REASON.to_string(),
        }
    }

    fn apply(&self, mut record: BlockRecord) -> BlockRecord {
        record.active = false;
        record.unblocked_at = Some(self.at);
        record.unblocked_by = Some(self.by.clone());
        record.unblock_reason = Some(self.reason.clone());
        record
    }
}

/// Storage operations behind [`super::BlockStore`]
#[async_trait]
pub trait BlockRepository: Send + Sync + 'static {
    /// Persist a new active record. Fails with `Conflict` while the identity has
    /// an active record in force; an active record that has already expired is
    /// deactivated first.
    async fn insert_active(&self, record: BlockRecord) -> Result<BlockRecord, GuardError>;

    /// The identity's active record, if it is still in force at `now`
    async fn find_active(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockRecord>, GuardError>;

    /// Deactivate the identity's active record
    async fn deactivate(
        &self,
        identity: &str,
        deactivation: Deactivation,
    ) -> Result<Option<BlockRecord>, GuardError>;

    /// Bump the violation counter of the in-force record. Returns false when
    /// there was nothing to bump.
    async fn increment_violation(&self, identity: &str, now: DateTime<Utc>) -> Result<bool, GuardError>;

    /// Blocks matching `filter`, newest first
    async fn list(
        &self,
        filter: &BlockFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<BlockRecord>, GuardError>;

    async fn statistics(&self, now: DateTime<Utc>) -> Result<BlockStatistics, GuardError>;

    /// Deactivate every active record whose expiry has passed
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, GuardError>;

    /// Cheap reachability check for the health endpoint
    async fn ping(&self) -> Result<(), GuardError>;
}

/// In-process registry: active records in a sharded map, deactivated records
/// in an append-only history.
#[derive(Default)]
pub struct MemoryBlockRepository {
    active: DashMap<String, BlockRecord>,
    history: RwLock<Vec<BlockRecord>>,
}

impl MemoryBlockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn archive(&self, record: BlockRecord) -> Result<(), GuardError> {
        self.history
            .write()
            .map_err(|_| GuardError::StoreUnavailable("history lock poisoned".to_string()))?
            .push(record);
        Ok(())
    }

    fn all_records(&self) -> Result<Vec<BlockRecord>, GuardError> {
        let mut records = self
            .history
            .read()
            .map_err(|_| GuardError::StoreUnavailable("history lock poisoned".to_string()))?
            .clone();
        records.extend(self.active.iter().map(|r| r.value().clone()));
        Ok(records)
    }
}

#[async_trait]
impl BlockRepository for MemoryBlockRepository {
    async fn insert_active(&self, record: BlockRecord) -> Result<BlockRecord, GuardError> {
        match self.active.entry(record.identity.clone()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_expired(record.created_at) {
                    return Err(GuardError::Conflict(record.identity));
                }
                let expired = slot.insert(record.clone());
                self.archive(Deactivation::expiration(record.created_at).apply(expired))?;
                Ok(record)
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn find_active(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockRecord>, GuardError> {
        Ok(self
            .active
            .get(identity)
            .filter(|r| r.is_in_force(now))
            .map(|r| r.value().clone()))
    }

    async fn deactivate(
        &self,
        identity: &str,
        deactivation: Deactivation,
    ) -> Result<Option<BlockRecord>, GuardError> {
        let Some((_, record)) = self.active.remove(identity) else {
            return Ok(None);
        };
        let record = deactivation.apply(record);
        self.archive(record.clone())?;
        Ok(Some(record))
    }

    async fn increment_violation(&self, identity: &str, now: DateTime<Utc>) -> Result<bool, GuardError> {
        match self.active.get_mut(identity) {
            Some(mut record) if record.is_in_force(now) => {
                record.violation_count += 1;
                record
                    .metadata
                    .insert("lastSeen".to_string(), serde_json::json!(now));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        filter: &BlockFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<BlockRecord>, GuardError> {
        let mut matching: Vec<BlockRecord> = self
            .all_records()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let offset = page.saturating_sub(1) as usize * limit as usize;
        let items = matching.into_iter().skip(offset).take(limit as usize).collect();
        Ok(Page::new(items, total, page, limit))
    }

    async fn statistics(&self, now: DateTime<Utc>) -> Result<BlockStatistics, GuardError> {
        let recent_since = now - Duration::hours(24);
        let mut stats = BlockStatistics::default();

        for record in self.all_records()? {
            stats.total += 1;
            if record.is_expired(now) {
                stats.expired += 1;
            }
            if record.created_at >= recent_since {
                stats.recent_24h += 1;
            }
            if record.is_in_force(now) {
                stats.active += 1;
                *stats.by_reason.entry(record.reason.to_string()).or_default() += 1;
                *stats.by_kind.entry(record.kind.to_string()).or_default() += 1;
            }
        }

        Ok(stats)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, GuardError> {
        let due: Vec<String> = self
            .active
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        let mut expired = 0;
        for identity in due {
            // Re-checked under the shard lock: the record may have been
            // unblocked or replaced since the scan.
            if let Some((_, record)) = self.active.remove_if(&identity, |_, r| r.is_expired(now)) {
                self.archive(Deactivation::expiration(now).apply(record))?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn ping(&self) -> Result<(), GuardError> {
        Ok(())
    }
}

/// Postgres-backed registry
#[derive(Clone)]
pub struct PgBlockRepository {
    pool: PgPool,
}

impl PgBlockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_record(row: BlockRow) -> Result<BlockRecord, GuardError> {
    BlockRecord::try_from(row).map_err(|e| GuardError::StoreUnavailable(e.to_string()))
}

#[async_trait]
impl BlockRepository for PgBlockRepository {
    async fn insert_active(&self, record: BlockRecord) -> Result<BlockRecord, GuardError> {
        queries::expire_identity(
            &self.pool,
            &record.identity,
            record.created_at,
            constants::SYSTEM_ACTOR,
            constants::EXPIRATION_REASON,
        )
        .await?;

        match queries::insert_block(&self.pool, &record).await {
            Ok(row) => into_record(row),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(GuardError::Conflict(record.identity))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_active(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockRecord>, GuardError> {
        queries::find_active_block(&self.pool, identity, now)
            .await?
            .map(into_record)
            .transpose()
    }

    async fn deactivate(
        &self,
        identity: &str,
        deactivation: Deactivation,
    ) -> Result<Option<BlockRecord>, GuardError> {
        queries::deactivate_block(
            &self.pool,
            identity,
            deactivation.at,
            &deactivation.by,
            &deactivation.reason,
        )
        .await?
        .map(into_record)
        .transpose()
    }

    async fn increment_violation(&self, identity: &str, now: DateTime<Utc>) -> Result<bool, GuardError> {
        Ok(queries::increment_violation(&self.pool, identity, now).await?)
    }

    async fn list(
        &self,
        filter: &BlockFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<BlockRecord>, GuardError> {
        let offset = page.saturating_sub(1) as i64 * limit as i64;
        let total = queries::count_blocks(&self.pool, filter).await?;
        let items = queries::list_blocks(&self.pool, filter, offset, limit as i64)
            .await?
            .into_iter()
            .map(into_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, page, limit))
    }

    async fn statistics(&self, now: DateTime<Utc>) -> Result<BlockStatistics, GuardError> {
        let (total, active, expired, recent) =
            queries::block_counts(&self.pool, now, now - Duration::hours(24)).await?;

        let mut stats = BlockStatistics {
            total: total.max(0) as u64,
            active: active.max(0) as u64,
            expired: expired.max(0) as u64,
            recent_24h: recent.max(0) as u64,
            ..Default::default()
        };

        for (reason, count) in
            queries::active_counts_by(&self.pool, queries::GroupColumn::Reason, now).await?
        {
            let reason: BlockReason = reason
                .parse()
                .map_err(|e: bastion_common::ParseError| GuardError::StoreUnavailable(e.to_string()))?;
            stats.by_reason.insert(reason.to_string(), count.max(0) as u64);
        }
        for (kind, count) in
            queries::active_counts_by(&self.pool, queries::GroupColumn::Kind, now).await?
        {
            let kind: BlockKind = kind
                .parse()
                .map_err(|e: bastion_common::ParseError| GuardError::StoreUnavailable(e.to_string()))?;
            stats.by_kind.insert(kind.to_string(), count.max(0) as u64);
        }

        Ok(stats)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, GuardError> {
        Ok(queries::expire_due_blocks(
            &self.pool,
            now,
            constants::SYSTEM_ACTOR,
            constants::EXPIRATION_REASON,
        )
        .await?)
    }

    async fn ping(&self) -> Result<(), GuardError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_common::Metadata;
    use uuid::Uuid;

    fn record(identity: &str, created_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> BlockRecord {
        BlockRecord {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            kind: BlockKind::Manual,
            reason: BlockReason::Abuse,
            active: true,
            expires_at,
            violation_count: 0,
            metadata: Metadata::new(),
            blocked_by: "admin".to_string(),
            created_at,
            unblocked_at: None,
            unblocked_by: None,
            unblock_reason: None,
        }
    }

    #[tokio::test]
    async fn test_insert_conflicts_while_active() {
        let repo = MemoryBlockRepository::new();
        let now = Utc::now();

        repo.insert_active(record("1.1.1.1", now, None)).await.unwrap();
        let err = repo.insert_active(record("1.1.1.1", now, None)).await.unwrap_err();
        assert!(matches!(err, GuardError::Conflict(ref id) if id == "1.1.1.1"));

        // Different identity is unaffected
        repo.insert_active(record("2.2.2.2", now, None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_replaces_expired_active_record() {
        let repo = MemoryBlockRepository::new();
        let now = Utc::now();

        let old = repo
            .insert_active(record("1.1.1.1", now - Duration::hours(2), Some(now - Duration::hours(1))))
            .await
            .unwrap();
        let new = repo.insert_active(record("1.1.1.1", now, None)).await.unwrap();

        let page = repo.list(&BlockFilter::default(), 1, 10).await.unwrap();
        assert_eq!(page.total, 2);
        let archived = page.items.iter().find(|r| r.id == old.id).unwrap();
        assert!(!archived.active);
        assert_eq!(archived.unblocked_by.as_deref(), Some(constants::SYSTEM_ACTOR));
        assert!(page.items.iter().any(|r| r.id == new.id && r.active));
    }

    #[tokio::test]
    async fn test_expire_due_is_selective() {
        let repo = MemoryBlockRepository::new();
        let now = Utc::now();

        repo.insert_active(record("1.1.1.1", now, Some(now - Duration::seconds(1))))
            .await
            .unwrap();
        repo.insert_active(record("2.2.2.2", now, Some(now + Duration::hours(1))))
            .await
            .unwrap();
        repo.insert_active(record("3.3.3.3", now, None)).await.unwrap();

        assert_eq!(repo.expire_due(now).await.unwrap(), 1);
        assert_eq!(repo.expire_due(now).await.unwrap(), 0);
        assert!(repo.find_active("2.2.2.2", now).await.unwrap().is_some());
        assert!(repo.find_active("3.3.3.3", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_paginates_newest_first() {
        let repo = MemoryBlockRepository::new();
        let now = Utc::now();
        for i in 0..5 {
            repo.insert_active(record(&format!("10.0.0.{}", i), now - Duration::minutes(i), None))
                .await
                .unwrap();
        }

        let first = repo.list(&BlockFilter::default(), 1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.pages, 3);
        assert_eq!(first.items[0].identity, "10.0.0.0");
        assert_eq!(first.items[1].identity, "10.0.0.1");

        let last = repo.list(&BlockFilter::default(), 3, 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].identity, "10.0.0.4");
    }

    #[tokio::test]
    async fn test_increment_ignores_expired() {
        let repo = MemoryBlockRepository::new();
        let now = Utc::now();
        repo.insert_active(record("1.1.1.1", now, Some(now - Duration::seconds(1))))
            .await
            .unwrap();

        assert!(!repo.increment_violation("1.1.1.1", now).await.unwrap());
        assert!(!repo.increment_violation("9.9.9.9", now).await.unwrap());
    }
}
