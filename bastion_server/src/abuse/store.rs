//! Block registry: lifecycle of block records on top of a [`BlockRepository`]

use super::repository::{BlockRepository, Deactivation};
use crate::error::GuardError;
use bastion_common::{
    constants, BlockFilter, BlockKind, BlockReason, BlockRecord, BlockStatistics, Metadata, Page,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Handle to the block registry. Cheap to clone.
#[derive(Clone)]
pub struct BlockStore {
    repo: Arc<dyn BlockRepository>,
}

impl BlockStore {
    pub fn new(repo: Arc<dyn BlockRepository>) -> Self {
        Self { repo }
    }

    /// Create a new active block. Fails with `Conflict` if one is already in force.
    pub async fn create(
        &self,
        identity: &str,
        kind: BlockKind,
        reason: BlockReason,
        actor: &str,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<Metadata>,
    ) -> Result<BlockRecord, GuardError> {
        let now = Utc::now();

        let mut seeded = Metadata::new();
        seeded.insert("firstSeen".to_string(), serde_json::json!(now));
        seeded.insert("lastSeen".to_string(), serde_json::json!(now));
        if let Some(extra) = metadata {
            seeded.extend(extra);
        }

        let record = BlockRecord {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            kind,
            reason,
            active: true,
            expires_at,
            violation_count: 0,
            metadata: seeded,
            blocked_by: actor.to_string(),
            created_at: now,
            unblocked_at: None,
            unblocked_by: None,
            unblock_reason: None,
        };

        let record = self.repo.insert_active(record).await?;
        tracing::info!(
            "Blocked {} ({}, {}) by {}, expires {}",
            record.identity,
            record.kind,
            record.reason,
            record.blocked_by,
            record
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
        Ok(record)
    }

    /// Block on behalf of the fraud scorer. An existing block absorbs the
    /// request as another violation instead of failing.
    pub async fn auto_block(
        &self,
        identity: &str,
        reason: BlockReason,
        metadata: Option<Metadata>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlockRecord, GuardError> {
        let attempt = |metadata: Option<Metadata>| {
            self.create(
                identity,
                reason.automatic_kind(),
                reason,
                constants::SYSTEM_ACTOR,
                expires_at,
                metadata,
            )
        };

        match attempt(metadata.clone()).await {
            Err(GuardError::Conflict(_)) => {}
            other => return other,
        }

        tracing::debug!("{} already blocked, counting violation", identity);
        self.increment_violation(identity).await;
        if let Some(record) = self.repo.find_active(identity, Utc::now()).await? {
            return Ok(record);
        }

        // The conflicting block was lifted or expired in between
        tracing::debug!("Block on {} went away, retrying", identity);
        match attempt(metadata).await {
            Err(GuardError::Conflict(_)) => self
                .repo
                .find_active(identity, Utc::now())
                .await?
                .ok_or_else(|| GuardError::NotFound(identity.to_string())),
            other => other,
        }
    }

    /// Lift the active block for an identity
    pub async fn unblock(
        &self,
        identity: &str,
        actor: &str,
        reason: &str,
    ) -> Result<BlockRecord, GuardError> {
        let deactivation = Deactivation {
            at: Utc::now(),
            by: actor.to_string(),
            reason: reason.to_string(),
        };
        let record = self
            .repo
            .deactivate(identity, deactivation)
            .await?
            .ok_or_else(|| GuardError::NotFound(identity.to_string()))?;
        tracing::info!("Unblocked {} by {}: {}", identity, actor, reason);
        Ok(record)
    }

    /// The block currently in force for an identity, evaluated at query time
    pub async fn active_block(&self, identity: &str) -> Result<Option<BlockRecord>, GuardError> {
        self.repo.find_active(identity, Utc::now()).await
    }

    /// Whether the identity is blocked right now. Store failures fail open.
    pub async fn is_blocked(&self, identity: &str) -> bool {
        match self.active_block(identity).await {
            Ok(block) => block.is_some(),
            Err(e) => {
                tracing::error!("Block lookup failed for {}, allowing: {}", identity, e);
                false
            }
        }
    }

    /// Count another violation against the active block. Best-effort.
    pub async fn increment_violation(&self, identity: &str) {
        match self.repo.increment_violation(identity, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("No active block to count violation for {}", identity),
            Err(e) => tracing::warn!("Failed to count violation for {}: {}", identity, e),
        }
    }

    /// List blocks, newest first. `page` is 1-based.
    pub async fn list_blocks(
        &self,
        filter: &BlockFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<BlockRecord>, GuardError> {
        let page = page.max(1);
        let limit = limit.clamp(1, constants::MAX_PAGE_LIMIT);
        self.repo.list(filter, page, limit).await
    }

    pub async fn statistics(&self) -> Result<BlockStatistics, GuardError> {
        self.repo.statistics(Utc::now()).await
    }

    /// Deactivate every block whose expiry has passed
    pub async fn expire_sweep(&self) -> Result<u64, GuardError> {
        self.expire_sweep_at(Utc::now()).await
    }

    pub(crate) async fn expire_sweep_at(&self, now: DateTime<Utc>) -> Result<u64, GuardError> {
        let expired = self.repo.expire_due(now).await?;
        if expired > 0 {
            tracing::info!("Expired {} blocks", expired);
        }
        Ok(expired)
    }

    pub async fn ping(&self) -> Result<(), GuardError> {
        self.repo.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::repository::MemoryBlockRepository;
    use crate::abuse::testing::DownRepository;
    use async_trait::async_trait;
    use chrono::Duration;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store() -> BlockStore {
        BlockStore::new(Arc::new(MemoryBlockRepository::new()))
    }

    #[tokio::test]
    async fn test_create_seeds_metadata() {
        let store = store();
        let mut extra = Metadata::new();
        extra.insert("userAgent".to_string(), serde_json::json!("curl/8.0"));

        let record = store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Abuse, "alice", None, Some(extra))
            .await
            .unwrap();

        assert!(record.active);
        assert_eq!(record.violation_count, 0);
        assert_eq!(record.blocked_by, "alice");
        assert!(record.metadata.contains_key("firstSeen"));
        assert!(record.metadata.contains_key("lastSeen"));
        assert_eq!(record.metadata["userAgent"], "curl/8.0");
    }

    #[tokio::test]
    async fn test_double_create_conflicts() {
        let store = store();
        store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Abuse, "admin", None, None)
            .await
            .unwrap();

        let err = store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Spam, "admin", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_auto_block_is_idempotent() {
        let store = store();
        let first = store
            .auto_block("10.0.0.1", BlockReason::SuspiciousActivity, None, None)
            .await
            .unwrap();
        assert_eq!(first.kind, BlockKind::FraudDetection);
        assert_eq!(first.blocked_by, constants::SYSTEM_ACTOR);

        let mut last = first.violation_count;
        for _ in 0..3 {
            let again = store
                .auto_block("10.0.0.1", BlockReason::Spam, None, None)
                .await
                .unwrap();
            assert_eq!(again.id, first.id);
            assert!(again.violation_count > last);
            last = again.violation_count;
        }

        let active = store
            .list_blocks(&BlockFilter { active: Some(true), ..Default::default() }, 1, 20)
            .await
            .unwrap();
        assert_eq!(active.total, 1);
        assert_eq!(active.items[0].violation_count, 3);
    }

    #[tokio::test]
    async fn test_concurrent_auto_blocks_keep_one_active() {
        let store = store();

        let calls = (0..50).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .auto_block("10.0.0.9", BlockReason::MultipleFailedLogins, None, None)
                    .await
            })
        });
        for result in join_all(calls).await {
            assert!(result.unwrap().is_ok());
        }

        let active = store
            .list_blocks(&BlockFilter { active: Some(true), ..Default::default() }, 1, 100)
            .await
            .unwrap();
        assert_eq!(active.total, 1);
        assert_eq!(active.items[0].violation_count, 49);
    }

    #[tokio::test]
    async fn test_concurrent_create_and_auto_block_keep_one_active() {
        let store = store();

        let manual = (0..25).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .create("10.0.0.10", BlockKind::Manual, BlockReason::Abuse, "admin", None, None)
                    .await
            })
        });
        let automatic = (0..25).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .auto_block("10.0.0.10", BlockReason::SuspiciousActivity, None, None)
                    .await
            })
        });
        let (manual, automatic) = tokio::join!(join_all(manual), join_all(automatic));

        let mut created = 0;
        for result in manual {
            match result.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, GuardError::Conflict(_))),
            }
        }
        for result in automatic {
            assert!(result.unwrap().is_ok());
        }
        assert!(created <= 1);

        let active = store
            .list_blocks(&BlockFilter { active: Some(true), ..Default::default() }, 1, 100)
            .await
            .unwrap();
        assert_eq!(active.total, 1);
        // Every auto-block except one that created the record counts a violation
        let expected = if created == 1 { 25 } else { 24 };
        assert_eq!(active.items[0].violation_count, expected);
    }

    #[tokio::test]
    async fn test_auto_block_retries_when_conflicting_block_vanishes() {
        let repo = Arc::new(VanishingRepository {
            inner: MemoryBlockRepository::new(),
            conflicted: AtomicBool::new(false),
        });
        let store = BlockStore::new(repo.clone());

        let record = store
            .auto_block("10.0.0.11", BlockReason::MultipleFailedLogins, None, None)
            .await
            .unwrap();
        assert!(repo.conflicted.load(Ordering::SeqCst));
        assert!(record.active);
        assert_eq!(record.reason, BlockReason::MultipleFailedLogins);
        assert!(store.is_blocked("10.0.0.11").await);
    }

    /// Reports a conflict on the first insert, as if a block was lifted right after
    struct VanishingRepository {
        inner: MemoryBlockRepository,
        conflicted: AtomicBool,
    }

    #[async_trait]
    impl BlockRepository for VanishingRepository {
        async fn insert_active(&self, record: BlockRecord) -> Result<BlockRecord, GuardError> {
            if !self.conflicted.swap(true, Ordering::SeqCst) {
                return Err(GuardError::Conflict(record.identity));
            }
            self.inner.insert_active(record).await
        }
        async fn find_active(&self, identity: &str, now: DateTime<Utc>) -> Result<Option<BlockRecord>, GuardError> {
            self.inner.find_active(identity, now).await
        }
        async fn deactivate(&self, identity: &str, d: Deactivation) -> Result<Option<BlockRecord>, GuardError> {
            self.inner.deactivate(identity, d).await
        }
        async fn increment_violation(&self, identity: &str, now: DateTime<Utc>) -> Result<bool, GuardError> {
            self.inner.increment_violation(identity, now).await
        }
        async fn list(&self, filter: &BlockFilter, page: u32, limit: u32) -> Result<Page<BlockRecord>, GuardError> {
            self.inner.list(filter, page, limit).await
        }
        async fn statistics(&self, now: DateTime<Utc>) -> Result<BlockStatistics, GuardError> {
            self.inner.statistics(now).await
        }
        async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64, GuardError> {
            self.inner.expire_due(now).await
        }
        async fn ping(&self) -> Result<(), GuardError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_unblock_not_found() {
        let store = store();
        let err = store.unblock("10.0.0.1", "admin", "mistake").await.unwrap_err();
        assert!(matches!(err, GuardError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_block_unblock_round_trip() {
        let store = store();
        store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::AdminDecision, "admin", None, None)
            .await
            .unwrap();
        let unblocked = store.unblock("10.0.0.1", "admin", "appeal granted").await.unwrap();
        assert!(!unblocked.active);
        assert!(unblocked.unblocked_at.is_some());

        let active = store
            .list_blocks(&BlockFilter { active: Some(true), ..Default::default() }, 1, 20)
            .await
            .unwrap();
        assert!(active.items.iter().all(|r| r.identity != "10.0.0.1"));

        let inactive = store
            .list_blocks(&BlockFilter { active: Some(false), ..Default::default() }, 1, 20)
            .await
            .unwrap();
        let record = inactive.items.iter().find(|r| r.identity == "10.0.0.1").unwrap();
        assert_eq!(record.unblock_reason.as_deref(), Some("appeal granted"));
        assert_eq!(record.unblocked_by.as_deref(), Some("admin"));

        // A fresh block is allowed once the old one is inactive
        store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Abuse, "admin", None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expiry_is_live_before_sweep() {
        let store = store();
        let past = Utc::now() - Duration::seconds(1);
        store
            .create("10.0.0.1", BlockKind::Automatic, BlockReason::Spam, "system", Some(past), None)
            .await
            .unwrap();

        assert!(!store.is_blocked("10.0.0.1").await);
        assert!(store.active_block("10.0.0.1").await.unwrap().is_none());

        assert_eq!(store.expire_sweep().await.unwrap(), 1);
        let inactive = store
            .list_blocks(&BlockFilter { active: Some(false), ..Default::default() }, 1, 20)
            .await
            .unwrap();
        assert_eq!(inactive.items[0].unblocked_by.as_deref(), Some(constants::SYSTEM_ACTOR));
        assert_eq!(
            inactive.items[0].unblock_reason.as_deref(),
            Some(constants::EXPIRATION_REASON)
        );
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = store();
        store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Abuse, "admin", None, None)
            .await
            .unwrap();
        store
            .auto_block("10.0.0.2", BlockReason::Spam, None, None)
            .await
            .unwrap();
        store
            .create(
                "10.0.0.3",
                BlockKind::Automatic,
                BlockReason::Spam,
                "system",
                Some(Utc::now() - Duration::minutes(1)),
                None,
            )
            .await
            .unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.recent_24h, 3);
        assert_eq!(stats.by_reason.get("spam"), Some(&1));
        assert_eq!(stats.by_kind.get("manual"), Some(&1));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let store = BlockStore::new(Arc::new(DownRepository));
        assert!(!store.is_blocked("10.0.0.1").await);
        // Never panics or propagates
        store.increment_violation("10.0.0.1").await;
        assert!(matches!(
            store.statistics().await,
            Err(GuardError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_list_clamps_paging() {
        let store = store();
        let page = store.list_blocks(&BlockFilter::default(), 0, 10_000).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, constants::MAX_PAGE_LIMIT);
    }
}
