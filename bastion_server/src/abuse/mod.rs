//! Abuse mitigation core
//!
//! - Block registry with at most one active block per identity
//! - Behavioral fraud scoring with automatic blocking
//! - Request gate that denies blocked identities (fail-open)
//! - Periodic expiry sweep and tracking GC

pub mod gate;
pub mod heuristics;
pub mod repository;
pub mod scorer;
pub mod store;
pub mod sweeper;

pub use gate::{canonical_identity, GateDecision, RequestGate};
pub use repository::{BlockRepository, MemoryBlockRepository, PgBlockRepository};
pub use scorer::{EventOutcome, FraudScorer};
pub use store::BlockStore;
pub use sweeper::ExpirySweeper;

use crate::config::Config;
use crate::error::GuardError;
use bastion_common::{
    BlockFilter, BlockKind, BlockReason, BlockRecord, BlockStatistics, CleanupReport, FraudEvent,
    Metadata, Page, TrackingSnapshot,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Wired-up core: one registry shared by the gate, scorer and sweeper
#[derive(Clone)]
pub struct Guard {
    pub store: BlockStore,
    pub scorer: FraudScorer,
    pub gate: RequestGate,
    pub sweeper: ExpirySweeper,
}

impl Guard {
    pub fn new(repo: Arc<dyn BlockRepository>, config: &Config) -> Self {
        let store = BlockStore::new(repo);
        let scorer = FraudScorer::new(store.clone(), config.scoring.clone());
        let gate = RequestGate::new(store.clone(), config.gate.clone());
        let sweeper = ExpirySweeper::new(store.clone(), scorer.clone(), config.sweeper.clone());
        Self {
            store,
            scorer,
            gate,
            sweeper,
        }
    }

    /// Administrative block. The description is kept in the record's metadata
    /// and shown to the client on denial.
    pub async fn block(
        &self,
        identity: &str,
        kind: BlockKind,
        reason: BlockReason,
        actor: &str,
        expires_at: Option<DateTime<Utc>>,
        description: Option<String>,
    ) -> Result<BlockRecord, GuardError> {
        let identity = canonical_identity(identity)?;

        let metadata = description.filter(|d| !d.trim().is_empty()).map(|d| {
            let mut metadata = Metadata::new();
            metadata.insert("description".to_string(), serde_json::json!(d));
            metadata
        });
        self.store
            .create(&identity, kind, reason, actor, expires_at, metadata)
            .await
    }

    /// Administrative unblock. Also discards the identity's fraud tracking.
    pub async fn unblock(
        &self,
        identity: &str,
        actor: &str,
        reason: &str,
    ) -> Result<BlockRecord, GuardError> {
        let identity = canonical_identity(identity)?;
        let record = self.store.unblock(&identity, actor, reason).await?;
        if self.scorer.forget(&identity) {
            tracing::debug!("Cleared fraud tracking for {}", identity);
        }
        Ok(record)
    }

    /// Feed a collaborator-reported event to the scorer without waiting on it
    pub fn report_event(&self, identity: &str, event: FraudEvent) -> Result<(), GuardError> {
        let identity = canonical_identity(identity)?;
        self.scorer.report(&identity, event);
        Ok(())
    }

    /// Fraud tracking for an identity, if any is held
    pub fn tracking(&self, identity: &str) -> Result<Option<TrackingSnapshot>, GuardError> {
        Ok(self.scorer.snapshot(&canonical_identity(identity)?))
    }

    pub async fn list_blocks(
        &self,
        filter: &BlockFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<BlockRecord>, GuardError> {
        self.store.list_blocks(filter, page, limit).await
    }

    pub async fn statistics(&self) -> Result<BlockStatistics, GuardError> {
        self.store.statistics().await
    }

    pub async fn trigger_cleanup(&self) -> Result<CleanupReport, GuardError> {
        self.sweeper.trigger_cleanup().await
    }
}
