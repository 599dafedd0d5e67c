//! Behavioral fraud scorer
//!
//! Keeps a sliding-window tracking entry per identity and turns heuristic hits
//! into block requests against the [`BlockStore`]. Entries live in a sharded
//! map; an event mutates its entry under that key's shard lock only, and the
//! lock is always released before the block store is awaited.

use super::heuristics::{self, SpamScore};
use super::store::BlockStore;
use crate::config::ScoringConfig;
use bastion_common::{
    BlockReason, BlockRecord, FraudEvent, Metadata, SuspiciousActivity, TrackingSnapshot,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Longest content excerpt stored in spam block metadata
const EXCERPT_CHARS: usize = 200;

/// Suspicious-activity descriptions copied into block metadata
const RECENT_ACTIVITY_IN_METADATA: usize = 5;

/// Behavioral state for one identity
#[derive(Debug, Default)]
pub struct FraudTrackingEntry {
    failed_logins: VecDeque<DateTime<Utc>>,
    requests: VecDeque<DateTime<Utc>>,
    file_uploads: VecDeque<DateTime<Utc>>,
    suspicious_activities: VecDeque<SuspiciousActivity>,
}

impl FraudTrackingEntry {
    /// Most recent timestamp across all four lists
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        [
            self.failed_logins.back().copied(),
            self.requests.back().copied(),
            self.file_uploads.back().copied(),
            self.suspicious_activities.back().map(|s| s.timestamp),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    fn flag(&mut self, now: DateTime<Utc>, description: String, cap: usize) {
        self.suspicious_activities.push_back(SuspiciousActivity {
            timestamp: now,
            description,
        });
        while self.suspicious_activities.len() > cap.max(1) {
            self.suspicious_activities.pop_front();
        }
    }

    fn recent_activity(&self) -> Vec<String> {
        self.suspicious_activities
            .iter()
            .rev()
            .take(RECENT_ACTIVITY_IN_METADATA)
            .map(|s| s.description.clone())
            .collect()
    }

    fn snapshot(&self, identity: &str) -> TrackingSnapshot {
        TrackingSnapshot {
            identity: identity.to_string(),
            failed_logins: self.failed_logins.len(),
            requests: self.requests.len(),
            file_uploads: self.file_uploads.len(),
            suspicious_activities: self.suspicious_activities.iter().cloned().collect(),
            last_activity: self.last_activity(),
        }
    }
}

/// Append `now` and drop timestamps at or before `cutoff` from the front.
/// Lists are kept in arrival order and never grow past `cap`.
fn push_window(
    times: &mut VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
    cap: usize,
) {
    times.push_back(now);
    while times.front().is_some_and(|t| *t <= cutoff) {
        times.pop_front();
    }
    while times.len() > cap.max(1) {
        times.pop_front();
    }
}

/// Timestamps in `times` newer than `cutoff`
fn count_since(times: &VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) -> usize {
    times.len() - times.partition_point(|t| *t <= cutoff)
}

/// Result of scoring a single event
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    /// The event added an entry to the suspicious-activity log
    pub suspicious: bool,
    /// Present for content events
    pub spam_score: Option<u32>,
    pub is_spam: bool,
    /// Block in force after this event, if the event triggered one
    pub block: Option<BlockRecord>,
}

/// Block the scorer wants the store to create
#[derive(Debug)]
struct BlockRequest {
    reason: BlockReason,
    expires_at: Option<DateTime<Utc>>,
    metadata: Metadata,
}

#[derive(Debug, Default)]
struct Verdict {
    suspicious: bool,
    spam: Option<SpamScore>,
    block: Option<BlockRequest>,
}

/// Per-identity behavioral tracker. Cheap to clone.
#[derive(Clone)]
pub struct FraudScorer {
    entries: Arc<DashMap<String, FraudTrackingEntry>>,
    store: BlockStore,
    config: Arc<ScoringConfig>,
}

impl FraudScorer {
    pub fn new(store: BlockStore, config: ScoringConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            store,
            config: Arc::new(config),
        }
    }

    /// Fire-and-forget form of [`Self::record_event`] for the request path
    pub fn report(&self, identity: &str, event: FraudEvent) {
        let scorer = self.clone();
        let identity = identity.to_string();
        tokio::spawn(async move {
            scorer.record_event(&identity, &event).await;
        });
    }

    /// Score an event and request a block when a heuristic trips
    pub async fn record_event(&self, identity: &str, event: &FraudEvent) -> EventOutcome {
        self.record_event_at(identity, event, Utc::now()).await
    }

    pub(crate) async fn record_event_at(
        &self,
        identity: &str,
        event: &FraudEvent,
        now: DateTime<Utc>,
    ) -> EventOutcome {
        let verdict = self.evaluate(identity, event, now);

        let block = match verdict.block {
            Some(request) => {
                tracing::warn!(
                    "Auto-blocking {} for {} after {} event",
                    identity,
                    request.reason,
                    event.kind()
                );
                match self
                    .store
                    .auto_block(identity, request.reason, Some(request.metadata), request.expires_at)
                    .await
                {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::error!("Auto-block failed for {}: {}", identity, e);
                        None
                    }
                }
            }
            None => None,
        };

        EventOutcome {
            suspicious: verdict.suspicious,
            spam_score: verdict.spam.as_ref().map(|s| s.score()),
            is_spam: verdict
                .spam
                .as_ref()
                .is_some_and(|s| s.score() >= self.config.spam_threshold),
            block,
        }
    }

    /// Apply the event to the identity's entry. Holds the entry's shard lock
    /// for the duration; never awaits.
    fn evaluate(&self, identity: &str, event: &FraudEvent, now: DateTime<Utc>) -> Verdict {
        let cfg = &*self.config;
        let mut entry = self.entries.entry(identity.to_string()).or_default();
        let retention_cutoff = now - cfg.retention;

        match event {
            FraudEvent::FailedLogin => {
                push_window(
                    &mut entry.failed_logins,
                    now,
                    now - cfg.failed_login_window,
                    cfg.max_events_per_list,
                );

                let attempts = entry.failed_logins.len();
                if attempts < cfg.max_failed_logins {
                    return Verdict::default();
                }
                let mut metadata = Metadata::new();
                metadata.insert(
                    "trigger".to_string(),
                    serde_json::json!(format!(
                        "{} failed logins within {} minutes",
                        attempts,
                        cfg.failed_login_window.num_minutes()
                    )),
                );
                metadata.insert("failedLogins".to_string(), serde_json::json!(attempts));
                Verdict {
                    block: Some(BlockRequest {
                        reason: BlockReason::MultipleFailedLogins,
                        expires_at: Some(now + cfg.failed_login_block),
                        metadata,
                    }),
                    ..Default::default()
                }
            }

            FraudEvent::Request { endpoint, body } => {
                push_window(&mut entry.requests, now, retention_cutoff, cfg.max_events_per_list);

                let mut suspicious = false;
                let hits = heuristics::scan_request_body(body);
                if !hits.is_empty() {
                    entry.flag(
                        now,
                        format!("Suspicious pattern {:?} in request to {}", hits, endpoint),
                        cfg.max_activity_log,
                    );
                    suspicious = true;
                }

                let burst = count_since(&entry.requests, now - cfg.request_burst_window);
                if burst > cfg.max_requests_per_burst {
                    entry.flag(
                        now,
                        format!(
                            "Request rate exceeded: {} requests in {}s",
                            burst,
                            cfg.request_burst_window.num_seconds()
                        ),
                        cfg.max_activity_log,
                    );
                    suspicious = true;
                }

                let block = self.threshold_block(
                    &entry,
                    suspicious,
                    BlockReason::SuspiciousActivity,
                    Some(now + cfg.suspicious_block),
                    endpoint,
                );
                Verdict {
                    suspicious,
                    spam: None,
                    block,
                }
            }

            FraudEvent::FileUpload { filename, size } => {
                push_window(&mut entry.file_uploads, now, retention_cutoff, cfg.max_events_per_list);

                let flags = heuristics::check_upload(
                    filename,
                    *size,
                    entry.file_uploads.len(),
                    cfg.max_uploads_per_hour,
                    cfg.max_upload_bytes,
                );
                let suspicious = !flags.is_empty();
                if suspicious {
                    let reasons: Vec<String> = flags.iter().map(|f| f.describe()).collect();
                    entry.flag(
                        now,
                        format!("Suspicious upload {}: {}", filename, reasons.join(", ")),
                        cfg.max_activity_log,
                    );
                }

                let block = self.threshold_block(
                    &entry,
                    suspicious,
                    BlockReason::MaliciousUploads,
                    cfg.upload_block.map(|ttl| now + ttl),
                    filename,
                );
                Verdict {
                    suspicious,
                    spam: None,
                    block,
                }
            }

            FraudEvent::ContentActivity { text, label } => {
                let spam = heuristics::spam_score(text);
                let score = spam.score();
                if score < cfg.spam_threshold {
                    return Verdict {
                        spam: Some(spam),
                        ..Default::default()
                    };
                }

                let description = format!("Spam content ({}) with score {}", label, score);
                entry.flag(now, description.clone(), cfg.max_activity_log);

                let mut metadata = Metadata::new();
                metadata.insert("trigger".to_string(), serde_json::json!(description));
                metadata.insert("spamScore".to_string(), serde_json::json!(score));
                metadata.insert("label".to_string(), serde_json::json!(label));
                metadata.insert("matchedKeywords".to_string(), serde_json::json!(spam.keywords));
                metadata.insert(
                    "contentExcerpt".to_string(),
                    serde_json::json!(heuristics::excerpt(text, EXCERPT_CHARS)),
                );
                metadata.insert(
                    "recentActivity".to_string(),
                    serde_json::json!(entry.recent_activity()),
                );

                Verdict {
                    suspicious: true,
                    block: Some(BlockRequest {
                        reason: BlockReason::Spam,
                        expires_at: cfg.spam_block.map(|ttl| now + ttl),
                        metadata,
                    }),
                    spam: Some(spam),
                }
            }
        }
    }

    /// Block once the cumulative suspicious-activity log reaches the threshold.
    /// Only evaluated for events that were themselves suspicious.
    fn threshold_block(
        &self,
        entry: &FraudTrackingEntry,
        suspicious: bool,
        reason: BlockReason,
        expires_at: Option<DateTime<Utc>>,
        subject: &str,
    ) -> Option<BlockRequest> {
        let count = entry.suspicious_activities.len();
        if !suspicious || count < self.config.suspicious_threshold {
            return None;
        }

        let mut metadata = Metadata::new();
        metadata.insert(
            "trigger".to_string(),
            serde_json::json!(format!("{} suspicious activities, latest on {}", count, subject)),
        );
        metadata.insert(
            "recentActivity".to_string(),
            serde_json::json!(entry.recent_activity()),
        );
        Some(BlockRequest {
            reason,
            expires_at,
            metadata,
        })
    }

    /// Drop entries with no activity inside the idle TTL
    pub fn collect_garbage(&self) -> usize {
        self.collect_garbage_at(Utc::now())
    }

    pub(crate) fn collect_garbage_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.idle_ttl;
        let mut dropped = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.last_activity().is_some_and(|t| t > cutoff);
            if !keep {
                dropped += 1;
            }
            keep
        });
        if dropped > 0 {
            tracing::info!("Dropped {} idle fraud tracking entries", dropped);
        }
        dropped
    }

    pub fn snapshot(&self, identity: &str) -> Option<TrackingSnapshot> {
        self.entries.get(identity).map(|e| e.snapshot(identity))
    }

    /// Discard all tracking for an identity
    pub fn forget(&self, identity: &str) -> bool {
        self.entries.remove(identity).is_some()
    }

    /// Number of identities currently tracked
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
