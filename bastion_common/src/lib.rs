//! Bastion Common - Shared data model for the abuse-mitigation core
//!
//! This crate contains the block registry records, fraud event payloads and
//! admin request/response bodies used by both the server and CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Free-form metadata attached to a block record
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Parse errors for the string forms of the registry enums
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown block kind: {0}")]
    UnknownKind(String),

    #[error("Unknown block reason: {0}")]
    UnknownReason(String),
}

/// How a block came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Manual,
    Automatic,
    RateLimit,
    FraudDetection,
}

impl BlockKind {
    pub const ALL: [BlockKind; 4] = [
        BlockKind::Manual,
        BlockKind::Automatic,
        BlockKind::RateLimit,
        BlockKind::FraudDetection,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Manual => "manual",
            BlockKind::Automatic => "automatic",
            BlockKind::RateLimit => "rate_limit",
            BlockKind::FraudDetection => "fraud_detection",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseError::UnknownKind(s.to_string()))
    }
}

/// Why an identity was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Spam,
    Fraud,
    Abuse,
    SuspiciousActivity,
    RateLimitExceeded,
    MultipleFailedLogins,
    MaliciousUploads,
    AdminDecision,
}

impl BlockReason {
    pub const ALL: [BlockReason; 8] = [
        BlockReason::Spam,
        BlockReason::Fraud,
        BlockReason::Abuse,
        BlockReason::SuspiciousActivity,
        BlockReason::RateLimitExceeded,
        BlockReason::MultipleFailedLogins,
        BlockReason::MaliciousUploads,
        BlockReason::AdminDecision,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Spam => "spam",
            BlockReason::Fraud => "fraud",
            BlockReason::Abuse => "abuse",
            BlockReason::SuspiciousActivity => "suspicious_activity",
            BlockReason::RateLimitExceeded => "rate_limit_exceeded",
            BlockReason::MultipleFailedLogins => "multiple_failed_logins",
            BlockReason::MaliciousUploads => "malicious_uploads",
            BlockReason::AdminDecision => "admin_decision",
        }
    }

    /// Human readable explanation shown to blocked clients
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::Spam => "Spam-like content was detected from this address",
            BlockReason::Fraud => "Fraudulent activity was detected from this address",
            BlockReason::Abuse => "This address has been blocked for abuse",
            BlockReason::SuspiciousActivity => "Suspicious requests were detected from this address",
            BlockReason::RateLimitExceeded => "Too many requests were sent from this address",
            BlockReason::MultipleFailedLogins => "Too many failed login attempts from this address",
            BlockReason::MaliciousUploads => "Potentially malicious uploads were detected from this address",
            BlockReason::AdminDecision => "This address has been blocked by an administrator",
        }
    }

    /// Kind assigned to blocks the scorer creates for this reason
    pub fn automatic_kind(&self) -> BlockKind {
        match self {
            BlockReason::RateLimitExceeded => BlockKind::RateLimit,
            BlockReason::SuspiciousActivity | BlockReason::MaliciousUploads | BlockReason::Fraud => {
                BlockKind::FraudDetection
            }
            _ => BlockKind::Automatic,
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockReason {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ParseError::UnknownReason(s.to_string()))
    }
}

/// One block event in the registry. Records are never deleted; deactivation
/// stamps the `unblocked_*` fields and leaves the row as audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: Uuid,

    /// Blocked identity (client IP address)
    pub identity: String,

    pub kind: BlockKind,

    pub reason: BlockReason,

    pub active: bool,

    /// None means the block never expires
    pub expires_at: Option<DateTime<Utc>>,

    pub violation_count: u64,

    #[serde(default)]
    pub metadata: Metadata,

    /// Actor that created the block ("system" for automatic blocks)
    pub blocked_by: String,

    pub created_at: DateTime<Utc>,

    pub unblocked_at: Option<DateTime<Utc>>,

    pub unblocked_by: Option<String>,

    pub unblock_reason: Option<String>,
}

impl BlockRecord {
    /// Whether `expires_at` has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// Active and not yet expired
    pub fn is_in_force(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }

    /// Free text the admin attached when creating the block
    pub fn description(&self) -> Option<&str> {
        self.metadata.get("description").and_then(|v| v.as_str())
    }
}

/// Filters for listing blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFilter {
    pub active: Option<bool>,
    pub kind: Option<BlockKind>,
    pub reason: Option<BlockReason>,
}

impl BlockFilter {
    pub fn matches(&self, record: &BlockRecord) -> bool {
        self.active.map_or(true, |a| record.active == a)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.reason.map_or(true, |r| record.reason == r)
    }
}

/// Query string for the list endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBlocksQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<BlockKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ListBlocksQuery {
    pub fn filter(&self) -> BlockFilter {
        BlockFilter {
            active: self.active,
            kind: self.kind,
            reason: self.reason,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, limit: u32) -> Self {
        let pages = if limit == 0 {
            0
        } else {
            total.div_ceil(limit as u64) as u32
        };
        Self {
            items,
            total,
            page,
            limit,
            pages,
        }
    }
}

/// Registry statistics for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatistics {
    pub total: u64,
    pub active: u64,
    pub expired: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub by_kind: BTreeMap<String, u64>,
    pub recent_24h: u64,
}

/// Body returned to a denied client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenialPayload {
    pub message: String,
    pub reason: BlockReason,
    pub details: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Admin request to block an identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBlockRequest {
    pub identity: String,
    #[serde(default = "default_manual_kind")]
    pub kind: BlockKind,
    pub reason: BlockReason,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_manual_kind() -> BlockKind {
    BlockKind::Manual
}

/// Admin request to lift a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockRequest {
    pub reason: String,
}

/// Behavioral event reported by a collaborator service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FraudEvent {
    FailedLogin,
    Request {
        endpoint: String,
        #[serde(default)]
        body: String,
    },
    FileUpload {
        filename: String,
        size: u64,
    },
    ContentActivity {
        text: String,
        #[serde(default)]
        label: String,
    },
}

impl FraudEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FraudEvent::FailedLogin => "failed_login",
            FraudEvent::Request { .. } => "request",
            FraudEvent::FileUpload { .. } => "file_upload",
            FraudEvent::ContentActivity { .. } => "content_activity",
        }
    }
}

/// Body for the collaborator event intake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEventRequest {
    pub identity: String,
    pub event: FraudEvent,
}

/// Entry in an identity's suspicious-activity log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

/// Point-in-time view of an identity's fraud tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub identity: String,
    pub failed_logins: usize,
    pub requests: usize,
    pub file_uploads: usize,
    pub suspicious_activities: Vec<SuspiciousActivity>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Result of a manually triggered cleanup. `None` means the job was skipped
/// because a scheduled run was already in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_blocks: Option<u64>,
    pub dropped_entries: Option<usize>,
}

/// Constants shared by server and CLI
pub mod constants {
    /// Actor recorded for blocks created or expired by the core itself
    pub const SYSTEM_ACTOR: &str = "system";

    /// Unblock reason stamped by the expiry sweep
    pub const EXPIRATION_REASON: &str = "Automatic expiration";

    /// Message in every denial payload
    pub const DENIAL_MESSAGE: &str = "Access denied";

    /// Default trusted reverse-proxy client IP header
    pub const TRUSTED_PROXY_HEADER: &str = "CF-Connecting-IP";

    /// Generic forwarded-for header (first hop is the client)
    pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

    /// Real-IP header set by nginx-style proxies
    pub const REAL_IP_HEADER: &str = "X-Real-IP";

    /// Header naming the admin performing an action
    pub const ADMIN_USER_HEADER: &str = "X-Admin-User";

    /// Default page size for block listings
    pub const DEFAULT_PAGE_LIMIT: u32 = 20;

    /// Largest page size the registry will return
    pub const MAX_PAGE_LIMIT: u32 = 100;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(active: bool, expires_at: Option<DateTime<Utc>>) -> BlockRecord {
        BlockRecord {
            id: Uuid::new_v4(),
            identity: "10.0.0.1".to_string(),
            kind: BlockKind::Manual,
            reason: BlockReason::Abuse,
            active,
            expires_at,
            violation_count: 0,
            metadata: Metadata::new(),
            blocked_by: "admin".to_string(),
            created_at: Utc::now(),
            unblocked_at: None,
            unblocked_by: None,
            unblock_reason: None,
        }
    }

    #[test]
    fn test_enum_string_forms() {
        for kind in BlockKind::ALL {
            assert_eq!(kind.as_str().parse::<BlockKind>(), Ok(kind));
        }
        for reason in BlockReason::ALL {
            assert_eq!(reason.as_str().parse::<BlockReason>(), Ok(reason));
        }
        assert_eq!(
            "ddos".parse::<BlockReason>(),
            Err(ParseError::UnknownReason("ddos".to_string()))
        );

        let json = serde_json::to_string(&BlockReason::MultipleFailedLogins).unwrap();
        assert_eq!(json, "\"multiple_failed_logins\"");
    }

    #[test]
    fn test_automatic_kind() {
        assert_eq!(BlockReason::RateLimitExceeded.automatic_kind(), BlockKind::RateLimit);
        assert_eq!(BlockReason::SuspiciousActivity.automatic_kind(), BlockKind::FraudDetection);
        assert_eq!(BlockReason::MaliciousUploads.automatic_kind(), BlockKind::FraudDetection);
        assert_eq!(BlockReason::Spam.automatic_kind(), BlockKind::Automatic);
        assert_eq!(BlockReason::MultipleFailedLogins.automatic_kind(), BlockKind::Automatic);
    }

    #[test]
    fn test_record_in_force() {
        let now = Utc::now();
        assert!(record(true, None).is_in_force(now));
        assert!(record(true, Some(now + Duration::hours(1))).is_in_force(now));
        assert!(!record(true, Some(now - Duration::seconds(1))).is_in_force(now));
        assert!(!record(false, None).is_in_force(now));
        assert!(record(false, Some(now)).is_expired(now));
    }

    #[test]
    fn test_filter_matches() {
        let rec = record(false, None);
        assert!(BlockFilter::default().matches(&rec));
        assert!(BlockFilter { active: Some(false), ..Default::default() }.matches(&rec));
        assert!(!BlockFilter { active: Some(true), ..Default::default() }.matches(&rec));
        assert!(!BlockFilter { reason: Some(BlockReason::Spam), ..Default::default() }.matches(&rec));
    }

    #[test]
    fn test_page_count() {
        let page: Page<u8> = Page::new(vec![], 41, 1, 20);
        assert_eq!(page.pages, 3);
        let empty: Page<u8> = Page::new(vec![], 0, 1, 20);
        assert_eq!(empty.pages, 0);
    }

    #[test]
    fn test_fraud_event_json() {
        let event: FraudEvent = serde_json::from_str(
            r#"{"kind":"file_upload","filename":"invoice.exe","size":1024}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            FraudEvent::FileUpload {
                filename: "invoice.exe".to_string(),
                size: 1024
            }
        );

        let login: FraudEvent = serde_json::from_str(r#"{"kind":"failed_login"}"#).unwrap();
        assert_eq!(login.kind(), "failed_login");
    }

    #[test]
    fn test_create_request_defaults_to_manual() {
        let req: CreateBlockRequest =
            serde_json::from_str(r#"{"identity":"1.2.3.4","reason":"abuse"}"#).unwrap();
        assert_eq!(req.kind, BlockKind::Manual);
        assert!(req.expires_at.is_none());
    }
}
