//! Request gate
//!
//! Resolves the client identity of an inbound request and decides whether it
//! may proceed. Every failure mode on this path allows the request.

use super::store::BlockStore;
use crate::config::GateConfig;
use crate::error::GuardError;
use bastion_common::{constants, BlockReason, DenialPayload};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Outcome of gating one request
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allowed,
    Denied {
        reason: BlockReason,
        details: String,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl GateDecision {
    pub fn is_denied(&self) -> bool {
        matches!(self, GateDecision::Denied { .. })
    }

    /// Body sent to a denied client
    pub fn denial(&self) -> Option<DenialPayload> {
        match self {
            GateDecision::Allowed => None,
            GateDecision::Denied {
                reason,
                details,
                expires_at,
            } => Some(DenialPayload {
                message: constants::DENIAL_MESSAGE.to_string(),
                reason: *reason,
                details: details.clone(),
                expires_at: *expires_at,
            }),
        }
    }
}

/// Canonical form of a client IP. Every key written to or read from the
/// registry goes through here so that e.g. `2001:DB8::1` and `2001:db8::1`
/// name the same identity.
pub fn canonical_identity(raw: &str) -> Result<String, GuardError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| GuardError::UnresolvableIdentity)
}

#[derive(Clone)]
pub struct RequestGate {
    store: BlockStore,
    config: GateConfig,
}

impl RequestGate {
    pub fn new(store: BlockStore, config: GateConfig) -> Self {
        Self { store, config }
    }

    /// Client identity, first match wins: trusted proxy header, first hop of
    /// X-Forwarded-For, X-Real-IP, then the connection's peer address.
    pub fn resolve_identity(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<String, GuardError> {
        let from_header = |name: &str, first_hop: bool| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| if first_hop { v.split(',').next().unwrap_or("") } else { v })
                .and_then(|v| canonical_identity(v).ok())
        };

        from_header(&self.config.trusted_proxy_header, false)
            .or_else(|| from_header(constants::FORWARDED_FOR_HEADER, true))
            .or_else(|| from_header(constants::REAL_IP_HEADER, false))
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .ok_or(GuardError::UnresolvableIdentity)
    }

    /// Decide whether `identity` may proceed. A denied identity has another
    /// violation counted in the background.
    pub async fn check_and_gate(&self, identity: &str) -> GateDecision {
        let lookup = tokio::time::timeout(
            self.config.lookup_timeout,
            self.store.active_block(identity),
        )
        .await;

        let record = match lookup {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => return GateDecision::Allowed,
            Ok(Err(e)) => {
                tracing::error!("Block lookup failed for {}, allowing: {}", identity, e);
                return GateDecision::Allowed;
            }
            Err(_) => {
                tracing::warn!(
                    "Block lookup for {} exceeded {}ms, allowing",
                    identity,
                    self.config.lookup_timeout.as_millis()
                );
                return GateDecision::Allowed;
            }
        };

        let store = self.store.clone();
        let violator = identity.to_string();
        tokio::spawn(async move {
            store.increment_violation(&violator).await;
        });

        tracing::debug!("Denied {} ({})", identity, record.reason);
        GateDecision::Denied {
            reason: record.reason,
            details: record
                .description()
                .unwrap_or_else(|| record.reason.message())
                .to_string(),
            expires_at: record.expires_at,
        }
    }

    /// Resolve and gate in one step. Unresolvable requests are allowed.
    pub async fn gate_request(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> (Option<String>, GateDecision) {
        match self.resolve_identity(headers, peer) {
            Ok(identity) => {
                let decision = self.check_and_gate(&identity).await;
                (Some(identity), decision)
            }
            Err(e) => {
                tracing::debug!("{}, allowing request", e);
                (None, GateDecision::Allowed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::repository::MemoryBlockRepository;
    use crate::abuse::testing::{DownRepository, SlowRepository};
    use bastion_common::{BlockKind, Metadata};
    use http::HeaderValue;
    use std::sync::Arc;
    use std::time::Duration;

    fn gate() -> RequestGate {
        let store = BlockStore::new(Arc::new(MemoryBlockRepository::new()));
        RequestGate::new(store, GateConfig::default())
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.10:51000".parse().unwrap())
    }

    #[test]
    fn test_identity_precedence() {
        let gate = gate();
        let all = headers(&[
            ("cf-connecting-ip", "203.0.113.1"),
            ("x-forwarded-for", "198.51.100.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.9"),
        ]);
        assert_eq!(gate.resolve_identity(&all, peer()).unwrap(), "203.0.113.1");

        let forwarded = headers(&[
            ("x-forwarded-for", "198.51.100.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.9"),
        ]);
        assert_eq!(gate.resolve_identity(&forwarded, peer()).unwrap(), "198.51.100.7");

        let real = headers(&[("x-real-ip", "198.51.100.9")]);
        assert_eq!(gate.resolve_identity(&real, peer()).unwrap(), "198.51.100.9");

        assert_eq!(
            gate.resolve_identity(&HeaderMap::new(), peer()).unwrap(),
            "192.0.2.10"
        );
    }

    #[test]
    fn test_canonical_identity() {
        assert_eq!(canonical_identity(" 2001:DB8::1 ").unwrap(), "2001:db8::1");
        assert_eq!(canonical_identity("2001:0db8:0000::0001").unwrap(), "2001:db8::1");
        assert_eq!(canonical_identity("203.0.113.1").unwrap(), "203.0.113.1");
        assert!(matches!(
            canonical_identity("not-an-ip"),
            Err(GuardError::UnresolvableIdentity)
        ));
        assert!(canonical_identity("").is_err());

        let upper = headers(&[("x-forwarded-for", "2001:DB8::1")]);
        assert_eq!(gate().resolve_identity(&upper, None).unwrap(), "2001:db8::1");
    }

    #[test]
    fn test_blank_headers_are_skipped() {
        let gate = gate();
        let blank = headers(&[("cf-connecting-ip", "   "), ("x-forwarded-for", "")]);
        assert_eq!(gate.resolve_identity(&blank, peer()).unwrap(), "192.0.2.10");
    }

    #[test]
    fn test_unresolvable_identity() {
        let gate = gate();
        assert!(matches!(
            gate.resolve_identity(&HeaderMap::new(), None),
            Err(GuardError::UnresolvableIdentity)
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_request_is_allowed() {
        let gate = gate();
        let (identity, decision) = gate.gate_request(&HeaderMap::new(), None).await;
        assert!(identity.is_none());
        assert_eq!(decision, GateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_denied_with_reason_and_expiry() {
        let gate = gate();
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        gate.store
            .create(
                "10.0.0.1",
                BlockKind::Automatic,
                BlockReason::Spam,
                "system",
                Some(expires_at),
                None,
            )
            .await
            .unwrap();

        let decision = gate.check_and_gate("10.0.0.1").await;
        assert_eq!(
            decision,
            GateDecision::Denied {
                reason: BlockReason::Spam,
                details: BlockReason::Spam.message().to_string(),
                expires_at: Some(expires_at),
            }
        );
        let payload = decision.denial().unwrap();
        assert_eq!(payload.message, "Access denied");

        assert_eq!(gate.check_and_gate("10.0.0.2").await, GateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_denial_uses_admin_description() {
        let gate = gate();
        let mut metadata = Metadata::new();
        metadata.insert("description".to_string(), serde_json::json!("Chargeback fraud"));
        gate.store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Fraud, "admin", None, Some(metadata))
            .await
            .unwrap();

        match gate.check_and_gate("10.0.0.1").await {
            GateDecision::Denied { details, expires_at, .. } => {
                assert_eq!(details, "Chargeback fraud");
                assert!(expires_at.is_none());
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denial_counts_violation() {
        let gate = gate();
        gate.store
            .create("10.0.0.1", BlockKind::Manual, BlockReason::Abuse, "admin", None, None)
            .await
            .unwrap();

        assert!(gate.check_and_gate("10.0.0.1").await.is_denied());

        let mut count = 0;
        for _ in 0..50 {
            count = gate.store.active_block("10.0.0.1").await.unwrap().unwrap().violation_count;
            if count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_store_failure_allows() {
        let store = BlockStore::new(Arc::new(DownRepository));
        let gate = RequestGate::new(store, GateConfig::default());
        assert_eq!(gate.check_and_gate("10.0.0.1").await, GateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_slow_lookup_allows() {
        let store = BlockStore::new(Arc::new(SlowRepository(Duration::from_secs(5))));
        let gate = RequestGate::new(
            store,
            GateConfig {
                lookup_timeout: Duration::from_millis(20),
                ..GateConfig::default()
            },
        );
        let started = std::time::Instant::now();
        assert_eq!(gate.check_and_gate("10.0.0.1").await, GateDecision::Allowed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
