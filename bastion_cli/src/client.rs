//! Admin API client

use crate::config::Config;
use anyhow::Result;
use bastion_common::{
    constants, BlockRecord, BlockStatistics, CleanupReport, CreateBlockRequest, ListBlocksQuery,
    Page, TrackingSnapshot, UnblockRequest,
};
use serde::de::DeserializeOwned;

pub struct AdminClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    admin_user: Option<String>,
}

impl AdminClient {
    /// Build a client from saved credentials
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config.require_auth()?.to_string();
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.admin_url(),
            token,
            admin_user: config.admin_user.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        tracing::debug!("{} {}{}", method, self.base_url, path);
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some(user) = &self.admin_user {
            builder = builder.header(constants::ADMIN_USER_HEADER, user);
        }
        builder
    }

    async fn send<T: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<T> {
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::debug!("Admin API returned {}: {}", status, text);
            anyhow::bail!("{} - {}", status, error_message(&text));
        }

        Ok(response.json().await?)
    }

    pub async fn list_blocks(&self, query: &ListBlocksQuery) -> Result<Page<BlockRecord>> {
        Self::send(self.request(reqwest::Method::GET, "/blocks").query(query)).await
    }

    pub async fn create_block(&self, req: &CreateBlockRequest) -> Result<BlockRecord> {
        Self::send(self.request(reqwest::Method::POST, "/blocks").json(req)).await
    }

    pub async fn unblock(&self, identity: &str, reason: &str) -> Result<BlockRecord> {
        let body = UnblockRequest {
            reason: reason.to_string(),
        };
        Self::send(
            self.request(reqwest::Method::POST, &format!("/blocks/{}/unblock", identity))
                .json(&body),
        )
        .await
    }

    pub async fn statistics(&self) -> Result<BlockStatistics> {
        Self::send(self.request(reqwest::Method::GET, "/stats")).await
    }

    pub async fn cleanup(&self) -> Result<CleanupReport> {
        Self::send(self.request(reqwest::Method::POST, "/cleanup")).await
    }

    pub async fn tracking(&self, identity: &str) -> Result<TrackingSnapshot> {
        Self::send(self.request(reqwest::Method::GET, &format!("/tracking/{}", identity))).await
    }
}

/// The server's `{"error": ...}` message, or the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"error":"Identity 10.0.0.1 is already blocked"}"#),
            "Identity 10.0.0.1 is already blocked"
        );
        assert_eq!(error_message("Unauthorized"), "Unauthorized");
    }

    #[test]
    fn test_requires_login() {
        assert!(AdminClient::from_config(&Config::default()).is_err());
    }
}
