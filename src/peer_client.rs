//! Outbound HTTP client for pulling a peer's exported servers/agents/scans
//! (§4.2). Built on `reqwest` rather than the teacher's `curl` subprocess
//! pattern — see DESIGN.md for why.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::models::PeerConfig;
use crate::token_source::TokenSource;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 200;

pub struct PeerClient {
    peer_config: PeerConfig,
    client: reqwest::Client,
    retry_attempts: u32,
    token_source: Arc<dyn TokenSource>,
}

impl PeerClient {
    pub fn new(peer_config: PeerConfig, token_source: Arc<dyn TokenSource>) -> Self {
        Self::with_options(
            peer_config,
            token_source,
            Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            DEFAULT_RETRY_ATTEMPTS,
        )
    }

    pub fn with_options(
        peer_config: PeerConfig,
        token_source: Arc<dyn TokenSource>,
        timeout: Duration,
        retry_attempts: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a fixed timeout");
        if peer_config.federation_token.is_some() {
            info!(peer_id = %peer_config.peer_id, "using per-peer federation static token");
        } else {
            info!(peer_id = %peer_config.peer_id, "no per-peer token configured; falling back to shared token source");
        }
        PeerClient {
            peer_config,
            client,
            retry_attempts: retry_attempts.max(1),
            token_source,
        }
    }

    /// Per-peer static token takes priority over the shared OAuth2 source
    /// (§4.2.1).
    async fn auth_token(&self) -> Option<String> {
        if let Some(token) = &self.peer_config.federation_token {
            return Some(token.clone());
        }
        self.token_source.get_token().await
    }

    pub async fn fetch_servers(&self, since_generation: Option<u64>) -> Option<Vec<Value>> {
        let url = format!("{}/api/federation/servers", self.peer_config.endpoint);
        self.fetch_items(&url, since_generation).await
    }

    pub async fn fetch_agents(&self, since_generation: Option<u64>) -> Option<Vec<Value>> {
        let url = format!("{}/api/federation/agents", self.peer_config.endpoint);
        self.fetch_items(&url, since_generation).await
    }

    pub async fn fetch_scans(&self) -> Option<Vec<Value>> {
        let url = format!("{}/api/federation/security-scans", self.peer_config.endpoint);
        self.fetch_items(&url, None).await
    }

    pub async fn fetch_server(&self, server_name: &str) -> Option<Value> {
        let servers = self.fetch_servers(None).await?;
        servers.into_iter().find(|s| {
            s.get("path").and_then(Value::as_str) == Some(server_name)
                || s.get("server_name").and_then(Value::as_str) == Some(server_name)
        })
    }

    pub async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.peer_config.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success() || response.status().as_u16() < 300,
            Err(e) => {
                warn!(peer_id = %self.peer_config.peer_id, error = %e, "health check failed");
                false
            }
        }
    }

    async fn fetch_items(&self, url: &str, since_generation: Option<u64>) -> Option<Vec<Value>> {
        let token = self.auth_token().await?;
        if token.is_empty() {
            error!(peer_id = %self.peer_config.peer_id, "no authentication token available");
            return None;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self
                .client
                .get(url)
                .bearer_auth(&token)
                .header("Accept", "application/json");
            if let Some(since) = since_generation {
                request = request.query(&[("since_generation", since)]);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return match response.json::<Value>().await {
                            Ok(body) => Some(parse_items(body)),
                            Err(e) => {
                                error!(peer_id = %self.peer_config.peer_id, error = %e, "unparseable response body");
                                None
                            }
                        };
                    }
                    if status.as_u16() < 500 {
                        warn!(peer_id = %self.peer_config.peer_id, %status, "peer returned a non-retryable error");
                        return None;
                    }
                    warn!(peer_id = %self.peer_config.peer_id, %status, attempt, "peer returned a server error; may retry");
                }
                Err(e) => {
                    warn!(peer_id = %self.peer_config.peer_id, error = %e, attempt, "transport error; may retry");
                }
            }

            if attempt >= self.retry_attempts {
                error!(peer_id = %self.peer_config.peer_id, "exhausted retry attempts");
                return None;
            }
            let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }
}

/// Accepts either `{"items": [...], ...}` or a raw list.
fn parse_items(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_items_accepts_wrapped_and_raw_shapes() {
        let wrapped = serde_json::json!({"items": [{"path": "/s1"}], "sync_generation": 7});
        assert_eq!(parse_items(wrapped).len(), 1);

        let raw = serde_json::json!([{"path": "/s1"}, {"path": "/s2"}]);
        assert_eq!(parse_items(raw).len(), 2);

        let empty = serde_json::json!({"total_count": 0});
        assert_eq!(parse_items(empty).len(), 0);
    }
}
