//! Outbound OAuth2 client-credentials token source (§4.2.3), the `token_source`
//! collaborator. Caches by expiry under a lock, refreshing at most once per
//! call with a 60-second buffer before the cached token actually expires.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REFRESH_BUFFER_SECONDS: i64 = 60;

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_token(&self) -> Option<String>;
    fn is_configured(&self) -> bool;
    async fn clear_token(&self);
}

/// OAuth2 client-credentials token source that fetches from a token
/// endpoint via `reqwest` and caches the result.
pub struct OAuth2TokenSource {
    client: reqwest::Client,
    token_endpoint: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    cached: Arc<Mutex<Option<CachedToken>>>,
}

impl OAuth2TokenSource {
    pub fn from_env() -> Self {
        OAuth2TokenSource {
            client: reqwest::Client::new(),
            token_endpoint: std::env::var("FEDERATION_TOKEN_ENDPOINT").ok(),
            client_id: std::env::var("FEDERATION_CLIENT_ID").ok(),
            client_secret: std::env::var("FEDERATION_CLIENT_SECRET").ok(),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    async fn fetch_new_token(&self) -> Option<CachedToken> {
        let (endpoint, client_id, client_secret) = match (
            &self.token_endpoint,
            &self.client_id,
            &self.client_secret,
        ) {
            (Some(e), Some(c), Some(s)) => (e, c, s),
            _ => return None,
        };

        let response = self
            .client
            .post(endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "token endpoint request failed");
                return None;
            }
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            warn!(status = %response.status(), "token endpoint rejected credentials");
            return None;
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "token endpoint returned an error status");
            return None;
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default = "default_expires_in")]
            expires_in: i64,
        }
        fn default_expires_in() -> i64 {
            3600
        }

        match response.json::<TokenResponse>().await {
            Ok(body) => Some(CachedToken {
                token: body.access_token,
                expires_at: Utc::now() + Duration::seconds(body.expires_in),
            }),
            Err(e) => {
                warn!(error = %e, "failed to parse token endpoint response");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for OAuth2TokenSource {
    async fn get_token(&self) -> Option<String> {
        let mut guard = self.cached.lock().await;
        if let Some(cached) = guard.as_ref() {
            let refresh_at = cached.expires_at - Duration::seconds(REFRESH_BUFFER_SECONDS);
            if Utc::now() < refresh_at {
                debug!("using cached federation token");
                return Some(cached.token.clone());
            }
        }
        let fresh = self.fetch_new_token().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Some(token)
    }

    fn is_configured(&self) -> bool {
        self.token_endpoint.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    async fn clear_token(&self) {
        *self.cached.lock().await = None;
    }
}

/// Always returns a fixed token. Used in tests and for peers whose
/// `federation_token` makes the shared token source irrelevant.
pub struct StaticTokenSource(pub Option<String>);

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn get_token(&self) -> Option<String> {
        self.0.clone()
    }

    fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    async fn clear_token(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_reports_configured_state() {
        let configured = StaticTokenSource(Some("tok".into()));
        assert!(configured.is_configured());
        assert_eq!(configured.get_token().await, Some("tok".to_string()));

        let unconfigured = StaticTokenSource(None);
        assert!(!unconfigured.is_configured());
        assert_eq!(unconfigured.get_token().await, None);
    }

    #[test]
    fn oauth2_source_unconfigured_without_env() {
        // Doesn't read real env vars in this test process beyond what's set.
        let source = OAuth2TokenSource {
            client: reqwest::Client::new(),
            token_endpoint: None,
            client_id: None,
            client_secret: None,
            cached: Arc::new(Mutex::new(None)),
        };
        assert!(!source.is_configured());
    }
}
