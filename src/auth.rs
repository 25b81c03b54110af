//! Identity resolution from bearer tokens.

use async_trait::async_trait;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::models::Identity;

/// Resolves a session token to a user identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `None` when the token cannot be verified, for whatever reason.
    async fn resolve(&self, token: &str) -> Option<Identity>;
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Supabase GoTrue `/auth/v1/user` lookup.
pub struct SupabaseAuth {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseAuth {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn resolve(&self, token: &str) -> Option<Identity> {
        let response = match self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("Authorization", format!("Bearer {token}"))
            .header("apikey", &self.api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Auth server not reachable");
                return None;
            }
        };

        match response.status() {
            s if s.is_success() => match response.json::<Identity>().await {
                Ok(identity) => {
                    debug!(user = %identity.id, "Token resolved");
                    Some(identity)
                }
                Err(e) => {
                    warn!(error = %e, "Invalid auth response");
                    None
                }
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => None,
            other => {
                warn!(status = %other, "Auth server returned unexpected status");
                None
            }
        }
    }
}
