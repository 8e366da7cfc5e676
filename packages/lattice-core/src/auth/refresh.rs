//! Access-token refresh with rotation and a single-flight cache.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cloud::ApiClient;
use crate::error::{AuthError, ClientError};
use crate::vault::CredentialVault;

/// A cached access token is trusted only while it is more than this far
/// from expiry.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Utc::now() + ChronoDuration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// Exchanges the vault-held refresh token for access tokens and caches
/// the result in memory. The cache is never persisted.
///
/// Concurrency: the cache mutex is held across the exchange, so
/// concurrent callers share one in-flight exchange - the second caller
/// re-checks the cache after acquiring the lock instead of issuing a
/// duplicate. This is what keeps refresh-token rotation race-free.
pub struct TokenRefreshCoordinator {
    client: ApiClient,
    vault: Arc<CredentialVault>,
    identity_id: String,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenRefreshCoordinator {
    /// `client` must be a public (bootstrap) client; the refresh grant
    /// itself never carries a bearer token.
    pub fn new(client: ApiClient, vault: Arc<CredentialVault>, identity_id: String) -> Self {
        Self {
            client,
            vault,
            identity_id,
            cache: Mutex::new(None),
        }
    }

    /// Return a bearer token, exchanging the refresh token when the
    /// cached one is missing or within the expiry margin.
    pub async fn get_valid_access_token(&self) -> Result<String, ClientError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.token.clone());
            }
        }
        self.exchange_locked(&mut cache).await
    }

    /// 401 recovery path. If another caller already rotated past the
    /// stale token we were using, reuse its result instead of issuing a
    /// second exchange.
    pub async fn refresh_after_unauthorized(
        &self,
        stale_token: &str,
    ) -> Result<String, ClientError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.token != stale_token && cached.is_fresh() {
                tracing::debug!("Reusing access token refreshed by a concurrent request");
                return Ok(cached.token.clone());
            }
        }
        *cache = None;
        self.exchange_locked(&mut cache).await
    }

    /// Drop the cached access token.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn exchange_locked(
        &self,
        cache: &mut Option<CachedToken>,
    ) -> Result<String, ClientError> {
        let refresh_token = self
            .vault
            .retrieve(&self.identity_id)?
            .ok_or(AuthError::ReauthenticationRequired)?;

        let resp = self.client.refresh_token(&refresh_token).await?;

        // Persist a rotated refresh token before handing out the access
        // token; the old one died the moment the server answered.
        if let Some(rotated) = &resp.refresh_token {
            if rotated != &refresh_token {
                self.vault.store(&self.identity_id, rotated)?;
                tracing::debug!("Refresh token rotated and persisted");
            }
        }

        let cached = CachedToken {
            token: resp.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(resp.expires_in as i64),
        };
        let token = cached.token.clone();
        *cache = Some(cached);
        Ok(token)
    }
}
