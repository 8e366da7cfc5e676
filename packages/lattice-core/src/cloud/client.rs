//! HTTP client for the Lattice Cloud API.
//!
//! Requests come in two classes. The bootstrap endpoints (device code,
//! token exchange/refresh, validation) are public and never carry a user
//! token. Everything else is protected: a bearer token is attached from
//! the refresh coordinator, a 401 triggers exactly one coordinated
//! refresh-and-replay, and transient failures (timeouts, connection
//! errors, 5xx) are retried with exponential backoff.

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::auth::TokenRefreshCoordinator;
use crate::cloud::config::CloudEndpointConfig;
use crate::error::{AuthError, ClientError};

/// Client id presented to the authorization server.
pub const CLIENT_ID: &str = "lattice-cli";
/// Scope requested during device authorization.
pub const DEVICE_SCOPE: &str = "agent";

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_GRANT_TYPE: &str = "refresh_token";

/// Transient failures are retried up to this many attempts in total.
const MAX_TRANSIENT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<Arc<TokenRefreshCoordinator>>,
    backoff_base: Duration,
}

impl ApiClient {
    /// Client for the public bootstrap endpoints only. Protected requests
    /// through this client fail with re-login guidance.
    pub fn public(config: &CloudEndpointConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.clone(),
            auth: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Client that attaches bearer tokens from the coordinator.
    pub fn authenticated(
        config: &CloudEndpointConfig,
        coordinator: Arc<TokenRefreshCoordinator>,
    ) -> Self {
        Self {
            auth: Some(coordinator),
            ..Self::public(config)
        }
    }

    /// Override the transient-retry backoff base (tests, tuning).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn coordinator(&self) -> Result<&Arc<TokenRefreshCoordinator>, ClientError> {
        self.auth
            .as_ref()
            .ok_or_else(|| AuthError::ReauthenticationRequired.into())
    }

    // ========================================================================
    // Core request path
    // ========================================================================

    /// Issue a request with per-request retry state: bounded exponential
    /// backoff for transient failures, plus at most one refresh-and-replay
    /// for a 401 on a protected request. The two are independent.
    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        protected: bool,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut bearer = if protected {
            Some(self.coordinator()?.get_valid_access_token().await?)
        } else {
            None
        };
        let mut auth_retried = false;
        let mut attempt: u32 = 1;

        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .timeout(REQUEST_TIMEOUT);
            if let Some(token) = &bearer {
                req = req.bearer_auth(token);
            }
            if let Some(b) = body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::UNAUTHORIZED && protected {
                        if auth_retried {
                            return Err(AuthError::AuthenticationExpired.into());
                        }
                        tracing::debug!("401 on {}, refreshing token and replaying once", path);
                        let stale = bearer.take().unwrap_or_default();
                        bearer = Some(
                            self.coordinator()?
                                .refresh_after_unauthorized(&stale)
                                .await?,
                        );
                        auth_retried = true;
                        continue;
                    }

                    if status.is_server_error() {
                        if attempt >= MAX_TRANSIENT_ATTEMPTS {
                            let message = resp.text().await.unwrap_or_default();
                            return Err(ClientError::Transient {
                                attempts: attempt,
                                last_error: format!("server returned {}: {}", status, message),
                            });
                        }
                        let delay = self.backoff_base * 2u32.pow(attempt - 1);
                        eprintln!("DBG 5xx retry path={} status={} delay={:?}", path, status, delay);
                        tracing::warn!(
                            "{} returned {}, retrying in {:?} (attempt {})",
                            path,
                            status,
                            delay,
                            attempt
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    if !status.is_success() {
                        let message = resp.text().await.unwrap_or_default();
                        return Err(ClientError::Status {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    return Ok(resp);
                }
                Err(e) if is_transient(&e) => {
                    if attempt >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(ClientError::Transient {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.backoff_base * 2u32.pow(attempt - 1);
                    eprintln!("DBG transient err retry path={} err={} delay={:?}", path, e, delay);
                    tracing::warn!("{} failed ({}), retrying in {:?}", path, e, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(ClientError::Http(e)),
            }
        }
    }

    /// GET a protected endpoint and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self
            .execute::<()>(Method::GET, path, None, true)
            .await?;
        Ok(resp.json().await?)
    }

    /// POST a protected endpoint and decode the JSON body.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let resp = self.execute(Method::POST, path, Some(body), true).await?;
        Ok(resp.json().await?)
    }

    // ========================================================================
    // Bootstrap endpoints (public: never carry a user token)
    // ========================================================================

    pub async fn request_device_code(&self) -> Result<DeviceCodeResponse, ClientError> {
        let body = DeviceCodeRequest {
            client_id: CLIENT_ID,
            scope: DEVICE_SCOPE,
        };
        let resp = self
            .execute(Method::POST, "/auth/device/code", Some(&body), false)
            .await?;
        Ok(resp.json().await?)
    }

    /// One poll of the token endpoint for the device grant. Issues a
    /// single request; the flow engine owns rescheduling, so transport
    /// trouble surfaces as `Transient` without internal retries.
    pub async fn poll_device_token(
        &self,
        device_code: &str,
    ) -> Result<DeviceTokenOutcome, ClientError> {
        let url = format!("{}/auth/token", self.base_url);
        let body = DeviceTokenRequest {
            device_code,
            client_id: CLIENT_ID,
            grant_type: DEVICE_GRANT_TYPE,
        };

        let resp = match self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if is_transient(&e) => {
                return Err(ClientError::Transient {
                    attempts: 1,
                    last_error: e.to_string(),
                });
            }
            Err(e) => return Err(ClientError::Http(e)),
        };

        let status = resp.status();
        if status.is_server_error() {
            return Err(ClientError::Transient {
                attempts: 1,
                last_error: format!("server returned {}", status),
            });
        }
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        // Both 200 and 400 carry a JSON body: a grant, or an OAuth error
        // code steering the poll loop.
        match resp.json::<DeviceTokenBody>().await? {
            DeviceTokenBody::Error { error, .. } => Ok(match error.as_str() {
                "authorization_pending" => DeviceTokenOutcome::Pending,
                "slow_down" => DeviceTokenOutcome::SlowDown,
                "access_denied" => DeviceTokenOutcome::Denied,
                "expired_token" => DeviceTokenOutcome::Expired,
                _ => DeviceTokenOutcome::Protocol(error),
            }),
            DeviceTokenBody::Grant(grant) => Ok(DeviceTokenOutcome::Granted(grant)),
        }
    }

    /// Exchange a refresh token for a new access token. A 400/401 here
    /// means the refresh token is dead and only a new login helps.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResponse, ClientError> {
        let body = RefreshRequest {
            refresh_token,
            client_id: CLIENT_ID,
            grant_type: REFRESH_GRANT_TYPE,
        };
        match Box::pin(self.execute(Method::POST, "/auth/token", Some(&body), false)).await {
            Ok(resp) => Ok(resp.json().await?),
            Err(ClientError::Status {
                status: 400 | 401, ..
            }) => Err(AuthError::ReauthenticationRequired.into()),
            Err(e) => Err(e),
        }
    }

    /// Ask the server whether a token is still good. Only an explicit
    /// rejection counts as invalid; unreachable servers are reported as
    /// such so callers can keep existing credentials.
    pub async fn validate_token(&self, token: &str) -> Result<TokenVerifyResult, ClientError> {
        let url = format!("{}/auth/validate", self.base_url);

        let resp = match self
            .http
            .get(&url)
            .timeout(VERIFY_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Token validation network error: {}", e);
                return Ok(TokenVerifyResult::NetworkError(e.to_string()));
            }
        };

        match resp.status().as_u16() {
            200 => {
                let validation: TokenValidation = resp.json().await?;
                if validation.valid {
                    Ok(TokenVerifyResult::Valid(validation))
                } else {
                    Ok(TokenVerifyResult::Invalid)
                }
            }
            401 | 403 => Ok(TokenVerifyResult::Invalid),
            status => {
                tracing::debug!("Token validation returned status {}", status);
                Ok(TokenVerifyResult::NetworkError(format!(
                    "server returned {}",
                    status
                )))
            }
        }
    }

    // ========================================================================
    // Protected endpoints
    // ========================================================================

    /// Revoke this device's tokens, or every device's with `all_devices`.
    pub async fn revoke_token(&self, request: &RevokeRequest) -> Result<(), ClientError> {
        self.execute(Method::POST, "/auth/revoke", Some(request), true)
            .await?;
        Ok(())
    }

    pub async fn send_heartbeat(&self, beat: &HeartbeatRequest) -> Result<(), ClientError> {
        self.execute(Method::POST, "/agents/heartbeat", Some(beat), true)
            .await?;
        Ok(())
    }
}

/// Timeouts and connection/DNS failures qualify for backoff retry;
/// anything else (TLS, body decode, builder misuse) does not.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct DeviceCodeRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    pub interval: Option<u64>,
}

#[derive(Debug, Serialize)]
struct DeviceTokenRequest<'a> {
    device_code: &'a str,
    client_id: &'a str,
    grant_type: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Successful device-grant payload.
#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: Option<String>,
    pub expires_in: u64,
    pub scope: Option<String>,
    pub user: Option<UserProfile>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceTokenBody {
    Error {
        error: String,
        #[allow(dead_code)]
        error_description: Option<String>,
    },
    Grant(TokenGrant),
}

/// Classified result of one device-token poll.
#[derive(Debug)]
pub enum DeviceTokenOutcome {
    Granted(TokenGrant),
    Pending,
    SlowDown,
    Denied,
    Expired,
    Protocol(String),
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    client_id: &'a str,
    grant_type: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present when the server rotated the refresh token; the old one is
    /// invalid from this response onward.
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub scopes: Option<Vec<String>>,
}

/// Result of a token validation attempt
#[derive(Debug)]
pub enum TokenVerifyResult {
    /// Token is valid
    Valid(TokenValidation),
    /// Token was explicitly rejected by the server (401/403)
    Invalid,
    /// Could not reach the server (network error, timeout, server error)
    NetworkError(String),
}

#[derive(Debug, Serialize)]
pub struct RevokeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_devices: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatRequest {
    pub identity_id: String,
    pub agent_version: Option<String>,
    pub hostname: Option<String>,
    pub timestamp: String,
}
