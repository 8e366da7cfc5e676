//! OAuth 2.0 Device Authorization Grant flow.
//!
//! The operator authorizes in a browser on any device while this engine
//! polls the token endpoint. One poll request is in flight at a time;
//! every terminal state ends the loop, which cancels all scheduling.

use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::cloud::{ApiClient, DeviceTokenOutcome, TokenGrant};
use crate::error::{AuthError, ClientError};

/// Fallback when the server omits the polling interval.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
/// Upper bound on the reschedule delay after a transient polling failure.
const MAX_TRANSIENT_POLL_DELAY: Duration = Duration::from_secs(30);

/// Where the flow currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    RequestingCode,
    AwaitingAuthorization,
    Authorized,
    Denied,
    Expired,
    Error,
}

/// An in-progress device authorization session. Lives only for the
/// duration of one login.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    pub interval: u64,
}

impl DeviceAuthorization {
    /// URL to show the operator; prefers the pre-filled variant.
    pub fn verification_url(&self) -> String {
        self.verification_uri_complete
            .clone()
            .unwrap_or_else(|| format!("{}?code={}", self.verification_uri, self.user_code))
    }
}

pub struct DeviceFlow {
    client: ApiClient,
    state: FlowState,
}

impl DeviceFlow {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            state: FlowState::RequestingCode,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Request a device code and user code from the authorization server.
    pub async fn request_code(&mut self) -> Result<DeviceAuthorization, AuthError> {
        match self.client.request_device_code().await {
            Ok(resp) => {
                self.state = FlowState::AwaitingAuthorization;
                Ok(DeviceAuthorization {
                    device_code: resp.device_code,
                    user_code: resp.user_code,
                    verification_uri: resp.verification_uri,
                    verification_uri_complete: resp.verification_uri_complete,
                    expires_in: resp.expires_in,
                    interval: resp.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
                })
            }
            Err(e) => {
                self.state = FlowState::Error;
                Err(AuthError::Init(e.to_string()))
            }
        }
    }

    /// Open the verification URL in the local browser. Failure is logged
    /// and otherwise ignored; the operator still has the printed URL.
    pub fn open_browser(&self, session: &DeviceAuthorization) {
        #[cfg(feature = "browser")]
        {
            let url = session.verification_url();
            if let Err(e) = webbrowser::open(&url) {
                tracing::warn!(
                    "Failed to open browser automatically: {}. Please visit: {}",
                    e,
                    url
                );
            }
        }

        #[cfg(not(feature = "browser"))]
        let _ = session;
    }

    /// Poll the token endpoint until a terminal state.
    ///
    /// The first tick lands one interval after the code was issued.
    /// `slow_down` doubles the protocol interval and the doubling is
    /// never undone; transport failures reschedule once with a capped
    /// delay and leave the protocol interval alone. No poll is ever
    /// scheduled past the session's declared expiry.
    pub async fn poll(&mut self, session: &DeviceAuthorization) -> Result<TokenGrant, AuthError> {
        let deadline = Instant::now() + Duration::from_secs(session.expires_in);
        let mut interval = Duration::from_secs(session.interval.max(1));
        let mut next_delay = interval;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(next_delay.min(remaining)).await;
            if Instant::now() >= deadline {
                self.state = FlowState::Expired;
                return Err(AuthError::Expired);
            }

            match self.client.poll_device_token(&session.device_code).await {
                Ok(DeviceTokenOutcome::Granted(grant)) => {
                    self.state = FlowState::Authorized;
                    tracing::info!("Device authorization granted");
                    return Ok(grant);
                }
                Ok(DeviceTokenOutcome::Pending) => {
                    tracing::debug!("Authorization pending, next poll in {:?}", interval);
                    next_delay = interval;
                }
                Ok(DeviceTokenOutcome::SlowDown) => {
                    interval *= 2;
                    next_delay = interval;
                    tracing::debug!("Server asked to slow down, interval now {:?}", interval);
                }
                Ok(DeviceTokenOutcome::Denied) => {
                    self.state = FlowState::Denied;
                    return Err(AuthError::Denied);
                }
                Ok(DeviceTokenOutcome::Expired) => {
                    self.state = FlowState::Expired;
                    return Err(AuthError::Expired);
                }
                Ok(DeviceTokenOutcome::Protocol(code)) => {
                    self.state = FlowState::Error;
                    return Err(AuthError::Protocol(code));
                }
                Err(ClientError::Transient { last_error, .. }) => {
                    // Transport trouble is not a protocol signal: keep the
                    // protocol interval, take one capped longer nap.
                    next_delay = (interval * 2).min(MAX_TRANSIENT_POLL_DELAY);
                    tracing::warn!(
                        "Token poll failed ({}), retrying in {:?}",
                        last_error,
                        next_delay
                    );
                }
                Err(e) => {
                    self.state = FlowState::Error;
                    return Err(AuthError::Protocol(e.to_string()));
                }
            }
        }
    }
}
