//! Login, logout, and status - the surface command handlers talk to.
//!
//! One `SessionManager` is built at process startup and torn down at
//! exit; it owns the identity store and the credential vault and hands
//! out authenticated clients.

use serde::Serialize;
use std::sync::Arc;

use crate::auth::device_flow::{DeviceAuthorization, DeviceFlow};
use crate::auth::refresh::TokenRefreshCoordinator;
use crate::cloud::{ApiClient, RevokeRequest, TokenVerifyResult};
use crate::cloud::config::CloudEndpointConfig;
use crate::error::{AuthError, ClientError, StoreError};
use crate::identity::{HostMetadata, Identity, IdentityStore};
use crate::vault::CredentialVault;

#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub identity: Option<Identity>,
    pub user_email: Option<String>,
    pub user_id: Option<String>,
}

impl AuthStatus {
    fn unauthenticated(identity: Option<Identity>) -> Self {
        Self {
            authenticated: false,
            identity,
            user_email: None,
            user_id: None,
        }
    }
}

pub struct SessionManager {
    config: CloudEndpointConfig,
    identities: IdentityStore,
    vault: Arc<CredentialVault>,
}

impl SessionManager {
    /// Session manager over the default stores.
    pub fn new(config: CloudEndpointConfig) -> Result<Self, StoreError> {
        Ok(Self {
            config,
            identities: IdentityStore::open()?,
            vault: Arc::new(CredentialVault::open()?),
        })
    }

    /// Session manager over explicit stores (tests, embedding).
    pub fn with_parts(
        config: CloudEndpointConfig,
        identities: IdentityStore,
        vault: CredentialVault,
    ) -> Self {
        Self {
            config,
            identities,
            vault: Arc::new(vault),
        }
    }

    pub fn config(&self) -> &CloudEndpointConfig {
        &self.config
    }

    /// Start a device-flow login: request the code the operator will
    /// confirm in a browser. The caller presents
    /// [`DeviceAuthorization::verification_url`] and then calls
    /// [`SessionManager::finish_login`].
    pub async fn begin_login(&self) -> Result<(DeviceFlow, DeviceAuthorization), ClientError> {
        let mut flow = DeviceFlow::new(ApiClient::public(&self.config));
        let session = flow.request_code().await?;
        Ok((flow, session))
    }

    /// Poll until the operator finishes authorizing, then persist the
    /// identity and refresh token.
    pub async fn finish_login(
        &self,
        mut flow: DeviceFlow,
        session: &DeviceAuthorization,
        name: Option<&str>,
    ) -> Result<AuthStatus, ClientError> {
        let grant = flow.poll(session).await?;

        let identity = self.identities.get_or_create(name).await?;
        self.vault.store(&identity.id, &grant.refresh_token)?;
        self.identities.update_metadata(HostMetadata::current());

        let user_email = grant.user.as_ref().and_then(|u| u.email.clone());
        tracing::info!(
            "Authenticated as {}",
            user_email.as_deref().unwrap_or("unknown user")
        );

        Ok(AuthStatus {
            authenticated: true,
            identity: Some(identity),
            user_email,
            user_id: grant.user_id,
        })
    }

    /// Provisioning path: store a pre-issued refresh token instead of
    /// running the device flow, and validate it with one immediate
    /// exchange so a bad token fails here rather than on first use.
    pub async fn login_with_token(
        &self,
        token: &str,
        name: Option<&str>,
    ) -> Result<AuthStatus, ClientError> {
        if !crate::vault::looks_like_token(token) {
            return Err(
                AuthError::Init("the provided value does not look like a refresh token".into())
                    .into(),
            );
        }

        let identity = self.identities.get_or_create(name).await?;
        self.vault.store(&identity.id, token)?;

        let coordinator = self.coordinator(&identity);
        match coordinator.get_valid_access_token().await {
            Ok(_) => {
                self.identities.update_metadata(HostMetadata::current());
                Ok(AuthStatus {
                    authenticated: true,
                    identity: Some(identity),
                    user_email: None,
                    user_id: None,
                })
            }
            Err(e) => {
                // Do not keep a token the server just rejected.
                self.vault.remove(&identity.id);
                Err(e)
            }
        }
    }

    /// Revoke server-side (best-effort) and remove local credentials.
    /// With `all_identities`, every device is revoked and the local
    /// identity file is deleted too.
    pub async fn logout(&self, all_identities: bool) -> Result<(), ClientError> {
        let Some(identity) = self.identities.get() else {
            tracing::debug!("Logout requested with no local identity");
            return Ok(());
        };

        match self.authenticated_client() {
            Ok(client) => {
                let request = if all_identities {
                    RevokeRequest {
                        device_id: None,
                        all_devices: Some(true),
                    }
                } else {
                    RevokeRequest {
                        device_id: Some(identity.id.clone()),
                        all_devices: None,
                    }
                };
                if let Err(e) = client.revoke_token(&request).await {
                    tracing::warn!("Token revocation failed: {}", e);
                }
            }
            Err(e) => tracing::debug!("Skipping server-side revocation: {}", e),
        }

        self.vault.remove(&identity.id);
        if all_identities {
            self.identities.remove();
        }
        tracing::info!("Logged out '{}'", identity.display_name);
        Ok(())
    }

    /// Report whether this host holds a usable session. Network trouble
    /// keeps existing credentials; only an explicit rejection clears
    /// them. Corrupt local state degrades to "not authenticated".
    pub async fn status_check(&self) -> AuthStatus {
        let Some(identity) = self.identities.get() else {
            return AuthStatus::unauthenticated(None);
        };

        match self.vault.retrieve(&identity.id) {
            Ok(Some(_)) => {}
            Ok(None) => return AuthStatus::unauthenticated(Some(identity)),
            Err(e) => {
                tracing::warn!("Stored credential unreadable ({}), treating as logged out", e);
                return AuthStatus::unauthenticated(Some(identity));
            }
        }

        let coordinator = self.coordinator(&identity);
        let access_token = match coordinator.get_valid_access_token().await {
            Ok(token) => token,
            Err(ClientError::Auth(AuthError::ReauthenticationRequired)) => {
                return AuthStatus::unauthenticated(Some(identity));
            }
            Err(e) => {
                // Could not reach the server - that is not an auth failure.
                tracing::info!("Could not refresh token ({}), assuming still authenticated", e);
                return AuthStatus {
                    authenticated: true,
                    identity: Some(identity),
                    user_email: None,
                    user_id: None,
                };
            }
        };

        let client = ApiClient::public(&self.config);
        match client.validate_token(&access_token).await {
            Ok(TokenVerifyResult::Valid(validation)) => AuthStatus {
                authenticated: true,
                identity: Some(identity),
                user_email: validation.user_email,
                user_id: validation.user_id,
            },
            Ok(TokenVerifyResult::Invalid) => {
                tracing::warn!("Token rejected by server, clearing credentials");
                self.vault.remove(&identity.id);
                AuthStatus::unauthenticated(Some(identity))
            }
            Ok(TokenVerifyResult::NetworkError(reason)) => {
                tracing::info!(
                    "Could not verify token ({}), assuming still authenticated",
                    reason
                );
                AuthStatus {
                    authenticated: true,
                    identity: Some(identity),
                    user_email: None,
                    user_id: None,
                }
            }
            Err(e) => {
                tracing::warn!("Error verifying token: {}, assuming still authenticated", e);
                AuthStatus {
                    authenticated: true,
                    identity: Some(identity),
                    user_email: None,
                    user_id: None,
                }
            }
        }
    }

    /// Build a client for protected endpoints, or fail with guidance.
    pub fn authenticated_client(&self) -> Result<ApiClient, ClientError> {
        let identity = self
            .identities
            .get()
            .ok_or(AuthError::ReauthenticationRequired)?;

        match self.vault.retrieve(&identity.id) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(AuthError::ReauthenticationRequired.into()),
            Err(e) => {
                tracing::warn!("Stored credential unreadable: {}", e);
                return Err(AuthError::ReauthenticationRequired.into());
            }
        }

        Ok(ApiClient::authenticated(
            &self.config,
            Arc::new(self.coordinator(&identity)),
        ))
    }

    /// The identity this host operates under, if one exists.
    pub fn identity(&self) -> Option<Identity> {
        self.identities.get()
    }

    fn coordinator(&self, identity: &Identity) -> TokenRefreshCoordinator {
        TokenRefreshCoordinator::new(
            ApiClient::public(&self.config),
            Arc::clone(&self.vault),
            identity.id.clone(),
        )
    }
}
