//! Lattice Core Library
//!
//! This crate provides the credential and session plumbing for Lattice
//! agents:
//! - Per-host identity (created once, namespaces all credentials)
//! - Credential vault (platform keyring with an encrypted-file fallback)
//! - OAuth 2.0 device flow authentication and token refresh
//! - Authenticated cloud client with retry/backoff
//! - Liveness heartbeat
//!
//! # Features
//!
//! - `keyring-storage` (default): Use the platform keyring for credential
//!   storage
//! - `browser` (default): Automatically open the browser during the OAuth
//!   device flow
//!
//! # Example
//!
//! ```no_run
//! use lattice_core::auth::SessionManager;
//! use lattice_core::cloud::load_cloud_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = SessionManager::new(load_cloud_config())?;
//!
//!     // Authenticate using the device flow
//!     let (flow, pending) = session.begin_login().await?;
//!     println!("Visit: {}", pending.verification_url());
//!     let status = session.finish_login(flow, &pending, None).await?;
//!     println!("Authenticated: {}", status.authenticated);
//!
//!     // Talk to protected endpoints
//!     let client = session.authenticated_client()?;
//!     let _ = client;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cloud;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod vault;

// Re-export commonly used types
pub use auth::{AuthStatus, DeviceAuthorization, DeviceFlow, FlowState, SessionManager};
pub use cloud::{ApiClient, CloudEndpointConfig, TokenVerifyResult, load_cloud_config};
pub use error::{AuthError, ClientError, StoreError};
pub use heartbeat::{Disconnect, LivenessReporter};
pub use identity::{HostMetadata, Identity, IdentityStore};
pub use vault::{CredentialVault, SecretStore};
