//! Integration tests for the session facade.
//!
//! Tests verify that:
//! - A fresh device-flow login creates the identity and persists the
//!   refresh token through the vault
//! - A dead refresh token resolves to "run login again" everywhere
//! - Logout clears credentials and token-login validates eagerly

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lattice_core::auth::SessionManager;
use lattice_core::cloud::CloudEndpointConfig;
use lattice_core::error::{AuthError, ClientError};
use lattice_core::identity::IdentityStore;
use lattice_core::vault::CredentialVault;
use mockito::{Server, ServerGuard};
use tempfile::TempDir;

fn session_manager(server: &ServerGuard, dir: &TempDir) -> SessionManager {
    SessionManager::with_parts(
        CloudEndpointConfig::for_base_url(server.url()),
        IdentityStore::open_at(dir.path().join("identity.json")),
        CredentialVault::open_at(dir.path().join("secrets.json")),
    )
}

#[tokio::test]
async fn fresh_login_persists_the_refresh_token() {
    let mut server = Server::new_async().await;

    let device_mock = server
        .mock("POST", "/auth/device/code")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "device_code": "D1",
                "user_code": "ABCD",
                "verification_uri": "https://lattice.cloud/activate",
                "expires_in": 5,
                "interval": 1
            }"#,
        )
        .expect(1)
        .create_async()
        .await;

    let polls = Arc::new(AtomicUsize::new(0));
    let polls_in_mock = polls.clone();
    let token_mock = server
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body_from_request(move |_| {
            if polls_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                br#"{"error": "authorization_pending"}"#.to_vec()
            } else {
                br#"{
                    "access_token": "A1",
                    "refresh_token": "R1",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "scope": "agent",
                    "user": {"email": "op@example.com", "name": "Op"},
                    "user_id": "user_1"
                }"#
                .to_vec()
            }
        })
        .expect(2)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);
    assert!(session.identity().is_none());

    let (flow, pending) = session.begin_login().await.expect("device code request");
    assert_eq!(pending.user_code, "ABCD");

    let status = session
        .finish_login(flow, &pending, Some("test-agent"))
        .await
        .expect("login should complete");

    device_mock.assert_async().await;
    token_mock.assert_async().await;
    assert!(status.authenticated);
    assert_eq!(status.user_email.as_deref(), Some("op@example.com"));

    // The refresh token landed in the vault under the new identity.
    let identity = session.identity().expect("identity created during login");
    assert_eq!(identity.display_name, "test-agent");
    let vault = CredentialVault::open_at(dir.path().join("secrets.json"));
    assert_eq!(vault.retrieve(&identity.id).unwrap().as_deref(), Some("R1"));
}

#[tokio::test]
async fn expired_refresh_token_requires_reauthentication() {
    let mut server = Server::new_async().await;

    let _token_mock = server
        .mock("POST", "/auth/token")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "invalid_grant"}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);

    // Seed an identity holding a revoked refresh token.
    let identity = IdentityStore::open_at(dir.path().join("identity.json"))
        .get_or_create(Some("stale-host"))
        .await
        .unwrap();
    CredentialVault::open_at(dir.path().join("secrets.json"))
        .store(&identity.id, "rt_revoked_refresh_001")
        .unwrap();

    let client = session.authenticated_client().expect("client builds");
    let result = client.get_json::<serde_json::Value>("/v1/whoami").await;
    assert!(matches!(
        result,
        Err(ClientError::Auth(AuthError::ReauthenticationRequired))
    ));

    let status = session.status_check().await;
    assert!(!status.authenticated);
}

#[tokio::test]
async fn status_check_without_credentials_is_unauthenticated() {
    let server = Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);

    let status = session.status_check().await;
    assert!(!status.authenticated);
    assert!(status.identity.is_none());

    let result = session.authenticated_client();
    assert!(matches!(
        result,
        Err(ClientError::Auth(AuthError::ReauthenticationRequired))
    ));
}

#[tokio::test]
async fn login_with_token_validates_and_persists_rotation() {
    let mut server = Server::new_async().await;

    let token_mock = server
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "access_token": "A1",
                "refresh_token": "rt_rotated_refresh_0002",
                "token_type": "Bearer",
                "expires_in": 3600
            }"#,
        )
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);

    let status = session
        .login_with_token("rt_provisioned_token_01", Some("prov-host"))
        .await
        .expect("token login should validate");

    token_mock.assert_async().await;
    assert!(status.authenticated);

    // The server rotated the provisioned token; the rotation is what
    // must survive.
    let identity = session.identity().unwrap();
    let vault = CredentialVault::open_at(dir.path().join("secrets.json"));
    assert_eq!(
        vault.retrieve(&identity.id).unwrap().as_deref(),
        Some("rt_rotated_refresh_0002")
    );
}

#[tokio::test]
async fn login_with_malformed_token_fails_fast() {
    let server = Server::new_async().await;
    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);

    let result = session.login_with_token("not a token", None).await;
    assert!(matches!(
        result,
        Err(ClientError::Auth(AuthError::Init(_)))
    ));
}

#[tokio::test]
async fn logout_removes_credential_and_keeps_identity() {
    let mut server = Server::new_async().await;

    let _token_mock = server
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "A1", "expires_in": 3600}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let revoke_mock = server
        .mock("POST", "/auth/revoke")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);

    let identity = IdentityStore::open_at(dir.path().join("identity.json"))
        .get_or_create(Some("leaving-host"))
        .await
        .unwrap();
    CredentialVault::open_at(dir.path().join("secrets.json"))
        .store(&identity.id, "rt_active_refresh_001")
        .unwrap();

    session.logout(false).await.expect("logout");

    revoke_mock.assert_async().await;
    let vault = CredentialVault::open_at(dir.path().join("secrets.json"));
    assert!(vault.retrieve(&identity.id).unwrap().is_none());
    // Plain logout keeps the identity for the next login.
    assert!(session.identity().is_some());
}

#[tokio::test]
async fn logout_all_resets_the_identity_too() {
    let mut server = Server::new_async().await;

    let _token_mock = server
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "A1", "expires_in": 3600}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let _revoke_mock = server
        .mock("POST", "/auth/revoke")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let session = session_manager(&server, &dir);

    let identity = IdentityStore::open_at(dir.path().join("identity.json"))
        .get_or_create(Some("reset-host"))
        .await
        .unwrap();
    CredentialVault::open_at(dir.path().join("secrets.json"))
        .store(&identity.id, "rt_active_refresh_002")
        .unwrap();

    session.logout(true).await.expect("logout --all");

    assert!(session.identity().is_none());
}
