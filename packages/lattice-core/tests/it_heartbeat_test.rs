//! Integration tests for the liveness reporter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lattice_core::auth::TokenRefreshCoordinator;
use lattice_core::cloud::CloudEndpointConfig;
use lattice_core::heartbeat::{Disconnect, LivenessReporter};
use lattice_core::identity::{HostMetadata, Identity};
use lattice_core::vault::CredentialVault;
use lattice_core::ApiClient;
use mockito::{Server, ServerGuard};
use tempfile::TempDir;

const IDENTITY_ID: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

fn test_identity() -> Identity {
    Identity {
        id: IDENTITY_ID.to_string(),
        display_name: "beat-host".to_string(),
        created_at: Utc::now(),
        host: HostMetadata {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            hostname: Some("beat-host".to_string()),
            agent_version: Some("0.4.0".to_string()),
        },
    }
}

fn authed_client(server: &ServerGuard, dir: &TempDir) -> ApiClient {
    let config = CloudEndpointConfig::for_base_url(server.url());
    let vault = CredentialVault::open_at(dir.path().join("secrets.json"));
    vault
        .store(IDENTITY_ID, "rt_heartbeat_refresh_01")
        .unwrap();
    let coordinator = TokenRefreshCoordinator::new(
        ApiClient::public(&config),
        Arc::new(vault),
        IDENTITY_ID.to_string(),
    );
    ApiClient::authenticated(&config, Arc::new(coordinator))
}

#[tokio::test]
async fn sends_initial_beat_then_repeats_and_stops_cleanly() {
    let mut server = Server::new_async().await;

    let _token_mock = server
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "A1", "expires_in": 3600}"#)
        .expect(1)
        .create_async()
        .await;

    let beat_mock = server
        .mock("POST", "/agents/heartbeat")
        .with_status(200)
        .with_body("{}")
        .expect_at_least(2)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let client = authed_client(&server, &dir);

    let mut reporter =
        LivenessReporter::start_with_interval(client, test_identity(), Duration::from_millis(200));

    tokio::time::sleep(Duration::from_millis(500)).await;

    // stop() is deterministic and idempotent.
    let stopping = Instant::now();
    reporter.stop().await;
    reporter.stop().await;
    assert!(stopping.elapsed() < Duration::from_secs(1));

    beat_mock.assert_async().await;
    assert!(reporter.disconnect_signal().borrow().is_none());
}

#[tokio::test]
async fn exhausted_retries_emit_a_disconnect_signal() {
    let mut server = Server::new_async().await;

    let _token_mock = server
        .mock("POST", "/auth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "A1", "expires_in": 3600}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    // Every beat fails fast (404 is not retried as transient), so the
    // reporter walks its linear backoff and gives up.
    let beat_mock = server
        .mock("POST", "/agents/heartbeat")
        .with_status(404)
        .with_body("unknown agent")
        .expect(6)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let client = authed_client(&server, &dir);

    let mut reporter =
        LivenessReporter::start_with_interval(client, test_identity(), Duration::from_millis(50));
    let mut disconnect = reporter.disconnect_signal();

    tokio::time::timeout(Duration::from_secs(10), disconnect.changed())
        .await
        .expect("reporter should give up within the timeout")
        .expect("signal sender should still be alive");

    assert_eq!(*disconnect.borrow(), Some(Disconnect::RetriesExhausted));
    beat_mock.assert_async().await;

    reporter.stop().await;
}
