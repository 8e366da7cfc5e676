//! Periodic liveness heartbeat with bounded retry.
//!
//! The reporter runs as a cooperative task: each tick completes (or the
//! task is cancelled) before the next is scheduled, so beats never
//! overlap. Failures stretch the cadence linearly; exhausting the retry
//! budget publishes a disconnect signal and halts the task.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cloud::{ApiClient, HeartbeatRequest};
use crate::identity::Identity;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 5;

/// Why the reporter gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Consecutive heartbeat failures exceeded the retry budget.
    RetriesExhausted,
}

pub struct LivenessReporter {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    disconnected: watch::Receiver<Option<Disconnect>>,
}

impl LivenessReporter {
    /// Spawn the reporter. The client must be authenticated (see
    /// `SessionManager::authenticated_client`); the first beat goes out
    /// immediately.
    pub fn start(client: ApiClient, identity: Identity) -> Self {
        Self::start_with_interval(client, identity, HEARTBEAT_INTERVAL)
    }

    pub fn start_with_interval(client: ApiClient, identity: Identity, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run(client, identity, interval, task_cancel, tx).await;
        });
        Self {
            cancel,
            handle: Some(handle),
            disconnected: rx,
        }
    }

    /// Channel that flips to `Some` when the reporter gives up on the
    /// server.
    pub fn disconnect_signal(&self) -> watch::Receiver<Option<Disconnect>> {
        self.disconnected.clone()
    }

    /// Cancel the reporter and wait for the task to finish. Safe to call
    /// more than once.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LivenessReporter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    client: ApiClient,
    identity: Identity,
    interval: Duration,
    cancel: CancellationToken,
    disconnected: watch::Sender<Option<Disconnect>>,
) {
    let mut retry_count: u32 = 0;
    let t0 = std::time::Instant::now();

    loop {
        eprintln!("DBG loop top @ {:?}", t0.elapsed());
        let beat = HeartbeatRequest {
            identity_id: identity.id.clone(),
            agent_version: identity.host.agent_version.clone(),
            hostname: identity.host.hostname.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        eprintln!("DBG beat attempt start @ {:?}", t0.elapsed());
        match client.send_heartbeat(&beat).await {
            Ok(()) => {
                eprintln!("DBG beat OK @ {:?}", t0.elapsed());
                if retry_count > 0 {
                    tracing::info!("Heartbeat recovered after {} retries", retry_count);
                }
                retry_count = 0;
            }
            Err(e) => {
                eprintln!("DBG beat ERR: {}", e);
                retry_count += 1;
                tracing::warn!("Heartbeat failed ({}), retry {}/{}", e, retry_count, MAX_RETRIES);
                if retry_count > MAX_RETRIES {
                    tracing::error!("Heartbeat retries exhausted, marking agent disconnected");
                    let _ = disconnected.send(Some(Disconnect::RetriesExhausted));
                    return;
                }
            }
        }

        // Healthy cadence is one interval; failures stretch it linearly
        // by the retry count.
        let delay = if retry_count == 0 {
            interval
        } else {
            interval * retry_count
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
