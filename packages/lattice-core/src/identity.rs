//! Per-host identity persisted under the user config directory.
//!
//! The identity is created once per host and namespaces everything else:
//! keyring entries, encrypted blobs, and heartbeats all key off
//! [`Identity::id`]. It is read-only after creation apart from
//! best-effort metadata merges, and removed only on explicit reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::cloud::config::lattice_config_dir;
use crate::error::StoreError;

/// Environment variable that names the identity without prompting.
pub const ENV_AGENT_NAME: &str = "LATTICE_AGENT_NAME";
/// When set, suppresses every interactive prompt (CI hosts).
pub const ENV_NONINTERACTIVE: &str = "LATTICE_NONINTERACTIVE";

/// File name of the identity record inside the config directory.
const IDENTITY_FILE: &str = "identity.json";

/// How long the interactive naming prompt waits before falling back to a
/// generated default.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMetadata {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub agent_version: Option<String>,
}

impl HostMetadata {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: local_hostname(),
            agent_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub host: HostMetadata,
}

/// Get the local machine's hostname
pub(crate) fn local_hostname() -> Option<String> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("COMPUTERNAME").ok()
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
    }
}

/// Store for the single per-host [`Identity`].
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Open the store at the default config location.
    pub fn open() -> Result<Self, StoreError> {
        Ok(Self {
            path: lattice_config_dir()?.join(IDENTITY_FILE),
        })
    }

    /// Open the store against an explicit file path.
    pub fn open_at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Return the persisted identity without creating one. An unreadable
    /// or unparseable file is reported and treated as absent.
    pub fn get(&self) -> Option<Identity> {
        if !self.path.exists() {
            return None;
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to read identity file {:?}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!("Identity file {:?} is corrupt: {}", self.path, e);
                None
            }
        }
    }

    /// Return the existing identity, or create one.
    ///
    /// The display name is resolved in order: explicit override ->
    /// `LATTICE_AGENT_NAME` -> interactive prompt (TTY only, bounded by
    /// [`PROMPT_TIMEOUT`]) -> generated default.
    pub async fn get_or_create(&self, name_override: Option<&str>) -> Result<Identity, StoreError> {
        if let Some(existing) = self.get() {
            return Ok(existing);
        }

        let display_name = resolve_display_name(name_override).await;
        let identity = Identity {
            id: Uuid::new_v4().to_string(),
            display_name,
            created_at: Utc::now(),
            host: HostMetadata::current(),
        };
        self.persist(&identity)?;
        tracing::info!(
            "Created identity '{}' ({})",
            identity.display_name,
            identity.id
        );
        Ok(identity)
    }

    /// Merge updated host metadata into the stored identity. Failures are
    /// logged and swallowed.
    pub fn update_metadata(&self, host: HostMetadata) {
        let Some(mut identity) = self.get() else {
            return;
        };
        if host.hostname.is_some() {
            identity.host.hostname = host.hostname;
        }
        if host.agent_version.is_some() {
            identity.host.agent_version = host.agent_version;
        }
        identity.host.os = host.os;
        identity.host.arch = host.arch;
        if let Err(e) = self.persist(&identity) {
            tracing::warn!("Failed to update identity metadata: {}", e);
        }
    }

    /// Delete the identity file (explicit reset/logout only). Best-effort.
    pub fn remove(&self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!("Failed to delete identity file: {}", e);
            }
        }
    }

    fn persist(&self, identity: &Identity) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::ConfigWrite {
                what: "identity file",
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(identity)
            .map_err(|e| StoreError::Serialize("identity", e))?;
        fs::write(&self.path, json).map_err(|source| StoreError::ConfigWrite {
            what: "identity file",
            path: self.path.clone(),
            source,
        })
    }
}

async fn resolve_display_name(name_override: Option<&str>) -> String {
    if let Some(name) = name_override {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    if let Ok(name) = std::env::var(ENV_AGENT_NAME) {
        let name = name.trim().to_string();
        if !name.is_empty() {
            tracing::debug!("Using identity name from {}", ENV_AGENT_NAME);
            return name;
        }
    }

    if std::env::var_os(ENV_NONINTERACTIVE).is_none() && std::io::stdin().is_terminal() {
        if let Some(name) = prompt_for_name().await {
            return name;
        }
    }

    default_display_name()
}

fn default_display_name() -> String {
    match local_hostname() {
        Some(hostname) => format!("agent-{}", hostname),
        None => format!("agent-{}", &Uuid::new_v4().to_string()[..8]),
    }
}

/// Ask the operator for a name. Returns `None` on timeout, EOF, or an
/// empty answer; the caller falls back to the generated default so a
/// stuck prompt can never hang a CI pipeline.
async fn prompt_for_name() -> Option<String> {
    use std::io::Write;
    eprint!("Name this host (press enter for a default): ");
    let _ = std::io::stderr().flush();

    let read = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok().map(|_| line)
    });

    match tokio::time::timeout(PROMPT_TIMEOUT, read).await {
        Ok(Ok(Some(line))) => {
            let name = line.trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        }
        Ok(_) => None,
        Err(_) => {
            eprintln!();
            tracing::debug!("Naming prompt timed out, using generated default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> IdentityStore {
        IdentityStore::open_at(dir.path().join("identity.json"))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = store.get_or_create(Some("test-host")).await.unwrap();
        let second = store.get_or_create(Some("other-name")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name, "test-host");
    }

    #[tokio::test]
    async fn explicit_name_wins() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let identity = store.get_or_create(Some("build-agent-7")).await.unwrap();
        assert_eq!(identity.display_name, "build-agent-7");
        assert!(!identity.id.is_empty());
    }

    #[test]
    fn get_without_create_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).get().is_none());
    }

    #[test]
    fn corrupt_identity_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        fs::write(&path, "{not json").unwrap();

        assert!(IdentityStore::open_at(path).get().is_none());
    }

    #[tokio::test]
    async fn update_metadata_merges_fields() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let created = store.get_or_create(Some("merge-me")).await.unwrap();

        store.update_metadata(HostMetadata {
            os: "linux".to_string(),
            arch: "aarch64".to_string(),
            hostname: Some("renamed-host".to_string()),
            agent_version: None,
        });

        let updated = store.get().unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.host.arch, "aarch64");
        assert_eq!(updated.host.hostname.as_deref(), Some("renamed-host"));
        // A missing field in the merge keeps the stored value.
        assert_eq!(updated.host.agent_version, created.host.agent_version);
    }

    #[tokio::test]
    async fn remove_deletes_the_identity() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.get_or_create(Some("short-lived")).await.unwrap();

        store.remove();
        assert!(store.get().is_none());
    }
}
