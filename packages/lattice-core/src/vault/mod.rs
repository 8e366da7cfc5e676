//! Credential storage with platform keyring and encrypted-file fallback.
//!
//! Storage priority:
//! 1. Platform keyring (if the `keyring-storage` feature is enabled and
//!    the keyring is reachable)
//! 2. Encrypted file keyed to this host (always available)
//!
//! Exactly one secret is held per identity; a login or rotation
//! overwrites it, logout deletes it. Plaintext is never persisted.

mod cipher;

pub(crate) use cipher::looks_like_token;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::cloud::config::lattice_config_dir;
use crate::error::StoreError;

#[cfg(feature = "keyring-storage")]
use keyring::Entry;

/// Service name used for keyring storage
#[cfg(feature = "keyring-storage")]
const KEYRING_SERVICE: &str = "lattice-cli";
/// File name of the encrypted fallback store
const SECRETS_FILE: &str = "secrets.json";

/// One secret per identity, behind whichever backend holds it.
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &'static str;
    fn store(&self, id: &str, secret: &str) -> Result<(), StoreError>;
    fn retrieve(&self, id: &str) -> Result<Option<String>, StoreError>;
    fn remove(&self, id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Keyring-backed store (optional, platform-specific)
// ============================================================================

#[cfg(feature = "keyring-storage")]
struct KeyringStore;

#[cfg(feature = "keyring-storage")]
impl KeyringStore {
    fn entry(&self, id: &str) -> Result<Entry, StoreError> {
        Entry::new(KEYRING_SERVICE, id)
            .map_err(|e| StoreError::Backend(format!("failed to create keyring entry: {}", e)))
    }
}

#[cfg(feature = "keyring-storage")]
impl SecretStore for KeyringStore {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn store(&self, id: &str, secret: &str) -> Result<(), StoreError> {
        self.entry(id)?
            .set_password(secret)
            .map_err(|e| StoreError::Backend(format!("failed to store in keyring: {}", e)))
    }

    fn retrieve(&self, id: &str) -> Result<Option<String>, StoreError> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!(
                "failed to read from keyring: {}",
                e
            ))),
        }
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Backend(format!(
                "failed to delete from keyring: {}",
                e
            ))),
        }
    }
}

// ============================================================================
// Encrypted-file store (always available)
// ============================================================================

/// JSON map of identity id -> base64 blob, mode 0600, whole-file
/// read-modify-write. Concurrent CLI invocations race last-writer-wins
/// on this file; that is an accepted limitation.
struct EncryptedFileStore {
    path: PathBuf,
    material: String,
}

impl EncryptedFileStore {
    fn open_default() -> Result<Self, StoreError> {
        Ok(Self::open_at(lattice_config_dir()?.join(SECRETS_FILE)))
    }

    fn open_at(path: PathBuf) -> Self {
        Self {
            path,
            material: cipher::host_material(),
        }
    }

    fn read_map(&self) -> BTreeMap<String, String> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to read secrets file {:?}: {}", self.path, e);
                return BTreeMap::new();
            }
        };
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("Secrets file {:?} is corrupt: {}", self.path, e);
                BTreeMap::new()
            }
        }
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::ConfigWrite {
                what: "secrets file",
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json =
            serde_json::to_string(map).map_err(|e| StoreError::Serialize("secrets file", e))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .map_err(|source| StoreError::ConfigWrite {
                    what: "secrets file",
                    path: self.path.clone(),
                    source,
                })?;
            let mut file = std::io::BufWriter::new(file);
            file.write_all(json.as_bytes())
                .map_err(|source| StoreError::ConfigWrite {
                    what: "secrets file",
                    path: self.path.clone(),
                    source,
                })?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, &json).map_err(|source| StoreError::ConfigWrite {
                what: "secrets file",
                path: self.path.clone(),
                source,
            })?;
        }

        Ok(())
    }
}

impl SecretStore for EncryptedFileStore {
    fn name(&self) -> &'static str {
        "encrypted file"
    }

    fn store(&self, id: &str, secret: &str) -> Result<(), StoreError> {
        let mut map = self.read_map();
        map.insert(id.to_string(), cipher::encrypt(&self.material, secret)?);
        self.write_map(&map)
    }

    fn retrieve(&self, id: &str) -> Result<Option<String>, StoreError> {
        let map = self.read_map();
        let Some(blob) = map.get(id) else {
            return Ok(None);
        };

        match cipher::decrypt(&self.material, blob) {
            Ok(secret) => Ok(Some(secret)),
            Err(original) => {
                // Values written before the AEAD scheme were plain
                // base64. Migrate them on first read.
                if let Some(legacy) = cipher::decode_legacy(blob) {
                    tracing::info!("Migrating legacy credential to encrypted storage");
                    if let Err(e) = self.store(id, &legacy) {
                        tracing::warn!("Failed to re-encrypt legacy credential: {}", e);
                    }
                    return Ok(Some(legacy));
                }
                Err(original)
            }
        }
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut map = self.read_map();
        if map.remove(id).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

// ============================================================================
// The vault: explicit chain over the configured backends
// ============================================================================

/// Chain-of-responsibility over [`SecretStore`] backends, native storage
/// first. Backend unavailability is recovered here and never reaches
/// callers; decryption failures do, so corruption stays distinguishable
/// from "not logged in".
pub struct CredentialVault {
    stores: Vec<Box<dyn SecretStore>>,
}

impl CredentialVault {
    /// Open the default chain: keyring (when compiled in), then the
    /// encrypted file under the config directory.
    pub fn open() -> Result<Self, StoreError> {
        let mut stores: Vec<Box<dyn SecretStore>> = Vec::new();
        #[cfg(feature = "keyring-storage")]
        stores.push(Box::new(KeyringStore));
        stores.push(Box::new(EncryptedFileStore::open_default()?));
        Ok(Self { stores })
    }

    /// File-only vault against an explicit secrets path. Used by tests
    /// and by tooling that must not touch the platform keyring.
    pub fn open_at(secrets_path: PathBuf) -> Self {
        Self {
            stores: vec![Box::new(EncryptedFileStore::open_at(secrets_path))],
        }
    }

    /// Vault over an explicit backend chain.
    pub fn with_stores(stores: Vec<Box<dyn SecretStore>>) -> Self {
        Self { stores }
    }

    /// Store a secret in the first backend that will take it.
    pub fn store(&self, id: &str, secret: &str) -> Result<(), StoreError> {
        let mut last_err = None;
        for store in &self.stores {
            match store.store(id, secret) {
                Ok(()) => {
                    tracing::debug!("Credential stored via {}", store.name());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("{} store failed: {}, trying next backend", store.name(), e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(StoreError::Backend("no storage backend available".into())))
    }

    /// Retrieve the secret for an identity, trying each backend in turn.
    /// Returns `None` only when every backend reports the secret absent.
    pub fn retrieve(&self, id: &str) -> Result<Option<String>, StoreError> {
        for store in &self.stores {
            match store.retrieve(id) {
                Ok(Some(secret)) => {
                    tracing::debug!("Credential loaded via {}", store.name());
                    return Ok(Some(secret));
                }
                Ok(None) => continue,
                Err(StoreError::Backend(reason)) => {
                    tracing::warn!(
                        "{} unavailable ({}), trying next backend",
                        store.name(),
                        reason
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Delete the secret from every backend. Best-effort; errors are
    /// logged and swallowed.
    pub fn remove(&self, id: &str) {
        for store in &self.stores {
            if let Err(e) = store.remove(id) {
                tracing::warn!("Failed to remove credential from {}: {}", store.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use tempfile::TempDir;

    const ID: &str = "11111111-2222-3333-4444-555555555555";

    fn file_vault(dir: &TempDir) -> CredentialVault {
        CredentialVault::open_at(dir.path().join("secrets.json"))
    }

    /// Backend that always fails, standing in for a host without a
    /// reachable keyring.
    struct DeadStore;

    impl SecretStore for DeadStore {
        fn name(&self) -> &'static str {
            "dead"
        }
        fn store(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("no secret service".into()))
        }
        fn retrieve(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("no secret service".into()))
        }
        fn remove(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("no secret service".into()))
        }
    }

    #[test]
    fn store_retrieve_roundtrip() {
        let dir = TempDir::new().unwrap();
        let vault = file_vault(&dir);

        vault.store(ID, "rt_refresh_token_001").unwrap();
        assert_eq!(
            vault.retrieve(ID).unwrap().as_deref(),
            Some("rt_refresh_token_001")
        );
    }

    #[test]
    fn roundtrip_survives_a_dead_native_backend() {
        let dir = TempDir::new().unwrap();
        let vault = CredentialVault::with_stores(vec![
            Box::new(DeadStore),
            Box::new(EncryptedFileStore::open_at(dir.path().join("secrets.json"))),
        ]);

        vault.store(ID, "rt_refresh_token_002").unwrap();
        assert_eq!(
            vault.retrieve(ID).unwrap().as_deref(),
            Some("rt_refresh_token_002")
        );
    }

    #[test]
    fn retrieve_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(file_vault(&dir).retrieve(ID).unwrap().is_none());
    }

    #[test]
    fn overwrite_keeps_a_single_credential() {
        let dir = TempDir::new().unwrap();
        let vault = file_vault(&dir);

        vault.store(ID, "rt_first_token_00001").unwrap();
        vault.store(ID, "rt_second_token_0002").unwrap();
        assert_eq!(
            vault.retrieve(ID).unwrap().as_deref(),
            Some("rt_second_token_0002")
        );
    }

    #[test]
    fn remove_deletes_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let vault = file_vault(&dir);

        vault.store(ID, "rt_ephemeral_token_1").unwrap();
        vault.remove(ID);
        assert!(vault.retrieve(ID).unwrap().is_none());
        vault.remove(ID);
    }

    #[test]
    fn plaintext_never_lands_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");
        let vault = CredentialVault::open_at(path.clone());

        vault.store(ID, "rt_super_secret_42_42").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("rt_super_secret_42_42"));
    }

    #[test]
    fn legacy_token_migrates_on_first_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");

        // Seed a pre-AEAD value: plain base64 of the token.
        let legacy_blob = BASE64.encode("rt_legacy_token_0001");
        let mut map = BTreeMap::new();
        map.insert(ID.to_string(), legacy_blob.clone());
        fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();

        let vault = CredentialVault::open_at(path.clone());
        assert_eq!(
            vault.retrieve(ID).unwrap().as_deref(),
            Some("rt_legacy_token_0001")
        );

        // The stored value was rewritten under the current scheme...
        let rewritten: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_ne!(rewritten[ID], legacy_blob);

        // ...and the second read comes straight from the AEAD path.
        assert_eq!(
            vault.retrieve(ID).unwrap().as_deref(),
            Some("rt_legacy_token_0001")
        );
    }

    #[test]
    fn truncated_blob_is_corruption_not_absence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");

        let mut map = BTreeMap::new();
        map.insert(ID.to_string(), BASE64.encode([0u8; 10]));
        fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();

        let result = CredentialVault::open_at(path).retrieve(ID);
        assert!(matches!(result, Err(StoreError::InvalidCiphertext)));
    }

    #[test]
    fn foreign_host_blob_is_a_decryption_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");

        let foreign = cipher::encrypt("other-host|linux|x86_64|/root", "rt_foreign_token_01").unwrap();
        let mut map = BTreeMap::new();
        map.insert(ID.to_string(), foreign);
        fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();

        let result = CredentialVault::open_at(path).retrieve(ID);
        assert!(matches!(result, Err(StoreError::Decryption)));
    }
}
