//! AES-256-GCM encryption for the fallback secret store.
//!
//! The key is derived from host-identifying material, so a secrets file
//! copied to another machine does not decrypt there. Every write uses a
//! fresh random salt and nonce; the stored layout is
//! `salt || nonce || tag || ciphertext`, base64-encoded.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::StoreError;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Smallest decodable blob: the header with an empty ciphertext.
const HEADER_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

const PBKDF2_ROUNDS: u32 = 100_000;

/// Mixed into every per-blob salt so other applications deriving from
/// the same host material land in a different key space.
const APP_SALT: &[u8] = b"lattice-credential-vault-v1";

/// Host-identifying material the encryption key is derived from.
pub(crate) fn host_material() -> String {
    let hostname =
        crate::identity::local_hostname().unwrap_or_else(|| "unknown-host".to_string());
    let home = dirs::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!(
        "{}|{}|{}|{}",
        hostname,
        std::env::consts::OS,
        std::env::consts::ARCH,
        home
    )
}

fn derive_key(material: &str, salt: &[u8]) -> [u8; 32] {
    let mut full_salt = Vec::with_capacity(APP_SALT.len() + salt.len());
    full_salt.extend_from_slice(APP_SALT);
    full_salt.extend_from_slice(salt);

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(material.as_bytes(), &full_salt, PBKDF2_ROUNDS, &mut key);
    key
}

pub(crate) fn encrypt(material: &str, plaintext: &str) -> Result<String, StoreError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(material, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| StoreError::Backend(format!("cipher init failed: {}", e)))?;
    let ct_with_tag = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| StoreError::Backend(format!("encryption failed: {}", e)))?;

    // AES-GCM appends the 16-byte tag; the stored layout wants it ahead
    // of the ciphertext.
    let split = ct_with_tag.len() - TAG_LEN;
    let mut blob = Vec::with_capacity(HEADER_LEN + split);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct_with_tag[split..]);
    blob.extend_from_slice(&ct_with_tag[..split]);
    Ok(BASE64.encode(blob))
}

pub(crate) fn decrypt(material: &str, encoded: &str) -> Result<String, StoreError> {
    let blob = BASE64
        .decode(encoded.trim())
        .map_err(|_| StoreError::Decryption)?;
    if blob.len() < HEADER_LEN {
        return Err(StoreError::InvalidCiphertext);
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, rest) = rest.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let key = derive_key(material, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| StoreError::Decryption)?;

    let mut ct_with_tag = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    ct_with_tag.extend_from_slice(ciphertext);
    ct_with_tag.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ct_with_tag.as_slice())
        .map_err(|_| StoreError::Decryption)?;
    String::from_utf8(plaintext).map_err(|_| StoreError::Decryption)
}

/// Interpret a stored value as a legacy base64-obfuscated token. Returns
/// the plaintext only when the decoded value has the opaque-token shape.
pub(crate) fn decode_legacy(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    let token = String::from_utf8(bytes).ok()?;
    looks_like_token(&token).then_some(token)
}

/// Opaque tokens as issued by the authorization server: printable, no
/// whitespace, reasonably long.
pub(crate) fn looks_like_token(s: &str) -> bool {
    s.len() >= 16
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let material = host_material();
        let secret = "rt_0123456789abcdef0123456789abcdef";

        let blob = encrypt(&material, secret).unwrap();
        assert_ne!(blob, secret);
        assert_eq!(decrypt(&material, &blob).unwrap(), secret);
    }

    #[test]
    fn each_write_produces_a_distinct_blob() {
        let material = host_material();
        let a = encrypt(&material, "same-secret-same-secret").unwrap();
        let b = encrypt(&material, "same-secret-same-secret").unwrap();
        // Fresh salt and nonce per write.
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_host_material_fails_to_decrypt() {
        let blob = encrypt("host-a|linux|x86_64|/home/a", "rt_secret_secret").unwrap();
        let result = decrypt("host-b|linux|x86_64|/home/b", &blob);
        assert!(matches!(result, Err(StoreError::Decryption)));
    }

    #[test]
    fn truncated_blob_is_invalid_ciphertext() {
        let short = BASE64.encode([0u8; 20]);
        let result = decrypt(&host_material(), &short);
        assert!(matches!(result, Err(StoreError::InvalidCiphertext)));
    }

    #[test]
    fn tampered_blob_fails_authentication() {
        let material = host_material();
        let blob = encrypt(&material, "rt_secret_secret_secret").unwrap();
        let mut raw = BASE64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let result = decrypt(&material, &BASE64.encode(raw));
        assert!(matches!(result, Err(StoreError::Decryption)));
    }

    #[test]
    fn legacy_decode_accepts_token_shapes_only() {
        let legacy = BASE64.encode("rt_legacy_token_0001");
        assert_eq!(
            decode_legacy(&legacy).as_deref(),
            Some("rt_legacy_token_0001")
        );

        // Random bytes decode but do not look like a token.
        let junk = BASE64.encode([0x00, 0x01, 0xfe, 0xff, 0x33, 0x44]);
        assert!(decode_legacy(&junk).is_none());
    }
}
