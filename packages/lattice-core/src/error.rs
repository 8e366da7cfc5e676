//! Error taxonomy for the credential and session subsystem.
//!
//! Three layers: [`StoreError`] for local persistence (identity file,
//! keyring, encrypted secrets file), [`AuthError`] for the authorization
//! protocol, and [`ClientError`] for everything a request can run into.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from local persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A config-directory write failed (identity file, secrets file).
    #[error("failed to write {what} at {path}: {source}")]
    ConfigWrite {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored blob is shorter than the salt + IV + tag header. This is
    /// corruption, not "no credential" - the two must stay distinguishable.
    #[error("stored credential is truncated; run `lattice login` to re-authenticate")]
    InvalidCiphertext,

    /// The blob has a valid shape but did not decrypt under this host's
    /// key. Happens when the secrets file was copied from another machine
    /// or the host material changed.
    #[error(
        "stored credential could not be decrypted (it may have been written on another host); \
         run `lattice login` to re-authenticate"
    )]
    Decryption,

    /// Native secure storage was unavailable or rejected the operation.
    /// The vault chain recovers from this by falling through to the
    /// encrypted file; it never reaches callers of the vault.
    #[error("secure storage backend error: {0}")]
    Backend(String),

    #[error("failed to serialize {0}: {1}")]
    Serialize(&'static str, #[source] serde_json::Error),
}

/// Errors from the device authorization and token refresh protocols.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The device-code request itself failed.
    #[error("could not start device authorization: {0}")]
    Init(String),

    /// The operator rejected the request in the browser.
    #[error("authorization was denied")]
    Denied,

    /// The device code expired before the operator finished authorizing.
    #[error("device authorization expired before approval; run `lattice login` to try again")]
    Expired,

    /// The authorization server returned an error code outside the
    /// device-flow vocabulary.
    #[error("authorization server returned `{0}`")]
    Protocol(String),

    /// No refresh token exists, or the one we had was rejected.
    #[error("not authenticated; run `lattice login`")]
    ReauthenticationRequired,

    /// A protected request got 401 twice in a row - once before and once
    /// after a coordinated refresh.
    #[error("session expired; run `lattice login` to re-authenticate")]
    AuthenticationExpired,
}

/// Errors surfaced by the API client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Timeouts, connection/DNS failures, or 5xx responses that survived
    /// every retry attempt. Carries the final status or error message.
    #[error("request failed after {attempts} attempts: {last_error}")]
    Transient { attempts: u32, last_error: String },

    /// A non-success response outside the retry classes.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
