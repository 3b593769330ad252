use std::path::PathBuf;

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Every failure the identity and secret layer can surface.
///
/// Nothing is retried or swallowed internally; the caller decides policy.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A derived or recovered key does not match the stored verification hash.
    #[error("key does not verify against the stored key hash")]
    BadKey,

    #[error("password rejected: must be at least {min_len} characters")]
    BadPasswordSelected { min_len: usize },

    #[error("username rejected: must be at least {min_len} characters")]
    BadUsernameSelected { min_len: usize },

    /// An operation was invoked in the wrong identity-lifecycle state.
    #[error("illegal method usage: {0}")]
    IllegalMethodUsage(String),

    /// AEAD tag mismatch: tampered artifact or wrong key.
    #[error("authentication failed while decrypting {0}")]
    AuthenticationFailed(&'static str),

    #[error(
        "refusing to replace {path}: local copy (mtime {local_mtime_ns}ns) is newer than remote ({remote_mtime_ns}ns)"
    )]
    OlderServerFile {
        path: PathBuf,
        local_mtime_ns: u64,
        remote_mtime_ns: u64,
    },

    /// A decrypted name would escape the trusted root.
    #[error("permission denied: decrypted path {0:?} escapes the sync root")]
    PathTraversal(String),

    #[error("invalid encrypted name {name:?}: {reason}")]
    InvalidEncryptedName { name: String, reason: String },

    #[error("path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),

    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("invalid key length: {actual} bytes (expected {expected})")]
    InvalidKeyLength { actual: usize, expected: usize },

    #[error("malformed log {path} line {line}: {reason}")]
    MalformedLog {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("invalid threshold/share count: {0}")]
    InvalidThreshold(String),

    #[error("not enough shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("shares disagree on threshold ({expected} vs {found})")]
    ThresholdMismatch { expected: u8, found: u8 },

    #[error("duplicate share index {0}")]
    DuplicateShareIndex(u64),

    /// Interpolation produced a value that cannot be a 256-bit secret.
    #[error("recovered value does not fit in 32 bytes")]
    SecretOutOfRange,

    #[error("invalid share encoding: {0}")]
    InvalidShareEncoding(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("AEAD operation failed: {0}")]
    Aead(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization: {0}")]
    Json(#[from] serde_json::Error),
}
