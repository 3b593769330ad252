//! cloudio-crypto: identity and durable-secret layer for CloudIO
//!
//! Everything that leaves the device is encrypted with XChaCha20-Poly1305
//! under a password-derived key:
//!
//! ```text
//! password ──Argon2id(salt = H(username))──▶ SymmetricKey ──▶ EntityCrypto
//!                                                │               ├── file content (AAD = FileMetadata)
//!                                                │               ├── relative path  → "<hex>.cio"
//!                                                │               └── wrapped keys
//!                                                ├── key_hashes.txt  (verification hash per generation)
//!                                                ├── enc_keys.txt    (generation i-1 wrapped under i)
//!                                                └── Shamir split over GF(p) for offline backup
//! ```

pub mod derivation;
pub mod entity;
pub mod error;
pub mod field;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod polynomial;
pub mod record;
pub mod shamir;
pub mod workspace;

pub use derivation::{KeyDerivation, DEFAULT_MIN_PASSWORD_LEN};
pub use entity::{EntityCrypto, ENCRYPTED_NAME_EXT};
pub use error::{CryptoError, CryptoResult};
pub use field::FieldElement;
pub use identity::{IdentityLog, KeyRecord, WrappedKey};
pub use kdf::{derive_key_argon2, identity_salt, key_hash, KdfParams};
pub use keys::{KeyFingerprint, Nonce, SymmetricKey};
pub use polynomial::Polynomial;
pub use record::{FileInfo, FileMetadata, RemoteEntry};
pub use shamir::{lagrange_at_zero, recover_secret, split_secret, Share, MAX_SHARES};
pub use workspace::{RetryPolicy, SyncWorkspace};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a [`KeyFingerprint`]
pub const FINGERPRINT_SIZE: usize = 32;
