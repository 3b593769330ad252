//! Key derivation: Argon2id password → symmetric key, plus the salt and
//! verification-hash constructions the identity logs are built on

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::KEY_SIZE;

/// Minimum username length accepted as a salt source.
pub const MIN_USERNAME_LEN: usize = 3;

/// Hex length of a stored key hash (SHA-512).
pub const KEY_HASH_HEX_LEN: usize = 128;

const SALT_DOMAIN: &[u8] = b"cloudio-identity-salt-v1";
const KEY_HASH_DOMAIN: &[u8] = b"cloudio-key-hash-v1";

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and benches. Never use for real identities.
    pub fn insecure_fast() -> Self {
        Self {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn to_argon2(&self) -> CryptoResult<Params> {
        Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))
    }
}

/// Salt bound to a username: `SHA-256(domain || username)`.
///
/// Hashing keeps the salt at a fixed 32 bytes no matter how short the
/// username is, which Argon2's 8-byte minimum would otherwise reject.
pub fn identity_salt(username: &str) -> CryptoResult<[u8; 32]> {
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(CryptoError::BadUsernameSelected {
            min_len: MIN_USERNAME_LEN,
        });
    }
    let mut hasher = Sha256::new();
    hasher.update(SALT_DOMAIN);
    hasher.update(username.as_bytes());
    Ok(hasher.finalize().into())
}

/// Derive a 256-bit key from a password and salt using Argon2id.
pub fn derive_key_argon2(
    password: &SecretString,
    salt: &[u8; 32],
    params: &KdfParams,
) -> CryptoResult<SymmetricKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id KDF failed: {e}")))?;

    let derived = SymmetricKey::from_bytes(key);
    zeroize::Zeroize::zeroize(&mut key);
    Ok(derived)
}

/// Verification hash of a key, hex encoded as stored in the hash log.
pub fn key_hash(salt: &[u8; 32], key: &SymmetricKey) -> String {
    hex::encode(key_digest(salt, key))
}

fn key_digest(salt: &[u8; 32], key: &SymmetricKey) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(KEY_HASH_DOMAIN);
    hasher.update(salt);
    hasher.update(key.as_bytes());
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Constant-time check of `key` against a stored hex hash.
///
/// A stored value that is not valid hex simply fails to match.
pub fn verify_key_hash(salt: &[u8; 32], key: &SymmetricKey, stored_hex: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hex) else {
        return false;
    };
    bool::from(key_digest(salt, key).as_slice().ct_eq(stored.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn salt() -> [u8; 32] {
        identity_salt("alice").unwrap()
    }

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-passphrase-123");
        let params = KdfParams::insecure_fast();

        let key1 = derive_key_argon2(&password, &salt(), &params).unwrap();
        let key2 = derive_key_argon2(&password, &salt(), &params).unwrap();

        assert!(key1.ct_eq(&key2), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let params = KdfParams::insecure_fast();
        let key1 = derive_key_argon2(&SecretString::from("passphrase-a"), &salt(), &params).unwrap();
        let key2 = derive_key_argon2(&SecretString::from("passphrase-b"), &salt(), &params).unwrap();
        assert!(!key1.ct_eq(&key2));
    }

    #[test]
    fn test_kdf_salt_depends_on_username() {
        let password = SecretString::from("same-passphrase");
        let params = KdfParams::insecure_fast();
        let a = derive_key_argon2(&password, &identity_salt("alice").unwrap(), &params).unwrap();
        let b = derive_key_argon2(&password, &identity_salt("bob").unwrap(), &params).unwrap();
        assert!(!a.ct_eq(&b));
    }

    #[test]
    fn test_short_username_rejected() {
        assert!(matches!(
            identity_salt("ab"),
            Err(CryptoError::BadUsernameSelected { min_len: 3 })
        ));
        assert!(identity_salt("abc").is_ok());
    }

    #[test]
    fn test_invalid_params_surface_as_kdf_error() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 1,
        };
        let result = derive_key_argon2(&SecretString::from("whatever-long"), &salt(), &params);
        assert!(matches!(result, Err(CryptoError::Kdf(_))));
    }

    #[test]
    fn test_key_hash_shape_and_verify() {
        let key = SymmetricKey::from_bytes([5u8; KEY_SIZE]);
        let hash = key_hash(&salt(), &key);

        assert_eq!(hash.len(), KEY_HASH_HEX_LEN);
        assert!(verify_key_hash(&salt(), &key, &hash));
        assert!(!verify_key_hash(
            &salt(),
            &SymmetricKey::from_bytes([6u8; KEY_SIZE]),
            &hash
        ));
        assert!(!verify_key_hash(&identity_salt("mallory").unwrap(), &key, &hash));
        assert!(!verify_key_hash(&salt(), &key, "not hex"));
    }
}
