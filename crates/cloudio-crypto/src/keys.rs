//! Key material: symmetric keys, AEAD nonces and opaque key fingerprints

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{FINGERPRINT_SIZE, KEY_SIZE, NONCE_SIZE};

/// A 256-bit symmetric key. Zeroized on drop.
///
/// Never persisted in plaintext: the identity logs only ever hold its
/// verification hash, or the key wrapped under its successor.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from a slice, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                actual: bytes.len(),
                expected: KEY_SIZE,
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Generate a random key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Constant-time comparison against another key.
    pub fn ct_eq(&self, other: &SymmetricKey) -> bool {
        bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 192-bit XChaCha20-Poly1305 nonce.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// A fresh random nonce. 192 bits is large enough that random nonces
    /// never collide in practice under one key.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let mut bytes = [0u8; NONCE_SIZE];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| CryptoError::InvalidNonce(format!("{s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Nonce::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

/// Opaque fingerprint of the key behind an [`crate::EntityCrypto`].
///
/// Two fingerprints compare equal iff the underlying keys are equal. The
/// comparison is constant-time. Not `Hash`.
#[derive(Clone)]
pub struct KeyFingerprint([u8; FINGERPRINT_SIZE]);

impl KeyFingerprint {
    const CONTEXT: &'static str = "cloudio 2024-01 entity fingerprint v1";

    pub(crate) fn of(key: &SymmetricKey) -> Self {
        Self(blake3::derive_key(Self::CONTEXT, key.as_bytes()))
    }

    /// Short hex prefix, safe for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl PartialEq for KeyFingerprint {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for KeyFingerprint {}

impl std::fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyFingerprint({}..)", self.short_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let k1 = SymmetricKey::generate();
        let k2 = SymmetricKey::generate();
        assert!(!k1.ct_eq(&k2), "random keys must differ");
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let result = SymmetricKey::from_slice(&[0u8; 31]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { actual: 31, .. })
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("ab"));
    }

    #[test]
    fn test_nonce_hex_roundtrip() {
        let nonce = Nonce::random();
        let parsed = Nonce::from_hex(&nonce.to_hex()).unwrap();
        assert_eq!(nonce, parsed);
    }

    #[test]
    fn test_nonce_from_bad_hex() {
        assert!(Nonce::from_hex("zz").is_err());
        assert!(Nonce::from_hex("abcd").is_err(), "too short");
    }

    #[test]
    fn test_fingerprint_tracks_key_equality() {
        let a = SymmetricKey::from_bytes([1u8; KEY_SIZE]);
        let b = SymmetricKey::from_bytes([1u8; KEY_SIZE]);
        let c = SymmetricKey::from_bytes([2u8; KEY_SIZE]);

        assert_eq!(KeyFingerprint::of(&a), KeyFingerprint::of(&b));
        assert_ne!(KeyFingerprint::of(&a), KeyFingerprint::of(&c));
    }

    #[test]
    fn test_fingerprint_is_not_the_key() {
        let key = SymmetricKey::from_bytes([7u8; KEY_SIZE]);
        let fp = KeyFingerprint::of(&key);
        assert_ne!(&fp.0, key.as_bytes());
    }
}
