//! Per-file metadata that travels next to each ciphertext
//!
//! The AEAD tag authenticates this record but does not embed it, so the sync
//! layer ships it out-of-band with the encrypted blob. Its canonical byte form
//! (compact JSON, fields in declaration order) is the associated data bound
//! into the content encryption.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CryptoResult;
use crate::keys::Nonce;

/// Associated data bound to one encrypted file revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Plaintext modification time, nanoseconds since the Unix epoch
    pub mtime_ns: u64,
    /// Encrypted relative path (`<hex>.cio`)
    pub enc_name: String,
    /// Nonce the path was encrypted under; stable across revisions
    pub name_nonce: Nonce,
    /// Nonce the content was encrypted under; fresh per revision
    pub data_nonce: Nonce,
}

impl FileMetadata {
    /// Canonical associated-data bytes.
    pub fn aad_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// One row of the remote store's listing, as served to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub enc_name: String,
    /// Hex nonce of the encrypted name
    pub name_nonce: String,
    pub mtime_ns: u64,
}

/// A remote file resolved to its plaintext relative path.
///
/// `name_nonce` is what the scheduler carries forward when it pushes the next
/// revision of the same logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub name_nonce: Nonce,
    pub enc_name: String,
    pub mtime_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMetadata {
        FileMetadata {
            mtime_ns: 1_700_000_000_123_456_789,
            enc_name: "abcdef.cio".to_string(),
            name_nonce: Nonce::from_bytes([1u8; 24]),
            data_nonce: Nonce::from_bytes([2u8; 24]),
        }
    }

    #[test]
    fn test_aad_is_canonical_after_transport() {
        let meta = sample();
        let aad = meta.aad_bytes().unwrap();

        // What the receiving side reconstructs from the shipped JSON must
        // serialize to the exact same associated data.
        let restored = FileMetadata::from_json(&aad).unwrap();
        assert_eq!(restored, meta);
        assert_eq!(restored.aad_bytes().unwrap(), aad);
    }

    #[test]
    fn test_nonces_serialize_as_hex() {
        let json = String::from_utf8(sample().aad_bytes().unwrap()).unwrap();
        assert!(json.contains(&"01".repeat(24)));
        assert!(json.contains(&"02".repeat(24)));
        assert!(json.starts_with("{\"mtime_ns\":1700000000123456789"));
    }

    #[test]
    fn test_bad_nonce_rejected() {
        let json = br#"{"mtime_ns":1,"enc_name":"x.cio","name_nonce":"zz","data_nonce":"00"}"#;
        assert!(FileMetadata::from_json(json).is_err());
    }
}
