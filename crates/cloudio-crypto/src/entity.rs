//! Entity cryptography: XChaCha20-Poly1305 over file content, relative paths
//! and wrapped keys, all under one raw symmetric key
//!
//! Encrypted name format: `hex(ciphertext || tag) + ".cio"`. The path is
//! encrypted without associated data under a caller-chosen nonce, so reusing
//! a file's name nonce keeps its encrypted identity stable across revisions.
//!
//! Encrypted content: `ciphertext || tag` under a fresh data nonce, with the
//! file's [`FileMetadata`] bound as associated data.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyFingerprint, Nonce, SymmetricKey};
use crate::record::{FileInfo, FileMetadata, RemoteEntry};
use crate::workspace::SyncWorkspace;

/// Extension carried by every encrypted name.
pub const ENCRYPTED_NAME_EXT: &str = ".cio";

/// Encrypts and decrypts entities under one key. Holds no salt.
///
/// Not `PartialEq`; compare [`EntityCrypto::fingerprint`]s instead.
pub struct EntityCrypto {
    key: SymmetricKey,
    fingerprint: KeyFingerprint,
}

impl EntityCrypto {
    pub fn new(key: SymmetricKey) -> Self {
        let fingerprint = KeyFingerprint::of(&key);
        Self { key, fingerprint }
    }

    /// Keyed digest of the underlying key; equal iff the keys are equal.
    pub fn fingerprint(&self) -> &KeyFingerprint {
        &self.fingerprint
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()))
    }

    /// AEAD-encrypt an arbitrary payload.
    pub fn seal(&self, plaintext: &[u8], nonce: &Nonce, aad: &[u8]) -> CryptoResult<Vec<u8>> {
        self.cipher()
            .encrypt(
                XNonce::from_slice(nonce.as_bytes()),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::Aead(e.to_string()))
    }

    /// AEAD-decrypt an arbitrary payload.
    pub fn open(
        &self,
        ciphertext: &[u8],
        nonce: &Nonce,
        aad: &[u8],
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        self.open_as(ciphertext, nonce, aad, "payload")
    }

    fn open_as(
        &self,
        ciphertext: &[u8],
        nonce: &Nonce,
        aad: &[u8],
        what: &'static str,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce.as_bytes()),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::AuthenticationFailed(what))
    }

    /// Encrypt a root-relative path into a pseudonymous name.
    ///
    /// The path is canonicalized to `/`-separated form first, so the same
    /// logical file gets the same name on every platform. A path naming the
    /// root itself (empty, or only `.`) is rejected.
    pub fn encrypt_path(&self, relative_path: &Path, nonce: &Nonce) -> CryptoResult<String> {
        let canonical = canonical_path_string(relative_path)?;
        let ciphertext = self.seal(canonical.as_bytes(), nonce, &[])?;
        Ok(format!("{}{ENCRYPTED_NAME_EXT}", hex::encode(ciphertext)))
    }

    /// Decrypt a name produced by [`EntityCrypto::encrypt_path`].
    ///
    /// The result is safe to join onto the trusted root: any value containing
    /// a parent-directory segment or an absolute prefix is rejected.
    pub fn decrypt_path(&self, enc_name: &str, nonce: &Nonce) -> CryptoResult<PathBuf> {
        let hex_part = enc_name.strip_suffix(ENCRYPTED_NAME_EXT).ok_or_else(|| {
            CryptoError::InvalidEncryptedName {
                name: enc_name.to_string(),
                reason: format!("missing {ENCRYPTED_NAME_EXT} extension"),
            }
        })?;
        let ciphertext = hex::decode(hex_part).map_err(|e| CryptoError::InvalidEncryptedName {
            name: enc_name.to_string(),
            reason: format!("hex decode: {e}"),
        })?;

        let plaintext = self.open_as(&ciphertext, nonce, &[], "path")?;
        let decoded =
            std::str::from_utf8(&plaintext).map_err(|e| CryptoError::InvalidEncryptedName {
                name: enc_name.to_string(),
                reason: format!("decrypted path is not UTF-8: {e}"),
            })?;

        confine(decoded)
    }

    /// Encrypt `file_path` (which must live under the workspace root) into the
    /// staging directory.
    ///
    /// Returns the staged ciphertext path and the metadata record that must
    /// accompany it. Callers pass the previous revision's `name_nonce` to keep
    /// the encrypted name stable, and a fresh `data_nonce` every time.
    pub fn encrypt_file(
        &self,
        workspace: &SyncWorkspace,
        file_path: &Path,
        name_nonce: &Nonce,
        data_nonce: &Nonce,
    ) -> CryptoResult<(PathBuf, FileMetadata)> {
        let relative = workspace.relative_path(file_path)?;
        let enc_name = self.encrypt_path(&relative, name_nonce)?;

        let mtime_ns = mtime_ns(&std::fs::metadata(file_path)?)?;
        let metadata = FileMetadata {
            mtime_ns,
            enc_name,
            name_nonce: *name_nonce,
            data_nonce: *data_nonce,
        };

        let plaintext = Zeroizing::new(std::fs::read(file_path)?);
        let ciphertext = self.seal(&plaintext, data_nonce, &metadata.aad_bytes()?)?;

        std::fs::create_dir_all(workspace.staging())?;
        let staged = workspace.staged_path(&metadata.enc_name);
        std::fs::write(&staged, &ciphertext)?;

        debug!(
            path = %relative.display(),
            bytes = plaintext.len(),
            "file encrypted"
        );
        Ok((staged, metadata))
    }

    /// Decrypt a fetched ciphertext into the workspace root.
    ///
    /// Refuses with [`CryptoError::OlderServerFile`] when a local copy exists
    /// with a newer modification time than the one recorded in `metadata`.
    /// On success the plaintext's modification time is restored from
    /// `metadata` so later timestamp comparisons stay exact.
    pub fn decrypt_file(
        &self,
        workspace: &SyncWorkspace,
        enc_path: &Path,
        metadata: &FileMetadata,
    ) -> CryptoResult<PathBuf> {
        let file_name = enc_path.file_name().and_then(|n| n.to_str());
        if file_name != Some(metadata.enc_name.as_str()) {
            return Err(CryptoError::InvalidEncryptedName {
                name: enc_path.display().to_string(),
                reason: "file name does not match its metadata record".into(),
            });
        }

        let relative = self.decrypt_path(&metadata.enc_name, &metadata.name_nonce)?;
        let target = workspace.root().join(&relative);

        match std::fs::metadata(&target) {
            Ok(local) => {
                let local_mtime_ns = mtime_ns(&local)?;
                if local_mtime_ns > metadata.mtime_ns {
                    warn!(
                        path = %relative.display(),
                        local_mtime_ns,
                        remote_mtime_ns = metadata.mtime_ns,
                        "refusing to overwrite newer local file"
                    );
                    return Err(CryptoError::OlderServerFile {
                        path: target,
                        local_mtime_ns,
                        remote_mtime_ns: metadata.mtime_ns,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let ciphertext = std::fs::read(enc_path)?;
        let plaintext = self.open_as(
            &ciphertext,
            &metadata.data_nonce,
            &metadata.aad_bytes()?,
            "file content",
        )?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomically(
            &target,
            &plaintext,
            UNIX_EPOCH + Duration::from_nanos(metadata.mtime_ns),
        )?;

        debug!(path = %relative.display(), bytes = plaintext.len(), "file decrypted");
        Ok(target)
    }

    /// Resolve a remote listing into plaintext relative paths.
    pub fn decrypt_file_list(
        &self,
        entries: &[RemoteEntry],
    ) -> CryptoResult<BTreeMap<PathBuf, FileInfo>> {
        let mut files = BTreeMap::new();
        for entry in entries {
            let name_nonce = Nonce::from_hex(&entry.name_nonce)?;
            let path = self.decrypt_path(&entry.enc_name, &name_nonce)?;
            files.insert(
                path.clone(),
                FileInfo {
                    path,
                    name_nonce,
                    enc_name: entry.enc_name.clone(),
                    mtime_ns: entry.mtime_ns,
                },
            );
        }
        Ok(files)
    }

    /// Wrap raw key bytes under this entity's key. No associated data.
    pub fn encrypt_key(&self, key: &SymmetricKey, nonce: &Nonce) -> CryptoResult<Vec<u8>> {
        self.seal(key.as_bytes(), nonce, &[])
    }

    /// Unwrap a key produced by [`EntityCrypto::encrypt_key`].
    pub fn decrypt_key(&self, wrapped: &[u8], nonce: &Nonce) -> CryptoResult<SymmetricKey> {
        let plaintext = self.open_as(wrapped, nonce, &[], "wrapped key")?;
        SymmetricKey::from_slice(&plaintext)
    }
}

impl std::fmt::Debug for EntityCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCrypto")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

fn canonical_path_string(path: &Path) -> CryptoResult<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(seg) => segments.push(
                seg.to_str()
                    .ok_or_else(|| CryptoError::NonUtf8Path(path.to_path_buf()))?,
            ),
            Component::CurDir => {}
            _ => return Err(CryptoError::PathTraversal(path.display().to_string())),
        }
    }
    if segments.is_empty() {
        return Err(CryptoError::PathTraversal(path.display().to_string()));
    }
    Ok(segments.join("/"))
}

/// Path-confinement check on a decrypted name.
fn confine(decoded: &str) -> CryptoResult<PathBuf> {
    let escapes = decoded.is_empty()
        || decoded.starts_with('/')
        || decoded.starts_with('\\')
        || decoded.split(['/', '\\']).any(|seg| seg == "..")
        || Path::new(decoded)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        warn!(name = decoded, "rejected decrypted path outside the sync root");
        return Err(CryptoError::PathTraversal(decoded.to_string()));
    }
    Ok(PathBuf::from_iter(decoded.split('/')))
}

/// Write `content` to a sibling temp file, stamp its mtime, then rename it over
/// `target`. An existing `target` is untouched until the rename.
fn write_atomically(target: &Path, content: &[u8], mtime: SystemTime) -> CryptoResult<()> {
    let name = target
        .file_name()
        .ok_or_else(|| CryptoError::PathTraversal(target.display().to_string()))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".cio-partial");
    let tmp = target.with_file_name(tmp_name);

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.set_modified(mtime)?;
        file.sync_all()
    })();
    if let Err(e) = written.and_then(|()| std::fs::rename(&tmp, target)) {
        if let Err(cleanup) = std::fs::remove_file(&tmp) {
            debug!(path = %tmp.display(), error = %cleanup, "partial file not removed");
        }
        return Err(e.into());
    }
    Ok(())
}

fn mtime_ns(metadata: &std::fs::Metadata) -> CryptoResult<u64> {
    let since_epoch = metadata
        .modified()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX))
}
