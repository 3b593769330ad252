//! Identity log store: the key-hash log and the wrapped-key log, read back as
//! one ordered chain of [`KeyRecord`]s
//!
//! On disk (both append-only, oldest first, one record per line):
//! ```text
//! key_hashes.txt   <hex sha512>
//! enc_keys.txt     <hex ciphertext> & <hex nonce>
//! ```
//! Record `i > 0` pairs hash `i` with wrapped line `i - 1`: the key of
//! generation `i - 1` encrypted under the key of generation `i`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::KEY_HASH_HEX_LEN;
use crate::keys::Nonce;

pub const HASH_LOG_FILE: &str = "key_hashes.txt";
pub const WRAPPED_LOG_FILE: &str = "enc_keys.txt";

const WRAPPED_SEPARATOR: &str = " & ";

/// A prior key wrapped under its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub nonce: Nonce,
}

impl WrappedKey {
    fn to_line(&self) -> String {
        format!(
            "{}{WRAPPED_SEPARATOR}{}",
            hex::encode(&self.ciphertext),
            self.nonce.to_hex()
        )
    }

    fn parse_line(line: &str) -> Result<Self, String> {
        let (ct_hex, nonce_hex) = line
            .split_once(WRAPPED_SEPARATOR)
            .ok_or_else(|| format!("expected `<ciphertext>{WRAPPED_SEPARATOR}<nonce>`"))?;
        let ciphertext = hex::decode(ct_hex.trim()).map_err(|e| format!("ciphertext: {e}"))?;
        if ciphertext.is_empty() {
            return Err("empty ciphertext".into());
        }
        let nonce = Nonce::from_hex(nonce_hex).map_err(|e| e.to_string())?;
        Ok(Self { ciphertext, nonce })
    }
}

/// One generation of the identity's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// Hex verification hash of this generation's key
    pub hash: String,
    /// The previous generation's key wrapped under this one; `None` only for
    /// the first generation
    pub wrapped_predecessor: Option<WrappedKey>,
}

/// Handle on one identity's pair of logs inside a state directory.
#[derive(Debug, Clone)]
pub struct IdentityLog {
    hash_path: PathBuf,
    wrapped_path: PathBuf,
}

impl IdentityLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            hash_path: state_dir.join(HASH_LOG_FILE),
            wrapped_path: state_dir.join(WRAPPED_LOG_FILE),
        }
    }

    pub fn hash_log_path(&self) -> &Path {
        &self.hash_path
    }

    pub fn wrapped_log_path(&self) -> &Path {
        &self.wrapped_path
    }

    /// Load the full chain, oldest generation first.
    ///
    /// A missing hash log means "no identity yet" and a missing wrapped log
    /// means "never rotated"; both are valid. Anything that breaks positional
    /// correspondence between the two files is [`CryptoError::MalformedLog`].
    pub fn load(&self) -> CryptoResult<Vec<KeyRecord>> {
        let hashes = read_lines(&self.hash_path)?;
        let wrapped = read_lines(&self.wrapped_path)?;

        for (line, hash) in &hashes {
            if hash.len() != KEY_HASH_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(self.malformed(&self.hash_path, *line, "not a hex key hash"));
            }
        }

        let expected_wrapped = hashes.len().saturating_sub(1);
        if wrapped.len() != expected_wrapped {
            let line = wrapped.last().map(|(l, _)| *l).unwrap_or(0);
            return Err(self.malformed(
                &self.wrapped_path,
                line,
                &format!(
                    "{} wrapped records for {} key hashes (expected {expected_wrapped})",
                    wrapped.len(),
                    hashes.len()
                ),
            ));
        }

        let mut records = Vec::with_capacity(hashes.len());
        let mut predecessors = wrapped.into_iter();
        for (i, (_, hash)) in hashes.into_iter().enumerate() {
            let wrapped_predecessor = if i == 0 {
                None
            } else {
                match predecessors.next() {
                    Some((line, text)) => Some(
                        WrappedKey::parse_line(&text)
                            .map_err(|reason| self.malformed(&self.wrapped_path, line, &reason))?,
                    ),
                    None => None,
                }
            };
            records.push(KeyRecord {
                hash: hash.to_ascii_lowercase(),
                wrapped_predecessor,
            });
        }
        Ok(records)
    }

    /// Append the first generation's hash.
    pub(crate) fn append_first(&self, hash: &str) -> CryptoResult<()> {
        append_line(&self.hash_path, hash)?;
        debug!(log = %self.hash_path.display(), "key hash appended");
        Ok(())
    }

    /// Append one rotation: the wrapped predecessor, then the new hash.
    pub(crate) fn append_rotation(&self, wrapped: &WrappedKey, hash: &str) -> CryptoResult<()> {
        append_line(&self.wrapped_path, &wrapped.to_line())?;
        append_line(&self.hash_path, hash)?;
        debug!(
            hash_log = %self.hash_path.display(),
            wrapped_log = %self.wrapped_path.display(),
            "rotation record appended"
        );
        Ok(())
    }

    fn malformed(&self, path: &Path, line: usize, reason: &str) -> CryptoError {
        CryptoError::MalformedLog {
            path: path.to_path_buf(),
            line,
            reason: reason.to_string(),
        }
    }
}

/// Non-blank lines with their 1-based line numbers; empty when the file is absent.
fn read_lines(path: &Path) -> CryptoResult<Vec<(usize, String)>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim().to_string()))
        .filter(|(_, l)| !l.is_empty())
        .collect())
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.sync_all()
}
