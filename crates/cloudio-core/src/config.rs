use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CloudioError, CloudioResult};

/// Floor for `crypto.min_password_len`; the identity layer enforces the same.
pub const MIN_PASSWORD_LEN: usize = 12;

/// Top-level client configuration (loaded from cloudio.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudioConfig {
    pub client: ClientConfig,
    pub workspace: WorkspaceConfig,
    pub identity: IdentityConfig,
    pub crypto: CryptoConfig,
    pub backup: BackupConfig,
}

impl CloudioConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> CloudioResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(CloudioError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&content).map_err(|source| CloudioError::TomlParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> CloudioResult<()> {
        match self.client.log_format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(CloudioError::Config(format!(
                    "client.log_format must be \"text\" or \"json\", got {other:?}"
                )))
            }
        }
        if self.workspace.cleanup_attempts == 0 {
            return Err(CloudioError::Config(
                "workspace.cleanup_attempts must be at least 1".into(),
            ));
        }
        if self.crypto.min_password_len < MIN_PASSWORD_LEN {
            return Err(CloudioError::Config(format!(
                "crypto.min_password_len must be at least {MIN_PASSWORD_LEN}, got {}",
                self.crypto.min_password_len
            )));
        }
        let BackupConfig { threshold, shares } = self.backup;
        if threshold == 0 || u16::from(threshold) + 1 > u16::from(shares) || shares > 127 {
            return Err(CloudioError::Config(format!(
                "backup needs 0 < threshold < shares <= 127, got threshold={threshold} shares={shares}"
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> CloudioResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Trusted plaintext sync root
    pub root: PathBuf,
    /// Where encrypted files are staged before upload / after download
    pub staging_dir: PathBuf,
    /// Attempts when removing a locked staged file (default: 5)
    pub cleanup_attempts: u32,
    /// Initial backoff between attempts in ms, doubled each time (default: 100)
    pub cleanup_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Account name; the KDF salt is derived from it
    pub username: String,
    /// Directory holding key_hashes.txt and enc_keys.txt
    pub state_dir: PathBuf,
}

/// Argon2id work factor and password policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Minimum password length in characters (default: 12)
    pub min_password_len: usize,
}

/// Default split for `cloudio backup`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Polynomial degree; `threshold + 1` shares recover the key
    pub threshold: u8,
    pub shares: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/CloudIO/files"),
            staging_dir: PathBuf::from("~/CloudIO/tmp"),
            cleanup_attempts: 5,
            cleanup_backoff_ms: 100,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            state_dir: PathBuf::from("~/.local/share/cloudio"),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            min_password_len: MIN_PASSWORD_LEN,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            shares: 5,
        }
    }
}
