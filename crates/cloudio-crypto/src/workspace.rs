//! Sync workspace: the trusted plaintext root and the ciphertext staging area
//!
//! Passed explicitly to every file operation instead of living in process-wide
//! globals, so two workspaces can coexist in one process (and in tests).

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CryptoError, CryptoResult};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1)
    pub attempts: u32,
    /// Sleep before the second attempt; doubled after each failure
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncWorkspace {
    root: PathBuf,
    staging: PathBuf,
    cleanup: RetryPolicy,
}

impl SyncWorkspace {
    pub fn new(root: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging: staging.into(),
            cleanup: RetryPolicy::default(),
        }
    }

    pub fn with_cleanup_policy(mut self, policy: RetryPolicy) -> Self {
        self.cleanup = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Create the root and staging directories if missing.
    pub fn ensure_dirs(&self) -> CryptoResult<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.staging)?;
        Ok(())
    }

    /// Path of `file` relative to the root, in the form that gets encrypted.
    pub fn relative_path(&self, file: &Path) -> CryptoResult<PathBuf> {
        let rel = file
            .strip_prefix(&self.root)
            .map_err(|_| CryptoError::PathTraversal(file.display().to_string()))?;
        if rel.as_os_str().is_empty()
            || rel.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CryptoError::PathTraversal(file.display().to_string()));
        }
        Ok(rel.to_path_buf())
    }

    pub(crate) fn staged_path(&self, enc_name: &str) -> PathBuf {
        self.staging.join(enc_name)
    }

    /// Remove every staged ciphertext. Returns the number of files removed.
    ///
    /// Files that are briefly locked (permission denied) are retried under the
    /// workspace's [`RetryPolicy`]; any other error aborts the sweep.
    pub fn clear_staging(&self) -> CryptoResult<usize> {
        let entries = match std::fs::read_dir(&self.staging) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                debug!(path = %entry.path().display(), "staging cleanup: skipping directory");
                continue;
            }
            remove_with_retry(&entry.path(), &self.cleanup)?;
            removed += 1;
        }
        debug!(removed, staging = %self.staging.display(), "staging cleared");
        Ok(removed)
    }
}

fn remove_with_retry(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && attempt < attempts => {
                warn!(
                    path = %path.display(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "staged file locked, retrying"
                );
                std::thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace(tmp: &TempDir) -> SyncWorkspace {
        let ws = SyncWorkspace::new(tmp.path().join("files"), tmp.path().join("tmp"));
        ws.ensure_dirs().unwrap();
        ws
    }

    #[test]
    fn test_relative_path_inside_root() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp);
        let file = ws.root().join("docs/report.pdf");
        assert_eq!(ws.relative_path(&file).unwrap(), PathBuf::from("docs/report.pdf"));
    }

    #[test]
    fn test_relative_path_outside_root_rejected() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp);
        assert!(matches!(
            ws.relative_path(Path::new("/etc/passwd")),
            Err(CryptoError::PathTraversal(_))
        ));
        let sneaky = ws.root().join("../tmp/x");
        assert!(ws.relative_path(&sneaky).is_err());
    }

    #[test]
    fn test_clear_staging_removes_files_only() {
        let tmp = TempDir::new().unwrap();
        let ws = workspace(&tmp).with_cleanup_policy(RetryPolicy {
            attempts: 1,
            initial_backoff: Duration::from_millis(1),
        });
        std::fs::write(ws.staged_path("a.cio"), b"a").unwrap();
        std::fs::write(ws.staged_path("b.cio"), b"b").unwrap();
        std::fs::create_dir(ws.staging().join("nested")).unwrap();

        assert_eq!(ws.clear_staging().unwrap(), 2);
        assert!(!ws.staged_path("a.cio").exists());
        assert!(ws.staging().join("nested").exists());
    }

    #[test]
    fn test_clear_missing_staging_is_noop() {
        let tmp = TempDir::new().unwrap();
        let ws = SyncWorkspace::new(tmp.path().join("files"), tmp.path().join("absent"));
        assert_eq!(ws.clear_staging().unwrap(), 0);
    }
}
