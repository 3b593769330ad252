//! Password-based identity: first-password selection, rotation, full-history
//! key retrieval, and Shamir backup/recovery of the current key
//!
//! Every handle on the same state directory shares one process-wide lock.
//! Mutations of the identity logs take it exclusively, after the slow KDF
//! work is done: under the lock the log is re-read and the outgoing key
//! re-verified against the newest hash, so two racing rotations cannot both
//! append against the same generation. Reads take it shared, so they never
//! observe a rotation with only one of its two lines written.
//!
//! Cross-process writers are not coordinated: at most one process may hold
//! an identity open for writes.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::entity::EntityCrypto;
use crate::error::{CryptoError, CryptoResult};
use crate::identity::{IdentityLog, KeyRecord, WrappedKey};
use crate::kdf::{derive_key_argon2, identity_salt, key_hash, verify_key_hash, KdfParams};
use crate::keys::{KeyFingerprint, Nonce, SymmetricKey};
use crate::shamir::{recover_secret, split_secret, validate_parameters, Share};

/// Minimum password length, in characters. Configured policies may raise it
/// but never lower it.
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 12;

type IdentityLock = Arc<RwLock<()>>;

/// Live identity locks, keyed by resolved state directory. Entries die with
/// the last handle that uses them.
static IDENTITY_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Weak<RwLock<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn identity_lock(state_dir: &Path) -> CryptoResult<IdentityLock> {
    let key = resolve_dir(state_dir)?;
    let mut locks = IDENTITY_LOCKS
        .lock()
        .map_err(|_| poisoned("identity lock registry"))?;
    if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
        return Ok(lock);
    }
    locks.retain(|_, weak| weak.strong_count() > 0);
    let lock = Arc::new(RwLock::new(()));
    locks.insert(key, Arc::downgrade(&lock));
    Ok(lock)
}

/// Absolute, symlink-free form of `dir`, even when its tail does not exist yet:
/// the deepest existing ancestor is canonicalized and the rest re-joined.
fn resolve_dir(dir: &Path) -> CryptoResult<PathBuf> {
    let absolute = std::path::absolute(dir)?;
    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    let mut skip = 0usize;
    loop {
        match existing.canonicalize() {
            Ok(resolved) if skip == 0 => {
                return Ok(tail.iter().rev().fold(resolved, |acc, seg| acc.join(seg)));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let Some(parent) = existing.parent() else {
            return Ok(absolute);
        };
        match existing.components().next_back() {
            // `absolute` keeps `..`; below a missing directory it is resolved lexically.
            Some(Component::ParentDir) => skip += 1,
            Some(Component::Normal(_)) if skip > 0 => skip -= 1,
            Some(Component::Normal(seg)) => tail.push(seg.to_os_string()),
            _ => {}
        }
        existing = parent;
    }
}

fn poisoned(what: &str) -> CryptoError {
    CryptoError::Io(io::Error::other(format!("{what} poisoned")))
}

pub struct KeyDerivation {
    username: String,
    salt: [u8; 32],
    state_dir: PathBuf,
    log: IdentityLog,
    params: KdfParams,
    min_password_len: usize,
    lock: IdentityLock,
}

impl KeyDerivation {
    /// Open (or prepare to create) the identity of `username` whose logs live
    /// in `state_dir`. Nothing is written until a password is selected.
    ///
    /// Handles opened on the same directory, under any spelling of its path,
    /// serialize their log access through one shared lock.
    pub fn new(username: &str, state_dir: impl Into<PathBuf>) -> CryptoResult<Self> {
        let salt = identity_salt(username)?;
        let state_dir = state_dir.into();
        let lock = identity_lock(&state_dir)?;
        Ok(Self {
            username: username.to_string(),
            salt,
            log: IdentityLog::new(&state_dir),
            state_dir,
            params: KdfParams::default(),
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            lock,
        })
    }

    pub fn with_params(mut self, params: KdfParams) -> Self {
        self.params = params;
        self
    }

    /// Raise the password length policy. Values below
    /// [`DEFAULT_MIN_PASSWORD_LEN`] are clamped up to it.
    pub fn with_min_password_len(mut self, min_len: usize) -> Self {
        self.min_password_len = min_len.max(DEFAULT_MIN_PASSWORD_LEN);
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn log(&self) -> &IdentityLog {
        &self.log
    }

    /// Number of key generations recorded so far (0 = no identity yet).
    pub fn generations(&self) -> CryptoResult<usize> {
        Ok(self.load_records()?.len())
    }

    /// Run the KDF over `password` and the identity salt.
    ///
    /// With `verify`, the key must match the newest stored hash
    /// ([`CryptoError::BadKey`] otherwise). Verifying before any password has
    /// been selected is [`CryptoError::IllegalMethodUsage`].
    pub fn derive_key(&self, password: &SecretString, verify: bool) -> CryptoResult<SymmetricKey> {
        if verify {
            // Fail on an empty history before paying for the KDF.
            self.require_history(&self.load_records()?)?;
        }
        let key = derive_key_argon2(password, &self.salt, &self.params)?;
        if verify {
            self.verify_latest(&key, &self.load_records()?)?;
        }
        Ok(key)
    }

    /// Create the identity from its first password.
    pub fn select_first_pw(&self, password: &SecretString) -> CryptoResult<EntityCrypto> {
        self.require_empty(&self.load_records()?)?;
        self.check_password_policy(password)?;

        let key = derive_key_argon2(password, &self.salt, &self.params)?;

        let _guard = self.write_guard()?;
        self.require_empty(&self.log.load()?)?;
        self.log.append_first(&key_hash(&self.salt, &key))?;

        let entity = EntityCrypto::new(key);
        info!(
            username = %self.username,
            fingerprint = %entity.fingerprint().short_hex(),
            "identity created"
        );
        Ok(entity)
    }

    /// Rotate from `old_password` to `new_password`.
    ///
    /// The old key is wrapped under the new one and appended to the chain, so
    /// content encrypted under any earlier generation stays recoverable.
    pub fn replace_pw(
        &self,
        old_password: &SecretString,
        new_password: &SecretString,
    ) -> CryptoResult<EntityCrypto> {
        self.require_history(&self.load_records()?)?;
        self.check_password_policy(new_password)?;

        let old_key = self.derive_key(old_password, true)?;
        let new_key = derive_key_argon2(new_password, &self.salt, &self.params)?;
        self.rotate(&old_key, new_key)
    }

    /// Rotate starting from an already-held key (e.g. one recovered from
    /// shares). `key` must still verify against the newest stored hash.
    pub fn replace_pw_from_key(
        &self,
        key: &SymmetricKey,
        new_password: &SecretString,
    ) -> CryptoResult<EntityCrypto> {
        let records = self.load_records()?;
        self.require_history(&records)?;
        self.check_password_policy(new_password)?;
        self.verify_latest(key, &records)?;

        let new_key = derive_key_argon2(new_password, &self.salt, &self.params)?;
        self.rotate(key, new_key)
    }

    /// Every key generation, newest first: `[current, previous, .., original]`.
    ///
    /// Each historical key exists only in the returned (zeroize-on-drop)
    /// values; nothing is written back.
    pub fn retrieve_keys(&self, current_key: &SymmetricKey) -> CryptoResult<Vec<SymmetricKey>> {
        let records = self.load_records()?;
        self.verify_latest(current_key, &records)?;

        let mut keys = Vec::with_capacity(records.len());
        keys.push(current_key.clone());

        for (generation, pair) in records.windows(2).enumerate().rev() {
            let (older, newer) = (&pair[0], &pair[1]);
            let wrapped = newer.wrapped_predecessor.as_ref().ok_or_else(|| {
                CryptoError::MalformedLog {
                    path: self.log.wrapped_log_path().to_path_buf(),
                    line: generation + 1,
                    reason: "missing wrapped predecessor".into(),
                }
            })?;

            let unwrapper = EntityCrypto::new(keys[keys.len() - 1].clone());
            let previous = unwrapper.decrypt_key(&wrapped.ciphertext, &wrapped.nonce)?;
            if !verify_key_hash(&self.salt, &previous, &older.hash) {
                return Err(CryptoError::BadKey);
            }
            keys.push(previous);
        }

        debug!(generations = keys.len(), "key history retrieved");
        Ok(keys)
    }

    /// Split the current key into `shares` shares, any `threshold + 1` of
    /// which recover it.
    pub fn backup_key(
        &self,
        password: &SecretString,
        threshold: u8,
        shares: u8,
    ) -> CryptoResult<Vec<Share>> {
        validate_parameters(threshold, shares)?;
        let key = self.derive_key(password, true)?;
        let out = split_secret(key.as_bytes(), threshold, shares)?;
        info!(
            username = %self.username,
            fingerprint = %KeyFingerprint::of(&key).short_hex(),
            threshold,
            shares,
            "key backed up into shares"
        );
        Ok(out)
    }

    /// Recover the current key from shares and rotate to `new_password`.
    pub fn recover_from_shares(
        &self,
        shares: &[Share],
        new_password: &SecretString,
    ) -> CryptoResult<EntityCrypto> {
        self.check_password_policy(new_password)?;
        let secret = recover_secret(shares)?;
        let key = SymmetricKey::from_bytes(*secret);
        let entity = self.replace_pw_from_key(&key, new_password)?;
        info!(
            username = %self.username,
            shares = shares.len(),
            "identity recovered from shares"
        );
        Ok(entity)
    }

    fn rotate(&self, old_key: &SymmetricKey, new_key: SymmetricKey) -> CryptoResult<EntityCrypto> {
        let _guard = self.write_guard()?;
        let records = self.log.load()?;
        self.verify_latest(old_key, &records)?;

        let new_hash = key_hash(&self.salt, &new_key);
        let entity = EntityCrypto::new(new_key);
        let nonce = Nonce::random();
        let wrapped = WrappedKey {
            ciphertext: entity.encrypt_key(old_key, &nonce)?,
            nonce,
        };
        self.log.append_rotation(&wrapped, &new_hash)?;

        info!(
            username = %self.username,
            generation = records.len() + 1,
            fingerprint = %entity.fingerprint().short_hex(),
            "key rotated"
        );
        Ok(entity)
    }

    fn verify_latest(&self, key: &SymmetricKey, records: &[KeyRecord]) -> CryptoResult<()> {
        let latest = self.require_history(records)?;
        if verify_key_hash(&self.salt, key, &latest.hash) {
            Ok(())
        } else {
            Err(CryptoError::BadKey)
        }
    }

    fn require_history<'a>(&self, records: &'a [KeyRecord]) -> CryptoResult<&'a KeyRecord> {
        records.last().ok_or_else(|| {
            CryptoError::IllegalMethodUsage(format!(
                "no password has been selected for {:?} yet",
                self.username
            ))
        })
    }

    fn require_empty(&self, records: &[KeyRecord]) -> CryptoResult<()> {
        if records.is_empty() {
            Ok(())
        } else {
            Err(CryptoError::IllegalMethodUsage(format!(
                "a first password was already selected for {:?}; use replace_pw",
                self.username
            )))
        }
    }

    fn check_password_policy(&self, password: &SecretString) -> CryptoResult<()> {
        if password.expose_secret().chars().count() < self.min_password_len {
            return Err(CryptoError::BadPasswordSelected {
                min_len: self.min_password_len,
            });
        }
        Ok(())
    }

    /// Snapshot of the chain, never torn by a concurrent rotation.
    fn load_records(&self) -> CryptoResult<Vec<KeyRecord>> {
        let _guard = self.read_guard()?;
        self.log.load()
    }

    fn read_guard(&self) -> CryptoResult<RwLockReadGuard<'_, ()>> {
        self.lock.read().map_err(|_| poisoned("identity lock"))
    }

    fn write_guard(&self) -> CryptoResult<RwLockWriteGuard<'_, ()>> {
        self.lock.write().map_err(|_| poisoned("identity lock"))
    }
}

impl std::fmt::Debug for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDerivation")
            .field("username", &self.username)
            .field("state_dir", &self.state_dir)
            .field("params", &self.params)
            .field("min_password_len", &self.min_password_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(tmp: &TempDir) -> KeyDerivation {
        KeyDerivation::new("alice", tmp.path().join("state"))
            .unwrap()
            .with_params(KdfParams::insecure_fast())
    }

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn test_select_then_verify() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        let entity = kd.select_first_pw(&pw("correct horse battery")).unwrap();

        let key = kd.derive_key(&pw("correct horse battery"), true).unwrap();
        assert_eq!(EntityCrypto::new(key).fingerprint(), entity.fingerprint());
        assert!(matches!(
            kd.derive_key(&pw("wrong horse battery"), true),
            Err(CryptoError::BadKey)
        ));
        assert_eq!(kd.generations().unwrap(), 1);
    }

    #[test]
    fn test_unverified_derive_needs_no_history() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        assert!(kd.derive_key(&pw("anything at all"), false).is_ok());
    }

    #[test]
    fn test_verified_derive_without_history_is_illegal() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        assert!(matches!(
            kd.derive_key(&pw("anything at all"), true),
            Err(CryptoError::IllegalMethodUsage(_))
        ));
    }

    #[test]
    fn test_short_password_rejected() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        assert!(matches!(
            kd.select_first_pw(&pw("short")),
            Err(CryptoError::BadPasswordSelected { min_len: 12 })
        ));
        assert_eq!(kd.generations().unwrap(), 0, "nothing written on rejection");
    }

    #[test]
    fn test_select_first_pw_twice_is_illegal() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        assert!(matches!(
            kd.select_first_pw(&pw("first password!")),
            Err(CryptoError::IllegalMethodUsage(_))
        ));
    }

    #[test]
    fn test_short_username_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            KeyDerivation::new("al", tmp.path()),
            Err(CryptoError::BadUsernameSelected { .. })
        ));
    }

    #[test]
    fn test_replace_before_select_is_illegal() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        assert!(matches!(
            kd.replace_pw(&pw("old password 1"), &pw("new password 1")),
            Err(CryptoError::IllegalMethodUsage(_))
        ));
    }

    #[test]
    fn test_replace_with_wrong_old_password() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        assert!(matches!(
            kd.replace_pw(&pw("not the password"), &pw("second password")),
            Err(CryptoError::BadKey)
        ));
        assert_eq!(kd.generations().unwrap(), 1);
    }

    #[test]
    fn test_replace_rejects_short_new_password() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        assert!(matches!(
            kd.replace_pw(&pw("first password!"), &pw("tiny")),
            Err(CryptoError::BadPasswordSelected { .. })
        ));
    }

    #[test]
    fn test_two_generation_chain() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        let k1 = kd.derive_key(&pw("first password!"), false).unwrap();

        kd.replace_pw(&pw("first password!"), &pw("second password")).unwrap();
        let k2 = kd.derive_key(&pw("second password"), true).unwrap();

        let keys = kd.retrieve_keys(&k2).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ct_eq(&k2));
        assert!(keys[1].ct_eq(&k1));

        // The old password no longer verifies.
        assert!(matches!(
            kd.derive_key(&pw("first password!"), true),
            Err(CryptoError::BadKey)
        ));
    }

    #[test]
    fn test_retrieve_keys_rejects_stale_key() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        let k1 = kd.derive_key(&pw("first password!"), false).unwrap();
        kd.replace_pw(&pw("first password!"), &pw("second password")).unwrap();

        assert!(matches!(kd.retrieve_keys(&k1), Err(CryptoError::BadKey)));
    }

    #[test]
    fn test_replace_from_key_requires_current_key() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();

        let stranger = SymmetricKey::generate();
        assert!(matches!(
            kd.replace_pw_from_key(&stranger, &pw("second password")),
            Err(CryptoError::BadKey)
        ));
    }

    #[test]
    fn test_backup_validates_parameters_first() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        assert!(matches!(
            kd.backup_key(&pw("first password!"), 3, 3),
            Err(CryptoError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn test_backup_and_recover() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        let original = kd.select_first_pw(&pw("first password!")).unwrap();
        let k1 = kd.derive_key(&pw("first password!"), true).unwrap();

        let shares = kd.backup_key(&pw("first password!"), 2, 5).unwrap();
        let subset = [shares[4].clone(), shares[0].clone(), shares[2].clone()];
        let recovered = kd.recover_from_shares(&subset, &pw("brand new password")).unwrap();

        assert_ne!(recovered.fingerprint(), original.fingerprint());
        let k2 = kd.derive_key(&pw("brand new password"), true).unwrap();
        let keys = kd.retrieve_keys(&k2).unwrap();
        assert!(keys[1].ct_eq(&k1));
    }

    #[test]
    fn test_recover_from_too_few_shares() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();
        let shares = kd.backup_key(&pw("first password!"), 2, 5).unwrap();

        assert!(matches!(
            kd.recover_from_shares(&shares[..2], &pw("brand new password")),
            Err(CryptoError::InsufficientShares { have: 2, need: 3 })
        ));
        assert_eq!(kd.generations().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_rotations_do_not_fork_the_chain() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        kd.select_first_pw(&pw("first password!")).unwrap();

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = ["second password a", "second password b"]
                .into_iter()
                .map(|new| {
                    let kd = &kd;
                    s.spawn(move || kd.replace_pw(&pw("first password!"), &pw(new)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1, "exactly one rotation wins");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(CryptoError::BadKey))));
        assert_eq!(kd.generations().unwrap(), 2);
    }

    #[test]
    fn test_handles_on_one_directory_share_a_lock() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("state");
        let a = KeyDerivation::new("alice", &dir).unwrap();
        let b = KeyDerivation::new("alice", dir.join("..").join("state")).unwrap();
        let c = KeyDerivation::new("alice", tmp.path().join("other")).unwrap();

        assert!(Arc::ptr_eq(&a.lock, &b.lock));
        assert!(!Arc::ptr_eq(&a.lock, &c.lock));

        std::fs::create_dir_all(&dir).unwrap();
        let d = KeyDerivation::new("alice", &dir).unwrap();
        assert!(Arc::ptr_eq(&a.lock, &d.lock), "creating the directory keeps the key");
    }

    #[test]
    fn test_racing_handles_keep_the_chain_decryptable() {
        for _ in 0..8 {
            let tmp = TempDir::new().unwrap();
            let first = identity(&tmp);
            first.select_first_pw(&pw("first password!")).unwrap();
            let second = identity(&tmp);
            let barrier = std::sync::Barrier::new(2);

            let results: Vec<_> = std::thread::scope(|s| {
                let handles: Vec<_> = [(&first, "second password a"), (&second, "second password b")]
                    .into_iter()
                    .map(|(kd, new)| {
                        let barrier = &barrier;
                        s.spawn(move || {
                            barrier.wait();
                            kd.replace_pw(&pw("first password!"), &pw(new))
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

            let winner = ["second password a", "second password b"]
                .into_iter()
                .find_map(|p| first.derive_key(&pw(p), true).ok())
                .expect("one new password verifies");
            let keys = second.retrieve_keys(&winner).unwrap();
            assert_eq!(keys.len(), 2);
        }
    }

    #[test]
    fn test_reads_during_rotation_see_whole_records() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp);
        let reader = identity(&tmp);
        kd.select_first_pw(&pw("password number 0")).unwrap();
        let done = AtomicBool::new(false);

        let failures = std::thread::scope(|s| {
            let watcher = s.spawn(|| {
                let mut failures = 0usize;
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    match reader.generations() {
                        Ok(n) => {
                            assert!(n >= last, "generation count went backwards");
                            last = n;
                        }
                        Err(_) => failures += 1,
                    }
                }
                failures
            });
            for i in 0..30 {
                kd.replace_pw(
                    &pw(&format!("password number {i}")),
                    &pw(&format!("password number {}", i + 1)),
                )
                .unwrap();
            }
            done.store(true, Ordering::Release);
            watcher.join().unwrap()
        });

        assert_eq!(failures, 0);
        assert_eq!(kd.generations().unwrap(), 31);
    }

    #[test]
    fn test_password_policy_cannot_be_lowered() {
        let tmp = TempDir::new().unwrap();
        let kd = identity(&tmp).with_min_password_len(0);
        assert!(matches!(
            kd.select_first_pw(&pw("short")),
            Err(CryptoError::BadPasswordSelected { min_len: 12 })
        ));

        let strict = identity(&tmp).with_min_password_len(20);
        assert!(matches!(
            strict.select_first_pw(&pw("fifteen chars!!")),
            Err(CryptoError::BadPasswordSelected { min_len: 20 })
        ));
    }
}
