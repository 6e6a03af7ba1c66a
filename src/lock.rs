/// Lease-based locking for refresh coordination
///
/// A lease is a key in a shared store holding a random value. Acquiring sets the
/// key only if it is absent, with an expiry. Releasing deletes the key only if it
/// still holds the holder's value, so a holder whose lease expired and was taken
/// over by someone else never deletes the new holder's lease.
use crate::error::LockError;
use base64::{engine::general_purpose::STANDARD, Engine};
use fs2::FileExt;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(35);
pub const DEFAULT_RETRY_COUNT: u32 = 10;
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(500);

const KEY_PREFIX: &str = "refresh-lock-";

/// Proof of lease ownership, fresh for every acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// 20 random bytes, base64 encoded
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(STANDARD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shared key-value store with the two atomic primitives leases need
pub trait LockStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`, only if the key is absent
    ///
    /// Returns whether the key was set. An expired entry counts as absent.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if it currently holds `value`
    ///
    /// Returns whether the key was deleted. Must be a single atomic step.
    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, LockError>;
}

/// Mutual exclusion around a refresh cycle
pub trait Lock: Send + Sync {
    /// Run `body` while holding the lock for `key`
    fn with_lock<T, F>(&self, key: &str, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> T;
}

/// Lock for single-process use: runs the body immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLock;

impl Lock for NoOpLock {
    fn with_lock<T, F>(&self, _key: &str, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> T,
    {
        Ok(body())
    }
}

/// Distributed lock over a `LockStore`
///
/// Busy leases are retried every `wait_interval`, for `retry_count` attempts in
/// total, before giving up with `LockError::Contention`.
pub struct LeaseLock<S> {
    store: Arc<S>,
    ttl: Duration,
    retry_count: u32,
    wait_interval: Duration,
}

impl<S> Clone for LeaseLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ttl: self.ttl,
            retry_count: self.retry_count,
            wait_interval: self.wait_interval,
        }
    }
}

impl<S: LockStore> LeaseLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
            retry_count: DEFAULT_RETRY_COUNT,
            wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }

    /// Lease lifetime, the safety net for crashed holders
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Total acquisition attempts, at least one
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.max(1);
        self
    }

    pub fn with_wait_interval(mut self, wait_interval: Duration) -> Self {
        self.wait_interval = wait_interval;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn wait_interval(&self) -> Duration {
        self.wait_interval
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Store key used for the lease on `key`
    pub fn lease_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// Try to take the lease once, without waiting
    ///
    /// Returns `None` if another holder has it.
    pub fn try_acquire(&self, key: &str) -> Result<Option<LeaseGuard<'_, S>>, LockError> {
        let lease_key = Self::lease_key(key);
        let token = LeaseToken::generate();

        if !self.store.set_if_absent(&lease_key, token.as_str(), self.ttl)? {
            return Ok(None);
        }

        debug!(key = %lease_key, ttl_secs = self.ttl.as_secs(), "lease acquired");
        Ok(Some(LeaseGuard {
            store: self.store.as_ref(),
            key: lease_key,
            token,
            released: false,
        }))
    }

    /// Take the lease, waiting between attempts while it is busy
    pub fn acquire(&self, key: &str) -> Result<LeaseGuard<'_, S>, LockError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire(key)? {
                return Ok(guard);
            }

            if attempts >= self.retry_count {
                warn!(key = %Self::lease_key(key), attempts, "lease still busy, giving up");
                return Err(LockError::Contention {
                    key: Self::lease_key(key),
                    attempts,
                });
            }

            debug!(key = %Self::lease_key(key), attempts, "lease busy, waiting");
            thread::sleep(self.wait_interval);
        }
    }
}

impl<S: LockStore> Lock for LeaseLock<S> {
    fn with_lock<T, F>(&self, key: &str, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> T,
    {
        let _guard = self.acquire(key)?;
        Ok(body())
    }
}

/// RAII guard for a held lease
///
/// The lease is released when this guard is dropped, also while unwinding.
pub struct LeaseGuard<'a, S: LockStore> {
    store: &'a S,
    key: String,
    token: LeaseToken,
    released: bool,
}

impl<S: LockStore> LeaseGuard<'_, S> {
    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Release now, reporting whether the lease was still ours
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.store.compare_and_delete(&self.key, self.token.as_str())
    }
}

impl<S: LockStore> Drop for LeaseGuard<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match self.store.compare_and_delete(&self.key, self.token.as_str()) {
            Ok(true) => debug!(key = %self.key, "lease released"),
            Ok(false) => warn!(key = %self.key, "lease expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to release lease"),
        }
    }
}

/// In-process lease store
///
/// Shares leases between threads through cloned handles. Useful for tests and
/// for hosts running several proxies over one record inside a single process.
#[derive(Debug, Default, Clone)]
pub struct MemoryLockStore {
    leases: Arc<Mutex<HashMap<String, MemoryLease>>>,
}

#[derive(Debug)]
struct MemoryLease {
    value: String,
    deadline: Instant,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the live lease under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(key)
            .filter(|lease| lease.deadline > Instant::now())
            .map(|lease| lease.value.clone())
    }

    /// Make the lease under `key` expire immediately
    pub fn expire(&self, key: &str) {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get_mut(key) {
            lease.deadline = Instant::now();
        }
    }
}

impl LockStore for MemoryLockStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut leases = self.leases.lock();
        let now = Instant::now();

        if matches!(leases.get(key), Some(lease) if lease.deadline > now) {
            return Ok(false);
        }

        leases.insert(
            key.to_string(),
            MemoryLease {
                value: value.to_string(),
                deadline: now + ttl,
            },
        );
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, LockError> {
        let mut leases = self.leases.lock();
        let now = Instant::now();

        match leases.get(key) {
            Some(lease) if lease.value == value && lease.deadline > now => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Lease store shared by processes on one host
///
/// Each key has a `.lease` file holding the value and its deadline. Both
/// primitives run under an exclusive file lock on the key's `.guard` file,
/// which makes them atomic across processes.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    lock_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileLease {
    value: String,
    expires_at_ms: u64,
}

impl FileLockStore {
    /// Create a store in a custom lock directory
    pub fn new(lock_dir: PathBuf) -> Result<Self, LockError> {
        fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    /// Create a store for a specific application in the default lock directory
    pub fn for_app(app_name: &str) -> Result<Self, LockError> {
        let mut lock_dir = crate::config::LockSettings::default().lock_dir();
        lock_dir.push(app_name);
        Self::new(lock_dir)
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        // Sanitize the key for use in filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        (
            self.lock_dir.join(format!("{}.guard", safe_key)),
            self.lock_dir.join(format!("{}.lease", safe_key)),
        )
    }

    /// Run `f` on the lease file while holding the key's guard
    ///
    /// Guard files are never removed: another process may be blocked on an
    /// open handle to it.
    fn with_guard<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Path) -> Result<T, LockError>,
    ) -> Result<T, LockError> {
        let (guard_path, lease_path) = self.paths(key);

        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)?;
        FileExt::lock_exclusive(&guard)?;

        // The guard is unlocked when its handle is dropped
        f(&lease_path)
    }

    /// Read the lease under the guard
    ///
    /// A lease file that cannot be parsed holds no valid owner, so it counts
    /// as absent and the next acquisition overwrites it.
    fn read_lease(path: &Path) -> Result<Option<FileLease>, LockError> {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(lease) => Ok(Some(lease)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable lease file");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_lease(path: &Path, lease: &FileLease) -> Result<(), LockError> {
        let content = serde_json::to_string(lease)
            .map_err(|e| LockError::StoreError(format!("Failed to serialize lease: {}", e)))?;

        // Write then rename so a crash never leaves a partial lease behind
        let tmp_path = path.with_extension(format!("lease.tmp.{}", std::process::id()));
        let mut file = File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl LockStore for FileLockStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        self.with_guard(key, |lease_path| {
            let now = now_millis();
            if matches!(Self::read_lease(lease_path)?, Some(lease) if lease.expires_at_ms > now) {
                return Ok(false);
            }

            let lease = FileLease {
                value: value.to_string(),
                expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            };
            Self::write_lease(lease_path, &lease)?;
            Ok(true)
        })
    }

    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, LockError> {
        self.with_guard(key, |lease_path| match Self::read_lease(lease_path)? {
            Some(lease) if lease.value == value && lease.expires_at_ms > now_millis() => {
                fs::remove_file(lease_path)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }
}
