/// Refresh policy and loadable settings
use crate::error::{Failure, FailureResponse, SettingsError};
use crate::lock::{LeaseLock, LockStore, DEFAULT_RETRY_COUNT, DEFAULT_TTL, DEFAULT_WAIT_INTERVAL};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Statuses that never trigger a refresh unless reconfigured
pub const DEFAULT_SKIP_STATUSES: [u16; 7] = [402, 404, 414, 422, 429, 500, 503];

type SkipPredicate = Arc<dyn Fn(&FailureResponse) -> bool + Send + Sync>;

/// How a failed operation is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Propagate the failure as-is, no refresh
    NonRefreshable,
    /// Refresh once and retry the operation once
    Refreshable,
}

/// Refresh policy shared by proxies
///
/// Build it once, wrap it in an `Arc` and hand it to every proxy.
///
/// # Example
///
/// ```
/// use tokenwrap::config::Configuration;
///
/// let config = Configuration::default().configure(|c| {
///     c.skip_statuses.insert(520);
///     c.skip_refresh(|response| {
///         response.body["message"] == "Duplicate Idempotency Key header detected"
///     });
/// });
/// assert!(config.skip_statuses.contains(&520));
/// ```
#[derive(Clone)]
pub struct Configuration {
    pub skip_statuses: BTreeSet<u16>,
    skip_refresh: SkipPredicate,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            skip_statuses: DEFAULT_SKIP_STATUSES.into_iter().collect(),
            skip_refresh: Arc::new(|_| false),
        }
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("skip_statuses", &self.skip_statuses)
            .finish_non_exhaustive()
    }
}

impl Configuration {
    /// Apply a mutator and return the result
    pub fn configure(mut self, mutator: impl FnOnce(&mut Self)) -> Self {
        mutator(&mut self);
        self
    }

    /// Install an extra skip condition, checked after the status list
    pub fn skip_refresh<F>(&mut self, predicate: F)
    where
        F: Fn(&FailureResponse) -> bool + Send + Sync + 'static,
    {
        self.skip_refresh = Arc::new(predicate);
    }

    /// Restore the default policy
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_non_refreshable(&self, response: &FailureResponse) -> bool {
        self.skip_statuses.contains(&response.status) || (self.skip_refresh)(response)
    }

    /// Classify a failure from a forwarded operation
    ///
    /// Failures without a response never trigger a refresh.
    pub fn classify<E: Failure + ?Sized>(&self, failure: &E) -> Classification {
        match failure.response() {
            Some(response) if !self.is_non_refreshable(response) => Classification::Refreshable,
            _ => Classification::NonRefreshable,
        }
    }
}

/// Settings document, usually loaded from JSON at startup
///
/// Every field is optional:
///
/// ```json
/// {
///   "skip_statuses": [402, 404, 429],
///   "lock": { "ttl_secs": 35, "retry_count": 10, "wait_interval_ms": 500 }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub skip_statuses: Vec<u16>,
    pub lock: LockSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            skip_statuses: DEFAULT_SKIP_STATUSES.to_vec(),
            lock: LockSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Runtime policy for these settings
    ///
    /// The skip predicate cannot be expressed in a document; install it
    /// afterwards with `Configuration::configure`.
    pub fn configuration(&self) -> Configuration {
        Configuration::default().configure(|c| {
            c.skip_statuses = self.skip_statuses.iter().copied().collect();
        })
    }

    /// Lease lock over `store` using these lock settings
    pub fn lease_lock<S: LockStore>(&self, store: Arc<S>) -> LeaseLock<S> {
        LeaseLock::new(store)
            .with_ttl(self.lock.ttl())
            .with_retry_count(self.lock.retry_count)
            .with_wait_interval(self.lock.wait_interval())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub ttl_secs: u64,
    pub retry_count: u32,
    pub wait_interval_ms: u64,
    /// Directory for file-backed leases
    pub dir: Option<PathBuf>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL.as_secs(),
            retry_count: DEFAULT_RETRY_COUNT,
            wait_interval_ms: DEFAULT_WAIT_INTERVAL.as_millis() as u64,
            dir: None,
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    /// Directory for file-backed leases
    ///
    /// Uses the configured directory, then the per-user runtime directory,
    /// then a user-specific subdirectory of the temp directory.
    pub fn lock_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }

        if let Some(mut path) = dirs::runtime_dir() {
            path.push("tokenwrap-locks");
            return path;
        }

        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        std::env::temp_dir().join(format!("tokenwrap-locks-{}", user))
    }
}
