/// Credential persistence with pluggable storage
use crate::credential::Credential;
use crate::error::Failure;
use crate::record::TokenRecord;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage interface for credentials
pub trait CredentialStore: Send + Sync {
    /// Save a credential
    fn save_credential(&self, key: &str, credential: Credential) -> Result<(), String>;

    /// Get a credential by key
    fn get_credential(&self, key: &str) -> Result<Option<Credential>, String>;

    /// Delete a credential
    fn delete_credential(&self, key: &str) -> Result<(), String>;
}

/// In-memory storage implementation
///
/// Thread-safe in-memory storage for credentials. Clones share the same map,
/// which lets several records in one process act as holders of one row.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    credentials: Arc<RwLock<HashMap<String, Credential>>>,
}

impl MemoryStore {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn save_credential(&self, key: &str, credential: Credential) -> Result<(), String> {
        let mut credentials = self.credentials.write();
        credentials.insert(key.to_string(), credential);
        Ok(())
    }

    fn get_credential(&self, key: &str) -> Result<Option<Credential>, String> {
        let credentials = self.credentials.read();
        Ok(credentials.get(key).cloned())
    }

    fn delete_credential(&self, key: &str) -> Result<(), String> {
        let mut credentials = self.credentials.write();
        credentials.remove(key);
        Ok(())
    }
}

/// File-based storage implementation using XDG conventions
///
/// Credentials are grouped by domain: a key `"github.com:user1"` lives in
/// `credentials_github.com.json`, keys without a domain in
/// `credentials_default.json`. Every read-modify-write holds an exclusive lock
/// on the domain file's companion `.lock` file, so processes sharing the
/// directory do not lose each other's writes.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a new file storage instance with a custom application name
    ///
    /// Checks `$XDG_DATA_HOME` first, then the platform data directory.
    /// Stores credentials in `<data_dir>/<app_name>/`.
    pub fn new(app_name: &str) -> Result<Self, String> {
        let base_dir = Self::data_dir(std::env::var_os("XDG_DATA_HOME"))
            .ok_or_else(|| "Could not determine data directory".to_string())?;

        Self::with_path(base_dir.join(app_name))
    }

    /// Base data directory: `xdg_data_home` when set and non-empty, else the platform's
    fn data_dir(xdg_data_home: Option<std::ffi::OsString>) -> Option<PathBuf> {
        match xdg_data_home {
            Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => dirs::data_dir(),
        }
    }

    /// Create a file storage instance with a custom path
    pub fn with_path(path: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(&path)
            .map_err(|e| format!("Failed to create storage directory: {}", e))?;

        Ok(Self { base_path: path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn domain(key: &str) -> &str {
        match key.split_once(':') {
            Some((domain, _)) if !domain.is_empty() => domain,
            _ => "default",
        }
    }

    fn credentials_path(&self, domain: &str) -> PathBuf {
        // Sanitize domain for use in filename
        let safe_domain = domain.replace(['/', '\\', ':'], "_");
        self.base_path
            .join(format!("credentials_{}.json", safe_domain))
    }

    /// Run `f` while holding the domain's file lock
    fn locked<T>(
        &self,
        domain: &str,
        f: impl FnOnce(&Path) -> Result<T, String>,
    ) -> Result<T, String> {
        let path = self.credentials_path(domain);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.with_extension("lock"))
            .map_err(|e| format!("Failed to open lock file: {}", e))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| format!("Failed to lock credentials file: {}", e))?;

        // Unlocked when `lock_file` is dropped
        f(&path)
    }

    fn load(path: &Path) -> Result<HashMap<String, Credential>, String> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read credentials file: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse credentials: {}", e))
    }

    /// Write through a temp file and rename, owner-only on unix
    fn save(path: &Path, credentials: &HashMap<String, Credential>) -> Result<(), String> {
        let content = serde_json::to_string_pretty(credentials)
            .map_err(|e| format!("Failed to serialize credentials: {}", e))?;

        let tmp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));
        fs::write(&tmp_path, content)
            .map_err(|e| format!("Failed to write credentials file: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| format!("Failed to set credentials file permissions: {}", e))?;
        }

        fs::rename(&tmp_path, path)
            .map_err(|e| format!("Failed to replace credentials file: {}", e))?;

        debug!(path = %path.display(), "persisted credentials");
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn save_credential(&self, key: &str, credential: Credential) -> Result<(), String> {
        self.locked(Self::domain(key), |path| {
            let mut credentials = Self::load(path)?;
            credentials.insert(key.to_string(), credential);
            Self::save(path, &credentials)
        })
    }

    fn get_credential(&self, key: &str) -> Result<Option<Credential>, String> {
        self.locked(Self::domain(key), |path| {
            Ok(Self::load(path)?.get(key).cloned())
        })
    }

    fn delete_credential(&self, key: &str) -> Result<(), String> {
        self.locked(Self::domain(key), |path| {
            let mut credentials = Self::load(path)?;
            if credentials.remove(key).is_some() {
                Self::save(path, &credentials)?;
            }
            Ok(())
        })
    }
}

/// A `TokenRecord` backed by a `CredentialStore` entry
///
/// The key doubles as the record identity, so every `StoredRecord` over the
/// same key and store coordinates on the same lease.
#[derive(Debug, Clone)]
pub struct StoredRecord<S> {
    store: Arc<S>,
    key: String,
    credential: Credential,
}

impl<S: CredentialStore> StoredRecord<S> {
    /// Load the record currently stored under `key`
    pub fn load(store: Arc<S>, key: impl Into<String>) -> Result<Self, String> {
        let key = key.into();
        let credential = store
            .get_credential(&key)?
            .ok_or_else(|| format!("No credential stored under {}", key))?;

        Ok(Self {
            store,
            key,
            credential,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Write `credential` back to the store and adopt it as this record's state
    ///
    /// The record's fields only change once the store accepted the write.
    pub fn persist(&mut self, credential: &Credential) -> Result<(), String> {
        self.store.save_credential(&self.key, credential.clone())?;
        self.credential = credential.clone();
        debug!(key = %self.key, "record persisted");
        Ok(())
    }
}

impl<S: CredentialStore> TokenRecord for StoredRecord<S> {
    fn identity(&self) -> String {
        self.key.clone()
    }

    fn access_token(&self) -> String {
        self.credential.token.clone()
    }

    fn refresh_token(&self) -> String {
        self.credential.refresh_token.clone()
    }

    fn expires_at(&self) -> Option<u64> {
        self.credential.expires_at
    }

    fn reload(&mut self) -> Result<(), String> {
        self.credential = self
            .store
            .get_credential(&self.key)?
            .ok_or_else(|| format!("Credential {} disappeared from the store", self.key))?;
        Ok(())
    }

    fn credential(&self) -> Credential {
        self.credential.clone()
    }
}

/// Callback writing every new credential back to `store` under `key`
///
/// Convenience over the `StoredRecord::persist` contract for when the record is
/// owned by the proxy: it saves to the same store entry, and the record picks the
/// value up on its next reload. Write failures are logged; the lease TTL and the
/// next reload recover from them.
pub fn persist_to<S>(
    store: Arc<S>,
    key: impl Into<String>,
) -> impl FnMut(&Credential, Option<&dyn Failure>) + Send + 'static
where
    S: CredentialStore + 'static,
{
    let key = key.into();
    move |credential: &Credential, _: Option<&dyn Failure>| {
        if let Err(e) = store.save_credential(&key, credential.clone()) {
            warn!(key = %key, error = %e, "failed to persist refreshed credential");
        }
    }
}
