//! Tokenwrap - Transparent OAuth 2.0 token refresh for long-lived credentials
//!
//! This library keeps an access token usable across many callers without each
//! of them re-implementing refresh logic.
//!
//! # Features
//!
//! - `TokenProxy` forwards operations to a credential, refreshing it proactively
//!   when it is about to expire and reactively on refreshable failures
//! - Configurable failure classification (skip statuses and a skip predicate)
//! - Lease-based locking so only one holder refreshes a shared credential at a time
//! - Record reconciliation: holders that lost the race adopt the winner's credential
//! - In-memory and file-backed lease and credential stores
//!
//! # Example
//!
//! ```
//! use tokenwrap::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! store
//!     .save_credential("user:42", Credential::new("abc", "def", Some(0)))
//!     .unwrap();
//!
//! let refresher = |old: &Credential| -> tokenwrap::error::Result<Credential> {
//!     Ok(Credential::new("xyz", old.refresh_token.clone(), None))
//! };
//! let lock = LeaseLock::new(Arc::new(MemoryLockStore::new()));
//! let record = StoredRecord::load(store.clone(), "user:42").unwrap();
//!
//! let mut proxy = TokenProxy::from_record(
//!     record,
//!     refresher,
//!     lock,
//!     Arc::new(Configuration::default()),
//!     persist_to(store.clone(), "user:42"),
//! );
//!
//! // The stored credential has expired, so it is refreshed before the call
//! let token = proxy
//!     .forward(|credential| Ok::<_, ResponseError>(credential.token.clone()))
//!     .unwrap();
//! assert_eq!(token, "xyz");
//! assert_eq!(store.get_credential("user:42").unwrap().unwrap().token, "xyz");
//! ```

pub mod config;
pub mod credential;
pub mod error;
pub mod lock;
pub mod oauth;
pub mod proxy;
pub mod record;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Classification, Configuration, Settings};
    pub use crate::credential::Credential;
    pub use crate::error::{
        Failure, FailureResponse, LockError, ProxyError, RefreshError, RequestError,
        ResponseError,
    };
    pub use crate::lock::{FileLockStore, LeaseLock, Lock, LockStore, MemoryLockStore, NoOpLock};
    pub use crate::oauth::{HttpRefresher, OAuthConfig, Refresher};
    pub use crate::proxy::{DirectRefresh, TokenProxy};
    pub use crate::record::{RecordBackedProxy, TokenRecord};
    pub use crate::store::{persist_to, CredentialStore, FileStore, MemoryStore, StoredRecord};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// Network refresh taking 100ms, counting real calls
    struct SlowRefresher {
        calls: Arc<AtomicUsize>,
    }

    impl Refresher for SlowRefresher {
        fn refresh(&self, old: &Credential) -> crate::error::Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(Duration::from_millis(100));
            Ok(Credential::new(
                format!("57ed301a-{}", n),
                old.refresh_token.clone(),
                Some(now() + 7200),
            ))
        }
    }

    fn shared_proxy<L: Lock>(
        store: &Arc<MemoryStore>,
        lock: L,
        calls: &Arc<AtomicUsize>,
        callbacks: &Arc<AtomicUsize>,
    ) -> RecordBackedProxy<StoredRecord<MemoryStore>, SlowRefresher, L> {
        let record = StoredRecord::load(store.clone(), "user:42").unwrap();
        let mut persist = persist_to(store.clone(), "user:42");
        let fired = callbacks.clone();

        TokenProxy::from_record(
            record,
            SlowRefresher {
                calls: calls.clone(),
            },
            lock,
            Arc::new(Configuration::default()),
            move |credential: &Credential, failure: Option<&dyn Failure>| {
                fired.fetch_add(1, Ordering::SeqCst);
                persist(credential, failure);
            },
        )
    }

    #[test]
    fn test_concurrent_holders_refresh_once() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_credential("user:42", Credential::new("ABC", "DEF", Some(now() - 1)))
            .unwrap();

        let lock = LeaseLock::new(Arc::new(MemoryLockStore::new()))
            .with_wait_interval(Duration::from_millis(10))
            .with_retry_count(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let callbacks = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut primary = shared_proxy(&store, lock.clone(), &calls, &callbacks);
        let mut secondary = shared_proxy(&store, lock, &calls, &callbacks);

        let primary_events = events.clone();
        let handle = thread::spawn(move || {
            primary_events.lock().push("before_primary");
            let token = primary
                .forward(|c| Ok::<_, ResponseError>(c.token.clone()))
                .unwrap();
            primary_events.lock().push("after_primary");
            token
        });

        thread::sleep(Duration::from_millis(10));

        events.lock().push("before_secondary");
        let started = Instant::now();
        let secondary_token = secondary
            .forward(|c| Ok::<_, ResponseError>(c.token.clone()))
            .unwrap();
        let blocked = started.elapsed();
        events.lock().push("after_secondary");

        let primary_token = handle.join().unwrap();

        // The secondary waited out the primary's refresh instead of racing it
        assert!(blocked >= Duration::from_millis(50));
        let events = events.lock();
        assert_eq!(events[..2], ["before_primary", "before_secondary"]);
        assert!(events.contains(&"after_primary"));
        assert!(events.contains(&"after_secondary"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.load(Ordering::SeqCst), 2);
        assert_eq!(primary_token, "57ed301a-1");
        assert_eq!(secondary_token, "57ed301a-1");
        assert_eq!(
            store.get_credential("user:42").unwrap().unwrap().token,
            "57ed301a-1"
        );
    }

    #[test]
    fn test_many_holders_share_one_refresh() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_credential("user:42", Credential::new("ABC", "DEF", Some(now() + 3600)))
            .unwrap();

        let lock = LeaseLock::new(Arc::new(MemoryLockStore::new()))
            .with_wait_interval(Duration::from_millis(10))
            .with_retry_count(200);
        let calls = Arc::new(AtomicUsize::new(0));
        let callbacks = Arc::new(AtomicUsize::new(0));

        let proxies: Vec<_> = (0..5)
            .map(|_| shared_proxy(&store, lock.clone(), &calls, &callbacks))
            .collect();

        // Every holder sees a 401 for the original token
        let handles: Vec<_> = proxies
            .into_iter()
            .map(|mut proxy| {
                thread::spawn(move || {
                    proxy
                        .forward(|c| {
                            if c.token == "ABC" {
                                Err(ResponseError::new(401, serde_json::Value::Null))
                            } else {
                                Ok(c.token.clone())
                            }
                        })
                        .unwrap()
                })
            })
            .collect();

        let tokens: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.load(Ordering::SeqCst), 5);
        assert!(tokens.iter().all(|t| t == "57ed301a-1"));
    }

    #[test]
    fn test_settings_drive_file_backed_coordination() {
        let dir = std::env::temp_dir().join(format!("tokenwrap_flow_{}", rand::random::<u32>()));
        let settings = Settings::from_json_str(&format!(
            r#"{{"skip_statuses": [429], "lock": {{"wait_interval_ms": 10, "dir": {:?}}}}}"#,
            dir.join("leases")
        ))
        .unwrap();

        let store = Arc::new(FileStore::with_path(dir.join("credentials")).unwrap());
        store
            .save_credential("example.com:user", Credential::new("ABC", "DEF", None))
            .unwrap();
        let leases = Arc::new(FileLockStore::new(settings.lock.lock_dir()).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let mut proxy = TokenProxy::from_record(
            StoredRecord::load(store.clone(), "example.com:user").unwrap(),
            SlowRefresher {
                calls: calls.clone(),
            },
            settings.lease_lock(leases),
            Arc::new(settings.configuration()),
            persist_to(store.clone(), "example.com:user"),
        );

        // 404 is refreshable once the skip list only holds 429
        let mut attempts = 0;
        let token = proxy
            .forward(|c| {
                attempts += 1;
                if attempts == 1 {
                    Err(ResponseError::new(404, serde_json::Value::Null))
                } else {
                    Ok(c.token.clone())
                }
            })
            .unwrap();

        assert_eq!(token, "57ed301a-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store
                .get_credential("example.com:user")
                .unwrap()
                .unwrap()
                .token,
            "57ed301a-1"
        );

        std::fs::remove_dir_all(dir).ok();
    }
}
