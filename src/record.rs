/// Record-backed refresh with reconciliation under a lease
///
/// Several holders (threads, processes, replicas) may wrap the same persisted
/// record. When one of them needs a refresh it takes the lease for the record,
/// reloads it, and only calls the refresh operation if nobody else replaced the
/// token in the meantime. Otherwise it adopts the reloaded credential.
use crate::config::Configuration;
use crate::credential::Credential;
use crate::error::{Failure, RenewError};
use crate::lock::Lock;
use crate::oauth::Refresher;
use crate::proxy::{RefreshStrategy, TokenProxy};
use std::sync::Arc;
use tracing::{debug, info};

/// Persisted credential record owned by the host application
///
/// The proxy only reads the record and asks it to reload. Writing refreshed
/// credentials back is the callback's job, and must happen for reconciliation
/// to see them.
pub trait TokenRecord: Send {
    /// Stable identity used as the lock key, e.g. `"user:42"`
    fn identity(&self) -> String;

    fn access_token(&self) -> String;

    fn refresh_token(&self) -> String;

    fn expires_at(&self) -> Option<u64>;

    /// Re-read the fields from the backing store
    fn reload(&mut self) -> Result<(), String>;

    fn credential(&self) -> Credential {
        Credential::new(self.access_token(), self.refresh_token(), self.expires_at())
    }
}

/// Strategy reconciling against the record before refreshing
pub struct RecordRefresh<T, R, L> {
    record: T,
    refresher: R,
    lock: L,
}

impl<T, R, L> RecordRefresh<T, R, L> {
    pub fn new(record: T, refresher: R, lock: L) -> Self {
        Self {
            record,
            refresher,
            lock,
        }
    }

    pub fn record(&self) -> &T {
        &self.record
    }

    pub fn lock(&self) -> &L {
        &self.lock
    }
}

impl<T, R, L> RefreshStrategy for RecordRefresh<T, R, L>
where
    T: TokenRecord,
    R: Refresher,
    L: Lock,
{
    fn renew(
        &mut self,
        stale: &Credential,
        commit: &mut dyn FnMut(Credential),
    ) -> Result<(), RenewError> {
        let identity = self.record.identity();
        let Self {
            record,
            refresher,
            lock,
        } = self;

        lock.with_lock(&identity, || -> Result<(), RenewError> {
            record.reload().map_err(RenewError::Record)?;
            let current = record.credential();

            if current.token != stale.token {
                debug!(%identity, "record already refreshed by another holder, adopting");
                commit(current);
                return Ok(());
            }

            let fresh = refresher.refresh(&current)?;
            info!(%identity, "credential refreshed");
            commit(fresh);
            Ok(())
        })?
    }
}

/// Proxy whose credential comes from a persisted record
pub type RecordBackedProxy<T, R, L> = TokenProxy<RecordRefresh<T, R, L>>;

impl<T, R, L> TokenProxy<RecordRefresh<T, R, L>>
where
    T: TokenRecord,
    R: Refresher,
    L: Lock,
{
    /// Wrap the credential currently held by `record`
    ///
    /// Refreshes run under `lock`, keyed by the record's identity.
    pub fn from_record<F>(
        record: T,
        refresher: R,
        lock: L,
        config: Arc<Configuration>,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Credential, Option<&dyn Failure>) + Send + 'static,
    {
        let credential = record.credential();
        Self::with_strategy(
            credential,
            RecordRefresh::new(record, refresher, lock),
            config,
            callback,
        )
    }

    pub fn record(&self) -> &T {
        self.strategy().record()
    }
}
