/// Transparent refresh around operations that use a credential
use crate::config::{Classification, Configuration};
use crate::credential::Credential;
use crate::error::{Failure, ProxyError, RenewError};
use crate::oauth::Refresher;
use std::sync::Arc;
use tracing::{debug, info};

/// Observer of successful refreshes
///
/// Receives the new credential and the failure that triggered the refresh,
/// or `None` when the refresh was proactive. Typically persists the credential.
pub type Callback = Box<dyn FnMut(&Credential, Option<&dyn Failure>) + Send>;

/// How a proxy replaces a stale credential
pub trait RefreshStrategy {
    /// Obtain the credential replacing `stale` and hand it to `commit`
    ///
    /// `commit` swaps the proxy's credential and runs the callback. It must be
    /// called exactly once when this returns `Ok`, and never on error.
    fn renew(
        &mut self,
        stale: &Credential,
        commit: &mut dyn FnMut(Credential),
    ) -> Result<(), RenewError>;
}

/// Strategy calling the refresh operation directly, without coordination
pub struct DirectRefresh<R> {
    refresher: R,
}

impl<R: Refresher> DirectRefresh<R> {
    pub fn new(refresher: R) -> Self {
        Self { refresher }
    }
}

impl<R: Refresher> RefreshStrategy for DirectRefresh<R> {
    fn renew(
        &mut self,
        stale: &Credential,
        commit: &mut dyn FnMut(Credential),
    ) -> Result<(), RenewError> {
        let fresh = self.refresher.refresh(stale)?;
        info!("credential refreshed");
        commit(fresh);
        Ok(())
    }
}

/// Proxy that keeps a credential usable across forwarded operations
///
/// Before each operation the credential is refreshed if it expires within the
/// grace period. A failed operation is classified against the `Configuration`:
/// non-refreshable failures propagate unchanged, anything else triggers one
/// refresh and one retry. A failure of the retry propagates as-is.
///
/// # Example
///
/// ```
/// use tokenwrap::prelude::*;
/// use std::sync::Arc;
///
/// let refresher = |old: &Credential| -> tokenwrap::error::Result<Credential> {
///     Ok(Credential::new("fresh", old.refresh_token.clone(), None))
/// };
/// let mut proxy = TokenProxy::new(
///     Credential::new("stale", "r", None),
///     refresher,
///     Arc::new(Configuration::default()),
///     |new_credential, _failure| println!("refreshed to {}", new_credential.token),
/// );
///
/// let mut first = true;
/// let token = proxy
///     .forward(|credential| {
///         if std::mem::take(&mut first) {
///             return Err(ResponseError::new(401, serde_json::Value::Null));
///         }
///         Ok(credential.token.clone())
///     })
///     .unwrap();
/// assert_eq!(token, "fresh");
/// ```
pub struct TokenProxy<S> {
    credential: Credential,
    strategy: S,
    config: Arc<Configuration>,
    callback: Callback,
}

impl<R: Refresher> TokenProxy<DirectRefresh<R>> {
    /// Wrap a credential refreshed directly through `refresher`
    pub fn new<F>(
        credential: Credential,
        refresher: R,
        config: Arc<Configuration>,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Credential, Option<&dyn Failure>) + Send + 'static,
    {
        Self::with_strategy(credential, DirectRefresh::new(refresher), config, callback)
    }
}

impl<S: RefreshStrategy> TokenProxy<S> {
    pub fn with_strategy<F>(
        credential: Credential,
        strategy: S,
        config: Arc<Configuration>,
        callback: F,
    ) -> Self
    where
        F: FnMut(&Credential, Option<&dyn Failure>) + Send + 'static,
    {
        Self {
            credential,
            strategy,
            config,
            callback: Box::new(callback),
        }
    }

    /// The current credential
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn token(&self) -> &str {
        &self.credential.token
    }

    pub fn refresh_token(&self) -> &str {
        &self.credential.refresh_token
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.credential.expires_at
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Run `operation` against the current credential, refreshing when needed
    pub fn forward<T, E, F>(&mut self, mut operation: F) -> Result<T, ProxyError<E>>
    where
        F: FnMut(&Credential) -> Result<T, E>,
        E: Failure,
    {
        if self.credential.is_expiring() {
            debug!(expires_at = ?self.credential.expires_at, "credential expiring, refreshing first");
            if let Err(e) = self.refresh_cycle(None) {
                return Err(e.with_trigger(None));
            }
        }

        let failure = match operation(&self.credential) {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        let status = failure.response().map(|response| response.status);
        if self.config.classify(&failure) == Classification::NonRefreshable {
            debug!(?status, "failure is not refreshable, propagating");
            return Err(ProxyError::Operation(failure));
        }

        debug!(?status, "refreshable failure, refreshing credential");
        if let Err(e) = self.refresh_cycle(Some(&failure as &dyn Failure)) {
            return Err(e.with_trigger(Some(failure)));
        }

        operation(&self.credential).map_err(ProxyError::Operation)
    }

    /// Refresh now, regardless of expiry
    pub fn refresh(&mut self) -> Result<(), RenewError> {
        self.refresh_cycle(None)
    }

    fn refresh_cycle(&mut self, trigger: Option<&dyn Failure>) -> Result<(), RenewError> {
        let Self {
            credential,
            strategy,
            callback,
            ..
        } = self;

        let stale = credential.clone();
        strategy.renew(&stale, &mut |fresh: Credential| {
            *credential = fresh;
            callback(&*credential, trigger);
        })
    }
}
