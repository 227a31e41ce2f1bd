//! Installation access tokens
//!
//! [`InstallationTokenSource`] owns the cached token of one installation and
//! refreshes it through a [`TokenExchanger`] when it is missing or about to
//! expire. The refresh runs while the per-installation lock is held, so
//! concurrent callers for the same installation wait for a single exchange
//! instead of issuing their own.

use crate::error::{AuthError, ExchangeError};
use crate::exchange::{HttpExchanger, TokenExchanger, DEFAULT_API_URL};
use crate::token::{
    AccessToken, Clock, InstallationId, Permissions, SystemClock, TokenSource, EXPIRY_DELTA,
};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Upper bound for a single exchange call.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Narrows an installation token to a subset of repositories or permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallationTokenOptions {
    /// Repository names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repositories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_ids: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

impl InstallationTokenOptions {
    /// Limit the token to a repository by name
    pub fn repository(mut self, name: impl Into<String>) -> Self {
        self.repositories.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    /// Limit the token to a repository by ID
    pub fn repository_id(mut self, id: u64) -> Self {
        self.repository_ids.get_or_insert_with(Vec::new).push(id);
        self
    }

    /// Request a single permission, e.g. `("pull_requests", "write")`
    pub fn permission(mut self, name: impl Into<String>, level: impl Into<String>) -> Self {
        self.permissions
            .get_or_insert_with(Permissions::new)
            .insert(name.into(), level.into());
        self
    }
}

/// Cached, self-refreshing installation token.
pub struct InstallationTokenSource {
    id: InstallationId,
    app: Arc<dyn TokenSource>,
    exchanger: Arc<dyn TokenExchanger>,
    options: Option<InstallationTokenOptions>,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
    exchange_timeout: Option<Duration>,
    cached: Mutex<Option<AccessToken>>,
}

impl InstallationTokenSource {
    pub fn new(
        id: InstallationId,
        app: Arc<dyn TokenSource>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Self {
        Self {
            id,
            app,
            exchanger,
            options: None,
            clock: Arc::new(SystemClock),
            expiry_margin: EXPIRY_DELTA,
            exchange_timeout: Some(DEFAULT_EXCHANGE_TIMEOUT),
            cached: Mutex::new(None),
        }
    }

    pub fn builder(id: impl Into<InstallationId>) -> InstallationTokenSourceBuilder {
        InstallationTokenSourceBuilder::new(id.into())
    }

    /// Scope every exchanged token with `options`
    pub fn with_options(mut self, options: Option<InstallationTokenOptions>) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// `None` disables the deadline; callers can still cancel by dropping.
    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn installation_id(&self) -> InstallationId {
        self.id
    }

    /// Return the cached token, exchanging a new one if it is missing or
    /// within the expiry margin.
    ///
    /// # Errors
    /// - [`AuthError::Precondition`] for installation ID zero, before any I/O
    /// - [`AuthError::Signing`] if the app assertion cannot be minted
    /// - [`AuthError::Exchange`] if GitHub does not issue a usable token; the
    ///   cache is left as it was
    pub async fn token(&self) -> Result<AccessToken, AuthError> {
        self.ensure_installation_id()?;

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_at(self.clock.now(), self.expiry_margin) {
                debug!(installation_id = %self.id, "Using cached installation token");
                return Ok(token.clone());
            }
        }

        let token = self.exchange().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Exchange a new token even if the cached one is still valid.
    ///
    /// A failed refresh keeps the previous token in place.
    pub async fn refresh(&self) -> Result<AccessToken, AuthError> {
        self.ensure_installation_id()?;

        let mut cached = self.cached.lock().await;
        let token = self.exchange().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Snapshot of the cached token without refreshing
    pub async fn cached(&self) -> Option<AccessToken> {
        self.cached.lock().await.clone()
    }

    fn ensure_installation_id(&self) -> Result<(), AuthError> {
        if self.id.is_valid() {
            Ok(())
        } else {
            Err(AuthError::Precondition(
                "installation ID is required".to_string(),
            ))
        }
    }

    /// Must be called with the cache lock held.
    async fn exchange(&self) -> Result<AccessToken, AuthError> {
        let assertion = self.app.token().await?;

        let exchange = self
            .exchanger
            .exchange(self.id, &assertion, self.options.as_ref());
        let token = match self.exchange_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ExchangeError::Timeout(limit))??,
            None => exchange.await?,
        };

        if !token.is_valid_at(self.clock.now(), self.expiry_margin) {
            return Err(ExchangeError::Stale {
                expires_at: token.expires_at,
            }
            .into());
        }

        info!(
            installation_id = %self.id,
            expires_at = %token.expires_at,
            expires_in_secs = token.time_until_expiry(self.clock.now()).as_secs(),
            "Obtained installation token"
        );
        Ok(token)
    }
}

impl fmt::Debug for InstallationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationTokenSource")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("expiry_margin", &self.expiry_margin)
            .field("exchange_timeout", &self.exchange_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for InstallationTokenSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        InstallationTokenSource::token(self).await
    }
}

/// Builder that checks the app token source is present before anything
/// tries to use it.
pub struct InstallationTokenSourceBuilder {
    id: InstallationId,
    app: Option<Arc<dyn TokenSource>>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    options: Option<InstallationTokenOptions>,
    expiry_margin: Duration,
    exchange_timeout: Option<Duration>,
}

impl InstallationTokenSourceBuilder {
    fn new(id: InstallationId) -> Self {
        Self {
            id,
            app: None,
            exchanger: None,
            options: None,
            expiry_margin: EXPIRY_DELTA,
            exchange_timeout: Some(DEFAULT_EXCHANGE_TIMEOUT),
        }
    }

    pub fn app_source(mut self, app: Arc<dyn TokenSource>) -> Self {
        self.app = Some(app);
        self
    }

    /// Defaults to [`HttpExchanger`] against `https://api.github.com`
    pub fn exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    pub fn options(mut self, options: InstallationTokenOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<InstallationTokenSource, AuthError> {
        let app = self.app.ok_or_else(|| {
            AuthError::Configuration("an app token source is required".to_string())
        })?;

        let exchanger: Arc<dyn TokenExchanger> = match self.exchanger {
            Some(exchanger) => exchanger,
            None => Arc::new(HttpExchanger::new(reqwest::Client::new(), DEFAULT_API_URL)),
        };

        Ok(InstallationTokenSource::new(self.id, app, exchanger)
            .with_options(self.options)
            .with_expiry_margin(self.expiry_margin)
            .with_exchange_timeout(self.exchange_timeout))
    }
}
