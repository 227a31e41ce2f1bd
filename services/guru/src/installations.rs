//! Per-installation client cache.
//!
//! Webhook handlers ask [`Installations::client`] for the installation named
//! in the event. The first request builds an [`InstallationTokenSource`]
//! around the shared app token source; later requests reuse it, and with it
//! the cached installation token.
//!
//! A token source outlives its cache entry while any handler still holds its
//! client. Rebuilding the client for that installation picks the live source
//! back up, so there is never more than one exchange in flight per
//! installation, even across `remove` and idle eviction.

use crate::client::InstallationClient;
use crate::exchange::{HttpExchanger, TokenExchanger, DEFAULT_API_URL};
use crate::installation::{
    InstallationTokenOptions, InstallationTokenSource, DEFAULT_EXCHANGE_TIMEOUT,
};
use crate::token::{Clock, InstallationId, SystemClock, TokenSource, EXPIRY_DELTA};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

struct Entry {
    client: Arc<InstallationClient>,
    last_used: Instant,
}

impl Entry {
    /// Some handler besides the cache holds the client
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.client) > 1
    }
}

#[derive(Default)]
struct Clients {
    entries: HashMap<InstallationId, Entry>,
    /// Token sources by installation, alive as long as any client holds one
    sources: HashMap<InstallationId, Weak<InstallationTokenSource>>,
}

/// Cache of authenticated clients keyed by installation ID.
///
/// Lookup and insertion share one critical section, so concurrent first
/// requests for a new installation still build exactly one client. The map
/// lock is never held across an await; token refreshes use the
/// per-installation locks inside each token source.
pub struct Installations {
    app: Arc<dyn TokenSource>,
    exchanger: Arc<dyn TokenExchanger>,
    http: Client,
    api_url: String,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
    exchange_timeout: Option<Duration>,
    token_options: Option<InstallationTokenOptions>,
    clients: Mutex<Clients>,
    created: AtomicUsize,
}

impl Installations {
    /// Cache against `https://api.github.com` with default settings
    pub fn new(app: Arc<dyn TokenSource>) -> Self {
        Self::builder(app).build()
    }

    pub fn builder(app: Arc<dyn TokenSource>) -> InstallationsBuilder {
        InstallationsBuilder {
            app,
            exchanger: None,
            http: None,
            api_url: DEFAULT_API_URL.to_string(),
            clock: Arc::new(SystemClock),
            expiry_margin: EXPIRY_DELTA,
            exchange_timeout: Some(DEFAULT_EXCHANGE_TIMEOUT),
            token_options: None,
        }
    }

    /// Client for `id`, built on first use.
    ///
    /// Never fails: an invalid ID surfaces as an error from the first
    /// request made with the returned client.
    pub fn client(&self, id: InstallationId) -> Arc<InstallationClient> {
        let mut clients = self.lock();

        if let Some(entry) = clients.entries.get_mut(&id) {
            entry.last_used = Instant::now();
            debug!(installation_id = %id, "Reusing installation client");
            return entry.client.clone();
        }

        let live = clients.sources.get(&id).and_then(Weak::upgrade);
        let tokens = match live {
            Some(tokens) => {
                debug!(installation_id = %id, "Reusing live installation token source");
                tokens
            }
            None => {
                let tokens = Arc::new(self.token_source(id));
                clients.sources.insert(id, Arc::downgrade(&tokens));
                tokens
            }
        };
        let client = Arc::new(InstallationClient::new(
            self.http.clone(),
            self.api_url.clone(),
            tokens,
        ));

        clients.entries.insert(
            id,
            Entry {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(
            installation_id = %id,
            cached = clients.entries.len(),
            "Created installation client"
        );

        client
    }

    /// Drop the cached client, e.g. after the app was uninstalled.
    ///
    /// Handlers still holding the client keep using it, and a client rebuilt
    /// before they finish shares their token source.
    pub fn remove(&self, id: InstallationId) -> bool {
        let mut clients = self.lock();
        let removed = clients.entries.remove(&id).is_some();
        clients.prune_sources();
        if removed {
            info!(installation_id = %id, "Evicted installation client");
        }
        removed
    }

    /// Drop clients that have not been requested for at least `idle` and
    /// that no handler holds any more. Returns how many were removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut clients = self.lock();
        let before = clients.entries.len();
        clients
            .entries
            .retain(|_, entry| entry.in_use() || entry.last_used.elapsed() < idle);
        clients.prune_sources();
        let evicted = before - clients.entries.len();
        if evicted > 0 {
            info!(
                evicted,
                remaining = clients.entries.len(),
                "Evicted idle installation clients"
            );
        }
        evicted
    }

    /// Run [`Installations::evict_idle`] every `idle / 2` until aborted
    pub fn spawn_idle_sweeper(self: &Arc<Self>, idle: Duration) -> JoinHandle<()> {
        let installations = Arc::clone(self);
        let period = (idle / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                installations.evict_idle(idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of clients constructed over the cache's lifetime
    pub fn clients_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    fn token_source(&self, id: InstallationId) -> InstallationTokenSource {
        InstallationTokenSource::new(id, self.app.clone(), self.exchanger.clone())
            .with_options(self.token_options.clone())
            .with_clock(self.clock.clone())
            .with_expiry_margin(self.expiry_margin)
            .with_exchange_timeout(self.exchange_timeout)
    }

    fn lock(&self) -> MutexGuard<'_, Clients> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clients {
    fn prune_sources(&mut self) {
        self.sources.retain(|_, source| source.strong_count() > 0);
    }
}

pub struct InstallationsBuilder {
    app: Arc<dyn TokenSource>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    http: Option<Client>,
    api_url: String,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
    exchange_timeout: Option<Duration>,
    token_options: Option<InstallationTokenOptions>,
}

impl InstallationsBuilder {
    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Shared HTTP client for exchanges and API calls
    pub fn http(mut self, http: Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Override the exchange transport. Defaults to [`HttpExchanger`] on the
    /// configured API URL.
    pub fn exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
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

    pub fn token_options(mut self, options: InstallationTokenOptions) -> Self {
        self.token_options = Some(options);
        self
    }

    pub fn build(self) -> Installations {
        let http = self.http.unwrap_or_default();
        let api_url = self.api_url.trim_end_matches('/').to_string();
        let exchanger: Arc<dyn TokenExchanger> = match self.exchanger {
            Some(exchanger) => exchanger,
            None => Arc::new(HttpExchanger::new(http.clone(), api_url.clone())),
        };

        Installations {
            app: self.app,
            exchanger,
            http,
            api_url,
            clock: self.clock,
            expiry_margin: self.expiry_margin,
            exchange_timeout: self.exchange_timeout,
            token_options: self.token_options,
            clients: Mutex::new(Clients::default()),
            created: AtomicUsize::new(0),
        }
    }
}
