//! Shared fixtures for unit tests: RSA keys, a manual clock, a scripted
//! exchanger and an in-process upstream server.

use crate::error::{AuthError, ExchangeError};
use crate::exchange::TokenExchanger;
use crate::installation::InstallationTokenOptions;
use crate::token::{AccessToken, Clock, InstallationId, TokenSource};
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PRIVATE_KEY: &[u8] = include_bytes!("../testdata/private-key.pem");
pub const PUBLIC_KEY: &[u8] = include_bytes!("../testdata/public-key.pem");

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(unix_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.timestamp_opt(unix_secs, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Scripted outcome of one mock exchange
#[derive(Debug, Clone)]
pub enum MockReply {
    Token { value: String, ttl: Duration },
    Status(u16),
    /// Never completes
    Hang,
}

impl MockReply {
    pub fn token(value: impl Into<String>, ttl: Duration) -> Self {
        Self::Token {
            value: value.into(),
            ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub installation_id: InstallationId,
    pub assertion: String,
    pub options: Option<InstallationTokenOptions>,
}

/// Call-counting [`TokenExchanger`].
///
/// Pops scripted replies first; once they run out every call returns
/// `ghs_{installation}_{call}` valid for one hour.
pub struct MockExchanger {
    clock: Arc<dyn Clock>,
    replies: Mutex<VecDeque<MockReply>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<SeenRequest>>,
}

impl MockExchanger {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_delay(clock, Duration::ZERO)
    }

    pub fn with_delay(clock: Arc<dyn Clock>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            replies: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of exchanges observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenExchanger for MockExchanger {
    async fn exchange(
        &self,
        installation_id: InstallationId,
        assertion: &AccessToken,
        options: Option<&InstallationTokenOptions>,
    ) -> Result<AccessToken, ExchangeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(SeenRequest {
            installation_id,
            assertion: assertion.value.clone(),
            options: options.cloned(),
        });
        let reply = self.replies.lock().unwrap().pop_front();

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = reply.unwrap_or_else(|| {
            MockReply::token(
                format!("ghs_{}_{}", installation_id, call),
                Duration::from_secs(3600),
            )
        });

        match reply {
            MockReply::Token { value, ttl } => Ok(AccessToken::bearer(
                value,
                self.clock.now() + chrono::Duration::from_std(ttl).unwrap(),
            )),
            MockReply::Status(status) => Err(ExchangeError::UnexpectedStatus {
                status,
                body: "{\"message\":\"mock\"}".to_string(),
            }),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

/// App token source whose signing always fails
pub struct FailingSource;

#[async_trait]
impl TokenSource for FailingSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        Err(AuthError::Signing(
            jsonwebtoken::errors::ErrorKind::InvalidKeyFormat.into(),
        ))
    }
}

/// Serve `app` on an ephemeral local port and return its base URL
pub async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Minimal `pull_request.opened` webhook body
pub fn pull_request_opened(installation: Option<u64>) -> Value {
    let mut payload = json!({
        "action": "opened",
        "number": 12,
        "pull_request": {
            "number": 12,
            "title": "Add retries",
            "html_url": "https://github.com/octo/widgets/pull/12",
            "state": "open"
        },
        "repository": {
            "id": 1,
            "name": "widgets",
            "full_name": "octo/widgets",
            "owner": {"login": "octo", "id": 5}
        },
        "sender": {"login": "someone"}
    });
    if let Some(id) = installation {
        payload["installation"] = json!({"id": id, "node_id": "MDIz"});
    }
    payload
}
