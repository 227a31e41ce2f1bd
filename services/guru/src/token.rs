//! Access token value type and the `TokenSource` capability.

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How much earlier than `expires_at` a token is treated as expired.
///
/// Absorbs clock skew between us and GitHub plus the latency of the request
/// that carries the token.
pub const EXPIRY_DELTA: Duration = Duration::from_secs(10);

/// Permission name to access level, e.g. `pull_requests` -> `write`.
pub type Permissions = BTreeMap<String, String>;

/// GitHub App installation ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallationId(pub u64);

impl InstallationId {
    /// Zero is never assigned by GitHub.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for InstallationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repository an installation token is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// A bearer credential with a hard expiry.
///
/// Used both for app assertions and for installation access tokens. Replaced
/// wholesale on refresh, never mutated in place.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// The secret itself
    pub value: String,
    /// Authorization scheme; see [`AccessToken::token_type`]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    /// Permissions granted to an installation token
    pub permissions: Option<Permissions>,
    /// Repositories an installation token is limited to
    pub repositories: Option<Vec<Repository>>,
}

impl AccessToken {
    /// Create a bearer token without scope metadata
    pub fn bearer(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            token_type: "Bearer".to_string(),
            expires_at,
            permissions: None,
            repositories: None,
        }
    }

    /// Canonical authorization scheme, defaulting to `Bearer`.
    pub fn token_type(&self) -> &str {
        let t = self.token_type.as_str();
        if t.eq_ignore_ascii_case("bearer") || t.is_empty() {
            "Bearer"
        } else if t.eq_ignore_ascii_case("mac") {
            "MAC"
        } else if t.eq_ignore_ascii_case("basic") {
            "Basic"
        } else {
            t
        }
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type(), self.value)
    }

    /// Valid iff the value is non-empty and `now + margin < expires_at`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        if self.value.is_empty() {
            return false;
        }

        chrono::Duration::from_std(margin)
            .ok()
            .and_then(|margin| now.checked_add_signed(margin))
            .is_some_and(|deadline| deadline < self.expires_at)
    }

    /// Validity against the wall clock and [`EXPIRY_DELTA`]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now(), EXPIRY_DELTA)
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("permissions", &self.permissions)
            .field("repositories", &self.repositories)
            .finish()
    }
}

/// Source of the current time, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Anything that can hand out a currently usable token.
///
/// Two implementations exist: [`crate::auth::AppTokenSource`] mints app
/// assertions locally, and [`crate::installation::InstallationTokenSource`]
/// exchanges those assertions for cached installation tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<AccessToken, AuthError>;
}
