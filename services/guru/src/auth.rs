//! GitHub App Authentication
//!
//! Signs the short-lived RS256 JWT ("app assertion") that authenticates the
//! bot as its GitHub App. Assertions are cheap to mint and are never cached;
//! each installation token exchange gets a fresh one.

use crate::error::AuthError;
use crate::token::{AccessToken, Clock, SystemClock, TokenSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// GitHub rejects app JWTs that live longer than 10 minutes.
pub const ASSERTION_LIFETIME: Duration = Duration::from_secs(600);

/// JWT claims for GitHub App authentication
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubAppClaims {
    /// Issued at time (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issuer (GitHub App ID)
    pub iss: String,
}

/// A signed app assertion
#[derive(Clone)]
pub struct Assertion {
    /// Compact JWS
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assertion")
            .field("value", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl From<Assertion> for AccessToken {
    fn from(assertion: Assertion) -> Self {
        AccessToken::bearer(assertion.value, assertion.expires_at)
    }
}

/// Token source that authenticates as the GitHub App itself.
///
/// The private key is parsed once, here, and shared read-only afterwards.
pub struct AppTokenSource {
    app_id: String,
    key: EncodingKey,
    clock: Arc<dyn Clock>,
}

impl AppTokenSource {
    /// Create a new app token source.
    ///
    /// # Arguments
    /// * `app_id` - The GitHub App ID
    /// * `private_key_pem` - The RSA private key in PEM format
    ///
    /// # Errors
    /// Returns [`AuthError::Configuration`] if the app ID is empty or the key
    /// cannot be parsed or used for signing.
    pub fn new(app_id: impl Into<String>, private_key_pem: &[u8]) -> Result<Self, AuthError> {
        Self::with_clock(app_id, private_key_pem, Arc::new(SystemClock))
    }

    pub fn with_clock(
        app_id: impl Into<String>,
        private_key_pem: &[u8],
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let app_id = app_id.into();
        if app_id.trim().is_empty() {
            return Err(AuthError::Configuration(
                "GitHub App ID is required".to_string(),
            ));
        }

        let key = EncodingKey::from_rsa_pem(private_key_pem).map_err(|e| {
            AuthError::Configuration(format!("Failed to parse private key as RSA PEM: {}", e))
        })?;

        let source = Self { app_id, key, clock };

        // A PEM block can parse and still be unusable for RS256.
        source.assertion().map_err(|e| {
            AuthError::Configuration(format!("Private key cannot sign assertions: {}", e))
        })?;

        Ok(source)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Sign a new assertion valid for [`ASSERTION_LIFETIME`]
    pub fn assertion(&self) -> Result<Assertion, AuthError> {
        let issued_at = self.clock.now();
        let expires_at = issued_at
            + chrono::Duration::from_std(ASSERTION_LIFETIME)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let claims = GitHubAppClaims {
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.app_id.clone(),
        };

        let header = Header::new(Algorithm::RS256);
        let value = encode(&header, &claims, &self.key).map_err(AuthError::Signing)?;

        Ok(Assertion {
            value,
            issued_at,
            expires_at,
        })
    }
}

impl fmt::Debug for AppTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppTokenSource")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for AppTokenSource {
    async fn token(&self) -> Result<AccessToken, AuthError> {
        self.assertion().map(AccessToken::from)
    }
}
