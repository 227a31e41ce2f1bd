//! Error types for GitHub App authentication and API calls.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while minting or exchanging GitHub App credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// App ID or private key is missing or unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A tenant-scoped call was made without a usable installation ID
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The app assertion could not be signed
    #[error("Failed to sign app assertion: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    /// The installation token exchange failed
    #[error("Installation token exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
}

/// Failures of the `POST /app/installations/{id}/access_tokens` call.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Anything other than `201 Created`
    #[error("GitHub API returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// The request never produced a response
    #[error("Request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The response body was not a valid installation token
    #[error("Failed to decode installation token response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The body decoded but a required field was empty
    #[error("Installation token response is incomplete: missing {0}")]
    Incomplete(&'static str),

    /// GitHub handed back a token that is already inside the expiry margin
    #[error("Installation token expires too soon ({expires_at})")]
    Stale { expires_at: chrono::DateTime<chrono::Utc> },

    /// The exchange did not finish before the configured deadline
    #[error("Exchange did not complete within {0:?}")]
    Timeout(Duration),
}

/// Errors returned by [`crate::client::InstallationClient`] requests.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No valid installation token could be obtained
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("GitHub API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors loading process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "No private key configured: set GITHUB_APP_PRIVATE_KEY, \
         GITHUB_APP_PRIVATE_KEY_B64 or GITHUB_APP_PRIVATE_KEY_PATH"
    )]
    MissingPrivateKey,

    #[error("Failed to read private key from {path}: {source}")]
    ReadPrivateKey {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Private key is not valid base64: {0}")]
    DecodePrivateKey(#[from] base64::DecodeError),

    #[error("Invalid API URL: {0}")]
    InvalidApiUrl(String),

    #[error(
        "Client idle TTL ({ttl:?}) must not be shorter than the exchange timeout \
         ({exchange_timeout:?})"
    )]
    IdleTtlTooShort {
        ttl: Duration,
        exchange_timeout: Duration,
    },
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        AuthError::Configuration(err.to_string())
    }
}

impl AuthError {
    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Exchange(ExchangeError::Transport(_))
            | AuthError::Exchange(ExchangeError::Timeout(_)) => true,
            AuthError::Exchange(ExchangeError::UnexpectedStatus { status, .. }) => *status >= 500,
            _ => false,
        }
    }
}

impl ApiError {
    /// Whether GitHub might accept the same request later.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Auth(err) => err.is_transient(),
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Decode(_) => false,
        }
    }
}
