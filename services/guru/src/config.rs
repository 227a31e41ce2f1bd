//! Process configuration
//!
//! Flags with environment fallbacks, shared by the `guru` server and the
//! `get-token` tool.

use crate::auth::AppTokenSource;
use crate::error::{AuthError, ConfigError};
use crate::exchange::DEFAULT_API_URL;
use base64::{engine::general_purpose, Engine as _};
use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// GitHub App credentials and API endpoint
#[derive(Args, Debug, Clone)]
pub struct AppCredentials {
    /// GitHub App ID
    #[arg(long, env = "GITHUB_APP_ID")]
    pub app_id: String,

    /// Private key PEM, inline
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Private key PEM, base64 encoded
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY_B64", hide_env_values = true)]
    pub private_key_b64: Option<String>,

    /// Path to the private key PEM file
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY_PATH")]
    pub private_key_path: Option<PathBuf>,

    /// GitHub REST API root (GitHub Enterprise: https://HOST/api/v3)
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Deadline for a single installation token exchange, in seconds
    #[arg(long, env = "GURU_EXCHANGE_TIMEOUT_SECS", default_value_t = 30)]
    pub exchange_timeout_secs: u64,
}

impl AppCredentials {
    /// Private key bytes. Inline PEM wins over base64, which wins over a path.
    pub fn private_key_pem(&self) -> Result<Vec<u8>, ConfigError> {
        if let Some(pem) = self.private_key.as_deref().filter(|v| !v.is_empty()) {
            return Ok(pem.as_bytes().to_vec());
        }

        if let Some(encoded) = self.private_key_b64.as_deref().filter(|v| !v.is_empty()) {
            return Ok(general_purpose::STANDARD.decode(encoded.trim())?);
        }

        if let Some(path) = &self.private_key_path {
            return std::fs::read(path).map_err(|source| ConfigError::ReadPrivateKey {
                path: path.display().to_string(),
                source,
            });
        }

        Err(ConfigError::MissingPrivateKey)
    }

    /// API root without a trailing slash
    pub fn api_url(&self) -> Result<String, ConfigError> {
        let url = self.api_url.trim().trim_end_matches('/');
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ConfigError::InvalidApiUrl(self.api_url.clone()));
        }
        Ok(url.to_string())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    /// Load the key and build the app token source
    pub fn app_token_source(&self) -> Result<AppTokenSource, AuthError> {
        let pem = self.private_key_pem()?;
        AppTokenSource::new(self.app_id.clone(), &pem)
    }
}

/// Webhook server configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "guru")]
#[command(about = "GitHub App bot that greets new pull requests")]
#[command(version)]
pub struct ServerConfig {
    #[command(flatten)]
    pub credentials: AppCredentials,

    /// Secret used to verify X-Hub-Signature-256
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Evict installation clients unused for this many seconds
    #[arg(long, env = "GURU_CLIENT_IDLE_TTL_SECS")]
    pub client_idle_ttl_secs: Option<u64>,

    /// Emit JSON logs
    #[arg(long, env = "GURU_LOG_JSON")]
    pub log_json: bool,
}

impl ServerConfig {
    /// Idle TTL for cached clients; `None` when unset or zero.
    ///
    /// A TTL shorter than the exchange timeout is rejected: a client would
    /// become evictable while its first exchange is still running.
    pub fn client_idle_ttl(&self) -> Result<Option<Duration>, ConfigError> {
        let Some(ttl) = self
            .client_idle_ttl_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
        else {
            return Ok(None);
        };

        let exchange_timeout = self.credentials.exchange_timeout();
        if ttl < exchange_timeout {
            return Err(ConfigError::IdleTtlTooShort {
                ttl,
                exchange_timeout,
            });
        }
        Ok(Some(ttl))
    }
}
