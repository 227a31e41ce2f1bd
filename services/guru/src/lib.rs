//! Guru GitHub App
//!
//! Credential lifecycle for a GitHub App acting on behalf of many
//! installations, plus the webhook surface that uses it.
//!
//! ## Layers
//!
//! - [`auth::AppTokenSource`]: signs short-lived RS256 app assertions
//! - [`installation::InstallationTokenSource`]: exchanges assertions for
//!   installation tokens and caches them, one refresh at a time
//! - [`installations::Installations`]: one authenticated client per
//!   installation, built on first use
//! - [`webhook`]: signature-checked event receiver
//!
//! ## Binaries
//!
//! - `guru`: webhook server
//! - `get-token`: print an installation access token
//!
//! ## Example
//!
//! ```bash
//! TOKEN=$(get-token \
//!   --app-id $GITHUB_APP_ID \
//!   --private-key-path /path/to/key.pem \
//!   --installation-id $INSTALLATION_ID)
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod installation;
pub mod installations;
pub mod pr;
pub mod token;
pub mod webhook;

#[cfg(test)]
mod testutil;

pub use auth::AppTokenSource;
pub use client::InstallationClient;
pub use error::{ApiError, AuthError, ConfigError, ExchangeError};
pub use exchange::{HttpExchanger, TokenExchanger};
pub use installation::{InstallationTokenOptions, InstallationTokenSource};
pub use installations::Installations;
pub use token::{AccessToken, InstallationId, TokenSource};
