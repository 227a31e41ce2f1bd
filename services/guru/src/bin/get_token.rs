//! GitHub App Installation Token Generator
//!
//! Signs an app assertion with the configured private key and exchanges it
//! for a short-lived installation access token.
//!
//! ## Usage
//! ```bash
//! # With command line arguments
//! get-token \
//!   --app-id 123456 \
//!   --private-key-path ./key.pem \
//!   --installation-id 78901234
//!
//! # With environment variables, scoped to one repository
//! GITHUB_APP_ID=123456 \
//! GITHUB_APP_PRIVATE_KEY_PATH=./key.pem \
//! GITHUB_INSTALLATION_ID=78901234 \
//! get-token --repositories widgets --permissions contents=read --format json
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use guru::config::AppCredentials;
use guru::exchange::HttpExchanger;
use guru::installation::{InstallationTokenOptions, InstallationTokenSource};
use guru::token::{Permissions, Repository};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// GitHub App Installation Token Generator
#[derive(Parser, Debug)]
#[command(name = "get-token")]
#[command(about = "Generate GitHub App installation access tokens")]
#[command(version)]
struct Args {
    #[command(flatten)]
    credentials: AppCredentials,

    /// GitHub App Installation ID
    #[arg(long, env = "GITHUB_INSTALLATION_ID")]
    installation_id: u64,

    /// Limit the token to these repository names
    #[arg(long, value_delimiter = ',')]
    repositories: Vec<String>,

    /// Limit the token to these repository IDs
    #[arg(long, value_delimiter = ',')]
    repository_ids: Vec<u64>,

    /// Narrow permissions, as name=level (e.g. contents=read)
    #[arg(long, value_delimiter = ',', value_parser = parse_permission)]
    permissions: Vec<(String, String)>,

    /// Output file path (optional, prints to stdout if not specified)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Output format: token (default), json
    #[arg(long, default_value = "token")]
    format: String,
}

#[derive(Serialize)]
struct TokenOutput {
    token: String,
    installation_id: u64,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    permissions: Option<Permissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repositories: Option<Vec<Repository>>,
}

fn parse_permission(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, level)) if !name.is_empty() && !level.is_empty() => {
            Ok((name.to_string(), level.to_string()))
        }
        _ => Err(format!("expected name=level, got {value:?}")),
    }
}

impl Args {
    fn token_options(&self) -> Option<InstallationTokenOptions> {
        if self.repositories.is_empty()
            && self.repository_ids.is_empty()
            && self.permissions.is_empty()
        {
            return None;
        }

        let mut options = InstallationTokenOptions::default();
        for name in &self.repositories {
            options = options.repository(name.as_str());
        }
        for id in &self.repository_ids {
            options = options.repository_id(*id);
        }
        for (name, level) in &self.permissions {
            options = options.permission(name.as_str(), level.as_str());
        }
        Some(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !matches!(args.format.as_str(), "token" | "json") {
        bail!("unknown output format: {}", args.format);
    }

    let api_url = args.credentials.api_url()?;
    eprintln!("Signing assertion for GitHub App {}...", args.credentials.app_id);
    let app = args
        .credentials
        .app_token_source()
        .context("Failed to load GitHub App credentials")?;

    eprintln!(
        "Exchanging assertion for installation token (installation: {})...",
        args.installation_id
    );
    let mut builder = InstallationTokenSource::builder(args.installation_id)
        .app_source(Arc::new(app))
        .exchanger(Arc::new(HttpExchanger::new(reqwest::Client::new(), api_url)))
        .exchange_timeout(Some(args.credentials.exchange_timeout()));
    if let Some(options) = args.token_options() {
        builder = builder.options(options);
    }
    let token = builder
        .build()?
        .token()
        .await
        .context("Failed to obtain installation token")?;

    let output = match args.format.as_str() {
        "json" => serde_json::to_string_pretty(&TokenOutput {
            token: token.value.clone(),
            installation_id: args.installation_id,
            expires_at: token.expires_at,
            permissions: token.permissions.clone(),
            repositories: token.repositories.clone(),
        })?,
        _ => token.value.clone(),
    };

    if let Some(output_path) = &args.output {
        fs::write(output_path, &output)
            .with_context(|| format!("Failed to write token to {}", output_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(output_path, fs::Permissions::from_mode(0o600))?;
        }
        eprintln!("Token saved to {}", output_path.display());
    } else {
        println!("{}", output);
        eprintln!("Token generated successfully (expires: {})", token.expires_at);
    }

    Ok(())
}
