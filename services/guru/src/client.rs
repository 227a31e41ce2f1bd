//! Authenticated GitHub REST client for one installation.
//!
//! Every request asks the installation token source for the current token
//! first, so refreshes are invisible to callers.

use crate::error::ApiError;
use crate::exchange::github_headers;
use crate::installation::InstallationTokenSource;
use crate::token::InstallationId;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Comment created on an issue or pull request
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

/// GitHub client acting as one app installation
#[derive(Debug)]
pub struct InstallationClient {
    http: Client,
    api_url: String,
    tokens: Arc<InstallationTokenSource>,
}

impl InstallationClient {
    pub fn new(
        http: Client,
        api_url: impl Into<String>,
        tokens: Arc<InstallationTokenSource>,
    ) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            api_url,
            tokens,
        }
    }

    pub fn installation_id(&self) -> InstallationId {
        self.tokens.installation_id()
    }

    pub fn token_source(&self) -> &Arc<InstallationTokenSource> {
        &self.tokens
    }

    /// Send an authenticated request to `path` (relative to the API root).
    ///
    /// Non-2xx responses become [`ApiError::Status`].
    pub async fn send<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError>
    where
        B: Serialize + ?Sized,
    {
        let token = self.tokens.token().await?;
        let url = format!("{}/{}", self.api_url, path.trim_start_matches('/'));

        debug!(
            installation_id = %self.installation_id(),
            method = %method,
            url = %url,
            "GitHub API request"
        );

        let mut request = github_headers(self.http.request(method, &url))
            .header(AUTHORIZATION, token.authorization());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        decode(response).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(Method::POST, path, Some(body)).await?;
        decode(response).await
    }

    /// Comment on an issue or pull request
    pub async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<IssueComment, ApiError> {
        self.post(
            &format!("repos/{}/{}/issues/{}/comments", owner, repo, number),
            &CommentRequest { body },
        )
        .await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
