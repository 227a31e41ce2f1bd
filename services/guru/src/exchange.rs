//! Installation token exchange
//!
//! Trades an app assertion for an installation access token using
//! `POST /app/installations/{id}/access_tokens`.

use crate::error::ExchangeError;
use crate::installation::InstallationTokenOptions;
use crate::token::{AccessToken, InstallationId, Permissions, Repository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const BOT_USER_AGENT: &str = "guru-github-bot";

/// Headers every GitHub REST call carries, except `Authorization`.
pub(crate) fn github_headers(request: RequestBuilder) -> RequestBuilder {
    request
        .header(ACCEPT, ACCEPT_GITHUB_JSON)
        .header(USER_AGENT, BOT_USER_AGENT)
        .header("X-GitHub-Api-Version", API_VERSION)
}

/// Performs the assertion -> installation token exchange.
///
/// This is the only network seam of the credential manager. Implementations
/// must not retry; retry policy belongs to the caller.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        installation_id: InstallationId,
        assertion: &AccessToken,
        options: Option<&InstallationTokenOptions>,
    ) -> Result<AccessToken, ExchangeError>;
}

/// Response from GitHub installation token endpoint
#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    permissions: Option<Permissions>,
    #[serde(default)]
    repositories: Option<Vec<Repository>>,
}

/// [`TokenExchanger`] backed by the GitHub REST API
#[derive(Debug, Clone)]
pub struct HttpExchanger {
    http: Client,
    api_url: String,
}

impl HttpExchanger {
    pub fn new(http: Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { http, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, installation_id: InstallationId) -> String {
        format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        )
    }
}

#[async_trait]
impl TokenExchanger for HttpExchanger {
    async fn exchange(
        &self,
        installation_id: InstallationId,
        assertion: &AccessToken,
        options: Option<&InstallationTokenOptions>,
    ) -> Result<AccessToken, ExchangeError> {
        let url = self.url(installation_id);
        debug!(installation_id = %installation_id, url = %url, "Requesting installation token");

        let mut request = github_headers(self.http.post(&url))
            .header(AUTHORIZATION, assertion.authorization());
        if let Some(options) = options {
            request = request.json(options);
        }

        let response = request.send().await.map_err(ExchangeError::Transport)?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(
                installation_id = %installation_id,
                status = status.as_u16(),
                "Installation token exchange rejected"
            );
            return Err(ExchangeError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(ExchangeError::Transport)?;
        let payload: InstallationTokenResponse =
            serde_json::from_slice(&body).map_err(ExchangeError::Decode)?;

        if payload.token.is_empty() {
            return Err(ExchangeError::Incomplete("token"));
        }

        Ok(AccessToken {
            value: payload.token,
            token_type: "Bearer".to_string(),
            expires_at: payload.expires_at,
            permissions: payload.permissions,
            repositories: payload.repositories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_upstream;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Recorded {
        installation_id: u64,
        authorization: Option<String>,
        accept: Option<String>,
        api_version: Option<String>,
        body: String,
    }

    #[derive(Clone)]
    struct Upstream {
        status: AxumStatus,
        reply: Value,
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    async fn access_tokens(
        State(upstream): State<Upstream>,
        Path(id): Path<u64>,
        headers: HeaderMap,
        body: String,
    ) -> (AxumStatus, Json<Value>) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        upstream.requests.lock().unwrap().push(Recorded {
            installation_id: id,
            authorization: header("authorization"),
            accept: header("accept"),
            api_version: header("x-github-api-version"),
            body,
        });
        (upstream.status, Json(upstream.reply.clone()))
    }

    type Requests = Arc<Mutex<Vec<Recorded>>>;

    async fn upstream(status: AxumStatus, reply: Value) -> (HttpExchanger, Requests) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/app/installations/:id/access_tokens", post(access_tokens))
            .with_state(Upstream {
                status,
                reply,
                requests: requests.clone(),
            });
        let base = spawn_upstream(app).await;
        (HttpExchanger::new(Client::new(), format!("{}/", base)), requests)
    }

    fn assertion() -> AccessToken {
        AccessToken::bearer("app.jwt.value", Utc::now() + chrono::Duration::minutes(10))
    }

    #[tokio::test]
    async fn test_exchange_success() {
        let (exchanger, requests) = upstream(
            AxumStatus::CREATED,
            json!({
                "token": "ghs_mocked",
                "expires_at": "2030-01-01T00:00:00Z",
                "permissions": {"pull_requests": "write", "issues": "write"},
                "repositories": [
                    {"id": 1, "name": "repo", "full_name": "owner/repo", "private": false}
                ]
            }),
        )
        .await;

        let token = exchanger
            .exchange(InstallationId(42), &assertion(), None)
            .await
            .unwrap();

        assert_eq!(token.value, "ghs_mocked");
        assert_eq!(token.token_type(), "Bearer");
        assert_eq!(token.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
        assert_eq!(
            token.permissions.as_ref().and_then(|p| p.get("pull_requests")),
            Some(&"write".to_string())
        );
        let repos = token.repositories.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].full_name.as_deref(), Some("owner/repo"));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.installation_id, 42);
        assert_eq!(request.authorization.as_deref(), Some("Bearer app.jwt.value"));
        assert_eq!(request.accept.as_deref(), Some(ACCEPT_GITHUB_JSON));
        assert_eq!(request.api_version.as_deref(), Some(API_VERSION));
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_sends_scope_options() {
        let (exchanger, requests) = upstream(
            AxumStatus::CREATED,
            json!({"token": "ghs_scoped", "expires_at": "2030-01-01T00:00:00Z"}),
        )
        .await;

        let options = InstallationTokenOptions::default()
            .repository_id(7)
            .permission("pull_requests", "read");
        exchanger
            .exchange(InstallationId(1), &assertion(), Some(&options))
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(
            body,
            json!({"repository_ids": [7], "permissions": {"pull_requests": "read"}})
        );
    }

    #[tokio::test]
    async fn test_exchange_rejects_non_created_status() {
        let (exchanger, _) = upstream(AxumStatus::NOT_FOUND, json!({"message": "Not Found"})).await;
        let err = exchanger
            .exchange(InstallationId(1), &assertion(), None)
            .await
            .unwrap_err();
        match err {
            ExchangeError::UnexpectedStatus { status, body } => {
                assert_eq!(status, 404);
                assert!(body.contains("Not Found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 200 is a success code but not what the endpoint promises
        let (exchanger, _) = upstream(
            AxumStatus::OK,
            json!({"token": "ghs_x", "expires_at": "2030-01-01T00:00:00Z"}),
        )
        .await;
        let err = exchanger
            .exchange(InstallationId(1), &assertion(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::UnexpectedStatus { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_exchange_undecodable_body() {
        let (exchanger, _) = upstream(AxumStatus::CREATED, json!({"token": "ghs_x"})).await;
        let err = exchanger
            .exchange(InstallationId(1), &assertion(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Decode(_)));
    }

    #[tokio::test]
    async fn test_exchange_empty_token() {
        let (exchanger, _) = upstream(
            AxumStatus::CREATED,
            json!({"token": "", "expires_at": "2030-01-01T00:00:00Z"}),
        )
        .await;
        let err = exchanger
            .exchange(InstallationId(1), &assertion(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Incomplete("token")));
    }

    #[tokio::test]
    async fn test_exchange_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let exchanger = HttpExchanger::new(Client::new(), format!("http://{}", addr));
        let err = exchanger
            .exchange(InstallationId(1), &assertion(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
    }

    #[test]
    fn test_url() {
        let exchanger = HttpExchanger::new(Client::new(), "https://ghe.example.com/api/v3/");
        assert_eq!(exchanger.api_url(), "https://ghe.example.com/api/v3");
        assert_eq!(
            exchanger.url(InstallationId(99)),
            "https://ghe.example.com/api/v3/app/installations/99/access_tokens"
        );
    }
}
