//! Pull Request Operations
//!
//! Webhook payload types for pull request events and the handler that greets
//! newly opened pull requests.

use crate::client::IssueComment;
use crate::error::{ApiError, AuthError};
use crate::installations::Installations;
use crate::token::InstallationId;
use serde::Deserialize;
use tracing::info;

pub const WELCOME_MESSAGE: &str = "## Welcome to Guru!

Thanks for opening this pull request. Guru reviews the changes for:
- **Code quality**: style, formatting and readability
- **Potential bugs**: common mistakes and risky patterns
- **Performance**: obvious hot spots and wasted work

Feedback will show up as comments on this pull request.
Push new commits and Guru will take another look.
";

/// `pull_request` webhook payload (only the fields the bot reads)
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    pub repository: RepositoryRef,
    #[serde(default)]
    pub installation: Option<InstallationRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    pub name: String,
    pub full_name: String,
    pub owner: Owner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct InstallationRef {
    pub id: InstallationId,
}

impl PullRequestEvent {
    pub fn installation_id(&self) -> Option<InstallationId> {
        self.installation.map(|i| i.id)
    }
}

/// Post [`WELCOME_MESSAGE`] on the pull request as the installation that
/// delivered the event.
pub async fn welcome(
    installations: &Installations,
    event: &PullRequestEvent,
) -> Result<IssueComment, ApiError> {
    let installation_id = event.installation_id().ok_or_else(|| {
        AuthError::Precondition("event does not name an installation".to_string())
    })?;

    let client = installations.client(installation_id);
    let comment = client
        .create_issue_comment(
            &event.repository.owner.login,
            &event.repository.name,
            event.pull_request.number,
            WELCOME_MESSAGE,
        )
        .await?;

    info!(
        installation_id = %installation_id,
        repository = %event.repository.full_name,
        pr_number = event.pull_request.number,
        comment_id = comment.id,
        "Posted welcome comment"
    );

    Ok(comment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AppTokenSource;
    use crate::testutil::{
        pull_request_opened, spawn_upstream, ManualClock, MockExchanger, PRIVATE_KEY,
    };
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    type Posted = Arc<Mutex<Vec<(String, String)>>>;

    async fn comments(
        State(posted): State<Posted>,
        Path((owner, repo, number)): Path<(String, String, u64)>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        posted.lock().unwrap().push((
            format!("{}/{}#{}", owner, repo, number),
            body["body"].as_str().unwrap_or_default().to_string(),
        ));
        (StatusCode::CREATED, Json(json!({"id": 99})))
    }

    async fn setup() -> (Installations, Arc<MockExchanger>, Posted) {
        let posted: Posted = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/repos/:owner/:repo/issues/:number/comments", post(comments))
            .with_state(posted.clone());
        let base = spawn_upstream(app).await;

        let clock = ManualClock::starting_at(1_700_000_000);
        let exchanger = MockExchanger::new(clock.clone());
        let app_source = AppTokenSource::with_clock("123", PRIVATE_KEY, clock.clone()).unwrap();
        let installations = Installations::builder(Arc::new(app_source))
            .api_url(base)
            .exchanger(exchanger.clone())
            .clock(clock)
            .build();

        (installations, exchanger, posted)
    }

    #[test]
    fn test_parse_event() {
        let event: PullRequestEvent =
            serde_json::from_value(pull_request_opened(Some(77))).unwrap();
        assert_eq!(event.action, "opened");
        assert_eq!(event.pull_request.number, 12);
        assert_eq!(event.repository.owner.login, "octo");
        assert_eq!(event.installation_id(), Some(InstallationId(77)));

        let event: PullRequestEvent =
            serde_json::from_value(pull_request_opened(None)).unwrap();
        assert_eq!(event.installation_id(), None);
    }

    #[tokio::test]
    async fn test_welcome_posts_comment() {
        let (installations, exchanger, posted) = setup().await;
        let event: PullRequestEvent =
            serde_json::from_value(pull_request_opened(Some(77))).unwrap();

        let comment = welcome(&installations, &event).await.unwrap();
        assert_eq!(comment.id, 99);

        let posted = posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, "octo/widgets#12");
        assert_eq!(posted[0].1, WELCOME_MESSAGE);
        assert_eq!(exchanger.calls(), 1);
        assert_eq!(installations.clients_created(), 1);
    }

    #[tokio::test]
    async fn test_welcome_without_installation() {
        let (installations, exchanger, posted) = setup().await;
        let event: PullRequestEvent =
            serde_json::from_value(pull_request_opened(None)).unwrap();

        let err = welcome(&installations, &event).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::Precondition(_))));
        assert_eq!(exchanger.calls(), 0);
        assert!(installations.is_empty());
        assert!(posted.lock().unwrap().is_empty());
    }
}
