use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::clients::transport::ResilientTransport;
use crate::clients::{ClientError, Update, UpdateClient, parse_link, path_segments};
use crate::utils::preview;

const PER_PAGE: u32 = 30;

#[derive(Deserialize, Debug)]
struct GitHubUser {
    login: String,
}

#[derive(Deserialize, Debug)]
struct PullRequestResponse {
    title: String,
    user: Option<GitHubUser>,
    created_at: DateTime<Utc>,
    body: Option<String>,
}

#[derive(Deserialize, Debug)]
struct IssueResponse {
    title: String,
    user: Option<GitHubUser>,
    created_at: DateTime<Utc>,
    body: Option<String>,
    /// Present when the issue is really a pull request.
    pull_request: Option<serde_json::Value>,
}

pub struct GitHubClient {
    transport: ResilientTransport,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(transport: ResilientTransport, base_url: String, token: Option<String>) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// `https://github.com/{owner}/{repo}[/...]` → `(owner, repo)`.
    pub fn owner_and_repo(link: &str) -> Result<(String, String), ClientError> {
        let url = parse_link(link)?;
        let segments = path_segments(&url);
        match segments.as_slice() {
            [owner, repo, ..] => Ok((owner.clone(), repo.trim_end_matches(".git").to_string())),
            _ => Err(ClientError::InvalidLink {
                url: link.to_string(),
                reason: "expected /{owner}/{repo}".to_string(),
            }),
        }
    }

    fn request(&self, client: &Client, url: &str) -> RequestBuilder {
        let mut req = client
            .get(url)
            .query(&[("state", "all"), ("sort", "created"), ("direction", "desc")])
            .query(&[("per_page", PER_PAGE)])
            .header("User-Agent", "link-tracker/0.1")
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        req
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>, ClientError> {
        let response = self.transport.execute(|client| self.request(client, url)).await?;
        response.json::<Vec<T>>().await.map_err(ClientError::Decode)
    }
}

#[async_trait]
impl UpdateClient for GitHubClient {
    async fn retrieve_updates(&self, url: &str) -> Result<Vec<Update>, ClientError> {
        let (owner, repo) = Self::owner_and_repo(url)?;
        let repo_api = format!(
            "{}/repos/{}/{}",
            self.base_url,
            urlencoding::encode(&owner),
            urlencoding::encode(&repo)
        );

        let pulls: Vec<PullRequestResponse> = self.fetch(&format!("{repo_api}/pulls")).await?;
        let issues: Vec<IssueResponse> = self.fetch(&format!("{repo_api}/issues")).await?;
        log::debug!(
            "GitHub {owner}/{repo}: {} pull requests, {} issues",
            pulls.len(),
            issues.len()
        );

        let pull_updates = pulls.into_iter().map(|pr| Update {
            title: format!("pull request \"{}\"", pr.title),
            author: pr.user.map(|u| u.login).unwrap_or_default(),
            created_at: pr.created_at,
            body: preview(pr.body.as_deref()),
        });
        let issue_updates = issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(|issue| Update {
                title: format!("issue \"{}\"", issue.title),
                author: issue.user.map(|u| u.login).unwrap_or_default(),
                created_at: issue.created_at,
                body: preview(issue.body.as_deref()),
            });

        Ok(pull_updates.chain(issue_updates).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::circuit_breaker::CircuitBreakerConfig;
    use crate::clients::transport::{RetryPolicy, TransportError};
    use std::time::Duration;

    fn client(base_url: String) -> GitHubClient {
        let transport = ResilientTransport::new(
            Client::new(),
            RetryPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            CircuitBreakerConfig::default(),
        );
        GitHubClient::new(transport, base_url, Some("token".to_string()))
    }

    #[test]
    fn parses_owner_and_repo() {
        assert_eq!(
            GitHubClient::owner_and_repo("https://github.com/owner/repo.git").unwrap(),
            ("owner".to_string(), "repo".to_string())
        );
        assert_eq!(
            GitHubClient::owner_and_repo("https://github.com/owner/repo/pulls/3").unwrap(),
            ("owner".to_string(), "repo".to_string())
        );
        assert!(GitHubClient::owner_and_repo("https://github.com/owner").is_err());
    }

    #[tokio::test]
    async fn maps_pull_requests_and_issues() {
        let mut server = mockito::Server::new_async().await;
        let pulls = server
            .mock("GET", "/repos/owner/repo/pulls")
            .match_query(mockito::Matcher::Any)
            .match_header("authorization", "Bearer token")
            .with_status(200)
            .with_body(
                r#"[{"title":"Add feature","user":{"login":"alice"},"created_at":"2025-03-01T12:00:00Z","body":"Implements it"}]"#,
            )
            .create_async()
            .await;
        let issues = server
            .mock("GET", "/repos/owner/repo/issues")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                    {"title":"Crash","user":{"login":"bob"},"created_at":"2025-03-02T08:30:00Z","body":null},
                    {"title":"Add feature","user":{"login":"alice"},"created_at":"2025-03-01T12:00:00Z","body":"x","pull_request":{"url":"..."}}
                ]"#,
            )
            .create_async()
            .await;

        let updates = client(server.url())
            .retrieve_updates("https://github.com/owner/repo")
            .await
            .expect("should map updates");

        pulls.assert_async().await;
        issues.assert_async().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].title, "pull request \"Add feature\"");
        assert_eq!(updates[0].author, "alice");
        assert_eq!(updates[0].body, "Implements it");
        assert_eq!(updates[1].title, "issue \"Crash\"");
        assert_eq!(updates[1].author, "bob");
        assert_eq!(updates[1].created_at.to_rfc3339(), "2025-03-02T08:30:00+00:00");
    }

    #[tokio::test]
    async fn unknown_repository_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/owner/gone/pulls")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = client(server.url())
            .retrieve_updates("https://github.com/owner/gone")
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, ClientError::Transport(TransportError::NonRetryable { .. })));
    }

    #[tokio::test]
    async fn malformed_timestamp_is_a_decode_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/owner/repo/pulls")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"title":"t","user":null,"created_at":"yesterday","body":null}]"#)
            .create_async()
            .await;

        let err = client(server.url())
            .retrieve_updates("https://github.com/owner/repo")
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Decode(_)));
    }
}
