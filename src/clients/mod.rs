pub mod circuit_breaker;
pub mod github;
pub mod stackoverflow;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::clients::github::GitHubClient;
use crate::clients::stackoverflow::StackOverflowClient;
use crate::clients::transport::{ResilientTransport, TransportError};
use crate::configuration::ScrapperConfiguration;

/// One piece of upstream activity. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub title: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no client handles host {0:?}")]
    UnknownService(String),
    #[error("invalid link {url}: {reason}")]
    InvalidLink { url: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to decode upstream response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// The upstream services links can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    GitHub,
    StackOverflow,
}

impl Service {
    pub fn from_url(raw: &str) -> Result<Service, ClientError> {
        let url = parse_link(raw)?;
        let host = url.host_str().unwrap_or_default();
        match host.strip_prefix("www.").unwrap_or(host) {
            "github.com" => Ok(Service::GitHub),
            "stackoverflow.com" => Ok(Service::StackOverflow),
            other => Err(ClientError::UnknownService(other.to_string())),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::GitHub => f.write_str("github"),
            Service::StackOverflow => f.write_str("stackoverflow"),
        }
    }
}

pub(crate) fn parse_link(raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw).map_err(|e| ClientError::InvalidLink {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::InvalidLink {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(url)
}

/// First path segments of a link, empty segments skipped.
pub(crate) fn path_segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[async_trait]
pub trait UpdateClient: Send + Sync {
    /// Recent activity on the resource `url` points at.
    async fn retrieve_updates(&self, url: &str) -> Result<Vec<Update>, ClientError>;
}

/// One client per known service.
#[derive(Clone)]
pub struct Clients {
    github: Arc<dyn UpdateClient>,
    stackoverflow: Arc<dyn UpdateClient>,
}

impl Clients {
    pub fn new(github: Arc<dyn UpdateClient>, stackoverflow: Arc<dyn UpdateClient>) -> Self {
        Self { github, stackoverflow }
    }

    pub fn from_configuration(config: &ScrapperConfiguration) -> Result<Self, TransportError> {
        let github = GitHubClient::new(
            ResilientTransport::from_configuration(&config.resilience)?,
            config.github_api_url.clone(),
            config.github_token.clone(),
        );
        let stackoverflow = StackOverflowClient::new(
            ResilientTransport::from_configuration(&config.resilience)?,
            config.stackoverflow_api_url.clone(),
            config.stackoverflow_key.clone(),
        );
        Ok(Self::new(Arc::new(github), Arc::new(stackoverflow)))
    }

    pub fn for_service(&self, service: Service) -> &dyn UpdateClient {
        match service {
            Service::GitHub => self.github.as_ref(),
            Service::StackOverflow => self.stackoverflow.as_ref(),
        }
    }

    /// Resolves the service from the link host and fetches its updates.
    pub async fn retrieve_updates(&self, url: &str) -> Result<Vec<Update>, ClientError> {
        let service = Service::from_url(url)?;
        self.for_service(service).retrieve_updates(url).await
    }
}
