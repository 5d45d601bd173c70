use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use crate::api::{AddLinkRequest, ApiErrorResponse, CHAT_ID_HEADER, LinkResponse, ListLinksResponse, RemoveLinkRequest};

#[derive(Debug, thiserror::Error)]
pub enum ScrapperError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("request to scrapper failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("scrapper answered {status}: {description}")]
    Status { status: StatusCode, description: String },
}

/// What the bot needs from the scrapper.
#[async_trait]
pub trait ScrapperApi: Send + Sync {
    async fn register_chat(&self, chat_id: i64) -> Result<(), ScrapperError>;
    async fn delete_chat(&self, chat_id: i64) -> Result<(), ScrapperError>;
    async fn add_link(&self, chat_id: i64, request: &AddLinkRequest) -> Result<LinkResponse, ScrapperError>;
    async fn remove_link(&self, chat_id: i64, url: &str) -> Result<LinkResponse, ScrapperError>;
    async fn list_links(&self, chat_id: i64) -> Result<ListLinksResponse, ScrapperError>;
}

pub struct ScrapperClient {
    client: Client,
    base_url: String,
}

impl ScrapperClient {
    pub fn new(base_url: &str) -> Result<Self, ScrapperError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: Response) -> Result<Response, ScrapperError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let description = serde_json::from_str::<ApiErrorResponse>(&text)
            .map(|body| body.description)
            .unwrap_or(text);

        Err(match status {
            StatusCode::CONFLICT => ScrapperError::Conflict(description),
            StatusCode::NOT_FOUND => ScrapperError::NotFound(description),
            _ => ScrapperError::Status { status, description },
        })
    }
}

#[async_trait]
impl ScrapperApi for ScrapperClient {
    async fn register_chat(&self, chat_id: i64) -> Result<(), ScrapperError> {
        let response = self
            .client
            .post(format!("{}/tg-chat/{chat_id}", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_chat(&self, chat_id: i64) -> Result<(), ScrapperError> {
        let response = self
            .client
            .delete(format!("{}/tg-chat/{chat_id}", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn add_link(&self, chat_id: i64, request: &AddLinkRequest) -> Result<LinkResponse, ScrapperError> {
        let response = self
            .client
            .post(format!("{}/links", self.base_url))
            .header(CHAT_ID_HEADER, chat_id)
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn remove_link(&self, chat_id: i64, url: &str) -> Result<LinkResponse, ScrapperError> {
        let response = self
            .client
            .delete(format!("{}/links", self.base_url))
            .header(CHAT_ID_HEADER, chat_id)
            .json(&RemoveLinkRequest { link: url.to_string() })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_links(&self, chat_id: i64) -> Result<ListLinksResponse, ScrapperError> {
        let response = self
            .client
            .get(format!("{}/links", self.base_url))
            .header(CHAT_ID_HEADER, chat_id)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
