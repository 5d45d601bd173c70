use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use crate::clients::transport::ResilientTransport;
use crate::clients::{ClientError, Update, UpdateClient, parse_link, path_segments};
use crate::utils::preview;

#[derive(Deserialize, Debug)]
struct Owner {
    display_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Post {
    owner: Option<Owner>,
    #[serde(with = "chrono::serde::ts_seconds")]
    creation_date: DateTime<Utc>,
    body: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Items {
    items: Vec<Post>,
}

pub struct StackOverflowClient {
    transport: ResilientTransport,
    base_url: String,
    key: Option<String>,
}

impl StackOverflowClient {
    pub fn new(transport: ResilientTransport, base_url: String, key: Option<String>) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        }
    }

    /// `https://stackoverflow.com/questions/{id}[/slug]` → `id`.
    pub fn question_id(link: &str) -> Result<u64, ClientError> {
        let url = parse_link(link)?;
        let segments = path_segments(&url);
        match segments.as_slice() {
            [questions, id, ..] if questions == "questions" => id.parse().map_err(|_| ClientError::InvalidLink {
                url: link.to_string(),
                reason: format!("question id {id:?} is not a number"),
            }),
            _ => Err(ClientError::InvalidLink {
                url: link.to_string(),
                reason: "expected /questions/{id}".to_string(),
            }),
        }
    }

    fn request(&self, client: &Client, url: &str) -> RequestBuilder {
        let mut req = client
            .get(url)
            .query(&[
                ("site", "stackoverflow"),
                ("filter", "withbody"),
                ("order", "desc"),
                ("sort", "creation"),
            ])
            .header("Accept", "application/json");
        if let Some(key) = &self.key {
            req = req.query(&[("key", key)]);
        }
        req
    }

    async fn fetch(&self, url: &str) -> Result<Vec<Post>, ClientError> {
        let response = self.transport.execute(|client| self.request(client, url)).await?;
        let items: Items = response.json().await.map_err(ClientError::Decode)?;
        Ok(items.items)
    }
}

fn to_update(kind: &str, post: Post) -> Update {
    Update {
        title: kind.to_string(),
        author: post.owner.and_then(|o| o.display_name).unwrap_or_default(),
        created_at: post.creation_date,
        body: preview(post.body.as_deref()),
    }
}

#[async_trait]
impl UpdateClient for StackOverflowClient {
    async fn retrieve_updates(&self, url: &str) -> Result<Vec<Update>, ClientError> {
        let id = Self::question_id(url)?;
        let question_api = format!("{}/questions/{id}", self.base_url);

        let answers = self.fetch(&format!("{question_api}/answers")).await?;
        let comments = self.fetch(&format!("{question_api}/comments")).await?;
        log::debug!(
            "StackOverflow question {id}: {} answers, {} comments",
            answers.len(),
            comments.len()
        );

        Ok(answers
            .into_iter()
            .map(|post| to_update("answer", post))
            .chain(comments.into_iter().map(|post| to_update("comment", post)))
            .collect())
    }
}
