//! Scrapper HTTP API used by the bot to manage chats and subscriptions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::chats::repository::ChatRepository;
use crate::clients::Service;
use crate::db::{Storage, StoreError};
use crate::links::TrackedLink;
use crate::links::repository::LinkRepository;

pub const CHAT_ID_HEADER: &str = "Tg-Chat-Id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddLinkRequest {
    pub link: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveLinkRequest {
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkResponse {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

impl From<TrackedLink> for LinkResponse {
    fn from(tracked: TrackedLink) -> Self {
        Self {
            id: tracked.link.id,
            url: tracked.link.url,
            tags: tracked.tags,
            filters: tracked.filters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListLinksResponse {
    pub links: Vec<LinkResponse>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub description: String,
    pub code: String,
}

impl ApiErrorResponse {
    pub fn new(status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            code: status.as_u16().to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(e) if !e.is_domain() => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(StoreError::ChatAlreadyExists(_) | StoreError::LinkAlreadyExists(_)) => {
                StatusCode::CONFLICT
            }
            ApiError::Store(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let description = if status.is_server_error() {
            log::error!("Request failed: {self}");
            "internal error".to_string()
        } else {
            log::debug!("Request rejected with {status}: {self}");
            self.to_string()
        };
        (status, Json(ApiErrorResponse::new(status, description))).into_response()
    }
}

pub fn router(storage: Storage) -> Router {
    Router::new()
        .route("/tg-chat/:id", post(register_chat).delete(delete_chat))
        .route("/links", post(add_link).get(list_links).delete(remove_link))
        .with_state(storage)
}

fn chat_id(headers: &HeaderMap) -> Result<i64, ApiError> {
    let raw = headers
        .get(CHAT_ID_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("{CHAT_ID_HEADER} header is required")))?;
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{CHAT_ID_HEADER} must be an integer")))
}

async fn register_chat(State(storage): State<Storage>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    storage.chats().add_chat(id).await?;
    log::info!("Registered chat {id}");
    Ok(StatusCode::OK)
}

async fn delete_chat(State(storage): State<Storage>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    storage.chats().delete_chat(id).await?;
    log::info!("Deleted chat {id}");
    Ok(StatusCode::OK)
}

async fn list_links(State(storage): State<Storage>, headers: HeaderMap) -> Result<Json<ListLinksResponse>, ApiError> {
    let chat_id = chat_id(&headers)?;
    let links: Vec<LinkResponse> = storage
        .links()
        .get_links_with_chat(chat_id)
        .await?
        .into_iter()
        .map(LinkResponse::from)
        .collect();
    Ok(Json(ListLinksResponse {
        size: links.len(),
        links,
    }))
}

async fn add_link(
    State(storage): State<Storage>,
    headers: HeaderMap,
    body: Result<Json<AddLinkRequest>, JsonRejection>,
) -> Result<Json<LinkResponse>, ApiError> {
    let chat_id = chat_id(&headers)?;
    let Json(request) = body?;
    let link = request.link.trim().to_string();
    Service::from_url(&link).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let id = storage
        .links()
        .add_link(chat_id, &link, &request.tags, &request.filters)
        .await?;
    log::info!("Chat {chat_id} tracks {link}");
    Ok(Json(LinkResponse {
        id,
        url: link,
        tags: request.tags,
        filters: request.filters,
    }))
}

async fn remove_link(
    State(storage): State<Storage>,
    headers: HeaderMap,
    body: Result<Json<RemoveLinkRequest>, JsonRejection>,
) -> Result<Json<LinkResponse>, ApiError> {
    let chat_id = chat_id(&headers)?;
    let Json(request) = body?;

    let removed = storage.links().delete_link(chat_id, request.link.trim()).await?;
    log::info!("Chat {chat_id} stopped tracking {}", removed.url);
    Ok(Json(LinkResponse {
        id: removed.id,
        url: removed.url,
        tags: Vec::new(),
        filters: Vec::new(),
    }))
}
