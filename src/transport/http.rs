use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use reqwest::Client;

use crate::api::ApiErrorResponse;
use crate::transport::{ChatMessenger, LinkUpdate, SendError, UpdateSender, deliver};

/// Posts each update straight to the bot's `/updates` endpoint.
pub struct HttpUpdateSender {
    client: Client,
    endpoint: String,
}

impl HttpUpdateSender {
    pub fn new(bot_url: &str) -> Result<Self, SendError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self::with_client(client, bot_url))
    }

    pub fn with_client(client: Client, bot_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/updates", bot_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl UpdateSender for HttpUpdateSender {
    async fn send(&self, chat_id: i64, url: &str, description: &str) -> Result<(), SendError> {
        let update = LinkUpdate {
            chat_id,
            url: url.to_string(),
            description: description.to_string(),
        };
        let response = self.client.post(&self.endpoint).json(&update).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected { status, body });
        }
        log::debug!("Bot accepted update for chat {chat_id}: {url}");
        Ok(())
    }
}

/// Bot endpoint receiving updates from the scrapper.
pub fn updates_router(messenger: Arc<dyn ChatMessenger>) -> Router {
    Router::new()
        .route("/updates", post(receive_update))
        .with_state(messenger)
}

async fn receive_update(
    State(messenger): State<Arc<dyn ChatMessenger>>,
    Json(update): Json<LinkUpdate>,
) -> impl IntoResponse {
    match deliver(messenger.as_ref(), &update).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            log::warn!("Failed to deliver update for chat {}: {}", update.chat_id, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiErrorResponse::new(StatusCode::BAD_GATEWAY, e.to_string())),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::transport::{BoxError, ChatMessenger};

    /// Records sent texts; chats listed in `failing` get an error instead.
    #[derive(Default)]
    pub struct RecordingMessenger {
        pub sent: Mutex<Vec<(i64, String)>>,
        pub failing: Vec<i64>,
    }

    #[async_trait]
    impl ChatMessenger for RecordingMessenger {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), BoxError> {
            if self.failing.contains(&chat_id) {
                return Err(format!("chat {chat_id} blocked the bot").into());
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }
}
