use async_trait::async_trait;

use crate::chats::repository::chat_exists;
use crate::db::{StoreError, Transactor};
use crate::links::queries;
use crate::links::{Link, TrackedLink};

#[async_trait]
pub trait LinkRepository: Send + Sync {
    /// Subscribes `chat_id` to `url`, reusing the link row when another chat
    /// already tracks it. All-or-nothing.
    async fn add_link(&self, chat_id: i64, url: &str, tags: &[String], filters: &[String]) -> Result<i64, StoreError>;
    /// Removes the chat's subscription and returns the link it pointed to.
    async fn delete_link(&self, chat_id: i64, url: &str) -> Result<Link, StoreError>;
    async fn touch_link(&self, link_id: i64) -> Result<(), StoreError>;
    async fn update_activity(&self, link_id: i64, active: bool) -> Result<(), StoreError>;
    /// Up to `size` links, least recently polled first.
    async fn get_batch(&self, size: u32) -> Result<Vec<Link>, StoreError>;
    async fn count_links(&self) -> Result<i64, StoreError>;
    async fn get_links_with_chat(&self, chat_id: i64) -> Result<Vec<TrackedLink>, StoreError>;
    async fn get_links_with_chat_active(&self, chat_id: i64) -> Result<Vec<Link>, StoreError>;
}

pub struct SqliteLinkRepository {
    transactor: Transactor,
}

impl SqliteLinkRepository {
    pub fn new(transactor: Transactor) -> Self {
        Self { transactor }
    }
}

#[async_trait]
impl LinkRepository for SqliteLinkRepository {
    async fn add_link(&self, chat_id: i64, url: &str, tags: &[String], filters: &[String]) -> Result<i64, StoreError> {
        let url = url.to_string();
        let tags = tags.to_vec();
        let filters = filters.to_vec();

        self.transactor
            .with_transaction(move |conn| {
                Box::pin(async move {
                    if !chat_exists(conn, chat_id).await? {
                        return Err(StoreError::ChatNotFound(chat_id));
                    }

                    let now = chrono::Utc::now();
                    let link_id = match queries::find_link_by_url(conn, &url).await? {
                        Some(existing) => existing.id,
                        None => queries::insert_link(conn, &url, now).await?,
                    };

                    if queries::find_subscription(conn, chat_id, link_id).await?.is_some() {
                        return Err(StoreError::LinkAlreadyExists(url));
                    }

                    let subscription_id = queries::insert_subscription(conn, chat_id, link_id, now).await?;
                    for tag in &tags {
                        queries::insert_tag(conn, subscription_id, tag).await?;
                    }
                    for filter in &filters {
                        queries::insert_filter(conn, subscription_id, filter).await?;
                    }

                    log::debug!("Chat {chat_id} now tracks link {link_id} ({url})");
                    Ok(link_id)
                })
            })
            .await
    }

    async fn delete_link(&self, chat_id: i64, url: &str) -> Result<Link, StoreError> {
        let url = url.to_string();

        self.transactor
            .with_transaction(move |conn| {
                Box::pin(async move {
                    if !chat_exists(conn, chat_id).await? {
                        return Err(StoreError::ChatNotFound(chat_id));
                    }

                    let Some(link) = queries::find_link_by_url(conn, &url).await? else {
                        return Err(StoreError::LinkNotFound(url));
                    };
                    let Some(subscription_id) = queries::find_subscription(conn, chat_id, link.id).await? else {
                        return Err(StoreError::LinkNotFound(url));
                    };

                    queries::delete_subscription(conn, subscription_id).await?;
                    if queries::count_subscriptions(conn, link.id).await? == 0 {
                        log::debug!("Last subscription to {url} removed, deleting link {}", link.id);
                        queries::delete_link(conn, link.id).await?;
                    }

                    Ok(link)
                })
            })
            .await
    }

    async fn touch_link(&self, link_id: i64) -> Result<(), StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        if !queries::touch_link(&mut conn, link_id, chrono::Utc::now()).await? {
            log::debug!("Touch skipped, link {link_id} no longer exists");
        }
        Ok(())
    }

    async fn update_activity(&self, link_id: i64, active: bool) -> Result<(), StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        if !queries::set_activity(&mut conn, link_id, active).await? {
            log::debug!("Activity update skipped, link {link_id} no longer exists");
        }
        Ok(())
    }

    async fn get_batch(&self, size: u32) -> Result<Vec<Link>, StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        queries::oldest_links(&mut conn, size).await
    }

    async fn count_links(&self) -> Result<i64, StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        queries::count_links(&mut conn).await
    }

    async fn get_links_with_chat(&self, chat_id: i64) -> Result<Vec<TrackedLink>, StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        if !chat_exists(&mut conn, chat_id).await? {
            return Err(StoreError::ChatNotFound(chat_id));
        }

        let rows = queries::chat_links(&mut conn, chat_id, false).await?;
        let mut tracked = Vec::with_capacity(rows.len());
        for (subscription_id, link) in rows {
            tracked.push(TrackedLink {
                tags: queries::subscription_tags(&mut conn, subscription_id).await?,
                filters: queries::subscription_filters(&mut conn, subscription_id).await?,
                subscription_id,
                link,
            });
        }
        Ok(tracked)
    }

    async fn get_links_with_chat_active(&self, chat_id: i64) -> Result<Vec<Link>, StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        let rows = queries::chat_links(&mut conn, chat_id, true).await?;
        Ok(rows.into_iter().map(|(_, link)| link).collect())
    }
}
