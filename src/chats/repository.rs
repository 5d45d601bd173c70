use async_trait::async_trait;
use sqlx::{self, SqliteConnection};

use crate::db::{StoreError, Transactor, is_unique_violation};

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn add_chat(&self, chat_id: i64) -> Result<(), StoreError>;
    async fn delete_chat(&self, chat_id: i64) -> Result<(), StoreError>;
    async fn exists_chat(&self, chat_id: i64) -> Result<bool, StoreError>;
    async fn get_chat_ids(&self) -> Result<Vec<i64>, StoreError>;
}

pub struct SqliteChatRepository {
    transactor: Transactor,
}

impl SqliteChatRepository {
    pub fn new(transactor: Transactor) -> Self {
        Self { transactor }
    }
}

pub(crate) async fn chat_exists(conn: &mut SqliteConnection, chat_id: i64) -> Result<bool, StoreError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM chats WHERE id = ?1")
        .bind(chat_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

/// Links nobody subscribes to any more are dropped so the updater stops
/// polling them.
pub(crate) async fn delete_orphan_links(conn: &mut SqliteConnection) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        DELETE FROM links
        WHERE NOT EXISTS (SELECT 1 FROM subscriptions s WHERE s.link_id = links.id)
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl ChatRepository for SqliteChatRepository {
    async fn add_chat(&self, chat_id: i64) -> Result<(), StoreError> {
        let now = chrono::Utc::now();
        let result = sqlx::query("INSERT INTO chats (id, created_at) VALUES (?1, ?2)")
            .bind(chat_id)
            .bind(now)
            .execute(self.transactor.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::ChatAlreadyExists(chat_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_chat(&self, chat_id: i64) -> Result<(), StoreError> {
        self.transactor
            .with_transaction(move |conn| {
                Box::pin(async move {
                    let deleted = sqlx::query("DELETE FROM chats WHERE id = ?1")
                        .bind(chat_id)
                        .execute(&mut *conn)
                        .await?;
                    if deleted.rows_affected() == 0 {
                        return Err(StoreError::ChatNotFound(chat_id));
                    }

                    let orphans = delete_orphan_links(conn).await?;
                    log::debug!("Deleted chat {chat_id}, dropped {orphans} orphaned links");
                    Ok(())
                })
            })
            .await
    }

    async fn exists_chat(&self, chat_id: i64) -> Result<bool, StoreError> {
        let mut conn = self.transactor.pool().acquire().await?;
        chat_exists(&mut conn, chat_id).await
    }

    async fn get_chat_ids(&self) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar("SELECT id FROM chats ORDER BY id")
            .fetch_all(self.transactor.pool())
            .await?;
        Ok(ids)
    }
}
