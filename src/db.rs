use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::chats::repository::{ChatRepository, SqliteChatRepository};
use crate::configuration::ScrapperConfiguration;
use crate::links::repository::{LinkRepository, SqliteLinkRepository};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat {0} is already registered")]
    ChatAlreadyExists(i64),
    #[error("chat {0} is not registered")]
    ChatNotFound(i64),
    #[error("link {0} is already tracked")]
    LinkAlreadyExists(String),
    #[error("link {0} is not tracked")]
    LinkNotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{source} (rollback failed: {rollback})")]
    Rollback {
        source: Box<StoreError>,
        rollback: sqlx::Error,
    },
}

impl StoreError {
    /// Sentinel conditions the caller is expected to handle, as opposed to
    /// infrastructure failures.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            StoreError::ChatAlreadyExists(_)
                | StoreError::ChatNotFound(_)
                | StoreError::LinkAlreadyExists(_)
                | StoreError::LinkNotFound(_)
        )
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Runs multi-statement writes atomically.
///
/// The closure receives the transaction's connection. Query helpers in this
/// crate take `&mut SqliteConnection`, so any helper called with it joins the
/// enclosing transaction instead of checking out another pooled connection.
#[derive(Clone)]
pub struct Transactor {
    pool: SqlitePool,
}

impl Transactor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let mut tx = self.pool.begin().await?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => match tx.rollback().await {
                Ok(()) => Err(err),
                Err(rollback) => {
                    log::error!("Rollback failed after {err}: {rollback}");
                    Err(StoreError::Rollback {
                        source: Box::new(err),
                        rollback,
                    })
                }
            },
        }
    }
}

/// The repositories the scrapper works with, wired to one pool.
#[derive(Clone)]
pub struct Storage {
    chats: Arc<dyn ChatRepository>,
    links: Arc<dyn LinkRepository>,
}

impl Storage {
    pub fn new(pool: SqlitePool) -> Self {
        let transactor = Transactor::new(pool);
        let chats = Arc::new(SqliteChatRepository::new(transactor.clone())) as Arc<dyn ChatRepository>;
        let links = Arc::new(SqliteLinkRepository::new(transactor)) as Arc<dyn LinkRepository>;
        Self { chats, links }
    }

    pub fn chats(&self) -> Arc<dyn ChatRepository> {
        self.chats.clone()
    }

    pub fn links(&self) -> Arc<dyn LinkRepository> {
        self.links.clone()
    }
}

pub async fn initialize_db(config: &ScrapperConfiguration) -> Result<SqlitePool, StoreError> {
    log::debug!("Initializing database with path {}", config.database_path);
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.database_path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database_max_connections.max(1))
        .connect_with(options)
        .await?;

    log::debug!("Running migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;
    log::debug!("Database initialized");

    Ok(pool)
}
