//! Statements over a single connection.
//!
//! Every helper takes `&mut SqliteConnection` so it can run either on a
//! pooled connection or inside a transaction opened by the `Transactor`.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::db::StoreError;
use crate::links::Link;

const LINK_COLUMNS: &str = "l.id AS id, l.url AS url, l.updated_at AS updated_at, l.is_active AS is_active";

pub async fn find_link_by_url(conn: &mut SqliteConnection, url: &str) -> Result<Option<Link>, StoreError> {
    let link = sqlx::query_as::<_, Link>(&format!("SELECT {LINK_COLUMNS} FROM links l WHERE l.url = ?1"))
        .bind(url)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(link)
}

pub async fn insert_link(conn: &mut SqliteConnection, url: &str, now: DateTime<Utc>) -> Result<i64, StoreError> {
    let id = sqlx::query_scalar("INSERT INTO links (url, updated_at, is_active) VALUES (?1, ?2, FALSE) RETURNING id")
        .bind(url)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn find_subscription(
    conn: &mut SqliteConnection,
    chat_id: i64,
    link_id: i64,
) -> Result<Option<i64>, StoreError> {
    let id = sqlx::query_scalar("SELECT id FROM subscriptions WHERE chat_id = ?1 AND link_id = ?2")
        .bind(chat_id)
        .bind(link_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn insert_subscription(
    conn: &mut SqliteConnection,
    chat_id: i64,
    link_id: i64,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let id = sqlx::query_scalar(
        "INSERT INTO subscriptions (chat_id, link_id, created_at) VALUES (?1, ?2, ?3) RETURNING id",
    )
    .bind(chat_id)
    .bind(link_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn insert_tag(conn: &mut SqliteConnection, subscription_id: i64, name: &str) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO tags (subscription_id, name) VALUES (?1, ?2)")
        .bind(subscription_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn insert_filter(conn: &mut SqliteConnection, subscription_id: i64, value: &str) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO filters (subscription_id, value) VALUES (?1, ?2)")
        .bind(subscription_id)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_subscription(conn: &mut SqliteConnection, subscription_id: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM subscriptions WHERE id = ?1")
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn count_subscriptions(conn: &mut SqliteConnection, link_id: i64) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE link_id = ?1")
        .bind(link_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn delete_link(conn: &mut SqliteConnection, link_id: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM links WHERE id = ?1")
        .bind(link_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Moves the freshness cursor to `now`, never backwards.
pub async fn touch_link(conn: &mut SqliteConnection, link_id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE links
        SET updated_at = CASE WHEN updated_at < ?1 THEN ?1 ELSE updated_at END
        WHERE id = ?2
        "#,
    )
    .bind(now)
    .bind(link_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_activity(conn: &mut SqliteConnection, link_id: i64, active: bool) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE links SET is_active = ?1 WHERE id = ?2")
        .bind(active)
        .bind(link_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn oldest_links(conn: &mut SqliteConnection, limit: u32) -> Result<Vec<Link>, StoreError> {
    let links = sqlx::query_as::<_, Link>(&format!(
        "SELECT {LINK_COLUMNS} FROM links l ORDER BY l.updated_at ASC, l.id ASC LIMIT ?1"
    ))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;
    Ok(links)
}

pub async fn count_links(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM links")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn chat_links(
    conn: &mut SqliteConnection,
    chat_id: i64,
    only_active: bool,
) -> Result<Vec<(i64, Link)>, StoreError> {
    let active_clause = if only_active { "AND l.is_active = TRUE" } else { "" };
    let rows = sqlx::query_as::<_, SubscribedLinkRow>(&format!(
        r#"
        SELECT s.id AS subscription_id, {LINK_COLUMNS}
        FROM subscriptions s
        JOIN links l ON l.id = s.link_id
        WHERE s.chat_id = ?1 {active_clause}
        ORDER BY l.id
        "#
    ))
    .bind(chat_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().map(|r| (r.subscription_id, r.link)).collect())
}

pub async fn subscription_tags(conn: &mut SqliteConnection, subscription_id: i64) -> Result<Vec<String>, StoreError> {
    let tags = sqlx::query_scalar("SELECT name FROM tags WHERE subscription_id = ?1 ORDER BY name")
        .bind(subscription_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(tags)
}

pub async fn subscription_filters(
    conn: &mut SqliteConnection,
    subscription_id: i64,
) -> Result<Vec<String>, StoreError> {
    let filters = sqlx::query_scalar("SELECT value FROM filters WHERE subscription_id = ?1 ORDER BY value")
        .bind(subscription_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(filters)
}

struct SubscribedLinkRow {
    subscription_id: i64,
    link: Link,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for SubscribedLinkRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::{FromRow, Row};
        Ok(Self {
            subscription_id: row.try_get("subscription_id")?,
            link: Link::from_row(row)?,
        })
    }
}
