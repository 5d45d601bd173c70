pub mod queries;
pub mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// A tracked external resource.
///
/// `updated_at` is the freshness cursor (last poll), `is_active` records
/// activity that has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: i64,
    pub url: String,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

impl<'r> FromRow<'r, SqliteRow> for Link {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let url: String = row.try_get("url")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        let is_active: bool = row.try_get("is_active")?;

        Ok(Self {
            id,
            url,
            updated_at,
            is_active,
        })
    }
}

/// A link as one chat tracks it, with that subscription's tags and filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedLink {
    pub link: Link,
    pub subscription_id: i64,
    pub tags: Vec<String>,
    pub filters: Vec<String>,
}
