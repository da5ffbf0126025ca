//! Relational sink backed by SQLite
//!
//! One row per (publisherId, extensionId). Writes are upserts, so replaying a
//! batch leaves the table unchanged.

use crate::error::SinkWriteError;
use crate::models::{format_timestamp, CompositeKey, ExtensionRecord};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS vscode_extensions (
    publisherId TEXT NOT NULL,
    publisherName TEXT NOT NULL,
    publisherDisplayName TEXT NOT NULL,
    extensionId TEXT NOT NULL,
    extensionName TEXT NOT NULL,
    extensionDisplayName TEXT NOT NULL,
    lastUpdated TEXT NOT NULL,
    publishedDate TEXT NOT NULL,
    categories TEXT NOT NULL,
    install INTEGER NOT NULL,
    averagerating REAL NOT NULL,
    ratingcount INTEGER NOT NULL,
    trendingdaily REAL NOT NULL,
    trendingmonthly REAL NOT NULL,
    downloadCount INTEGER NOT NULL,
    PRIMARY KEY (publisherId, extensionId)
)
"#;

const UPSERT: &str = r#"
INSERT INTO vscode_extensions (
    publisherId, publisherName, publisherDisplayName,
    extensionId, extensionName, extensionDisplayName,
    lastUpdated, publishedDate, categories,
    install, averagerating, ratingcount,
    trendingdaily, trendingmonthly, downloadCount
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
ON CONFLICT(publisherId, extensionId) DO UPDATE SET
    publisherName = excluded.publisherName,
    publisherDisplayName = excluded.publisherDisplayName,
    extensionName = excluded.extensionName,
    extensionDisplayName = excluded.extensionDisplayName,
    lastUpdated = excluded.lastUpdated,
    publishedDate = excluded.publishedDate,
    categories = excluded.categories,
    install = excluded.install,
    averagerating = excluded.averagerating,
    ratingcount = excluded.ratingcount,
    trendingdaily = excluded.trendingdaily,
    trendingmonthly = excluded.trendingmonthly,
    downloadCount = excluded.downloadCount
"#;

/// Keyed extension table
#[derive(Debug, Clone)]
pub struct ExtensionStore {
    pool: SqlitePool,
}

impl ExtensionStore {
    /// Open (creating if needed) the database at `url` and ensure the table exists
    pub async fn connect(url: &str, busy_timeout: Duration) -> Result<Self, SinkWriteError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        // Single writer; batches are committed one at a time.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        info!(url, "Opened extension store");

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, SinkWriteError> {
        Ok(self.pool.begin().await?)
    }

    /// Upsert every record in its own transaction
    pub async fn write_store(&self, records: &[ExtensionRecord]) -> Result<usize, SinkWriteError> {
        let mut tx = self.begin().await?;
        let written = upsert_in(&mut tx, records).await?;
        tx.commit().await?;
        Ok(written)
    }

    pub async fn count(&self) -> Result<u64, SinkWriteError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM vscode_extensions")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Look up one extension by composite key
    pub async fn fetch(&self, key: &CompositeKey) -> Result<Option<ExtensionRecord>, SinkWriteError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM vscode_extensions WHERE publisherId = ?1 AND extensionId = ?2
            "#,
        )
        .bind(&key.publisher_id)
        .bind(&key.extension_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Upsert `records` inside an open transaction; nothing is committed here
pub async fn upsert_in(
    tx: &mut Transaction<'_, Sqlite>,
    records: &[ExtensionRecord],
) -> Result<usize, SinkWriteError> {
    for record in records {
        sqlx::query(UPSERT)
            .bind(&record.publisher_id)
            .bind(&record.publisher_name)
            .bind(&record.publisher_display_name)
            .bind(&record.extension_id)
            .bind(&record.extension_name)
            .bind(&record.extension_display_name)
            .bind(format_timestamp(&record.last_updated))
            .bind(format_timestamp(&record.published_date))
            .bind(record.categories_json()?)
            .bind(sql_int(record.install))
            .bind(record.average_rating)
            .bind(sql_int(record.rating_count))
            .bind(record.trending_daily)
            .bind(record.trending_monthly)
            .bind(sql_int(record.download_count))
            .execute(&mut **tx)
            .await?;
    }

    debug!(rows = records.len(), "Upserted batch");
    Ok(records.len())
}

// Counts above i64::MAX are rejected during normalization.
fn sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn record_from_row(row: &SqliteRow) -> Result<ExtensionRecord, SinkWriteError> {
    let categories: String = row.try_get("categories")?;

    Ok(ExtensionRecord {
        publisher_id: row.try_get("publisherId")?,
        publisher_name: row.try_get("publisherName")?,
        publisher_display_name: row.try_get("publisherDisplayName")?,
        extension_id: row.try_get("extensionId")?,
        extension_name: row.try_get("extensionName")?,
        extension_display_name: row.try_get("extensionDisplayName")?,
        last_updated: timestamp_column(row, "lastUpdated")?,
        published_date: timestamp_column(row, "publishedDate")?,
        categories: serde_json::from_str(&categories)?,
        install: count_column(row, "install")?,
        average_rating: row.try_get("averagerating")?,
        rating_count: count_column(row, "ratingcount")?,
        trending_daily: row.try_get("trendingdaily")?,
        trending_monthly: row.try_get("trendingmonthly")?,
        download_count: count_column(row, "downloadCount")?,
    })
}

fn timestamp_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, SinkWriteError> {
    let text: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SinkWriteError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u64, SinkWriteError> {
    let value: i64 = row.try_get(column)?;
    Ok(u64::try_from(value).unwrap_or_default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::fixtures::record;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> ExtensionStore {
        let url = format!("sqlite:{}", dir.path().join("store.db").display());
        ExtensionStore::connect(&url, Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let batch = vec![record("pub", "a", 1), record("pub", "b", 2)];

        store.write_store(&batch).await.unwrap();
        store.write_store(&batch).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        let stored = store.fetch(&CompositeKey::new("pub", "a")).await.unwrap();
        assert_eq!(stored, Some(batch[0].clone()));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_on_conflict() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.write_store(&[record("pub", "a", 1)]).await.unwrap();
        store.write_store(&[record("pub", "a", 500)]).await.unwrap();

        let stored = store
            .fetch(&CompositeKey::new("pub", "a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.install, 500);
        assert_eq!(stored.download_count, 1000);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_leaves_no_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut tx = store.begin().await.unwrap();
        upsert_in(&mut tx, &[record("pub", "a", 1)]).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_table_survives_reconnect() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.write_store(&[record("pub", "a", 1)]).await.unwrap();
        store.close().await;

        let reopened = open_store(&dir).await;
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let stored = store.fetch(&CompositeKey::new("pub", "nope")).await.unwrap();
        assert!(stored.is_none());
    }
}
