//! Persistent content-addressed cache for fetched manifest shards and the
//! graph blob, keyed by the SHA-256 the manifest declares.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blobs (
    sha256 TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    bytes BLOB NOT NULL,
    fetched_at INTEGER NOT NULL
);
";

/// A content-addressed byte cache backed by SQLite. A read is keyed by the
/// caller's declared content hash; a hash that isn't present is a miss, and
/// there is no other notion of staleness since the key IS the content hash.
pub struct AssetCache {
    pool: SqlitePool,
}

impl AssetCache {
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        let path_str = path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{path_str}?mode=rwc");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// An unbacked cache useful for `--no-cache` runs and tests.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Look up a cached blob by its declared content hash.
    pub async fn get(&self, sha256: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT bytes FROM blobs WHERE sha256 = ?1")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(bytes,)| bytes))
    }

    pub async fn put(&self, sha256: &str, url: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let fetched_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        sqlx::query(
            "INSERT INTO blobs (sha256, url, bytes, fetched_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sha256) DO UPDATE SET url = excluded.url, bytes = excluded.bytes, fetched_at = excluded.fetched_at",
        )
        .bind(sha256)
        .bind(url)
        .bind(bytes)
        .bind(fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
