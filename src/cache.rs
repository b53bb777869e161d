//! SQLite-backed query result cache.
//!
//! Results are keyed by the SHA-256 of the SQL text and expire after the
//! configured TTL. Inserts prune expired rows and, when the table grows past
//! `cache.max_entries`, evict the least recently accessed overflow.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::CacheConfig;
use crate::models::{QueryResult, ResultMeta};

/// Cache key for a SQL statement.
pub fn cache_key(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Look up a cached result. Expired entries are treated as misses.
/// Hits bump the access count and last-accessed time.
pub async fn lookup(pool: &SqlitePool, sql: &str) -> Result<Option<QueryResult>> {
    let key = cache_key(sql);
    let now = Utc::now().timestamp();

    let row = sqlx::query(
        "SELECT result_data, result_metadata FROM query_cache \
         WHERE query_hash = ? AND expires_at > ?",
    )
    .bind(&key)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    sqlx::query(
        "UPDATE query_cache SET access_count = access_count + 1, last_accessed = ? \
         WHERE query_hash = ?",
    )
    .bind(now)
    .bind(&key)
    .execute(pool)
    .await?;

    let data_json: String = row.get("result_data");
    let meta_json: String = row.get("result_metadata");

    let data: Vec<serde_json::Value> = serde_json::from_str(&data_json)?;
    let metadata: ResultMeta = serde_json::from_str(&meta_json)?;

    Ok(Some(QueryResult {
        data,
        metadata,
        execution_time: 0.0,
        from_cache: true,
    }))
}

/// Store a result with the configured TTL, then clean up.
pub async fn store(
    pool: &SqlitePool,
    config: &CacheConfig,
    sql: &str,
    result: &QueryResult,
) -> Result<()> {
    let key = cache_key(sql);
    let now = Utc::now().timestamp();

    let data_json = serde_json::to_string(&result.data)?;
    let meta_json = serde_json::to_string(&result.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO query_cache (query_hash, sql_query, result_data, result_metadata, created_at, expires_at, last_accessed)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(query_hash) DO UPDATE SET
            sql_query = excluded.sql_query,
            result_data = excluded.result_data,
            result_metadata = excluded.result_metadata,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at,
            last_accessed = excluded.last_accessed
        "#,
    )
    .bind(&key)
    .bind(sql)
    .bind(&data_json)
    .bind(&meta_json)
    .bind(now)
    .bind(now + config.ttl_secs)
    .bind(now)
    .execute(pool)
    .await?;

    cleanup(pool, config).await?;

    Ok(())
}

/// Drop expired entries, then evict the least recently accessed overflow
/// when the table exceeds `max_entries` (with a little headroom so eviction
/// doesn't run on every insert).
pub async fn cleanup(pool: &SqlitePool, config: &CacheConfig) -> Result<()> {
    let now = Utc::now().timestamp();

    sqlx::query("DELETE FROM query_cache WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_cache")
        .fetch_one(pool)
        .await?;

    if count > config.max_entries {
        let evict = count - config.max_entries + 10;
        sqlx::query(
            "DELETE FROM query_cache WHERE id IN (\
             SELECT id FROM query_cache ORDER BY last_accessed ASC LIMIT ?)",
        )
        .bind(evict)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Cache statistics for the API.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: i64,
    pub active_entries: i64,
    pub expired_entries: i64,
    pub total_accesses: i64,
    pub avg_accesses: f64,
}

pub async fn stats(pool: &SqlitePool) -> Result<CacheStats> {
    let now = Utc::now().timestamp();

    let row = sqlx::query(
        "SELECT COUNT(*) as total_entries, \
         COALESCE(SUM(access_count), 0) as total_accesses, \
         COALESCE(AVG(access_count), 0.0) as avg_accesses, \
         COUNT(CASE WHEN expires_at > ? THEN 1 END) as active_entries, \
         COUNT(CASE WHEN expires_at <= ? THEN 1 END) as expired_entries \
         FROM query_cache",
    )
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(CacheStats {
        total_entries: row.get("total_entries"),
        active_entries: row.get("active_entries"),
        expired_entries: row.get("expired_entries"),
        total_accesses: row.get("total_accesses"),
        avg_accesses: row.get("avg_accesses"),
    })
}

/// Purge every entry. Returns the number removed.
pub async fn clear(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM query_cache").execute(pool).await?;
    Ok(result.rows_affected())
}
