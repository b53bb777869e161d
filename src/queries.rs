//! User-saved queries.
//!
//! Named, tagged SQL statements a user keeps for reuse. Statements pass the
//! warehouse guard on save and update; execution goes through the normal
//! cached execution path and bumps per-query usage counters.

use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::models::{format_ts_iso, SavedQuery};
use crate::warehouse;

/// Fields accepted when saving or updating a query.
pub struct SavedQueryInput {
    pub name: String,
    pub sql_query: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

fn saved_query_from_row(row: &sqlx::sqlite::SqliteRow) -> SavedQuery {
    let tags_json: String = row.get("tags");
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    SavedQuery {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        sql_query: row.get("sql_query"),
        description: row.get("description"),
        tags,
        created_at: format_ts_iso(row.get("created_at")),
        last_executed: row.get::<Option<i64>, _>("last_executed").map(format_ts_iso),
        execution_count: row.get("execution_count"),
    }
}

/// Save a query after validating the statement.
pub async fn save(
    pool: &SqlitePool,
    user_id: i64,
    input: &SavedQueryInput,
) -> Result<SavedQuery> {
    warehouse::validate_statement(&input.sql_query)?;
    if input.name.trim().is_empty() {
        anyhow::bail!("Query name must not be empty");
    }

    let tags_json = serde_json::to_string(&input.tags)?;

    let result = sqlx::query(
        "INSERT INTO saved_queries (user_id, name, sql_query, description, tags, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&input.name)
    .bind(&input.sql_query)
    .bind(&input.description)
    .bind(&tags_json)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    get(pool, id, user_id)
        .await?
        .ok_or_else(|| anyhow!("Failed to save query"))
}

pub async fn get(pool: &SqlitePool, id: i64, user_id: i64) -> Result<Option<SavedQuery>> {
    let row = sqlx::query("SELECT * FROM saved_queries WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(saved_query_from_row))
}

pub async fn list(pool: &SqlitePool, user_id: i64) -> Result<Vec<SavedQuery>> {
    let rows = sqlx::query(
        "SELECT * FROM saved_queries WHERE user_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(saved_query_from_row).collect())
}

/// Replace a saved query's fields. Returns `None` for an unknown id.
pub async fn update(
    pool: &SqlitePool,
    id: i64,
    user_id: i64,
    input: &SavedQueryInput,
) -> Result<Option<SavedQuery>> {
    if get(pool, id, user_id).await?.is_none() {
        return Ok(None);
    }

    warehouse::validate_statement(&input.sql_query)?;
    let tags_json = serde_json::to_string(&input.tags)?;

    sqlx::query(
        "UPDATE saved_queries SET name = ?, sql_query = ?, description = ?, tags = ? \
         WHERE id = ? AND user_id = ?",
    )
    .bind(&input.name)
    .bind(&input.sql_query)
    .bind(&input.description)
    .bind(&tags_json)
    .bind(id)
    .bind(user_id)
    .execute(pool)
    .await?;

    get(pool, id, user_id).await
}

/// Delete a saved query. Returns whether it existed.
pub async fn delete(pool: &SqlitePool, id: i64, user_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM saved_queries WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Bump execution statistics after a run.
pub async fn record_execution(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE saved_queries SET last_executed = ?, execution_count = execution_count + 1 \
         WHERE id = ?",
    )
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
