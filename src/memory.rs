//! Conversation memory.
//!
//! Every question a user asks is recorded with the SQL it produced, a
//! truncated result summary, and timing. The most recent exchanges of a
//! session are replayed into the translation prompt so follow-up questions
//! ("and only for Europe?") resolve against earlier ones.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::models::{format_ts_iso, ConversationEntry};

/// Result summaries are truncated to this length before storage.
pub const SUMMARY_MAX_LEN: usize = 500;

pub struct MemoryRecord<'a> {
    pub user_id: i64,
    pub session_id: &'a str,
    pub query_text: &'a str,
    pub sql_query: Option<&'a str>,
    pub result_summary: Option<&'a str>,
    pub query_type: Option<&'a str>,
    pub execution_time: Option<f64>,
    pub row_count: Option<i64>,
}

/// Store one exchange. Summaries longer than [`SUMMARY_MAX_LEN`] are
/// truncated at a char boundary.
pub async fn store(pool: &SqlitePool, record: MemoryRecord<'_>) -> Result<()> {
    let summary = record.result_summary.map(truncate_summary);

    sqlx::query(
        "INSERT INTO conversation_memory \
         (user_id, session_id, query_text, sql_query, result_summary, query_type, execution_time, row_count, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.user_id)
    .bind(record.session_id)
    .bind(record.query_text)
    .bind(record.sql_query)
    .bind(summary)
    .bind(record.query_type)
    .bind(record.execution_time)
    .bind(record.row_count)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

fn truncate_summary(s: &str) -> String {
    if s.len() <= SUMMARY_MAX_LEN {
        return s.to_string();
    }
    let mut end = SUMMARY_MAX_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Fetch history for a user, newest first, optionally scoped to a session.
pub async fn history(
    pool: &SqlitePool,
    user_id: i64,
    session_id: Option<&str>,
    limit: i64,
) -> Result<Vec<ConversationEntry>> {
    let rows = match session_id {
        Some(sid) => {
            sqlx::query(
                "SELECT * FROM conversation_memory WHERE user_id = ? AND session_id = ? \
                 ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(user_id)
            .bind(sid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT * FROM conversation_memory WHERE user_id = ? \
                 ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(user_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .iter()
        .map(|row| ConversationEntry {
            id: row.get("id"),
            user_id: row.get("user_id"),
            session_id: row.get("session_id"),
            query_text: row.get("query_text"),
            sql_query: row.get("sql_query"),
            result_summary: row.get("result_summary"),
            query_type: row.get("query_type"),
            execution_time: row.get("execution_time"),
            row_count: row.get("row_count"),
            created_at: format_ts_iso(row.get("created_at")),
        })
        .collect())
}

/// Render the recent exchanges of a session as `Q:`/`A:` lines in
/// chronological order, for the translation prompt. Empty string when the
/// session has no history.
pub async fn recent_context(
    pool: &SqlitePool,
    user_id: i64,
    session_id: &str,
    context_window: i64,
) -> Result<String> {
    let entries = history(pool, user_id, Some(session_id), context_window).await?;

    let mut parts = Vec::new();
    for entry in entries.iter().rev() {
        parts.push(format!("Q: {}", entry.query_text));
        if let Some(ref summary) = entry.result_summary {
            parts.push(format!("A: {}", summary));
        }
    }

    Ok(parts.join("\n"))
}
