//! The conversational query pipeline.
//!
//! One user question flows through: conversation context lookup → SQL
//! translation → guarded warehouse execution → insight generation → chart
//! recommendation → follow-up suggestions → memory write-back. Used by both
//! `POST /analytics/query` and the `cva ask` CLI command.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;
use uuid::Uuid;

use crate::assistant::Assistant;
use crate::config::Config;
use crate::db;
use crate::memory::{self, MemoryRecord};
use crate::models::{ChartRecommendation, QueryResult, User};
use crate::warehouse::WarehouseClient;

/// Everything the pipeline produced for one question.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query_id: String,
    pub session_id: String,
    pub original_query: String,
    pub sql_query: String,
    pub explanation: String,
    pub query_type: String,
    pub data: Vec<serde_json::Value>,
    pub metadata: crate::models::ResultMeta,
    pub insights: String,
    pub chart_recommendation: ChartRecommendation,
    pub follow_up_suggestions: Vec<String>,
    pub execution_time: f64,
    pub from_cache: bool,
    pub timestamp: String,
}

/// Run the full pipeline for one question.
///
/// Translation and execution failures are recorded in conversation memory
/// (as `query_type = "error"`) and returned to the caller. Insight, chart,
/// and follow-up generation degrade to fallbacks inside the assistant and
/// never fail the pipeline.
pub async fn execute_question(
    config: &Config,
    pool: &SqlitePool,
    client: &WarehouseClient,
    assistant: &Assistant,
    user: &User,
    question: &str,
    session_id: Option<String>,
    use_cache: bool,
) -> Result<QueryOutcome> {
    let start = Instant::now();
    let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let context = memory::recent_context(pool, user.id, &session_id, config.memory.context_window)
        .await
        .unwrap_or_default();

    let translation = match assistant.translate(question, &context).await {
        Ok(t) => t,
        Err(e) => {
            record_failure(pool, user.id, &session_id, question, &e).await;
            return Err(e.context("Failed to generate SQL"));
        }
    };

    let result: QueryResult = match client
        .execute(pool, &translation.sql_query, use_cache)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            record_failure(pool, user.id, &session_id, question, &e).await;
            return Err(e.context("Query execution failed"));
        }
    };

    let insights = assistant.insights(&result, question).await;
    let chart_recommendation = assistant.chart_recommendation(&result, question).await;
    let follow_up_suggestions = assistant.follow_ups(question, &result).await;

    let total_execution_time = start.elapsed().as_secs_f64();

    memory::store(
        pool,
        MemoryRecord {
            user_id: user.id,
            session_id: &session_id,
            query_text: question,
            sql_query: Some(&translation.sql_query),
            result_summary: Some(&insights),
            query_type: Some(&translation.query_type),
            execution_time: Some(total_execution_time),
            row_count: Some(result.data.len() as i64),
        },
    )
    .await?;

    Ok(QueryOutcome {
        query_id: Uuid::new_v4().to_string(),
        session_id,
        original_query: question.to_string(),
        sql_query: translation.sql_query,
        explanation: translation.explanation,
        query_type: translation.query_type,
        metadata: result.metadata.clone(),
        data: result.data,
        insights,
        chart_recommendation,
        follow_up_suggestions,
        execution_time: total_execution_time,
        from_cache: result.from_cache,
        timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    })
}

/// Record a failed exchange so the session context reflects it.
async fn record_failure(
    pool: &SqlitePool,
    user_id: i64,
    session_id: &str,
    question: &str,
    error: &anyhow::Error,
) {
    let summary = format!("Error: {}", error);
    let record = MemoryRecord {
        user_id,
        session_id,
        query_text: question,
        sql_query: None,
        result_summary: Some(&summary),
        query_type: Some("error"),
        execution_time: None,
        row_count: None,
    };
    if let Err(e) = memory::store(pool, record).await {
        tracing::warn!(error = %e, "failed to record conversation error entry");
    }
}

/// CLI entry point — run one question and print the outcome.
pub async fn run_ask(
    config: &Config,
    question: &str,
    username: &str,
    session_id: Option<String>,
    use_cache: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;

    let user = crate::auth::get_user_by_username(&pool, username)
        .await?
        .with_context(|| format!("Unknown user: {}. Create one with `cva user add`.", username))?;

    let client = WarehouseClient::new(config)?;
    let assistant = Assistant::new(config)?;

    let outcome = execute_question(
        config,
        &pool,
        &client,
        &assistant,
        &user,
        question,
        session_id,
        use_cache,
    )
    .await?;

    println!("--- Query ---");
    println!("question:   {}", outcome.original_query);
    println!("sql:        {}", outcome.sql_query);
    if !outcome.explanation.is_empty() {
        println!("explanation: {}", outcome.explanation);
    }
    println!("type:       {}", outcome.query_type);
    println!(
        "rows:       {} ({:.2}s{})",
        outcome.metadata.row_count,
        outcome.execution_time,
        if outcome.from_cache { ", cached" } else { "" }
    );
    println!("session:    {}", outcome.session_id);
    println!();

    print_rows(&outcome.metadata.columns, &outcome.data);

    println!("--- Insights ---");
    println!("{}", outcome.insights);
    println!();

    println!(
        "--- Chart: {} ---",
        outcome.chart_recommendation.chart_type
    );
    if !outcome.chart_recommendation.reason.is_empty() {
        println!("{}", outcome.chart_recommendation.reason);
    }
    println!();

    if !outcome.follow_up_suggestions.is_empty() {
        println!("--- Follow-ups ---");
        for suggestion in &outcome.follow_up_suggestions {
            println!("- {}", suggestion);
        }
    }

    pool.close().await;
    Ok(())
}

/// CLI entry point — run one guarded SQL statement and print the rows.
pub async fn run_sql(config: &Config, sql: &str, use_cache: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let client = WarehouseClient::new(config)?;

    let result = client.execute(&pool, sql, use_cache).await?;

    println!(
        "{} rows ({:.2}s{})",
        result.metadata.row_count,
        result.execution_time,
        if result.from_cache { ", cached" } else { "" }
    );
    println!();
    print_rows(&result.metadata.columns, &result.data);

    pool.close().await;
    Ok(())
}

/// Print rows as a pipe-separated table capped at 50 lines.
fn print_rows(columns: &[String], data: &[serde_json::Value]) {
    if columns.is_empty() {
        return;
    }

    println!("{}", columns.join(" | "));

    for row in data.iter().take(50) {
        let cells: Vec<String> = columns
            .iter()
            .map(|col| match &row[col.as_str()] {
                serde_json::Value::Null => "NULL".to_string(),
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }

    if data.len() > 50 {
        println!("... ({} more rows)", data.len() - 50);
    }
    println!();
}
