//! Application store statistics.
//!
//! Provides a quick summary of local state: user counts, conversation
//! volume, cache occupancy, and alert activity. Used by `cva stats` to give
//! confidence that the store is healthy without touching the warehouse.

use anyhow::Result;
use chrono::Utc;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await?;
    let active_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_active = 1")
        .fetch_one(&pool)
        .await?;

    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_memory")
        .fetch_one(&pool)
        .await?;
    let sessions: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT session_id) FROM conversation_memory")
            .fetch_one(&pool)
            .await?;

    let now = Utc::now().timestamp();
    let cache_row = sqlx::query(
        "SELECT COUNT(*) as total, \
         COUNT(CASE WHEN expires_at > ? THEN 1 END) as active, \
         COALESCE(SUM(access_count), 0) as accesses \
         FROM query_cache",
    )
    .bind(now)
    .fetch_one(&pool)
    .await?;
    let cache_total: i64 = cache_row.get("total");
    let cache_active: i64 = cache_row.get("active");
    let cache_accesses: i64 = cache_row.get("accesses");

    let saved_queries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM saved_queries")
        .fetch_one(&pool)
        .await?;

    let alerts_row = sqlx::query(
        "SELECT COUNT(*) as total, \
         COUNT(CASE WHEN is_active = 1 THEN 1 END) as active, \
         COALESCE(SUM(trigger_count), 0) as triggers \
         FROM alerts",
    )
    .fetch_one(&pool)
    .await?;
    let alerts_total: i64 = alerts_row.get("total");
    let alerts_active: i64 = alerts_row.get("active");
    let alert_triggers: i64 = alerts_row.get("triggers");

    println!("--- Store ---");
    println!("path:           {}", config.store.path.display());
    println!();
    println!("--- Users ---");
    println!("total:          {}", users);
    println!("active:         {}", active_users);
    println!();
    println!("--- Conversations ---");
    println!("exchanges:      {}", conversations);
    println!("sessions:       {}", sessions);
    println!();
    println!("--- Query cache ---");
    println!("entries:        {}", cache_total);
    println!("live entries:   {}", cache_active);
    println!("total hits:     {}", cache_accesses);
    println!();
    println!("--- Saved queries ---");
    println!("saved:          {}", saved_queries);
    println!();
    println!("--- Alerts ---");
    println!("configured:     {}", alerts_total);
    println!("active:         {}", alerts_active);
    println!("total triggers: {}", alert_triggers);

    pool.close().await;
    Ok(())
}
