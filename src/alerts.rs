//! Threshold alerts over warehouse metrics.
//!
//! An alert pairs a guarded SQL statement with a threshold condition. When
//! evaluated, the statement runs against the warehouse, the first numeric
//! column of the first row becomes the metric value, and the condition
//! decides whether the alert fires. Firing alerts notify their owner by
//! email and/or Slack and append a history row either way the notification
//! goes.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::auth;
use crate::models::{format_ts_iso, Alert, Condition, NotifyMethod, QueryResult, User};
use crate::notify::Notifier;
use crate::warehouse::{self, WarehouseClient};

/// Fields accepted when creating an alert.
pub struct AlertInput {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub condition: String,
    pub notification_method: String,
    pub sql_query: String,
}

/// Partial update; `None` fields are left untouched.
#[derive(Default)]
pub struct AlertUpdate {
    pub name: Option<String>,
    pub threshold: Option<f64>,
    pub condition: Option<String>,
    pub notification_method: Option<String>,
    pub is_active: Option<bool>,
}

fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
    Ok(Alert {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("alert_name"),
        metric: row.get("metric"),
        threshold: row.get("threshold_value"),
        condition: Condition::parse(row.get("condition"))?,
        method: NotifyMethod::parse(row.get("notification_method"))?,
        sql_query: row.get("sql_query"),
        is_active: row.get::<i64, _>("is_active") != 0,
        last_checked: row.get("last_checked"),
        last_triggered: row.get("last_triggered"),
        trigger_count: row.get("trigger_count"),
        created_at: row.get("created_at"),
    })
}

/// Create an alert after validating the condition, method, and statement.
pub async fn create(pool: &SqlitePool, user_id: i64, input: &AlertInput) -> Result<Alert> {
    Condition::parse(&input.condition)?;
    NotifyMethod::parse(&input.notification_method)?;
    warehouse::validate_statement(&input.sql_query)?;

    if input.name.trim().is_empty() {
        bail!("Alert name must not be empty");
    }

    let result = sqlx::query(
        "INSERT INTO alerts \
         (user_id, alert_name, metric, threshold_value, condition, notification_method, sql_query, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&input.name)
    .bind(&input.metric)
    .bind(input.threshold)
    .bind(&input.condition)
    .bind(&input.notification_method)
    .bind(&input.sql_query)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    get(pool, id, user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Failed to create alert"))
}

/// Fetch one alert owned by `user_id`.
pub async fn get(pool: &SqlitePool, id: i64, user_id: i64) -> Result<Option<Alert>> {
    let row = sqlx::query("SELECT * FROM alerts WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(alert_from_row).transpose()
}

/// All alerts owned by `user_id`, newest first.
pub async fn list(pool: &SqlitePool, user_id: i64) -> Result<Vec<Alert>> {
    let rows = sqlx::query(
        "SELECT * FROM alerts WHERE user_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(alert_from_row).collect()
}

/// Every active alert across all users (check-all).
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<Alert>> {
    let rows = sqlx::query("SELECT * FROM alerts WHERE is_active = 1 ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(alert_from_row).collect()
}

/// Apply a partial update. Fails when no fields are given or validation
/// fails; returns the updated alert.
pub async fn update(
    pool: &SqlitePool,
    id: i64,
    user_id: i64,
    changes: &AlertUpdate,
) -> Result<Option<Alert>> {
    if get(pool, id, user_id).await?.is_none() {
        return Ok(None);
    }

    let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
        sqlx::QueryBuilder::new("UPDATE alerts SET ");
    let mut any = false;

    if let Some(ref name) = changes.name {
        builder.push("alert_name = ").push_bind(name);
        any = true;
    }
    if let Some(threshold) = changes.threshold {
        if any {
            builder.push(", ");
        }
        builder.push("threshold_value = ").push_bind(threshold);
        any = true;
    }
    if let Some(ref condition) = changes.condition {
        Condition::parse(condition)?;
        if any {
            builder.push(", ");
        }
        builder.push("condition = ").push_bind(condition);
        any = true;
    }
    if let Some(ref method) = changes.notification_method {
        NotifyMethod::parse(method)?;
        if any {
            builder.push(", ");
        }
        builder.push("notification_method = ").push_bind(method);
        any = true;
    }
    if let Some(active) = changes.is_active {
        if any {
            builder.push(", ");
        }
        builder.push("is_active = ").push_bind(active as i64);
        any = true;
    }

    if !any {
        bail!("No fields to update");
    }

    builder
        .push(" WHERE id = ")
        .push_bind(id)
        .push(" AND user_id = ")
        .push_bind(user_id);

    builder.build().execute(pool).await?;

    get(pool, id, user_id).await
}

/// Delete an alert (history rows cascade). Returns whether it existed.
pub async fn delete(pool: &SqlitePool, id: i64, user_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM alerts WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// First numeric column of the first row, the alert metric convention.
pub fn extract_metric(result: &QueryResult) -> Option<f64> {
    let first = result.data.first()?;
    for column in &result.metadata.columns {
        if let Some(value) = first.get(column.as_str()) {
            if let Some(n) = value.as_f64() {
                return Some(n);
            }
        }
    }
    None
}

/// Evaluate an alert's condition. Returns (condition met, metric value);
/// no rows or no numeric column evaluates to (false, 0.0).
pub async fn evaluate(
    client: &WarehouseClient,
    pool: &SqlitePool,
    alert: &Alert,
) -> Result<(bool, f64)> {
    let result = client.execute(pool, &alert.sql_query, true).await?;

    let metric_value = match extract_metric(&result) {
        Some(v) => v,
        None => return Ok((false, 0.0)),
    };

    Ok((alert.condition.is_met(metric_value, alert.threshold), metric_value))
}

/// Render the notification message for a firing alert.
pub fn render_message(alert: &Alert, metric_value: f64) -> String {
    let query_excerpt: String = alert.sql_query.chars().take(100).collect();

    format!(
        "🚨 **Alert Triggered: {}**\n\n\
         **Metric:** {}\n\
         **Current Value:** {}\n\
         **Threshold:** {} {}\n\
         **Time:** {}\n\n\
         Query: {}...",
        alert.name,
        alert.metric,
        metric_value,
        alert.condition.as_str(),
        alert.threshold,
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        query_excerpt
    )
}

/// Notify the owner of a firing alert, record history, bump counters.
/// Returns whether any notification was delivered.
pub async fn process_trigger(
    pool: &SqlitePool,
    notifier: &Notifier,
    alert: &Alert,
    metric_value: f64,
    owner: &User,
) -> Result<bool> {
    let message = render_message(alert, metric_value);
    let mut notification_sent = false;

    if alert.method.includes_email() {
        let subject = format!("Alert: {}", alert.name);
        let html_body = message.replace('\n', "<br>");
        let sent = notifier.send_email(&owner.email, &subject, &html_body).await;
        notification_sent = notification_sent || sent;
    }

    if alert.method.includes_slack() {
        let sent = notifier.send_slack(&message).await;
        notification_sent = notification_sent || sent;
    }

    sqlx::query(
        "INSERT INTO alert_history (alert_id, triggered_at, metric_value, threshold_value, message, notification_sent) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(alert.id)
    .bind(Utc::now().timestamp())
    .bind(metric_value)
    .bind(alert.threshold)
    .bind(&message)
    .bind(notification_sent as i64)
    .execute(pool)
    .await?;

    sqlx::query(
        "UPDATE alerts SET last_triggered = ?, trigger_count = trigger_count + 1 WHERE id = ?",
    )
    .bind(Utc::now().timestamp())
    .bind(alert.id)
    .execute(pool)
    .await?;

    Ok(notification_sent)
}

/// One history row for the API.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub alert_id: i64,
    pub triggered_at: String,
    pub metric_value: f64,
    pub threshold_value: f64,
    pub message: Option<String>,
    pub notification_sent: bool,
}

pub async fn history(pool: &SqlitePool, alert_id: i64, limit: i64) -> Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM alert_history WHERE alert_id = ? \
         ORDER BY triggered_at DESC, id DESC LIMIT ?",
    )
    .bind(alert_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| HistoryEntry {
            id: row.get("id"),
            alert_id: row.get("alert_id"),
            triggered_at: format_ts_iso(row.get("triggered_at")),
            metric_value: row.get("metric_value"),
            threshold_value: row.get("threshold_value"),
            message: row.get("message"),
            notification_sent: row.get::<i64, _>("notification_sent") != 0,
        })
        .collect())
}

/// Per-alert outcome from a check-all sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub alert_id: i64,
    pub alert_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_sent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub checked_count: usize,
    pub triggered_count: usize,
    pub results: Vec<CheckOutcome>,
}

/// Evaluate every active alert. A failure in one alert is isolated to its
/// own outcome entry and never aborts the sweep.
pub async fn check_all(
    pool: &SqlitePool,
    client: &WarehouseClient,
    notifier: &Notifier,
) -> Result<CheckReport> {
    let active = list_active(pool).await?;
    let mut results = Vec::with_capacity(active.len());

    for alert in &active {
        sqlx::query("UPDATE alerts SET last_checked = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(alert.id)
            .execute(pool)
            .await?;

        match evaluate(client, pool, alert).await {
            Ok((true, metric_value)) => {
                let owner = auth::get_user_by_id(pool, alert.user_id).await?;
                let notification_sent = match owner {
                    Some(ref user) => {
                        Some(process_trigger(pool, notifier, alert, metric_value, user).await?)
                    }
                    None => {
                        warn!(alert_id = alert.id, "alert owner missing, skipping notify");
                        None
                    }
                };

                results.push(CheckOutcome {
                    alert_id: alert.id,
                    alert_name: alert.name.clone(),
                    triggered: Some(true),
                    metric_value: Some(metric_value),
                    notification_sent,
                    error: None,
                });
            }
            Ok((false, metric_value)) => {
                results.push(CheckOutcome {
                    alert_id: alert.id,
                    alert_name: alert.name.clone(),
                    triggered: Some(false),
                    metric_value: Some(metric_value),
                    notification_sent: None,
                    error: None,
                });
            }
            Err(e) => {
                results.push(CheckOutcome {
                    alert_id: alert.id,
                    alert_name: alert.name.clone(),
                    triggered: None,
                    metric_value: None,
                    notification_sent: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let triggered_count = results
        .iter()
        .filter(|r| r.triggered == Some(true))
        .count();

    Ok(CheckReport {
        checked_count: active.len(),
        triggered_count,
        results,
    })
}

/// CLI entry point — evaluate every active alert and print the outcomes.
/// Intended for cron: `cva alert check`.
pub async fn run_check(config: &crate::config::Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    let client = WarehouseClient::new(config)?;
    let notifier = Notifier::from_config(&config.notify);

    let report = check_all(&pool, &client, &notifier).await?;

    println!(
        "checked {} alerts, {} triggered",
        report.checked_count, report.triggered_count
    );
    for outcome in &report.results {
        match (&outcome.error, outcome.triggered) {
            (Some(error), _) => {
                println!("  [{}] {} ERROR: {}", outcome.alert_id, outcome.alert_name, error)
            }
            (None, Some(true)) => println!(
                "  [{}] {} TRIGGERED (value {}, notified: {})",
                outcome.alert_id,
                outcome.alert_name,
                outcome.metric_value.unwrap_or(0.0),
                outcome.notification_sent.unwrap_or(false)
            ),
            _ => println!(
                "  [{}] {} ok (value {})",
                outcome.alert_id,
                outcome.alert_name,
                outcome.metric_value.unwrap_or(0.0)
            ),
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::ResultMeta;
    use crate::notify::testing::{CapturingMailer, CapturingWebhook};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        pool
    }

    fn input() -> AlertInput {
        AlertInput {
            name: "Revenue floor".to_string(),
            metric: "total_revenue".to_string(),
            threshold: 1000.0,
            condition: "<".to_string(),
            notification_method: "both".to_string(),
            sql_query: "SELECT SUM(TOTALPRICE) as total_revenue FROM ORDERS".to_string(),
        }
    }

    async fn owner(pool: &SqlitePool) -> User {
        auth::create_user(pool, "owner", "owner@example.com", "pw", None, "user")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let pool = test_pool().await;
        let user = owner(&pool).await;
        let alert = create(&pool, user.id, &input()).await.unwrap();

        assert_eq!(alert.name, "Revenue floor");
        assert_eq!(alert.condition, Condition::LessThan);
        assert_eq!(alert.method, NotifyMethod::Both);
        assert!(alert.is_active);
        assert_eq!(alert.trigger_count, 0);

        // Ownership enforced
        assert!(get(&pool, alert.id, user.id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_validates_inputs() {
        let pool = test_pool().await;
        let user = owner(&pool).await;

        let mut bad = input();
        bad.condition = "~".to_string();
        assert!(create(&pool, user.id, &bad).await.is_err());

        let mut bad = input();
        bad.notification_method = "carrier-pigeon".to_string();
        assert!(create(&pool, user.id, &bad).await.is_err());

        let mut bad = input();
        bad.sql_query = "DROP TABLE ORDERS".to_string();
        assert!(create(&pool, user.id, &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_update_partial_and_empty() {
        let pool = test_pool().await;
        let user = owner(&pool).await;
        let alert = create(&pool, user.id, &input()).await.unwrap();

        let updated = update(
            &pool,
            alert.id,
            user.id,
            &AlertUpdate {
                threshold: Some(2000.0),
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.threshold, 2000.0);
        assert!(!updated.is_active);
        assert_eq!(updated.name, "Revenue floor");

        let err = update(&pool, alert.id, user.id, &AlertUpdate::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No fields to update"));

        // Unknown id -> None
        assert!(update(
            &pool,
            9999,
            user.id,
            &AlertUpdate {
                threshold: Some(1.0),
                ..Default::default()
            }
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let pool = test_pool().await;
        let user = owner(&pool).await;
        let alert = create(&pool, user.id, &input()).await.unwrap();

        assert!(delete(&pool, alert.id, user.id).await.unwrap());
        assert!(!delete(&pool, alert.id, user.id).await.unwrap());
    }

    fn result_with(first_row: serde_json::Value, columns: &[&str]) -> QueryResult {
        QueryResult {
            data: vec![first_row],
            metadata: ResultMeta {
                columns: columns.iter().map(|s| s.to_string()).collect(),
                column_types: vec![],
                row_count: 1,
                query: String::new(),
            },
            execution_time: 0.0,
            from_cache: false,
        }
    }

    #[test]
    fn test_extract_metric_first_numeric_column() {
        let result = result_with(
            serde_json::json!({"NAME": "Acme", "REVENUE": 42.5, "ORDERS": 7}),
            &["NAME", "REVENUE", "ORDERS"],
        );
        assert_eq!(extract_metric(&result), Some(42.5));
    }

    #[test]
    fn test_extract_metric_no_numeric() {
        let result = result_with(
            serde_json::json!({"NAME": "Acme"}),
            &["NAME"],
        );
        assert_eq!(extract_metric(&result), None);

        let empty = QueryResult {
            data: vec![],
            metadata: ResultMeta {
                columns: vec![],
                column_types: vec![],
                row_count: 0,
                query: String::new(),
            },
            execution_time: 0.0,
            from_cache: false,
        };
        assert_eq!(extract_metric(&empty), None);
    }

    #[test]
    fn test_render_message_truncates_query() {
        let pool_alert = Alert {
            id: 1,
            user_id: 1,
            name: "Big".to_string(),
            metric: "m".to_string(),
            threshold: 5.0,
            condition: Condition::GreaterThan,
            method: NotifyMethod::Email,
            sql_query: "SELECT ".repeat(40),
            is_active: true,
            last_checked: None,
            last_triggered: None,
            trigger_count: 0,
            created_at: 0,
        };
        let message = render_message(&pool_alert, 9.0);
        assert!(message.contains("Alert Triggered: Big"));
        assert!(message.contains("> 5"));
        // Query excerpt capped at 100 chars
        let query_line = message.lines().last().unwrap();
        assert!(query_line.len() <= "Query: ".len() + 103);
    }

    #[tokio::test]
    async fn test_process_trigger_routes_and_records() {
        let pool = test_pool().await;
        let user = owner(&pool).await;
        let alert = create(&pool, user.id, &input()).await.unwrap();

        let mailer: &'static CapturingMailer = Box::leak(Box::default());
        let webhook: &'static CapturingWebhook = Box::leak(Box::default());
        let notifier = Notifier::new(Some(Box::new(mailer)), Some(Box::new(webhook)));

        let sent = process_trigger(&pool, &notifier, &alert, 500.0, &user)
            .await
            .unwrap();
        assert!(sent);

        // method = both -> both channels hit
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        assert_eq!(webhook.posts.lock().unwrap().len(), 1);
        assert_eq!(mailer.sent.lock().unwrap()[0].0, "owner@example.com");

        let entries = history(&pool, alert.id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metric_value, 500.0);
        assert!(entries[0].notification_sent);

        let reloaded = get(&pool, alert.id, user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.trigger_count, 1);
        assert!(reloaded.last_triggered.is_some());
    }

    #[tokio::test]
    async fn test_process_trigger_email_only() {
        let pool = test_pool().await;
        let user = owner(&pool).await;
        let mut email_only = input();
        email_only.notification_method = "email".to_string();
        let alert = create(&pool, user.id, &email_only).await.unwrap();

        let mailer: &'static CapturingMailer = Box::leak(Box::default());
        let webhook: &'static CapturingWebhook = Box::leak(Box::default());
        let notifier = Notifier::new(Some(Box::new(mailer)), Some(Box::new(webhook)));

        process_trigger(&pool, &notifier, &alert, 500.0, &user)
            .await
            .unwrap();

        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
        assert!(webhook.posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_with_no_channels_still_records_history() {
        let pool = test_pool().await;
        let user = owner(&pool).await;
        let alert = create(&pool, user.id, &input()).await.unwrap();

        let notifier = Notifier::new(None, None);
        let sent = process_trigger(&pool, &notifier, &alert, 500.0, &user)
            .await
            .unwrap();
        assert!(!sent);

        let entries = history(&pool, alert.id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].notification_sent);
    }
}
