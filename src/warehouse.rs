//! Snowflake warehouse client.
//!
//! Speaks the Snowflake REST protocol directly over `reqwest` — session
//! login followed by query requests — using only pure-Rust dependencies,
//! no vendor SDK.
//!
//! # Protocol
//!
//! 1. `POST /session/v1/login-request` with account/user/password returns a
//!    session token.
//! 2. `POST /queries/v1/query-request?requestId=<uuid>` with the token runs
//!    one statement and returns `rowtype` (column metadata) + `rowset`
//!    (stringly-typed rows), which are decoded into JSON objects.
//! 3. Error code `390112` means the session expired; the client re-logs-in
//!    once and replays the request.
//!
//! # Safety rails
//!
//! Only SELECT / WITH / SHOW / DESCRIBE statements are accepted, and a
//! SELECT without its own LIMIT/TOP gets the configured row cap appended.
//!
//! # Retry Strategy
//!
//! Transient failures use exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache;
use crate::config::{CacheConfig, Config, WarehouseConfig};
use crate::models::{QueryResult, ResultMeta};

/// Statement kinds the service will ever send to the warehouse.
const ALLOWED_PREFIXES: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN"];

/// Keywords that make a statement unacceptable regardless of position.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DELETE", "UPDATE", "INSERT", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "EXECUTE",
];

/// Validate a statement for safety before it goes anywhere near the
/// warehouse. Returns the failure reason on rejection.
pub fn validate_statement(sql: &str) -> Result<()> {
    let upper = sql.to_uppercase();
    let trimmed = upper.trim();

    for keyword in FORBIDDEN_KEYWORDS {
        // Match on word boundaries so e.g. "CREATED_AT" passes
        let found = upper
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .any(|word| word == *keyword);
        if found {
            bail!("Forbidden operation: {}", keyword);
        }
    }

    if !ALLOWED_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        bail!("Query must start with SELECT, WITH, SHOW, or DESCRIBE");
    }

    if sql.matches('(').count() != sql.matches(')').count() {
        bail!("Unmatched parentheses");
    }

    if sql.matches('\'').count() % 2 != 0 {
        bail!("Unmatched quotes");
    }

    Ok(())
}

/// Append the row cap to a SELECT that doesn't bound itself.
pub fn apply_row_limit(sql: &str, max_rows: u64) -> String {
    let upper = sql.to_uppercase();
    let trimmed = upper.trim();

    if trimmed.starts_with("SELECT") && !upper.contains("LIMIT") && !upper.contains("TOP") {
        format!("{} LIMIT {}", sql.trim_end().trim_end_matches(';'), max_rows)
    } else {
        sql.to_string()
    }
}

/// Reject table names that aren't plain identifiers before they are
/// interpolated into introspection statements.
fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("Invalid table name: '{}'", name);
    }
    Ok(())
}

pub struct WarehouseClient {
    client: reqwest::Client,
    config: WarehouseConfig,
    cache_config: CacheConfig,
    base_url: String,
    session_token: Mutex<Option<String>>,
}

impl WarehouseClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.warehouse.timeout_secs))
            .build()?;

        let base_url = config.warehouse.base_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}.snowflakecomputing.com",
                config.warehouse.account
            )
        });

        Ok(Self {
            client,
            config: config.warehouse.clone(),
            cache_config: config.cache.clone(),
            base_url,
            session_token: Mutex::new(None),
        })
    }

    fn password(&self) -> Result<String> {
        std::env::var(&self.config.password_env)
            .map_err(|_| anyhow!("{} environment variable not set", self.config.password_env))
    }

    /// Open a session and return its token.
    async fn login(&self) -> Result<String> {
        let password = self.password()?;

        let mut url = format!(
            "{}/session/v1/login-request?warehouse={}&databaseName={}&schemaName={}",
            self.base_url, self.config.warehouse, self.config.database, self.config.schema
        );
        if let Some(ref role) = self.config.role {
            url.push_str(&format!("&roleName={}", role));
        }

        let body = json!({
            "data": {
                "ACCOUNT_NAME": self.config.account,
                "LOGIN_NAME": self.config.user,
                "PASSWORD": password,
                "CLIENT_APP_ID": "conversant",
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
            }
        });

        let response = self
            .send_with_retry(|| self.client.post(&url).json(&body))
            .await?;

        if response["success"].as_bool() != Some(true) {
            let message = response["message"].as_str().unwrap_or("unknown error");
            bail!("Warehouse login failed: {}", message);
        }

        let token = response["data"]["token"]
            .as_str()
            .ok_or_else(|| anyhow!("Warehouse login response missing session token"))?
            .to_string();

        debug!("warehouse session opened");
        Ok(token)
    }

    /// Return the cached session token, logging in when there is none.
    async fn session_token(&self) -> Result<String> {
        let mut guard = self.session_token.lock().await;
        if let Some(ref token) = *guard {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn drop_session(&self) {
        let mut guard = self.session_token.lock().await;
        *guard = None;
    }

    /// POST with the standard retry/backoff loop and JSON decode.
    async fn send_with_retry<F>(&self, make_request: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = make_request().send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow!("Warehouse API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Warehouse API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Warehouse request failed after retries")))
    }

    /// Run one statement and return the raw response body, replaying once
    /// after a session-expired response.
    async fn query_request(&self, sql: &str) -> Result<Value> {
        for _ in 0..2 {
            let token = self.session_token().await?;
            let url = format!(
                "{}/queries/v1/query-request?requestId={}",
                self.base_url,
                Uuid::new_v4()
            );
            let body = json!({ "sqlText": sql, "asyncExec": false });

            let response = self
                .send_with_retry(|| {
                    self.client
                        .post(&url)
                        .header(
                            "Authorization",
                            format!("Snowflake Token=\"{}\"", token),
                        )
                        .json(&body)
                })
                .await?;

            if response["success"].as_bool() == Some(true) {
                return Ok(response);
            }

            // 390112: session token expired — re-login and replay once
            if response["code"].as_str() == Some("390112") {
                warn!("warehouse session expired, re-authenticating");
                self.drop_session().await;
                continue;
            }

            let message = response["message"].as_str().unwrap_or("unknown error");
            bail!("Warehouse query failed: {}", message);
        }

        bail!("Warehouse session could not be re-established")
    }

    /// Execute a guarded statement, going through the result cache unless
    /// the caller opts out.
    pub async fn execute(
        &self,
        pool: &SqlitePool,
        sql: &str,
        use_cache: bool,
    ) -> Result<QueryResult> {
        validate_statement(sql)?;
        let sql = apply_row_limit(sql, self.config.max_rows);

        if use_cache {
            if let Some(hit) = cache::lookup(pool, &sql).await? {
                debug!(query = %sql, "cache hit");
                return Ok(hit);
            }
        }

        let start = Instant::now();
        let response = self.query_request(&sql).await?;
        let execution_time = start.elapsed().as_secs_f64();

        let (columns, column_types, data) = decode_rowset(&response["data"])?;

        let result = QueryResult {
            metadata: ResultMeta {
                columns,
                column_types,
                row_count: data.len(),
                query: sql.clone(),
            },
            data,
            execution_time,
            from_cache: false,
        };

        if use_cache && !result.data.is_empty() {
            cache::store(pool, &self.cache_config, &sql, &result).await?;
        }

        Ok(result)
    }

    /// `SELECT 1` probe for health reporting.
    pub async fn test_connection(&self) -> bool {
        match self.query_request("SELECT 1").await {
            Ok(response) => {
                let cell = &response["data"]["rowset"][0][0];
                cell.as_str() == Some("1") || cell.as_i64() == Some(1)
            }
            Err(e) => {
                warn!(error = %e, "warehouse connection test failed");
                false
            }
        }
    }

    /// Table listing, or column detail for one table.
    pub async fn table_info(
        &self,
        pool: &SqlitePool,
        table_name: Option<&str>,
    ) -> Result<QueryResult> {
        let sql = match table_name {
            Some(name) => {
                validate_identifier(name)?;
                format!(
                    "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, COLUMN_DEFAULT \
                     FROM INFORMATION_SCHEMA.COLUMNS \
                     WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' \
                     ORDER BY ORDINAL_POSITION",
                    self.config.schema,
                    name.to_uppercase()
                )
            }
            None => format!(
                "SELECT TABLE_NAME, TABLE_TYPE, ROW_COUNT, BYTES \
                 FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = '{}' \
                 ORDER BY TABLE_NAME",
                self.config.schema
            ),
        };

        self.execute(pool, &sql, true).await
    }

    pub async fn sample_data(
        &self,
        pool: &SqlitePool,
        table_name: &str,
        limit: u64,
    ) -> Result<QueryResult> {
        validate_identifier(table_name)?;
        let sql = format!("SELECT * FROM {} LIMIT {}", table_name, limit);
        self.execute(pool, &sql, true).await
    }

    /// Supplier performance over the trailing `days` window.
    pub async fn supplier_performance(
        &self,
        pool: &SqlitePool,
        days: u32,
    ) -> Result<QueryResult> {
        let sql = format!(
            "SELECT \
             s.SUPPKEY, \
             s.NAME as SUPPLIER_NAME, \
             COUNT(DISTINCT l.ORDERKEY) as TOTAL_ORDERS, \
             SUM(l.QUANTITY) as TOTAL_QUANTITY, \
             SUM(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as TOTAL_REVENUE, \
             AVG(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as AVG_ORDER_VALUE, \
             AVG(DATEDIFF(day, l.SHIPDATE, l.COMMITDATE)) as AVG_DELIVERY_DELAY, \
             COUNT(CASE WHEN l.SHIPDATE > l.COMMITDATE THEN 1 END) as LATE_DELIVERIES, \
             s.ACCTBAL as ACCOUNT_BALANCE, \
             n.NAME as NATION \
             FROM SUPPLIER s \
             JOIN LINEITEM l ON s.SUPPKEY = l.SUPPKEY \
             JOIN NATION n ON s.NATIONKEY = n.NATIONKEY \
             WHERE l.SHIPDATE >= DATEADD(day, -{}, CURRENT_DATE) \
             GROUP BY s.SUPPKEY, s.NAME, s.ACCTBAL, n.NAME \
             ORDER BY TOTAL_REVENUE DESC \
             LIMIT 100",
            days
        );

        self.execute(pool, &sql, true).await
    }

    /// Monthly revenue/volume history over the trailing `months` window,
    /// the input series for downstream forecasting.
    pub async fn sales_history(&self, pool: &SqlitePool, months: u32) -> Result<QueryResult> {
        let sql = format!(
            "SELECT \
             DATE_TRUNC('month', l.SHIPDATE) as MONTH, \
             SUM(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as REVENUE, \
             SUM(l.QUANTITY) as QUANTITY_SOLD, \
             COUNT(DISTINCT l.ORDERKEY) as ORDERS_COUNT, \
             COUNT(DISTINCT l.PARTKEY) as UNIQUE_PARTS, \
             AVG(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as AVG_ORDER_VALUE \
             FROM LINEITEM l \
             WHERE l.SHIPDATE >= DATEADD(month, -{}, CURRENT_DATE) \
             GROUP BY DATE_TRUNC('month', l.SHIPDATE) \
             ORDER BY MONTH",
            months
        );

        self.execute(pool, &sql, true).await
    }

    /// Static performance analysis of a statement, plus the warehouse query
    /// plan when `EXPLAIN` succeeds.
    pub async fn analyze_performance(&self, pool: &SqlitePool, sql: &str) -> Result<Value> {
        let mut analysis = analyze_statement(sql);

        match self
            .execute(pool, &format!("EXPLAIN {}", sql), false)
            .await
        {
            Ok(plan) => {
                analysis["query_plan"] = Value::Array(plan.data);
            }
            Err(e) => {
                analysis["query_plan"] = Value::Null;
                analysis["plan_error"] = Value::String(e.to_string());
            }
        }

        Ok(analysis)
    }
}

/// The static half of performance analysis (no warehouse round trip).
pub fn analyze_statement(sql: &str) -> Value {
    let upper = sql.to_uppercase();

    let has_limit = upper.contains("LIMIT");
    let uses_joins = upper.contains("JOIN");
    let uses_aggregation = ["SUM", "COUNT", "AVG", "MAX", "MIN"]
        .iter()
        .any(|f| upper.contains(f));
    let uses_groupby = upper.contains("GROUP BY");
    let uses_orderby = upper.contains("ORDER BY");

    let mut suggestions: Vec<String> = Vec::new();
    if !has_limit {
        suggestions.push("Consider adding LIMIT clause for large tables".to_string());
    }
    if uses_joins && !has_limit {
        suggestions.push("JOIN operations on large tables should include LIMIT".to_string());
    }
    if upper.contains("LINEITEM") && !has_limit {
        suggestions.push("LINEITEM table has 6M+ rows, always use LIMIT".to_string());
    }

    json!({
        "has_limit": has_limit,
        "uses_joins": uses_joins,
        "uses_aggregation": uses_aggregation,
        "uses_groupby": uses_groupby,
        "uses_orderby": uses_orderby,
        "estimated_complexity": "medium",
        "suggestions": suggestions,
    })
}

/// Decode Snowflake's `rowtype`/`rowset` pair into column names, column
/// types, and JSON row objects. Values arrive stringly typed and are
/// converted per the declared column type.
fn decode_rowset(data: &Value) -> Result<(Vec<String>, Vec<String>, Vec<Value>)> {
    let rowtype = data["rowtype"]
        .as_array()
        .ok_or_else(|| anyhow!("Warehouse response missing rowtype"))?;

    let columns: Vec<String> = rowtype
        .iter()
        .map(|c| c["name"].as_str().unwrap_or("").to_string())
        .collect();
    let column_types: Vec<String> = rowtype
        .iter()
        .map(|c| c["type"].as_str().unwrap_or("text").to_string())
        .collect();

    let rowset = data["rowset"]
        .as_array()
        .ok_or_else(|| anyhow!("Warehouse response missing rowset"))?;

    let mut rows = Vec::with_capacity(rowset.len());
    for raw_row in rowset {
        let cells = raw_row
            .as_array()
            .ok_or_else(|| anyhow!("Warehouse rowset entry is not an array"))?;

        let mut obj = serde_json::Map::with_capacity(columns.len());
        for (i, cell) in cells.iter().enumerate() {
            let name = columns.get(i).cloned().unwrap_or_else(|| i.to_string());
            let ty = column_types.get(i).map(|s| s.as_str()).unwrap_or("text");
            obj.insert(name, decode_cell(cell, ty));
        }
        rows.push(Value::Object(obj));
    }

    Ok((columns, column_types, rows))
}

fn decode_cell(cell: &Value, column_type: &str) -> Value {
    let text = match cell {
        Value::Null => return Value::Null,
        Value::String(s) => s.as_str(),
        other => return other.clone(),
    };

    match column_type {
        "fixed" => {
            if text.contains('.') {
                text.parse::<f64>().map(|f| json!(f)).unwrap_or(json!(text))
            } else {
                text.parse::<i64>().map(|n| json!(n)).unwrap_or(json!(text))
            }
        }
        "real" => text.parse::<f64>().map(|f| json!(f)).unwrap_or(json!(text)),
        "boolean" => match text {
            "1" | "true" | "TRUE" => json!(true),
            "0" | "false" | "FALSE" => json!(false),
            _ => json!(text),
        },
        _ => json!(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_read_statements() {
        assert!(validate_statement("SELECT * FROM ORDERS").is_ok());
        assert!(validate_statement("  with t as (SELECT 1) select * from t").is_ok());
        assert!(validate_statement("SHOW TABLES").is_ok());
        assert!(validate_statement("DESCRIBE TABLE ORDERS").is_ok());
    }

    #[test]
    fn test_validate_rejects_mutations() {
        for sql in [
            "DELETE FROM ORDERS",
            "UPDATE ORDERS SET X = 1",
            "INSERT INTO ORDERS VALUES (1)",
            "DROP TABLE ORDERS",
            "SELECT 1; DROP TABLE ORDERS",
            "CREATE TABLE X (A INT)",
            "TRUNCATE TABLE ORDERS",
            "GRANT ALL ON ORDERS TO PUBLIC",
        ] {
            let err = validate_statement(sql).unwrap_err();
            assert!(
                err.to_string().contains("Forbidden operation")
                    || err.to_string().contains("must start with"),
                "{} -> {}",
                sql,
                err
            );
        }
    }

    #[test]
    fn test_validate_word_boundary_keywords() {
        // Column names containing forbidden substrings must pass
        assert!(validate_statement("SELECT CREATED_AT, UPDATED_BY FROM ORDERS").is_ok());
        // A bare forbidden keyword anywhere is still caught
        assert!(
            validate_statement("SELECT * FROM ORDERS WHERE 1 = 1; UPDATE ORDERS SET F = 1")
                .is_err()
        );
    }

    #[test]
    fn test_validate_rejects_unbalanced() {
        assert!(validate_statement("SELECT COUNT( FROM ORDERS").is_err());
        assert!(validate_statement("SELECT 'unterminated FROM ORDERS").is_err());
    }

    #[test]
    fn test_validate_rejects_non_read() {
        assert!(validate_statement("EXPLAIN SELECT * FROM ORDERS").is_ok());
        assert!(validate_statement("VACUUM").is_err());
        assert!(validate_statement("USE WAREHOUSE COMPUTE_WH").is_err());
    }

    #[test]
    fn test_row_limit_applied_when_absent() {
        let sql = apply_row_limit("SELECT * FROM LINEITEM", 1000);
        assert_eq!(sql, "SELECT * FROM LINEITEM LIMIT 1000");
    }

    #[test]
    fn test_row_limit_strips_trailing_semicolon() {
        let sql = apply_row_limit("SELECT * FROM LINEITEM;", 1000);
        assert_eq!(sql, "SELECT * FROM LINEITEM LIMIT 1000");
    }

    #[test]
    fn test_row_limit_not_applied_when_present() {
        let sql = "SELECT * FROM LINEITEM LIMIT 10";
        assert_eq!(apply_row_limit(sql, 1000), sql);

        let top = "SELECT TOP 5 * FROM LINEITEM";
        assert_eq!(apply_row_limit(top, 1000), top);

        let show = "SHOW TABLES";
        assert_eq!(apply_row_limit(show, 1000), show);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("LINEITEM").is_ok());
        assert!(validate_identifier("line_item2").is_ok());
        assert!(validate_identifier("ORDERS; DROP TABLE X").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_decode_rowset_types() {
        let data = json!({
            "rowtype": [
                {"name": "NAME", "type": "text"},
                {"name": "TOTAL", "type": "fixed"},
                {"name": "RATIO", "type": "real"},
                {"name": "ACTIVE", "type": "boolean"},
            ],
            "rowset": [
                ["Acme", "42", "0.5", "1"],
                ["Globex", "7.5", "1.25", "false"],
                [null, null, null, null],
            ],
        });

        let (columns, types, rows) = decode_rowset(&data).unwrap();
        assert_eq!(columns, vec!["NAME", "TOTAL", "RATIO", "ACTIVE"]);
        assert_eq!(types, vec!["text", "fixed", "real", "boolean"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["NAME"], json!("Acme"));
        assert_eq!(rows[0]["TOTAL"], json!(42));
        assert_eq!(rows[0]["RATIO"], json!(0.5));
        assert_eq!(rows[0]["ACTIVE"], json!(true));
        assert_eq!(rows[1]["TOTAL"], json!(7.5));
        assert_eq!(rows[1]["ACTIVE"], json!(false));
        assert_eq!(rows[2]["NAME"], Value::Null);
    }

    #[test]
    fn test_decode_rowset_missing_fields() {
        assert!(decode_rowset(&json!({})).is_err());
        assert!(decode_rowset(&json!({"rowtype": []})).is_err());
    }

    #[test]
    fn test_analyze_statement_flags() {
        let analysis = analyze_statement(
            "SELECT s.NAME, SUM(l.QUANTITY) FROM SUPPLIER s \
             JOIN LINEITEM l ON s.SUPPKEY = l.SUPPKEY GROUP BY s.NAME ORDER BY 2 DESC",
        );
        assert_eq!(analysis["has_limit"], json!(false));
        assert_eq!(analysis["uses_joins"], json!(true));
        assert_eq!(analysis["uses_aggregation"], json!(true));
        assert_eq!(analysis["uses_groupby"], json!(true));
        assert_eq!(analysis["uses_orderby"], json!(true));

        let suggestions = analysis["suggestions"].as_array().unwrap();
        assert!(suggestions
            .iter()
            .any(|s| s.as_str().unwrap().contains("LINEITEM")));
    }

    #[test]
    fn test_analyze_statement_bounded_query_has_no_suggestions() {
        let analysis = analyze_statement("SELECT * FROM REGION LIMIT 5");
        assert_eq!(analysis["has_limit"], json!(true));
        assert!(analysis["suggestions"].as_array().unwrap().is_empty());
    }
}
