//! Core data models used throughout Conversant.
//!
//! These types represent the users, query results, saved queries, and alerts
//! that flow through the analytics pipeline and HTTP API.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A registered user row from the application store.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: i64,
    pub last_login: Option<i64>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// User shape returned over the API (never carries the password hash).
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_login: Option<String>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            role: user.role.clone(),
            is_active: user.is_active,
            created_at: format_ts_iso(user.created_at),
            last_login: user.last_login.map(format_ts_iso),
        }
    }
}

/// Column metadata attached to every warehouse result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMeta {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub row_count: usize,
    pub query: String,
}

/// A warehouse query result: rows as JSON objects plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<serde_json::Value>,
    pub metadata: ResultMeta,
    pub execution_time: f64,
    pub from_cache: bool,
}

/// A user-saved query.
#[derive(Debug, Clone, Serialize)]
pub struct SavedQuery {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub sql_query: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub created_at: String,
    pub last_executed: Option<String>,
    pub execution_count: i64,
}

/// Comparison operator for alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl Condition {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            ">" => Condition::GreaterThan,
            "<" => Condition::LessThan,
            ">=" => Condition::GreaterOrEqual,
            "<=" => Condition::LessOrEqual,
            "=" => Condition::Equal,
            "!=" => Condition::NotEqual,
            other => bail!(
                "Invalid condition: '{}'. Must be one of: >, <, >=, <=, =, !=",
                other
            ),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::GreaterThan => ">",
            Condition::LessThan => "<",
            Condition::GreaterOrEqual => ">=",
            Condition::LessOrEqual => "<=",
            Condition::Equal => "=",
            Condition::NotEqual => "!=",
        }
    }

    /// Whether `value` satisfies this condition against `threshold`.
    pub fn is_met(&self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::GreaterThan => value > threshold,
            Condition::LessThan => value < threshold,
            Condition::GreaterOrEqual => value >= threshold,
            Condition::LessOrEqual => value <= threshold,
            Condition::Equal => value == threshold,
            Condition::NotEqual => value != threshold,
        }
    }
}

/// How a triggered alert is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMethod {
    Email,
    Slack,
    Both,
}

impl NotifyMethod {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "email" => NotifyMethod::Email,
            "slack" => NotifyMethod::Slack,
            "both" => NotifyMethod::Both,
            other => bail!(
                "Invalid notification method: '{}'. Must be one of: email, slack, both",
                other
            ),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyMethod::Email => "email",
            NotifyMethod::Slack => "slack",
            NotifyMethod::Both => "both",
        }
    }

    pub fn includes_email(&self) -> bool {
        matches!(self, NotifyMethod::Email | NotifyMethod::Both)
    }

    pub fn includes_slack(&self) -> bool {
        matches!(self, NotifyMethod::Slack | NotifyMethod::Both)
    }
}

/// A threshold alert owned by a user.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub condition: Condition,
    pub method: NotifyMethod,
    pub sql_query: String,
    pub is_active: bool,
    pub last_checked: Option<i64>,
    pub last_triggered: Option<i64>,
    pub trigger_count: i64,
    pub created_at: i64,
}

/// Alert shape returned over the API.
#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub condition: String,
    pub notification_method: String,
    pub sql_query: String,
    pub is_active: bool,
    pub last_checked: Option<String>,
    pub last_triggered: Option<String>,
    pub trigger_count: i64,
    pub created_at: String,
}

impl From<&Alert> for AlertView {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id,
            user_id: alert.user_id,
            name: alert.name.clone(),
            metric: alert.metric.clone(),
            threshold: alert.threshold,
            condition: alert.condition.as_str().to_string(),
            notification_method: alert.method.as_str().to_string(),
            sql_query: alert.sql_query.clone(),
            is_active: alert.is_active,
            last_checked: alert.last_checked.map(format_ts_iso),
            last_triggered: alert.last_triggered.map(format_ts_iso),
            trigger_count: alert.trigger_count,
            created_at: format_ts_iso(alert.created_at),
        }
    }
}

/// One stored exchange of the conversation memory.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub id: i64,
    pub user_id: i64,
    pub session_id: String,
    pub query_text: String,
    pub sql_query: Option<String>,
    pub result_summary: Option<String>,
    pub query_type: Option<String>,
    pub execution_time: Option<f64>,
    pub row_count: Option<i64>,
    pub created_at: String,
}

/// The SQL translation the assistant returns for a natural-language question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Translation {
    pub sql_query: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default = "default_query_type")]
    pub query_type: String,
    #[serde(default)]
    pub estimated_rows: String,
    #[serde(default)]
    pub performance_notes: String,
}

fn default_query_type() -> String {
    "general".to_string()
}

/// Chart recommendation for a result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartRecommendation {
    pub chart_type: String,
    #[serde(default)]
    pub x_axis: Option<String>,
    #[serde(default)]
    pub y_axis: Option<String>,
    #[serde(default)]
    pub color_by: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Format an epoch-seconds timestamp as ISO8601 (UTC).
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_parse_all_operators() {
        for op in [">", "<", ">=", "<=", "=", "!="] {
            let c = Condition::parse(op).unwrap();
            assert_eq!(c.as_str(), op);
        }
        assert!(Condition::parse("==").is_err());
        assert!(Condition::parse("").is_err());
    }

    #[test]
    fn test_condition_evaluation() {
        assert!(Condition::GreaterThan.is_met(10.0, 5.0));
        assert!(!Condition::GreaterThan.is_met(5.0, 5.0));
        assert!(Condition::GreaterOrEqual.is_met(5.0, 5.0));
        assert!(Condition::LessThan.is_met(4.9, 5.0));
        assert!(Condition::LessOrEqual.is_met(5.0, 5.0));
        assert!(Condition::Equal.is_met(5.0, 5.0));
        assert!(Condition::NotEqual.is_met(5.1, 5.0));
        assert!(!Condition::NotEqual.is_met(5.0, 5.0));
    }

    #[test]
    fn test_notify_method_routing() {
        assert!(NotifyMethod::Email.includes_email());
        assert!(!NotifyMethod::Email.includes_slack());
        assert!(NotifyMethod::Slack.includes_slack());
        assert!(!NotifyMethod::Slack.includes_email());
        assert!(NotifyMethod::Both.includes_email());
        assert!(NotifyMethod::Both.includes_slack());
        assert!(NotifyMethod::parse("pager").is_err());
    }

    #[test]
    fn test_translation_defaults() {
        let t: Translation = serde_json::from_str(r#"{"sql_query": "SELECT 1"}"#).unwrap();
        assert_eq!(t.sql_query, "SELECT 1");
        assert_eq!(t.query_type, "general");
        assert!(t.explanation.is_empty());
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }
}
