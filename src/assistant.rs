//! Analytics assistant backed by the Anthropic Messages API.
//!
//! The assistant turns natural-language questions into warehouse SQL,
//! summarizes results into business insights, proposes follow-up questions,
//! and recommends chart types. All calls go through one `complete` helper
//! speaking the Messages API conventions:
//! - Auth via `x-api-key` header (not `Authorization: Bearer`)
//! - Required `anthropic-version` header
//! - System prompt as a top-level `system` field
//!
//! Translation is the only operation allowed to fail the pipeline; insight,
//! follow-up, and chart calls degrade to local fallbacks so a flaky model
//! response never loses an already-computed query result.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::catalog;
use crate::config::{AssistantConfig, Config};
use crate::models::{ChartRecommendation, QueryResult, Translation};
use crate::warehouse;

/// The default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// The required Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Per-operation output token caps.
const TRANSLATE_MAX_TOKENS: u32 = 1500;
const INSIGHTS_MAX_TOKENS: u32 = 800;
const FOLLOW_UPS_MAX_TOKENS: u32 = 400;
const CHART_MAX_TOKENS: u32 = 500;
const PROBE_MAX_TOKENS: u32 = 10;

pub struct Assistant {
    client: reqwest::Client,
    config: AssistantConfig,
    base_url: String,
}

impl Assistant {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.assistant.timeout_secs))
            .build()?;

        let base_url = config
            .assistant
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client,
            config: config.assistant.clone(),
            base_url,
        })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var(&self.config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", self.config.api_key_env))
    }

    /// One Messages API call; returns the concatenated text blocks.
    async fn complete(
        &self,
        system: Option<&str>,
        user_message: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let api_key = self.api_key()?;

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": user_message}],
        });
        if let Some(system) = system {
            body["system"] = Value::String(system.to_string());
        }

        let url = format!("{}/messages", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return extract_text(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow!("Assistant API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Assistant API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Assistant request failed after retries")))
    }

    /// Minimal probe for health reporting.
    pub async fn test_connection(&self) -> bool {
        match self.complete(None, "Hello", PROBE_MAX_TOKENS).await {
            Ok(text) => !text.is_empty(),
            Err(e) => {
                warn!(error = %e, "assistant connection test failed");
                false
            }
        }
    }

    /// Translate a natural-language question into warehouse SQL.
    ///
    /// `context` carries recent conversation exchanges (may be empty). The
    /// returned SQL has already passed the statement guard.
    pub async fn translate(&self, question: &str, context: &str) -> Result<Translation> {
        let system = translate_system_prompt();

        let user_message = if context.is_empty() {
            question.to_string()
        } else {
            format!(
                "Previous conversation context:\n{}\n\nCurrent query: {}",
                context, question
            )
        };

        let response = self
            .complete(Some(&system), &user_message, TRANSLATE_MAX_TOKENS)
            .await?;

        let translation = parse_translation(&response)?;
        warehouse::validate_statement(&translation.sql_query)?;

        Ok(translation)
    }

    /// Summarize query results into business insights. Never fails the
    /// pipeline: model errors produce an apologetic fallback string.
    pub async fn insights(&self, result: &QueryResult, question: &str) -> String {
        if result.data.is_empty() {
            return "No data found for the given query.".to_string();
        }

        let sample = &result.data[..result.data.len().min(5)];
        let sample_json =
            serde_json::to_string_pretty(sample).unwrap_or_else(|_| "[]".to_string());

        let system = "You are a business analytics expert. Analyze the query results and \
                      provide actionable insights. Focus on:\n\
                      1. Key findings and trends\n\
                      2. Business implications\n\
                      3. Recommendations for action\n\
                      4. Notable patterns or anomalies\n\n\
                      Keep the response concise but informative, suitable for business \
                      stakeholders.";

        let user_message = format!(
            "Original Query: {}\n\n\
             Query Results Summary:\n\
             - Rows returned: {}\n\
             - Columns: {}\n\
             - Execution time: {:.2} seconds\n\n\
             Sample Data (first 5 rows):\n{}\n\n\
             Please provide insights and analysis of these results.",
            question,
            result.metadata.row_count,
            result.metadata.columns.join(", "),
            result.execution_time,
            sample_json
        );

        match self
            .complete(Some(system), &user_message, INSIGHTS_MAX_TOKENS)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "insight generation failed");
                format!("Could not generate insights: {}", e)
            }
        }
    }

    /// Suggest 3-5 follow-up questions. Falls back to canned suggestions.
    pub async fn follow_ups(&self, question: &str, result: &QueryResult) -> Vec<String> {
        if result.data.is_empty() {
            return vec![
                "Modify your query to include different filters or time periods".to_string(),
            ];
        }

        let sample = &result.data[..result.data.len().min(3)];
        let sample_json =
            serde_json::to_string_pretty(sample).unwrap_or_else(|_| "[]".to_string());

        let system = "You are a business analyst. Based on the original query and results, \
                      suggest 3-5 relevant follow-up questions that would provide additional \
                      insights. Focus on:\n\
                      1. Drill-down analysis\n\
                      2. Comparative analysis\n\
                      3. Time-based trends\n\
                      4. Related metrics\n\
                      5. Root cause analysis\n\n\
                      Return only the questions, one per line, without numbering or bullets.";

        let user_message = format!(
            "Original Query: {}\n\
             Number of results: {}\n\
             Columns in results: {}\n\n\
             Sample data: {}\n\n\
             Suggest follow-up questions for deeper analysis.",
            question,
            result.metadata.row_count,
            result.metadata.columns.join(", "),
            sample_json
        );

        match self
            .complete(Some(system), &user_message, FOLLOW_UPS_MAX_TOKENS)
            .await
        {
            Ok(text) => text
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            Err(e) => {
                warn!(error = %e, "follow-up suggestion failed");
                vec!["Explore related data by modifying your query".to_string()]
            }
        }
    }

    /// Recommend a chart for the result set, falling back to local
    /// heuristics when the model response doesn't parse.
    pub async fn chart_recommendation(
        &self,
        result: &QueryResult,
        question: &str,
    ) -> ChartRecommendation {
        if result.data.is_empty() {
            return ChartRecommendation {
                chart_type: "table".to_string(),
                x_axis: None,
                y_axis: None,
                color_by: None,
                reason: "No data to visualize".to_string(),
                title: None,
            };
        }

        let sample = &result.data[..result.data.len().min(5)];
        let sample_json =
            serde_json::to_string_pretty(sample).unwrap_or_else(|_| "[]".to_string());

        let system = "You are a data visualization expert. Based on the query results, \
                      recommend the most appropriate chart type and configuration.\n\n\
                      Consider:\n\
                      1. Data types (numerical, categorical, date/time)\n\
                      2. Number of dimensions\n\
                      3. Data volume\n\
                      4. Business context\n\
                      5. Clarity of visualization\n\n\
                      Respond with a JSON object:\n\
                      {\n\
                          \"chart_type\": \"bar|line|pie|scatter|heatmap|table\",\n\
                          \"x_axis\": \"column_name\",\n\
                          \"y_axis\": \"column_name\",\n\
                          \"color_by\": \"column_name or null\",\n\
                          \"reason\": \"explanation for chart choice\",\n\
                          \"title\": \"suggested chart title\"\n\
                      }";

        let user_message = format!(
            "Original Query: {}\n\
             Columns: {}\n\
             Sample Data: {}\n\
             Total Rows: {}\n\n\
             Recommend the best visualization for this data.",
            question,
            result.metadata.columns.join(", "),
            sample_json,
            result.metadata.row_count
        );

        match self
            .complete(Some(system), &user_message, CHART_MAX_TOKENS)
            .await
        {
            Ok(text) => match extract_json_payload(&text)
                .and_then(|payload| serde_json::from_str::<ChartRecommendation>(&payload).ok())
            {
                Some(rec) => rec,
                None => fallback_chart(&result.metadata.columns, &result.data),
            },
            Err(e) => {
                warn!(error = %e, "chart recommendation failed");
                fallback_chart(&result.metadata.columns, &result.data)
            }
        }
    }
}

/// Pull the concatenated text blocks out of a Messages API response.
fn extract_text(body: &Value) -> Result<String> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| anyhow!("Assistant response missing content array"))?;

    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("text"))
        .filter_map(|b| b["text"].as_str())
        .collect();

    if text.is_empty() {
        bail!("Assistant response contained no text content");
    }

    Ok(text.join(""))
}

/// System prompt for text-to-SQL translation: schema catalog, guidelines,
/// response contract, worked example.
fn translate_system_prompt() -> String {
    format!(
        r#"You are an expert SQL analyst specializing in supply chain and business analytics. Your task is to convert natural language queries into precise SQL queries for a Snowflake database.

{}
IMPORTANT GUIDELINES:
1. Always use proper table and column names exactly as defined in the schema
2. Include appropriate JOINs when querying multiple tables
3. Add LIMIT clauses for safety, especially with LINEITEM table (6M+ rows)
4. Use proper date functions and formatting for Snowflake
5. Include meaningful column aliases for better readability
6. Consider performance implications of queries
7. Only generate SELECT, WITH, SHOW, or DESCRIBE statements
8. Use appropriate aggregation functions when summarizing data
9. Include proper WHERE clauses for filtering
10. Use CASE statements for conditional logic when needed

RESPONSE FORMAT:
Always respond with a JSON object containing:
{{
    "sql_query": "the SQL query",
    "explanation": "brief explanation of what the query does",
    "query_type": "type of analysis (e.g., 'supplier_performance', 'sales_analysis', 'inventory_check')",
    "estimated_rows": "estimated number of rows returned",
    "performance_notes": "any performance considerations or optimizations"
}}

EXAMPLE:
User: "Show me top 10 suppliers by revenue last month"
Response: {{
    "sql_query": "SELECT s.NAME as supplier_name, SUM(l.EXTENDEDPRICE * (1 - l.DISCOUNT)) as total_revenue FROM SUPPLIER s JOIN LINEITEM l ON s.SUPPKEY = l.SUPPKEY WHERE l.SHIPDATE >= DATEADD(month, -1, CURRENT_DATE) GROUP BY s.SUPPKEY, s.NAME ORDER BY total_revenue DESC LIMIT 10",
    "explanation": "Retrieves top 10 suppliers by total revenue in the last month, joining SUPPLIER and LINEITEM tables",
    "query_type": "supplier_performance",
    "estimated_rows": "10",
    "performance_notes": "Uses date filter to limit LINEITEM scan, includes LIMIT for safety"
}}"#,
        catalog::prompt_context()
    )
}

/// Extract a JSON payload from a model response: a ```json fenced block
/// first, then the outermost `{...}` object.
pub fn extract_json_payload(text: &str) -> Option<String> {
    if let Some(fence_start) = text.find("```json") {
        let after = &text[fence_start + "```json".len()..];
        if let Some(fence_end) = after.find("```") {
            return Some(after[..fence_end].trim().to_string());
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(text[start..=end].to_string())
    } else {
        None
    }
}

/// Last-resort extraction of a bare SELECT statement from prose.
pub fn extract_select_fallback(text: &str) -> Option<String> {
    // Byte-wise ASCII scan: to_uppercase() may shift byte offsets when the
    // response contains non-ASCII prose
    let bytes = text.as_bytes();
    let start = (0..bytes.len().saturating_sub(5))
        .find(|&i| bytes[i..i + 6].eq_ignore_ascii_case(b"SELECT"))?;
    let rest = &text[start..];
    let end = rest.find("\n\n").unwrap_or(rest.len());
    let sql = rest[..end].trim().trim_end_matches("```").trim();
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

/// Parse a translation response, tolerating markdown wrapping and falling
/// back to bare-SQL extraction when the JSON contract wasn't honored.
pub fn parse_translation(response: &str) -> Result<Translation> {
    if let Some(payload) = extract_json_payload(response) {
        if let Ok(translation) = serde_json::from_str::<Translation>(&payload) {
            if !translation.sql_query.trim().is_empty() {
                return Ok(translation);
            }
        }
    }

    if let Some(sql) = extract_select_fallback(response) {
        return Ok(Translation {
            sql_query: sql,
            explanation: "SQL query extracted from response".to_string(),
            query_type: "general".to_string(),
            estimated_rows: "unknown".to_string(),
            performance_notes: "Manual extraction - review performance".to_string(),
        });
    }

    bail!("Could not extract SQL query from assistant response")
}

/// Chart recommendation from simple column-shape heuristics.
pub fn fallback_chart(columns: &[String], data: &[Value]) -> ChartRecommendation {
    if data.is_empty() || columns.is_empty() {
        return ChartRecommendation {
            chart_type: "table".to_string(),
            x_axis: None,
            y_axis: None,
            color_by: None,
            reason: "Insufficient data".to_string(),
            title: None,
        };
    }

    let mut numeric_columns = Vec::new();
    let mut categorical_columns = Vec::new();
    let mut date_columns = Vec::new();

    let sample = &data[0];
    for col in columns {
        let value = &sample[col.as_str()];
        if value.is_number() {
            numeric_columns.push(col.clone());
        } else if ["date", "time", "month", "year"]
            .iter()
            .any(|ind| col.to_lowercase().contains(ind))
        {
            date_columns.push(col.clone());
        } else {
            categorical_columns.push(col.clone());
        }
    }

    if numeric_columns.len() >= 2 {
        ChartRecommendation {
            chart_type: "scatter".to_string(),
            x_axis: Some(numeric_columns[0].clone()),
            y_axis: Some(numeric_columns[1].clone()),
            color_by: None,
            reason: "Two numeric columns suitable for scatter plot".to_string(),
            title: None,
        }
    } else if numeric_columns.len() == 1 && !categorical_columns.is_empty() {
        ChartRecommendation {
            chart_type: "bar".to_string(),
            x_axis: Some(categorical_columns[0].clone()),
            y_axis: Some(numeric_columns[0].clone()),
            color_by: None,
            reason: "Categorical and numeric data suitable for bar chart".to_string(),
            title: None,
        }
    } else if !date_columns.is_empty() && !numeric_columns.is_empty() {
        ChartRecommendation {
            chart_type: "line".to_string(),
            x_axis: Some(date_columns[0].clone()),
            y_axis: Some(numeric_columns[0].clone()),
            color_by: None,
            reason: "Time series data suitable for line chart".to_string(),
            title: None,
        }
    } else {
        ChartRecommendation {
            chart_type: "table".to_string(),
            x_axis: None,
            y_axis: None,
            color_by: None,
            reason: "Data structure best suited for tabular display".to_string(),
            title: None,
        }
    }
}
