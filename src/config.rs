use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Origin allowed to call the API from a browser (the dashboard).
    /// `"*"` permits any origin.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

fn default_cors_origin() -> String {
    "*".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_token_expiry_minutes")]
    pub token_expiry_minutes: i64,
    /// Env var holding the token-signing secret. Never stored in the file.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiry_minutes: default_token_expiry_minutes(),
            secret_key_env: default_secret_key_env(),
        }
    }
}

fn default_token_expiry_minutes() -> i64 {
    1440 // 24 hours
}
fn default_secret_key_env() -> String {
    "CONVERSANT_SECRET_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    pub account: String,
    pub user: String,
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Env var holding the warehouse password.
    #[serde(default = "default_warehouse_password_env")]
    pub password_env: String,
    /// Row cap appended to SELECTs that carry no LIMIT of their own.
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Override the `https://{account}.snowflakecomputing.com` base URL
    /// (used by tests to point at a stub server).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_warehouse_password_env() -> String {
    "SNOWFLAKE_PASSWORD".to_string()
}
fn default_max_rows() -> u64 {
    100_000
}
fn default_query_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Env var holding the API key. Older deployments of this product used
    /// `CLAUDE_API_KEY` and can keep it by overriding this field.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_assistant_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_assistant_max_retries")]
    pub max_retries: u32,
    /// Override the Anthropic API base URL (used by tests).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_assistant_timeout_secs(),
            max_retries: default_assistant_max_retries(),
            base_url: None,
        }
    }
}

fn default_model() -> String {
    "claude-3-sonnet-20240229".to_string()
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_assistant_timeout_secs() -> u64 {
    30
}
fn default_assistant_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_ttl_secs() -> i64 {
    3600 // 1 hour
}
fn default_cache_max_entries() -> i64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    /// Number of recent exchanges replayed into the translation prompt.
    #[serde(default = "default_context_window")]
    pub context_window: i64,
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_context_window() -> i64 {
    5
}
fn default_history_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_from: Option<String>,
    #[serde(default = "default_smtp_username_env")]
    pub smtp_username_env: String,
    #[serde(default = "default_smtp_password_env")]
    pub smtp_password_env: String,
    #[serde(default = "default_webhook_env")]
    pub webhook_env: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_from: None,
            smtp_username_env: default_smtp_username_env(),
            smtp_password_env: default_smtp_password_env(),
            webhook_env: default_webhook_env(),
        }
    }
}

fn default_smtp_port() -> u16 {
    587
}
fn default_smtp_username_env() -> String {
    "SMTP_USERNAME".to_string()
}
fn default_smtp_password_env() -> String {
    "SMTP_PASSWORD".to_string()
}
fn default_webhook_env() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}

impl Config {
    /// Token-signing secret from the environment.
    pub fn secret_key(&self) -> Result<String> {
        std::env::var(&self.auth.secret_key_env).with_context(|| {
            format!("{} environment variable not set", self.auth.secret_key_env)
        })
    }

    /// Minimal config for tests and config-less commands.
    pub fn minimal() -> Self {
        Self {
            store: StoreConfig {
                path: PathBuf::from("data/conversant.sqlite"),
            },
            server: ServerConfig {
                bind: "127.0.0.1:8000".to_string(),
                cors_origin: default_cors_origin(),
            },
            auth: AuthConfig::default(),
            warehouse: WarehouseConfig {
                account: "test".to_string(),
                user: "test".to_string(),
                database: "TEST".to_string(),
                schema: "PUBLIC".to_string(),
                warehouse: "TEST_WH".to_string(),
                role: None,
                password_env: default_warehouse_password_env(),
                max_rows: default_max_rows(),
                timeout_secs: default_query_timeout_secs(),
                max_retries: default_max_retries(),
                base_url: None,
            },
            assistant: AssistantConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate server
    if config.server.bind.is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    // Validate auth
    if config.auth.token_expiry_minutes < 1 {
        anyhow::bail!("auth.token_expiry_minutes must be >= 1");
    }

    // Validate warehouse
    if config.warehouse.account.is_empty() {
        anyhow::bail!("warehouse.account must not be empty");
    }
    if config.warehouse.user.is_empty() {
        anyhow::bail!("warehouse.user must not be empty");
    }
    if config.warehouse.max_rows == 0 {
        anyhow::bail!("warehouse.max_rows must be > 0");
    }

    // Validate cache
    if config.cache.ttl_secs < 1 {
        anyhow::bail!("cache.ttl_secs must be >= 1");
    }
    if config.cache.max_entries < 1 {
        anyhow::bail!("cache.max_entries must be >= 1");
    }

    // Validate memory
    if config.memory.context_window < 1 {
        anyhow::bail!("memory.context_window must be >= 1");
    }

    Ok(config)
}
