use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn cva_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cva");
    path
}

/// Reserve a local port for a server test.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn setup_test_env(bind_port: u16) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // The warehouse/assistant endpoints point at closed local ports so
    // connectivity probes fail fast instead of hitting the network.
    let config_content = format!(
        r#"[store]
path = "{root}/data/conversant.sqlite"

[server]
bind = "127.0.0.1:{bind_port}"

[warehouse]
account = "testacct"
user = "tester"
database = "SNOWFLAKE_SAMPLE_DATA"
schema = "TPCH_SF1"
warehouse = "COMPUTE_WH"
timeout_secs = 2
max_retries = 0
base_url = "http://127.0.0.1:9"

[assistant]
timeout_secs = 2
max_retries = 0
base_url = "http://127.0.0.1:9"

[cache]
ttl_secs = 60
max_entries = 100
"#,
        root = root.display(),
        bind_port = bind_port,
    );

    let config_path = config_dir.join("cva.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cva(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cva_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("SNOWFLAKE_PASSWORD")
        .env_remove("ANTHROPIC_API_KEY")
        .env("CONVERSANT_SECRET_KEY", "integration-test-secret")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cva binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_store() {
    let (_tmp, config_path) = setup_test_env(free_port());

    let (stdout, stderr, success) = run_cva(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(free_port());

    let (_, _, success1) = run_cva(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cva(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_user_add_and_list() {
    let (_tmp, config_path) = setup_test_env(free_port());
    run_cva(&config_path, &["init"]);

    let (stdout, stderr, success) = run_cva(
        &config_path,
        &[
            "user", "add", "alice", "alice@example.com", "--password", "s3cret",
        ],
    );
    assert!(success, "user add failed: {}{}", stdout, stderr);
    assert!(stdout.contains("alice"));

    let (stdout, _, success) = run_cva(&config_path, &["user", "list"]);
    assert!(success);
    assert!(stdout.contains("alice"));
    assert!(stdout.contains("alice@example.com"));
}

#[test]
fn test_user_add_duplicate_rejected() {
    let (_tmp, config_path) = setup_test_env(free_port());
    run_cva(&config_path, &["init"]);

    run_cva(
        &config_path,
        &[
            "user", "add", "bob", "bob@example.com", "--password", "pw",
        ],
    );
    let (_, stderr, success) = run_cva(
        &config_path,
        &[
            "user", "add", "bob", "other@example.com", "--password", "pw",
        ],
    );
    assert!(!success, "Duplicate username should fail");
    assert!(stderr.contains("already registered"), "got: {}", stderr);
}

#[test]
fn test_sql_rejects_forbidden_statement() {
    let (_tmp, config_path) = setup_test_env(free_port());
    run_cva(&config_path, &["init"]);

    let (_, stderr, success) = run_cva(&config_path, &["sql", "DROP TABLE ORDERS"]);
    assert!(!success, "Forbidden statement should fail");
    assert!(stderr.contains("Forbidden operation"), "got: {}", stderr);
}

#[test]
fn test_sql_requires_warehouse_password() {
    let (_tmp, config_path) = setup_test_env(free_port());
    run_cva(&config_path, &["init"]);

    // Valid statement, but no SNOWFLAKE_PASSWORD in the environment
    let (_, stderr, success) = run_cva(&config_path, &["sql", "SELECT 1"]);
    assert!(!success);
    assert!(stderr.contains("SNOWFLAKE_PASSWORD"), "got: {}", stderr);
}

#[test]
fn test_ask_unknown_user() {
    let (_tmp, config_path) = setup_test_env(free_port());
    run_cva(&config_path, &["init"]);

    let (_, stderr, success) = run_cva(
        &config_path,
        &["ask", "how are sales", "--user", "nobody"],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown user"), "got: {}", stderr);
}

#[test]
fn test_stats_offline() {
    let (_tmp, config_path) = setup_test_env(free_port());
    run_cva(&config_path, &["init"]);

    let (stdout, _, success) = run_cva(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Users"));
    assert!(stdout.contains("Query cache"));
    assert!(stdout.contains("Alerts"));
}

#[test]
fn test_templates() {
    let (_tmp, config_path) = setup_test_env(free_port());

    let (stdout, _, success) = run_cva(&config_path, &["templates"]);
    assert!(success);
    assert!(stdout.contains("Top 10 Suppliers by Revenue"));
    assert!(stdout.contains("Monthly Sales Trend"));
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("cva.toml");
    fs::write(&config_path, "[store]\npath = \"x.sqlite\"\n").unwrap();

    let (_, stderr, success) = run_cva(&config_path, &["init"]);
    assert!(!success, "Config without required sections should fail");
    assert!(!stderr.is_empty());
}

// ============ HTTP API ============

/// Kills the server process when the test ends.
struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_server(config_path: &Path) -> ServerGuard {
    let binary = cva_binary();
    let child = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(["serve", "api"])
        .env_remove("SNOWFLAKE_PASSWORD")
        .env_remove("ANTHROPIC_API_KEY")
        .env("CONVERSANT_SECRET_KEY", "integration-test-secret")
        .spawn()
        .expect("Failed to spawn cva serve api");
    ServerGuard(child)
}

/// Poll the banner endpoint until the server answers (the CI warm-up
/// window is 40s).
fn wait_for_server(base: &str) -> reqwest::blocking::Client {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(40);
    loop {
        match client.get(format!("{}/", base)).send() {
            Ok(resp) if resp.status().is_success() => return client,
            _ if Instant::now() > deadline => panic!("Server did not come up within 40s"),
            _ => std::thread::sleep(Duration::from_millis(250)),
        }
    }
}

#[test]
fn test_api_health_and_auth_flow() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    run_cva(&config_path, &["init"]);

    let _server = spawn_server(&config_path);
    let base = format!("http://127.0.0.1:{}", port);
    let client = wait_for_server(&base);

    // Banner
    let banner: serde_json::Value = client
        .get(format!("{}/", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(banner["status"], "active");

    // Health answers 200 even with unreachable dependencies
    let resp = client.get(format!("{}/health", base)).send().unwrap();
    assert!(resp.status().is_success());
    let health: serde_json::Value = resp.json().unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["services"]["warehouse"], false);
    assert_eq!(health["services"]["api"], "active");

    // Unauthenticated request follows the error contract
    let resp = client.get(format!("{}/auth/me", base)).send().unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    // Register → login → me
    let resp = client
        .post(format!("{}/auth/register", base))
        .json(&serde_json::json!({
            "username": "alice",
            "email": "alice@example.com",
            "password": "s3cret",
            "full_name": "Alice",
        }))
        .send()
        .unwrap();
    assert!(resp.status().is_success(), "register failed");
    let profile: serde_json::Value = resp.json().unwrap();
    assert_eq!(profile["username"], "alice");
    assert_eq!(profile["role"], "user");

    let resp = client
        .post(format!("{}/auth/login", base))
        .json(&serde_json::json!({"username": "alice", "password": "s3cret"}))
        .send()
        .unwrap();
    assert!(resp.status().is_success(), "login failed");
    let login: serde_json::Value = resp.json().unwrap();
    let token = login["access_token"].as_str().unwrap().to_string();
    assert_eq!(login["token_type"], "bearer");
    assert!(login["session_id"].as_str().is_some());

    let resp = client
        .get(format!("{}/auth/me", base))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let me: serde_json::Value = resp.json().unwrap();
    assert_eq!(me["username"], "alice");

    // Wrong password
    let resp = client
        .post(format!("{}/auth/login", base))
        .json(&serde_json::json!({"username": "alice", "password": "wrong"}))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Garbage token
    let resp = client
        .get(format!("{}/auth/me", base))
        .bearer_auth("not.a.token")
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Non-admin on an admin route
    let resp = client
        .get(format!("{}/auth/users", base))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "forbidden");
}

#[test]
fn test_api_saved_queries_and_alerts_offline() {
    let port = free_port();
    let (_tmp, config_path) = setup_test_env(port);
    run_cva(&config_path, &["init"]);

    let _server = spawn_server(&config_path);
    let base = format!("http://127.0.0.1:{}", port);
    let client = wait_for_server(&base);

    // Register + login
    client
        .post(format!("{}/auth/register", base))
        .json(&serde_json::json!({
            "username": "bob",
            "email": "bob@example.com",
            "password": "pw",
        }))
        .send()
        .unwrap();
    let login: serde_json::Value = client
        .post(format!("{}/auth/login", base))
        .json(&serde_json::json!({"username": "bob", "password": "pw"}))
        .send()
        .unwrap()
        .json()
        .unwrap();
    let token = login["access_token"].as_str().unwrap().to_string();

    // Save a query
    let resp = client
        .post(format!("{}/queries/saved", base))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "name": "order count",
            "sql_query": "SELECT COUNT(*) FROM ORDERS",
            "tags": ["orders"],
        }))
        .send()
        .unwrap();
    assert!(resp.status().is_success(), "save query failed");
    let saved: serde_json::Value = resp.json().unwrap();
    let saved_id = saved["id"].as_i64().unwrap();
    assert_eq!(saved["execution_count"], 0);

    // A mutating statement is rejected by the guard
    let resp = client
        .post(format!("{}/queries/saved", base))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "name": "bad",
            "sql_query": "DROP TABLE ORDERS",
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    // List + fetch
    let listing: serde_json::Value = client
        .get(format!("{}/queries/saved", base))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);

    let resp = client
        .get(format!("{}/queries/saved/{}", base, saved_id))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert!(resp.status().is_success());

    // Unknown id → 404 with contract body
    let resp = client
        .get(format!("{}/queries/saved/99999", base))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // Validate-sql works without warehouse access for invalid statements
    let resp = client
        .post(format!("{}/analytics/validate-sql", base))
        .bearer_auth(&token)
        .json(&serde_json::json!({"sql_query": "DELETE FROM ORDERS"}))
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let verdict: serde_json::Value = resp.json().unwrap();
    assert_eq!(verdict["is_valid"], false);
    assert!(verdict["message"]
        .as_str()
        .unwrap()
        .contains("Forbidden operation"));

    // Create an alert and read it back
    let resp = client
        .post(format!("{}/alerts", base))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "alert_name": "revenue floor",
            "metric": "total_revenue",
            "threshold_value": 1000.0,
            "condition": "<",
            "notification_method": "slack",
            "sql_query": "SELECT SUM(TOTALPRICE) as total_revenue FROM ORDERS",
        }))
        .send()
        .unwrap();
    assert!(resp.status().is_success(), "create alert failed");
    let alert: serde_json::Value = resp.json().unwrap();
    let alert_id = alert["id"].as_i64().unwrap();
    assert_eq!(alert["is_active"], true);
    assert_eq!(alert["trigger_count"], 0);

    // Bad condition rejected
    let resp = client
        .post(format!("{}/alerts", base))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "alert_name": "bad",
            "metric": "m",
            "threshold_value": 1.0,
            "condition": "~",
            "notification_method": "slack",
            "sql_query": "SELECT 1",
        }))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Partial update
    let resp = client
        .put(format!("{}/alerts/{}", base, alert_id))
        .bearer_auth(&token)
        .json(&serde_json::json!({"is_active": false}))
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let updated: serde_json::Value = resp.json().unwrap();
    assert_eq!(updated["is_active"], false);

    // History starts empty
    let history: serde_json::Value = client
        .get(format!("{}/alerts/{}/history", base, alert_id))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(history["count"], 0);

    // check-all: the only alert is now inactive, so nothing is checked
    let report: serde_json::Value = client
        .post(format!("{}/alerts/check-all", base))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(report["checked_count"], 0);

    // Templates
    let templates: serde_json::Value = client
        .get(format!("{}/queries/templates", base))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(templates["count"], 4);

    // Cache stats (empty) + admin-only clear
    let stats: serde_json::Value = client
        .get(format!("{}/queries/cache/stats", base))
        .bearer_auth(&token)
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(stats["cache_stats"]["total_entries"], 0);

    let resp = client
        .delete(format!("{}/queries/cache/clear", base))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // Delete the alert
    let resp = client
        .delete(format!("{}/alerts/{}", base, alert_id))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert!(resp.status().is_success());
    let resp = client
        .get(format!("{}/alerts/{}", base, alert_id))
        .bearer_auth(&token)
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
