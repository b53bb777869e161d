//! User accounts and access tokens.
//!
//! Passwords are stored as PBKDF2-HMAC-SHA256 digests
//! (`pbkdf2-sha256$<iterations>$<salt hex>$<digest hex>`). Access tokens are
//! stateless HS256 JWTs carrying the username, role, and expiry; the signing
//! secret comes from the environment. `user_sessions` rows are audit records
//! only — logout deactivates them but cannot recall an already-issued token.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::User;

type HmacSha256 = Hmac<Sha256>;

const KDF_SCHEME: &str = "pbkdf2-sha256";
const KDF_ITERATIONS: u32 = 120_000;
const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

// ============ Password hashing ============

/// PBKDF2-HMAC-SHA256, single 32-byte block.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; DIGEST_LEN] {
    let mut mac = HmacSha256::new_from_slice(password).expect("HMAC can take key of any size");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = mac.finalize().into_bytes();

    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&u);

    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(password).expect("HMAC can take key of any size");
        mac.update(&u);
        u = mac.finalize().into_bytes();
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }

    out
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    let digest = pbkdf2_sha256(password.as_bytes(), &salt, KDF_ITERATIONS);
    format!(
        "{}${}${}${}",
        KDF_SCHEME,
        KDF_ITERATIONS,
        hex::encode(salt),
        hex::encode(digest)
    )
}

/// Verify a password against a stored hash. Malformed hashes verify false.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 4 || parts[0] != KDF_SCHEME {
        return false;
    }

    let iterations: u32 = match parts[1].parse() {
        Ok(n) => n,
        Err(_) => return false,
    };
    let salt = match hex::decode(parts[2]) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let expected = match hex::decode(parts[3]) {
        Ok(d) => d,
        Err(_) => return false,
    };

    let digest = pbkdf2_sha256(password.as_bytes(), &salt, iterations);

    // Constant-time comparison via HMAC over both digests
    let mut mac = HmacSha256::new_from_slice(&salt).expect("HMAC can take key of any size");
    mac.update(&digest);
    let a = mac.finalize().into_bytes();
    let mut mac = HmacSha256::new_from_slice(&salt).expect("HMAC can take key of any size");
    mac.update(&expected);
    let b = mac.finalize().into_bytes();

    a == b
}

// ============ Access tokens ============

/// JWT claims carried by an access token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Username.
    pub sub: String,
    /// User role (`"user"` or `"admin"`).
    pub role: String,
    /// Expiration (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    pub iat: i64,
}

/// Issue an access token for a user.
pub fn issue_token(secret: &str, user: &User, expiry_minutes: i64) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user.username.clone(),
        role: user.role.clone(),
        exp: now + expiry_minutes * 60,
        iat: now,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to sign access token")
}

/// Decode and validate an access token.
///
/// Errors carry the message `"token has expired"` or `"invalid token"` so
/// callers can surface the distinction the way the API contract requires.
pub fn decode_token(secret: &str, token: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => anyhow!("token has expired"),
        _ => anyhow!("invalid token"),
    })?;

    Ok(data.claims)
}

// ============ User store operations ============

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        full_name: row.get("full_name"),
        role: row.get("role"),
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: row.get("created_at"),
        last_login: row.get("last_login"),
    }
}

pub async fn get_user_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(user_from_row))
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(user_from_row))
}

pub async fn get_user_by_id(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(user_from_row))
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>> {
    let rows = sqlx::query("SELECT * FROM users ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(user_from_row).collect())
}

/// Create a user. Fails if the username or email is already registered.
pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    email: &str,
    password: &str,
    full_name: Option<&str>,
    role: &str,
) -> Result<User> {
    if username.trim().is_empty() {
        bail!("username must not be empty");
    }
    if get_user_by_username(pool, username).await?.is_some() {
        bail!("Username already registered");
    }
    if get_user_by_email(pool, email).await?.is_some() {
        bail!("Email already registered");
    }

    let password_hash = hash_password(password);
    let now = Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO users (username, email, password_hash, full_name, role, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(username)
    .bind(email)
    .bind(&password_hash)
    .bind(full_name)
    .bind(role)
    .bind(now)
    .execute(pool)
    .await?;

    get_user_by_username(pool, username)
        .await?
        .ok_or_else(|| anyhow!("Failed to create user"))
}

/// Check credentials. Returns the user on success, `None` otherwise.
pub async fn authenticate(
    pool: &SqlitePool,
    username: &str,
    password: &str,
) -> Result<Option<User>> {
    let user = match get_user_by_username(pool, username).await? {
        Some(u) => u,
        None => return Ok(None),
    };

    if !verify_password(password, &user.password_hash) {
        return Ok(None);
    }

    Ok(Some(user))
}

pub async fn update_last_login(pool: &SqlitePool, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(Utc::now().timestamp())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a login session (audit trail). Returns the session id.
pub async fn record_session(
    pool: &SqlitePool,
    user_id: i64,
    expiry_minutes: i64,
) -> Result<String> {
    let session_id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO user_sessions (user_id, session_id, created_at, expires_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&session_id)
    .bind(now)
    .bind(now + expiry_minutes * 60)
    .execute(pool)
    .await?;

    Ok(session_id)
}

/// Deactivate every session for a user (logout).
pub async fn deactivate_sessions(pool: &SqlitePool, user_id: i64) -> Result<()> {
    sqlx::query("UPDATE user_sessions SET is_active = 0 WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// CLI entry point — create a user.
pub async fn run_user_add(
    config: &crate::config::Config,
    username: &str,
    email: &str,
    password: &str,
    full_name: Option<&str>,
    admin: bool,
) -> Result<()> {
    let pool = crate::db::connect(config).await?;

    let role = if admin { "admin" } else { "user" };
    let user = create_user(&pool, username, email, password, full_name, role).await?;

    println!("Created {} ({}, role: {})", user.username, user.email, user.role);

    pool.close().await;
    Ok(())
}

/// CLI entry point — list users.
pub async fn run_user_list(config: &crate::config::Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;

    let users = list_users(&pool).await?;
    if users.is_empty() {
        println!("No users.");
    } else {
        println!("{:<6} {:<20} {:<30} {:<8} ACTIVE", "ID", "USERNAME", "EMAIL", "ROLE");
        for user in &users {
            println!(
                "{:<6} {:<20} {:<30} {:<8} {}",
                user.id, user.username, user.email, user.role, user.is_active
            );
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
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

    fn test_user(username: &str) -> User {
        User {
            id: 1,
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: String::new(),
            full_name: None,
            role: "user".to_string(),
            is_active: true,
            created_at: 0,
            last_login: None,
        }
    }

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("hunter2");
        assert!(hash.starts_with("pbkdf2-sha256$"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn test_password_hashes_are_salted() {
        let a = hash_password("same-password");
        let b = hash_password("same-password");
        assert_ne!(a, b);
        assert!(verify_password("same-password", &a));
        assert!(verify_password("same-password", &b));
    }

    #[test]
    fn test_malformed_hash_verifies_false() {
        assert!(!verify_password("x", "not-a-hash"));
        assert!(!verify_password("x", "pbkdf2-sha256$abc$zz$zz"));
        assert!(!verify_password("x", ""));
    }

    #[test]
    fn test_token_roundtrip() {
        let user = test_user("alice");
        let token = issue_token("secret", &user, 60).unwrap();
        let claims = decode_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, "user");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_wrong_secret_rejected() {
        let user = test_user("alice");
        let token = issue_token("secret", &user, 60).unwrap();
        let err = decode_token("other-secret", &token).unwrap_err();
        assert!(err.to_string().contains("invalid token"));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Expired well past the default validation leeway
        let user = test_user("alice");
        let token = issue_token("secret", &user, -120).unwrap();
        let err = decode_token("secret", &token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let err = decode_token("secret", "not.a.token").unwrap_err();
        assert!(err.to_string().contains("invalid token"));
    }

    #[tokio::test]
    async fn test_create_and_authenticate_user() {
        let pool = test_pool().await;
        let user = create_user(&pool, "bob", "bob@example.com", "pw", Some("Bob"), "user")
            .await
            .unwrap();
        assert_eq!(user.username, "bob");
        assert!(user.is_active);

        let ok = authenticate(&pool, "bob", "pw").await.unwrap();
        assert!(ok.is_some());
        let bad = authenticate(&pool, "bob", "wrong").await.unwrap();
        assert!(bad.is_none());
        let missing = authenticate(&pool, "nobody", "pw").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let pool = test_pool().await;
        create_user(&pool, "bob", "bob@example.com", "pw", None, "user")
            .await
            .unwrap();
        let err = create_user(&pool, "bob", "other@example.com", "pw", None, "user")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Username already registered"));

        let err = create_user(&pool, "bob2", "bob@example.com", "pw", None, "user")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Email already registered"));
    }

    #[tokio::test]
    async fn test_sessions_deactivate_on_logout() {
        let pool = test_pool().await;
        let user = create_user(&pool, "bob", "bob@example.com", "pw", None, "user")
            .await
            .unwrap();
        record_session(&pool, user.id, 60).await.unwrap();
        record_session(&pool, user.id, 60).await.unwrap();

        deactivate_sessions(&pool, user.id).await.unwrap();

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_sessions WHERE user_id = ? AND is_active = 1",
        )
        .bind(user.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(active, 0);
    }
}
