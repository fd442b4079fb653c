//! SQLite persistence: stored responses, API keys, and usage logs.
//!
//! One relational store with per-statement atomicity; every write is an
//! independent insert keyed by a unique generated id, so concurrent requests
//! never conflict. Schema is created idempotently at startup.

use chrono::Utc;
use nanoid::nanoid;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::RelayError;

/// Sigil prefixing every issued key; the stored display prefix is the first
/// 8 characters of the full plaintext.
pub const KEY_SIGIL: &str = "cdx_";
const KEY_SECRET_LEN: usize = 32;
const KEY_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Failed,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Completed => "completed",
            ResponseStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Immutable once written; the only permitted mutation is deletion.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResponse {
    pub id: String,
    pub model: String,
    pub status: String,
    pub input: String,
    pub output: String,
    pub output_text: String,
    #[serde(flatten)]
    pub usage: Usage,
    pub created_at: i64,
    pub metadata: Value,
}

/// Persisted key record. The plaintext is never stored; `key_hash` is the
/// one-way SHA-256 digest used for verification.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub rate_limit: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

/// Returned exactly once, at issuance.
#[derive(Debug)]
pub struct IssuedKey {
    pub record: ApiKeyRecord,
    pub plaintext: String,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(database_path: &str) -> Result<Self, RelayError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                output_text TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                rate_limit INTEGER,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (api_key_id) REFERENCES api_keys(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----- responses -----

    pub async fn insert_response(&self, response: &StoredResponse) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO responses (
                id, model, status, input, output, output_text,
                input_tokens, output_tokens, total_tokens, created_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&response.id)
        .bind(&response.model)
        .bind(&response.status)
        .bind(&response.input)
        .bind(&response.output)
        .bind(&response.output_text)
        .bind(response.usage.input_tokens)
        .bind(response.usage.output_tokens)
        .bind(response.usage.total_tokens)
        .bind(response.created_at)
        .bind(response.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_response(&self, id: &str) -> Result<Option<StoredResponse>, RelayError> {
        let row = sqlx::query("SELECT * FROM responses WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_response).transpose().map_err(Into::into)
    }

    pub async fn list_responses(&self, limit: usize) -> Result<Vec<StoredResponse>, RelayError> {
        let limit = limit.clamp(1, 500) as i64;
        let rows = sqlx::query("SELECT * FROM responses ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(row_to_response)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub async fn delete_response(&self, id: &str) -> Result<bool, RelayError> {
        let result = sqlx::query("DELETE FROM responses WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn response_count(&self) -> Result<i64, RelayError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM responses")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ----- api keys -----

    /// Mint a new key. The plaintext exists only in the returned value.
    pub async fn issue_key(
        &self,
        name: &str,
        scopes: Vec<String>,
        rate_limit: Option<i64>,
        expires_at: Option<i64>,
    ) -> Result<IssuedKey, RelayError> {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(KEY_SECRET_LEN)
            .map(char::from)
            .collect();
        let plaintext = format!("{KEY_SIGIL}{secret}");
        let key_hash = hash_key(&plaintext);
        let key_prefix = plaintext[..KEY_PREFIX_LEN].to_owned();

        let record = ApiKeyRecord {
            id: format!("key_{}", nanoid!(12)),
            name: name.to_owned(),
            key_hash,
            key_prefix,
            scopes,
            is_active: true,
            rate_limit,
            expires_at,
            created_at: Utc::now().timestamp(),
            last_used_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, name, key_hash, key_prefix, scopes, is_active,
                rate_limit, expires_at, created_at, last_used_at
            ) VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, NULL)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.key_hash)
        .bind(&record.key_prefix)
        .bind(serde_json::to_string(&record.scopes).unwrap_or_else(|_| "[]".to_owned()))
        .bind(record.rate_limit)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(IssuedKey { record, plaintext })
    }

    pub async fn list_keys(&self, include_inactive: bool) -> Result<Vec<ApiKeyRecord>, RelayError> {
        let sql = if include_inactive {
            "SELECT * FROM api_keys ORDER BY created_at DESC, id DESC"
        } else {
            "SELECT * FROM api_keys WHERE is_active = 1 ORDER BY created_at DESC, id DESC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(row_to_key)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub async fn get_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, RelayError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_key).transpose().map_err(Into::into)
    }

    pub async fn revoke_key(&self, id: &str) -> Result<bool, RelayError> {
        let result = sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_key(&self, id: &str) -> Result<bool, RelayError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// One-way verification: hash the presented token and require an active,
    /// non-expired record. Touches `last_used_at` on success.
    pub async fn verify_key(&self, token: &str) -> Result<Option<ApiKeyRecord>, RelayError> {
        let hash = hash_key(token);
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ? LIMIT 1")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(record) = row.map(row_to_key).transpose()? else {
            return Ok(None);
        };
        if !record.is_active {
            return Ok(None);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= Utc::now().timestamp() {
                return Ok(None);
            }
        }

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
        Ok(Some(record))
    }

    pub async fn key_count(&self) -> Result<i64, RelayError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM api_keys")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ----- usage logs -----

    /// Append-only; one row per authenticated generation call.
    pub async fn log_usage(
        &self,
        api_key_id: &str,
        endpoint: &str,
        model: &str,
        usage: Usage,
    ) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO usage_logs (
                api_key_id, endpoint, model,
                input_tokens, output_tokens, total_tokens, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(api_key_id)
        .bind(endpoint)
        .bind(model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.total_tokens)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn usage_count(&self) -> Result<i64, RelayError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM usage_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

pub fn hash_key(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    format!("{digest:x}")
}

fn row_to_response(row: sqlx::sqlite::SqliteRow) -> Result<StoredResponse, sqlx::Error> {
    let metadata_raw: String = row.try_get("metadata")?;
    Ok(StoredResponse {
        id: row.try_get("id")?,
        model: row.try_get("model")?,
        status: row.try_get("status")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        output_text: row.try_get("output_text")?,
        usage: Usage {
            input_tokens: row.try_get("input_tokens")?,
            output_tokens: row.try_get("output_tokens")?,
            total_tokens: row.try_get("total_tokens")?,
        },
        created_at: row.try_get("created_at")?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(Value::Object(Default::default())),
    })
}

fn row_to_key(row: sqlx::sqlite::SqliteRow) -> Result<ApiKeyRecord, sqlx::Error> {
    let scopes_raw: String = row.try_get("scopes")?;
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        scopes: serde_json::from_str(&scopes_raw).unwrap_or_default(),
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        rate_limit: row.try_get("rate_limit")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn sample_response(id: &str) -> StoredResponse {
        StoredResponse {
            id: id.to_owned(),
            model: "gpt-5-codex".into(),
            status: ResponseStatus::Completed.as_str().into(),
            input: "\"hello\"".into(),
            output: "[]".into(),
            output_text: "hi".into(),
            usage: Usage {
                input_tokens: 2,
                output_tokens: 1,
                total_tokens: 3,
            },
            created_at: Utc::now().timestamp(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn response_round_trip_and_delete() {
        let (_dir, store) = scratch_store().await;
        store.insert_response(&sample_response("resp_a")).await.unwrap();

        let fetched = store.get_response("resp_a").await.unwrap().unwrap();
        assert_eq!(fetched.output_text, "hi");
        assert_eq!(fetched.usage.total_tokens, 3);

        assert!(store.delete_response("resp_a").await.unwrap());
        assert!(store.get_response("resp_a").await.unwrap().is_none());
        assert!(!store.delete_response("resp_a").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_clamped() {
        let (_dir, store) = scratch_store().await;
        for (i, id) in ["resp_1", "resp_2", "resp_3"].iter().enumerate() {
            let mut response = sample_response(id);
            response.created_at = 1_000 + i as i64;
            store.insert_response(&response).await.unwrap();
        }
        let listed = store.list_responses(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "resp_3");
    }

    #[tokio::test]
    async fn issued_key_verifies_and_plaintext_is_not_stored() {
        let (_dir, store) = scratch_store().await;
        let issued = store
            .issue_key("test", vec!["responses".into()], None, None)
            .await
            .unwrap();

        assert!(issued.plaintext.starts_with(KEY_SIGIL));
        assert_eq!(issued.record.key_prefix, &issued.plaintext[..8]);
        // The one-way hash is all that hits the database.
        assert_ne!(issued.record.key_hash, issued.plaintext);

        let verified = store.verify_key(&issued.plaintext).await.unwrap().unwrap();
        assert_eq!(verified.id, issued.record.id);
        assert!(verified.last_used_at.is_none());
        // last_used_at was touched by the verification above.
        let touched = store.get_key(&issued.record.id).await.unwrap().unwrap();
        assert!(touched.last_used_at.is_some());
    }

    #[tokio::test]
    async fn revoked_and_expired_keys_fail_verification() {
        let (_dir, store) = scratch_store().await;

        let revoked = store.issue_key("revoked", vec![], None, None).await.unwrap();
        assert!(store.revoke_key(&revoked.record.id).await.unwrap());
        assert!(store.verify_key(&revoked.plaintext).await.unwrap().is_none());

        let expired = store
            .issue_key("expired", vec![], None, Some(Utc::now().timestamp() - 60))
            .await
            .unwrap();
        assert!(store.verify_key(&expired.plaintext).await.unwrap().is_none());

        assert!(store.verify_key("cdx_not_a_real_key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inactive_keys_are_hidden_unless_requested() {
        let (_dir, store) = scratch_store().await;
        let a = store.issue_key("a", vec![], None, None).await.unwrap();
        store.issue_key("b", vec![], None, None).await.unwrap();
        store.revoke_key(&a.record.id).await.unwrap();

        assert_eq!(store.list_keys(false).await.unwrap().len(), 1);
        assert_eq!(store.list_keys(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn usage_log_is_append_only() {
        let (_dir, store) = scratch_store().await;
        let issued = store.issue_key("meter", vec![], None, None).await.unwrap();
        let usage = Usage {
            input_tokens: 5,
            output_tokens: 7,
            total_tokens: 12,
        };
        store
            .log_usage(&issued.record.id, "/v1/responses", "gpt-5-codex", usage)
            .await
            .unwrap();
        store
            .log_usage(&issued.record.id, "/v1/chat/completions", "gemini-2.5-flash", usage)
            .await
            .unwrap();
        assert_eq!(store.usage_count().await.unwrap(), 2);
    }
}
