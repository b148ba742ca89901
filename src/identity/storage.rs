use crate::identity::{IdentityCache, IdentityKey};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Row, Sqlite};
use std::str::FromStr;

/// Durable backing for identity assignments, kept in a local SQLite file.
#[derive(Clone)]
pub struct IdentityStore {
    pool: Pool<Sqlite>,
}

async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), String> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identity_map (
            table_name TEXT NOT NULL,
            old_id TEXT NOT NULL,
            new_id TEXT NOT NULL,
            PRIMARY KEY (table_name, old_id)
        );
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| format!("Failed to initialize identity storage: {}", e))?;

    Ok(())
}

impl IdentityStore {
    pub async fn open(url: &str) -> Result<Self, String> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| format!("Invalid identity store url '{}': {}", url, e))?
            .create_if_missing(true)
            .log_statements(log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| format!("Failed to open identity store: {}", e))?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: Pool<Sqlite>) -> Result<Self, String> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Loads every stored pair into the cache.
    pub async fn restore(&self, cache: &IdentityCache) -> Result<usize, String> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, old_id, new_id
            FROM identity_map
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to load identity map: {}", e))?;

        let pairs = rows
            .into_iter()
            .filter_map(|row| {
                let table: String = row.try_get("table_name").ok()?;
                let old_id: String = row.try_get("old_id").ok()?;
                let new_id: String = row.try_get("new_id").ok()?;
                Some((IdentityKey::new(&table, &old_id), new_id))
            })
            .collect::<Vec<_>>();

        cache.seed(pairs)
    }

    /// Writes all cached pairs; stored assignments are never overwritten.
    pub async fn persist(&self, cache: &IdentityCache) -> Result<usize, String> {
        let pairs = cache.snapshot()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to start identity transaction: {}", e))?;

        let mut written = 0usize;
        for (key, identity) in &pairs {
            let result = sqlx::query(
                r#"
                INSERT INTO identity_map (table_name, old_id, new_id)
                VALUES (?, ?, ?)
                ON CONFLICT(table_name, old_id) DO NOTHING
                "#,
            )
            .bind(&key.table)
            .bind(&key.old_id)
            .bind(identity)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                format!(
                    "Failed to persist identity for '{}'/'{}': {}",
                    key.table, key.old_id, e
                )
            })?;
            written += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| format!("Failed to commit identity map: {}", e))?;

        Ok(written)
    }
}
