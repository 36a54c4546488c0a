use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};

use crate::sink::{SinkError, SyncOp, SyncSink, Table};
use crate::state::SyncState;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite destination store: one table per record type keyed by its declared
/// primary-key columns, plus a single-row checkpoint table.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, SinkError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), SinkError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn load_state(&self) -> Result<SyncState, SinkError> {
        let row = sqlx::query("SELECT state FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(SyncState::default());
        };
        let raw: String = row.try_get("state")?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn count_rows(&self, table: Table) -> Result<i64, SinkError> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", table.as_str());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("n")?)
    }

    async fn upsert_rows(&self, table: Table, rows: &[Value]) -> Result<(), SinkError> {
        let sql = upsert_sql(table);
        for row in rows {
            let mut query = sqlx::query(&sql);
            for column in table.primary_key().iter().copied() {
                query = query.bind(key_text(table, row, column)?);
            }
            query = query.bind(serde_json::to_string(row)?);
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn save_state(&self, state: &SyncState) -> Result<(), SinkError> {
        let raw = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO sync_state (id, state) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state",
        )
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl SyncSink for SqliteStore {
    async fn apply(&mut self, op: SyncOp) -> Result<(), SinkError> {
        match op {
            SyncOp::Upsert { table, rows } => self.upsert_rows(table, &rows).await,
            SyncOp::Checkpoint { state } => self.save_state(&state).await,
        }
    }
}

fn upsert_sql(table: Table) -> String {
    let columns = table.primary_key();
    let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {table} ({columns}, payload) VALUES ({placeholders}) \
         ON CONFLICT({columns}) DO UPDATE SET payload = excluded.payload",
        table = table.as_str(),
        columns = columns.join(", "),
        placeholders = placeholders.join(", "),
    )
}

fn key_text(table: Table, row: &Value, column: &'static str) -> Result<String, SinkError> {
    match row.get(column) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        Some(Value::Bool(flag)) => Ok(flag.to_string()),
        _ => Err(SinkError::MissingKey {
            table: table.as_str(),
            column,
        }),
    }
}

fn default_db_path() -> Result<PathBuf, SinkError> {
    let mut path = dirs::data_dir().ok_or(SinkError::MissingDataDir)?;
    path.push("socratease-sync");
    path.push("connector.db");
    Ok(path)
}
