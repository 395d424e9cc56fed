use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::state::ConversationState;
use super::store::{Checkpoint, SessionStore, StoreError, ThreadSummary};

/// Checkpoint store on a local SQLite file.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub async fn new(db_path: PathBuf, max_connections: u32) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool, db_path };
        store.init_schema().await?;
        tracing::info!("Session store ready at {}", store.db_path.display());
        Ok(store)
    }

    pub async fn with_path(db_path: PathBuf) -> Result<Self, StoreError> {
        Self::new(db_path, 4).await
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_seq(&self, thread_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT MAX(seq) AS latest FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("latest")?)
    }

    /// Inserts `latest + 1` in a single statement so concurrent writers
    /// cannot both claim the same seq. With `expected` set, the insert only
    /// happens when the latest seq matches (0 standing for "no checkpoint").
    async fn append(
        &self,
        thread_id: &str,
        expected: Option<i64>,
        state: &ConversationState,
    ) -> Result<Option<i64>, StoreError> {
        let encoded = serde_json::to_string(state)?;
        let now = chrono::Utc::now().to_rfc3339();

        let (sql, guard) = match expected {
            None => (
                "INSERT INTO checkpoints (thread_id, seq, state, created_at) \
                 SELECT ?, latest + 1, ?, ? FROM \
                 (SELECT COALESCE(MAX(seq), 0) AS latest FROM checkpoints WHERE thread_id = ?) \
                 RETURNING seq",
                None,
            ),
            Some(seq) => (
                "INSERT INTO checkpoints (thread_id, seq, state, created_at) \
                 SELECT ?, latest + 1, ?, ? FROM \
                 (SELECT COALESCE(MAX(seq), 0) AS latest FROM checkpoints WHERE thread_id = ?) \
                 WHERE latest = ? \
                 RETURNING seq",
                Some(seq),
            ),
        };

        let mut query = sqlx::query(sql)
            .bind(thread_id)
            .bind(encoded)
            .bind(now)
            .bind(thread_id);
        if let Some(seq) = guard {
            query = query.bind(seq);
        }

        let row = query.fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("seq")?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            "SELECT thread_id, seq, state, created_at FROM checkpoints \
             WHERE thread_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let encoded: String = row.try_get("state")?;
        Ok(Some(Checkpoint {
            thread_id: row.try_get("thread_id")?,
            seq: row.try_get("seq")?,
            state: serde_json::from_str(&encoded)?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn save(&self, thread_id: &str, state: &ConversationState) -> Result<i64, StoreError> {
        let seq = self.append(thread_id, None, state).await?;
        // The unguarded insert always yields a row.
        seq.ok_or_else(|| StoreError::Database(sqlx::Error::RowNotFound))
    }

    async fn compare_and_swap(
        &self,
        thread_id: &str,
        expected_seq: Option<i64>,
        state: &ConversationState,
    ) -> Result<i64, StoreError> {
        let guard = expected_seq.unwrap_or(0);
        match self.append(thread_id, Some(guard), state).await? {
            Some(seq) => Ok(seq),
            None => {
                let found = self.latest_seq(thread_id).await?;
                tracing::warn!(
                    "Checkpoint conflict on thread {}: expected {:?}, found {:?}",
                    thread_id,
                    expected_seq,
                    found
                );
                Err(StoreError::Conflict {
                    thread_id: thread_id.to_string(),
                    expected: expected_seq,
                    found,
                })
            }
        }
    }

    async fn list_threads(&self, limit: usize) -> Result<Vec<ThreadSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT thread_id, MAX(seq) AS latest_seq, COUNT(*) AS checkpoints, \
             MAX(created_at) AS updated_at \
             FROM checkpoints \
             GROUP BY thread_id \
             ORDER BY updated_at DESC \
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut threads = Vec::with_capacity(rows.len());
        for row in rows {
            threads.push(ThreadSummary {
                thread_id: row.try_get("thread_id")?,
                latest_seq: row.try_get("latest_seq")?,
                checkpoints: row.try_get("checkpoints")?,
                updated_at: row.try_get::<Option<String>, _>("updated_at")?.unwrap_or_default(),
            });
        }
        Ok(threads)
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
