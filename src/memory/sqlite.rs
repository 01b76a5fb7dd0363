//! SQLite 交互记忆
//!
//! 单表只追加（seq 自增主键），另建 (provider_id, ts_ms) 与 (session_id, seq) 两个索引。
//! 旧库缺少 tokens_used 列时在打开时补上。
//! rusqlite 为同步 API，所有访问经 spawn_blocking 执行，避免阻塞 async 运行时。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::core::MemoryError;
use crate::llm::Operation;
use crate::memory::{InteractionRecord, InteractionStore, Outcome};

const SELECT_COLUMNS: &str = "seq, request_id, session_id, provider_id, operation, outcome, \
     error_signature, latency_ms, prompt, response, ts_ms, tokens_used";

/// 基于 SQLite 的持久化实现
pub struct SqliteInteractionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteInteractionStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS interactions (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 request_id TEXT NOT NULL,
                 session_id TEXT NOT NULL,
                 provider_id TEXT,
                 operation TEXT NOT NULL,
                 outcome TEXT NOT NULL,
                 error_signature TEXT,
                 latency_ms INTEGER NOT NULL,
                 prompt TEXT,
                 response TEXT,
                 ts_ms INTEGER NOT NULL,
                 tokens_used INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_interactions_provider
                 ON interactions(provider_id, ts_ms);
             CREATE INDEX IF NOT EXISTS idx_interactions_session
                 ON interactions(session_id, seq);",
        )?;
        if !has_column(&conn, "interactions", "tokens_used")? {
            conn.execute_batch(
                "ALTER TABLE interactions ADD COLUMN tokens_used INTEGER NOT NULL DEFAULT 0;",
            )?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, MemoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| MemoryError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| MemoryError::Join(e.to_string()))?
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// 列值无法还原为领域类型时报错，不做猜测性的替换
fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<InteractionRecord> {
    let seq: i64 = row.get(0)?;
    let request_id: String = row.get(1)?;
    let operation: String = row.get(4)?;
    let outcome: String = row.get(5)?;
    let latency_ms: i64 = row.get(7)?;
    let ts_ms: i64 = row.get(10)?;
    let tokens_used: i64 = row.get(11)?;

    let request_id = Uuid::parse_str(&request_id).map_err(|e| conversion_error(1, e))?;
    let operation = Operation::parse(&operation)
        .ok_or_else(|| conversion_error(4, format!("unknown operation '{}'", operation)))?;
    let outcome = Outcome::parse(&outcome)
        .ok_or_else(|| conversion_error(5, format!("unknown outcome '{}'", outcome)))?;
    let timestamp = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .ok_or_else(|| conversion_error(10, format!("timestamp out of range: {}", ts_ms)))?;

    Ok(InteractionRecord {
        seq: Some(seq as u64),
        request_id,
        session_id: row.get(2)?,
        provider_id: row.get(3)?,
        operation,
        outcome,
        error_signature: row.get(6)?,
        latency_ms: latency_ms.max(0) as u64,
        tokens_used: tokens_used.max(0) as u64,
        prompt: row.get(8)?,
        response: row.get(9)?,
        timestamp,
    })
}

#[async_trait]
impl InteractionStore for SqliteInteractionStore {
    async fn append(&self, record: InteractionRecord) -> Result<u64, MemoryError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO interactions (request_id, session_id, provider_id, operation, outcome, \
                 error_signature, latency_ms, prompt, response, ts_ms, tokens_used) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.request_id.to_string(),
                    record.session_id,
                    record.provider_id,
                    record.operation.as_str(),
                    record.outcome.as_str(),
                    record.error_signature,
                    record.latency_ms as i64,
                    record.prompt,
                    record.response,
                    record.timestamp.timestamp_millis(),
                    record.tokens_used as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn recent_outcomes(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        let provider_id = provider_id.to_string();
        let since_ms = since.timestamp_millis();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM interactions \
                 WHERE provider_id = ?1 AND ts_ms >= ?2 ORDER BY seq ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![provider_id, since_ms], row_to_record)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn context_for(
        &self,
        session_id: &str,
        max_entries: usize,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        let session_id = session_id.to_string();
        let limit = max_entries as i64;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM interactions \
                 WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![session_id, limit], row_to_record)?;
            let mut records = rows.collect::<Result<Vec<_>, _>>()?;
            records.reverse();
            Ok(records)
        })
        .await
    }

    async fn len(&self) -> Result<u64, MemoryError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM interactions", [], |r| r.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: &str, provider: &str, outcome: Outcome) -> InteractionRecord {
        InteractionRecord::new(
            Uuid::new_v4(),
            session,
            Some(provider.to_string()),
            Operation::Chat,
            outcome,
        )
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("interactions.db");

        {
            let store = SqliteInteractionStore::open(&path).unwrap();
            let r = record("s1", "ollama-local", Outcome::Success)
                .with_prompt(Some("hi".into()))
                .with_response("hello")
                .with_latency(42)
                .with_tokens(17);
            store.append(r).await.unwrap();
        }

        let store = SqliteInteractionStore::open(&path).unwrap();
        let ctx = store.context_for("s1", 10).await.unwrap();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].provider_id.as_deref(), Some("ollama-local"));
        assert_eq!(ctx[0].prompt.as_deref(), Some("hi"));
        assert_eq!(ctx[0].response.as_deref(), Some("hello"));
        assert_eq!(ctx[0].latency_ms, 42);
        assert_eq!(ctx[0].tokens_used, 17);
        assert_eq!(ctx[0].outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_sqlite_context_bounded_and_chronological() {
        let store = SqliteInteractionStore::open_in_memory().unwrap();
        for i in 0..6 {
            store
                .append(record("s1", "p", Outcome::Success).with_response(format!("r{i}")))
                .await
                .unwrap();
        }
        let ctx = store.context_for("s1", 4).await.unwrap();
        let responses: Vec<_> = ctx.iter().filter_map(|r| r.response.clone()).collect();
        assert_eq!(responses, vec!["r2", "r3", "r4", "r5"]);
        let seqs: Vec<_> = ctx.iter().filter_map(|r| r.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_sqlite_recent_failures_by_provider() {
        let store = SqliteInteractionStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .append(record("s", "groq", Outcome::Timeout).with_signature("timeout:deadline").at(now))
            .await
            .unwrap();
        store
            .append(record("s", "groq", Outcome::Success).at(now))
            .await
            .unwrap();
        store
            .append(record("s", "groq", Outcome::ProviderError).at(now - chrono::Duration::hours(2)))
            .await
            .unwrap();
        store
            .append(record("s", "ollama", Outcome::ProviderError).at(now))
            .await
            .unwrap();

        let since = now - chrono::Duration::minutes(10);
        let failures = store.recent_failures("groq", since).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_signature.as_deref(), Some("timeout:deadline"));
        assert_eq!(store.len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported_not_guessed() {
        let store = SqliteInteractionStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .append(record("s", "p", Outcome::Success).at(now))
            .await
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO interactions (request_id, session_id, provider_id, operation, outcome, \
                 error_signature, latency_ms, prompt, response, ts_ms) \
                 VALUES ('not-a-uuid', 's', 'p', 'chat', 'success', NULL, 5, NULL, NULL, ?1)",
                params![now.timestamp_millis()],
            )
            .unwrap();
        }

        let since = now - chrono::Duration::minutes(10);
        let err = store.recent_failures("p", since).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Sqlite(rusqlite::Error::FromSqlConversionFailure(1, _, _))
        ));
        assert!(store.context_for("s", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_a_conversion_error() {
        let store = SqliteInteractionStore::open_in_memory().unwrap();
        let now = Utc::now();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO interactions (request_id, session_id, provider_id, operation, outcome, \
                 error_signature, latency_ms, prompt, response, ts_ms) \
                 VALUES (?1, 's', 'p', 'chat', 'success', NULL, 5, NULL, NULL, ?2)",
                params![Uuid::new_v4().to_string(), now.timestamp_millis()],
            )
            .unwrap();
        }
        let err = store
            .recent_outcomes("p", now - chrono::Duration::minutes(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Sqlite(rusqlite::Error::FromSqlConversionFailure(5, _, _))
        ));
    }

    #[tokio::test]
    async fn test_opening_older_database_adds_tokens_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE interactions (
                     seq INTEGER PRIMARY KEY AUTOINCREMENT,
                     request_id TEXT NOT NULL,
                     session_id TEXT NOT NULL,
                     provider_id TEXT,
                     operation TEXT NOT NULL,
                     outcome TEXT NOT NULL,
                     error_signature TEXT,
                     latency_ms INTEGER NOT NULL,
                     prompt TEXT,
                     response TEXT,
                     ts_ms INTEGER NOT NULL
                 );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO interactions (request_id, session_id, provider_id, operation, outcome, \
                 error_signature, latency_ms, prompt, response, ts_ms) \
                 VALUES (?1, 's', 'p', 'chat', 'SUCCESS', NULL, 9, 'hi', 'hello', ?2)",
                params![Uuid::new_v4().to_string(), Utc::now().timestamp_millis()],
            )
            .unwrap();
        }

        let store = SqliteInteractionStore::open(&path).unwrap();
        let ctx = store.context_for("s", 10).await.unwrap();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].tokens_used, 0);
        store
            .append(record("s", "p", Outcome::Success).with_tokens(3))
            .await
            .unwrap();
        assert_eq!(store.context_for("s", 10).await.unwrap()[1].tokens_used, 3);
    }
}
