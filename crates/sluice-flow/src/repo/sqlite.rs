use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::error::{Result, SluiceError};
use sluice_core::status::FlowNodeStatus;
use sluice_core::types::{BatchId, ContextId, SessionId, TraceId};
use tracing::debug;

use super::ContextRepository;
use crate::context::{ContextRecord, FlowContext};

const SCHEMA: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;

     CREATE TABLE IF NOT EXISTS flow_contexts (
         id TEXT PRIMARY KEY,
         session_id TEXT NOT NULL,
         trace_id TEXT NOT NULL,
         batch_id TEXT,
         status TEXT NOT NULL,
         position TEXT NOT NULL,
         attempt INTEGER NOT NULL DEFAULT 0,
         error TEXT,
         data_json TEXT NOT NULL,
         created_at TEXT NOT NULL,
         updated_at TEXT NOT NULL
     );

     CREATE INDEX IF NOT EXISTS idx_ctx_status ON flow_contexts(status, created_at);
     CREATE INDEX IF NOT EXISTS idx_ctx_session ON flow_contexts(session_id);";

const UPSERT: &str = "INSERT OR REPLACE INTO flow_contexts
     (id, session_id, trace_id, batch_id, status, position, attempt, error, data_json, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const SELECT: &str = "SELECT id, session_id, trace_id, batch_id, status, position, attempt, error, data_json, created_at, updated_at
     FROM flow_contexts";

/// Context repository backed by SQLite. Payloads are stored as JSON.
pub struct SqliteContextRepository<T> {
    conn: Mutex<Connection>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> SqliteContextRepository<T> {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db("Failed to open context store"))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db("Failed to open context store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(db("Failed to initialize context schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            _payload: PhantomData,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SluiceError::Repository(e.to_string()))
    }
}

impl<T> ContextRepository<T> for SqliteContextRepository<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn save(&self, contexts: &[FlowContext<T>]) -> Result<()> {
        self.update(contexts)
    }

    fn update(&self, contexts: &[FlowContext<T>]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(db("Failed to begin transaction"))?;
        for ctx in contexts {
            let data_json = serde_json::to_string(ctx.data())?;
            tx.execute(
                UPSERT,
                params![
                    ctx.id().as_str(),
                    ctx.session_id().as_str(),
                    ctx.trace_id().as_str(),
                    ctx.batch_id().map(|b| b.as_str()),
                    ctx.status().as_str(),
                    ctx.position(),
                    ctx.attempt() as i64,
                    ctx.error(),
                    data_json,
                    ctx.created_at().to_rfc3339(),
                    ctx.updated_at().to_rfc3339(),
                ],
            )
            .map_err(db("Failed to write context"))?;
        }
        tx.commit().map_err(db("Failed to commit contexts"))?;
        debug!(count = contexts.len(), "Contexts written");
        Ok(())
    }

    fn update_status(
        &self,
        contexts: &[FlowContext<T>],
        status: FlowNodeStatus,
        position: &str,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(db("Failed to begin transaction"))?;
        let now = Utc::now().to_rfc3339();
        for ctx in contexts {
            let changed = tx
                .execute(
                    "UPDATE flow_contexts SET status = ?1, position = ?2, updated_at = ?3 WHERE id = ?4",
                    params![status.as_str(), position, now, ctx.id().as_str()],
                )
                .map_err(db("Failed to update context status"))?;
            if changed == 0 {
                let data_json = serde_json::to_string(ctx.data())?;
                tx.execute(
                    UPSERT,
                    params![
                        ctx.id().as_str(),
                        ctx.session_id().as_str(),
                        ctx.trace_id().as_str(),
                        ctx.batch_id().map(|b| b.as_str()),
                        status.as_str(),
                        position,
                        ctx.attempt() as i64,
                        ctx.error(),
                        data_json,
                        ctx.created_at().to_rfc3339(),
                        now,
                    ],
                )
                .map_err(db("Failed to write context"))?;
            }
        }
        tx.commit().map_err(db("Failed to commit status update"))?;
        Ok(())
    }

    fn get(&self, id: &ContextId) -> Result<Option<ContextRecord<T>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("{SELECT} WHERE id = ?1"),
                params![id.as_str()],
                read_row,
            )
            .optional()
            .map_err(db("Failed to load context"))?;
        row.map(decode).transpose()
    }

    fn find_by_status(&self, status: FlowNodeStatus) -> Result<Vec<ContextRecord<T>>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT} WHERE status = ?1 ORDER BY created_at"))
            .map_err(db("Failed to prepare query"))?;
        let rows = stmt
            .query_map(params![status.as_str()], read_row)
            .map_err(db("Failed to query contexts"))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode(row.map_err(db("Failed to read context row"))?)?);
        }
        Ok(records)
    }
}

/// Columns of one row, before the payload and enums are decoded.
struct RawRow {
    id: String,
    session_id: String,
    trace_id: String,
    batch_id: Option<String>,
    status: String,
    position: String,
    attempt: i64,
    error: Option<String>,
    data_json: String,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        trace_id: row.get(2)?,
        batch_id: row.get(3)?,
        status: row.get(4)?,
        position: row.get(5)?,
        attempt: row.get(6)?,
        error: row.get(7)?,
        data_json: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn decode<T: DeserializeOwned>(raw: RawRow) -> Result<ContextRecord<T>> {
    Ok(ContextRecord {
        id: ContextId(raw.id),
        session_id: SessionId(raw.session_id),
        trace_id: TraceId(raw.trace_id),
        batch_id: raw.batch_id.map(BatchId),
        status: FlowNodeStatus::from_str(&raw.status)?,
        position: raw.position,
        attempt: u32::try_from(raw.attempt).unwrap_or(0),
        error: raw.error,
        data: serde_json::from_str(&raw.data_json)?,
        created_at: parse_time(&raw.created_at),
        updated_at: parse_time(&raw.updated_at),
    })
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> SluiceError {
    move |e| SluiceError::Database(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FlowSession;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        sku: String,
        qty: u32,
    }

    fn order(qty: u32) -> Order {
        Order {
            sku: "sku-1".into(),
            qty,
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ctx.db");
        let session = FlowSession::new();
        let ctx = FlowContext::new(session, order(2), "intake");
        {
            let repo = SqliteContextRepository::open(&path).unwrap();
            repo.save(std::slice::from_ref(&ctx)).unwrap();
        }

        let repo = SqliteContextRepository::<Order>::open(&path).unwrap();
        let record = repo.get(ctx.id()).unwrap().unwrap();
        assert_eq!(record.data, order(2));
        assert_eq!(record.status, FlowNodeStatus::New);
        assert_eq!(record.position, "intake");
    }

    #[test]
    fn test_update_status_batch() {
        let repo = SqliteContextRepository::in_memory().unwrap();
        let session = FlowSession::new();
        let mut batch: Vec<_> = (1..=3)
            .map(|i| FlowContext::new(session.clone(), order(i), "intake"))
            .collect();
        repo.save(&batch[..2]).unwrap();
        batch[2].record_failure("never saved");

        repo.update_status(&batch, FlowNodeStatus::Pending, "pricing").unwrap();

        let pending = repo.find_by_status(FlowNodeStatus::Pending).unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|r| r.position == "pricing"));
        assert!(repo.find_by_status(FlowNodeStatus::New).unwrap().is_empty());
    }

    #[test]
    fn test_update_writes_full_state() {
        let repo = SqliteContextRepository::in_memory().unwrap();
        let mut ctx = FlowContext::new(FlowSession::new(), order(1), "intake");
        repo.save(std::slice::from_ref(&ctx)).unwrap();

        ctx.set_status(FlowNodeStatus::Pending).unwrap();
        ctx.set_batch(BatchId::new());
        ctx.bump_attempt();
        repo.update(std::slice::from_ref(&ctx)).unwrap();

        let record = repo.get(ctx.id()).unwrap().unwrap();
        assert_eq!(record.status, FlowNodeStatus::Pending);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.batch_id.as_ref(), ctx.batch_id());
    }

    #[test]
    fn test_missing_context() {
        let repo = SqliteContextRepository::<Order>::in_memory().unwrap();
        assert!(repo.get(&ContextId::new()).unwrap().is_none());
    }
}
