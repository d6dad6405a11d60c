//! SQLite-backed execution trace store.
//!
//! Two tables: insert-only `execution_traces` (one row per phase boundary)
//! and `execution_results` (one row per execution id, replaced on re-run).
//! Every call runs on tokio's blocking pool so the recovery pipeline never
//! blocks on disk I/O. The handle is cheap to clone; all clones share one
//! connection and one lifecycle.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::JoinHandle;

use super::errors::RecoveryError;
use super::types::{ExecutionResult, ExecutionTrace, ResultStatus, TokenUsage, TracePhase};

const TRACE_COLUMNS: &str = "id, execution_id, timestamp, phase, recovery_count, messages,
     estimated_tokens, actual_tokens, progress_summary, results, error";

const RESULT_COLUMNS: &str = "execution_id, task_type, results, status, timestamp";

// ─── TraceStore ─────────────────────────────────────────────────────────────

/// Handle to the trace database. `None` inside the mutex means closed.
#[derive(Clone)]
pub struct TraceStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl TraceStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RecoveryError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, RecoveryError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RecoveryError::DatabaseError {
                    reason: format!("failed to create {}: {e}", parent.display()),
                })?;
            }
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;

        tracing::info!("trace store opened");
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory store. Contents vanish on close.
    pub async fn open_in_memory() -> Result<Self, RecoveryError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, RecoveryError> {
            let conn = Connection::open_in_memory()?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Close the connection. Later calls on any clone fail with `StoreClosed`.
    pub async fn close(&self) -> Result<(), RecoveryError> {
        let slot = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RecoveryError> {
            let mut guard = slot.lock().map_err(|_| poisoned())?;
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, e)| RecoveryError::from(e)),
                None => Ok(()),
            }
        })
        .await??;
        tracing::info!("trace store closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, RecoveryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RecoveryError> + Send + 'static,
    {
        let slot = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<T, RecoveryError> {
            let guard = slot.lock().map_err(|_| poisoned())?;
            let conn = guard.as_ref().ok_or(RecoveryError::StoreClosed)?;
            f(conn)
        })
        .await?
    }

    // ─── Traces ─────────────────────────────────────────────────────────

    /// Insert one trace. Fails if a trace with the same id already exists.
    pub async fn put(&self, trace: &ExecutionTrace) -> Result<(), RecoveryError> {
        let row = TraceRow::from_trace(trace)?;
        let (trace_id, execution_id, phase) =
            (trace.id.clone(), trace.execution_id.clone(), trace.phase);

        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO execution_traces ({TRACE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    row.id,
                    row.execution_id,
                    row.timestamp,
                    row.phase,
                    row.recovery_count,
                    row.messages,
                    row.estimated_tokens,
                    row.actual_tokens,
                    row.progress_summary,
                    row.results,
                    row.error,
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            trace_id = %trace_id,
            execution_id = %execution_id,
            phase = phase.as_str(),
            "trace stored"
        );
        Ok(())
    }

    /// Write a trace without waiting for it. Failures are logged.
    pub fn put_detached(&self, trace: ExecutionTrace) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(e) = store.put(&trace).await {
                tracing::warn!(
                    error = %e,
                    execution_id = %trace.execution_id,
                    phase = trace.phase.as_str(),
                    "detached trace write failed"
                );
            }
        })
    }

    /// The `limit` most recent traces, newest first.
    pub async fn get_execution_traces(&self, limit: usize) -> Result<Vec<ExecutionTrace>, RecoveryError> {
        self.run(move |conn| {
            query_traces(
                conn,
                &format!(
                    "SELECT {TRACE_COLUMNS} FROM execution_traces
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
        })
        .await
    }

    /// All traces of one execution, oldest first.
    pub async fn get_traces_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionTrace>, RecoveryError> {
        let execution_id = execution_id.to_string();
        self.run(move |conn| {
            query_traces(
                conn,
                &format!(
                    "SELECT {TRACE_COLUMNS} FROM execution_traces
                     WHERE execution_id = ?1
                     ORDER BY timestamp ASC, rowid ASC"
                ),
                params![execution_id],
            )
        })
        .await
    }

    /// The `limit` most recent traces of one phase, newest first.
    pub async fn get_traces_by_phase(
        &self,
        phase: TracePhase,
        limit: usize,
    ) -> Result<Vec<ExecutionTrace>, RecoveryError> {
        self.run(move |conn| {
            query_traces(
                conn,
                &format!(
                    "SELECT {TRACE_COLUMNS} FROM execution_traces
                     WHERE phase = ?1
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
                ),
                params![phase.as_str(), limit as i64],
            )
        })
        .await
    }

    /// Number of `recovery` traces recorded for an execution.
    pub async fn count_recovery_traces(&self, execution_id: &str) -> Result<u32, RecoveryError> {
        let execution_id = execution_id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM execution_traces
                 WHERE execution_id = ?1 AND phase = ?2",
                params![execution_id, TracePhase::Recovery.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
        .await
    }

    // ─── Results ────────────────────────────────────────────────────────

    /// Record the final payload of a completed execution.
    ///
    /// Re-running with the same id replaces the earlier record.
    pub async fn store_execution_result(
        &self,
        execution_id: &str,
        task_type: &str,
        results: &serde_json::Value,
    ) -> Result<ExecutionResult, RecoveryError> {
        let record = ExecutionResult {
            execution_id: execution_id.to_string(),
            task_type: task_type.to_string(),
            results: results.clone(),
            status: ResultStatus::Completed,
            timestamp: Utc::now(),
        };
        let results_json = serde_json::to_string(&record.results)?;
        let row = record.clone();

        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO execution_results ({RESULT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    row.execution_id,
                    row.task_type,
                    results_json,
                    row.status.as_str(),
                    row.timestamp.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(execution_id, task_type, "execution result stored");
        Ok(record)
    }

    /// The stored result for an execution, if any.
    pub async fn get_execution_result(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionResult>, RecoveryError> {
        let execution_id = execution_id.to_string();
        self.run(move |conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {RESULT_COLUMNS} FROM execution_results WHERE execution_id = ?1"),
                    params![execution_id],
                    row_to_result,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// The `limit` most recent results of one task type, newest first.
    pub async fn get_results_by_task_type(
        &self,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionResult>, RecoveryError> {
        let task_type = task_type.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESULT_COLUMNS} FROM execution_results
                 WHERE task_type = ?1
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![task_type, limit as i64], row_to_result)?;

            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            Ok(results)
        })
        .await
    }
}

// ─── Schema ─────────────────────────────────────────────────────────────────

fn init_schema(conn: &Connection) -> Result<(), RecoveryError> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS execution_traces (
            id               TEXT PRIMARY KEY,
            execution_id     TEXT NOT NULL,
            timestamp        INTEGER NOT NULL,
            phase            TEXT NOT NULL CHECK (phase IN ('original', 'recovery', 'completion')),
            recovery_count   INTEGER NOT NULL DEFAULT 0,
            messages         TEXT NOT NULL,
            estimated_tokens INTEGER NOT NULL DEFAULT 0,
            actual_tokens    INTEGER,
            progress_summary TEXT,
            results          TEXT,
            error            TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_traces_timestamp
            ON execution_traces(timestamp);
        CREATE INDEX IF NOT EXISTS idx_traces_execution
            ON execution_traces(execution_id);
        CREATE INDEX IF NOT EXISTS idx_traces_phase
            ON execution_traces(phase);

        CREATE TABLE IF NOT EXISTS execution_results (
            execution_id TEXT PRIMARY KEY,
            task_type    TEXT NOT NULL,
            results      TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'completed',
            timestamp    INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_results_timestamp
            ON execution_results(timestamp);
        CREATE INDEX IF NOT EXISTS idx_results_task_type
            ON execution_results(task_type);
        ",
    )?;
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// A trace flattened into owned column values.
struct TraceRow {
    id: String,
    execution_id: String,
    timestamp: i64,
    phase: &'static str,
    recovery_count: i64,
    messages: String,
    estimated_tokens: i64,
    actual_tokens: Option<i64>,
    progress_summary: Option<String>,
    results: Option<String>,
    error: Option<String>,
}

impl TraceRow {
    fn from_trace(trace: &ExecutionTrace) -> Result<Self, RecoveryError> {
        Ok(Self {
            id: trace.id.clone(),
            execution_id: trace.execution_id.clone(),
            timestamp: trace.timestamp.timestamp_millis(),
            phase: trace.phase.as_str(),
            recovery_count: i64::from(trace.recovery_count),
            messages: serde_json::to_string(&trace.messages)?,
            estimated_tokens: i64::from(trace.token_usage.estimated),
            actual_tokens: trace.token_usage.actual.map(i64::from),
            progress_summary: trace
                .progress_summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            results: trace.results.as_ref().map(serde_json::to_string).transpose()?,
            error: trace.error.as_ref().map(serde_json::to_string).transpose()?,
        })
    }
}

fn query_traces(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ExecutionTrace>, RecoveryError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_trace)?;

    let mut traces = Vec::new();
    for row in rows {
        traces.push(row?);
    }
    Ok(traces)
}

/// Convert a rusqlite row to an ExecutionTrace.
///
/// JSON columns that fail to decode read back as empty/absent.
fn row_to_trace(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionTrace> {
    let phase: String = row.get(3)?;
    Ok(ExecutionTrace {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        timestamp: millis_to_datetime(row.get(2)?),
        phase: TracePhase::parse(&phase).unwrap_or(TracePhase::Original),
        recovery_count: row.get::<_, i64>(4)? as u32,
        messages: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        token_usage: TokenUsage {
            estimated: row.get::<_, i64>(6)? as u32,
            actual: row.get::<_, Option<i64>>(7)?.map(|t| t as u32),
        },
        progress_summary: parse_optional_json(row.get(8)?),
        results: parse_optional_json(row.get(9)?),
        error: parse_optional_json(row.get(10)?),
    })
}

/// Convert a rusqlite row to an ExecutionResult.
fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionResult> {
    Ok(ExecutionResult {
        execution_id: row.get(0)?,
        task_type: row.get(1)?,
        results: serde_json::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(serde_json::Value::Null),
        status: ResultStatus::Completed,
        timestamp: millis_to_datetime(row.get(4)?),
    })
}

fn parse_optional_json<T: serde::de::DeserializeOwned>(json: Option<String>) -> Option<T> {
    json.and_then(|s| serde_json::from_str(&s).ok())
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

fn poisoned() -> RecoveryError {
    RecoveryError::DatabaseError {
        reason: "connection mutex poisoned".to_string(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
