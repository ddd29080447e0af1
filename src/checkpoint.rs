//! Per-run checkpoint store.
//!
//! Every terminal node is recorded as soon as it is produced, before any of
//! its dependents start, so a killed run can resume exactly where it stopped.
//! A run is identified by its id plus a fingerprint of everything that shapes
//! the graph; resuming under a different fingerprint discards the old records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::cache::now_epoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Done,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Done => "done",
            CheckpointStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, CheckpointError> {
        match raw {
            "done" => Ok(CheckpointStatus::Done),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(CheckpointError::Corrupt(format!("unknown status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub node_id: String,
    pub status: CheckpointStatus,
    pub summary: Option<String>,
    pub failure: Option<String>,
    /// Cache key the node was evaluated under; a mismatch on resume means
    /// an input changed and the record is not reused.
    pub cache_key: String,
    /// Synthesized with some children missing.
    pub partial: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

impl CheckpointRecord {
    /// Whether a resumed run may take this record as the node's result.
    pub fn is_reusable(&self, cache_key: &str) -> bool {
        self.status == CheckpointStatus::Done && !self.partial && self.cache_key == cache_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub repo_path: String,
    pub fingerprint: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResume {
    /// No earlier state for this run id, or resumption disabled.
    Fresh,
    /// Same run id and fingerprint; records keyed by node id.
    Resumed(HashMap<String, CheckpointRecord>),
    /// Same run id under a different fingerprint; old records were dropped.
    Mismatch { previous_fingerprint: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("checkpoint lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
    #[error("unknown run {0}")]
    UnknownRun(String),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Register `run_id` and load its records when `resume` is set. With
    /// `resume` off, earlier records for the run are cleared and the run
    /// starts fresh; new records are still written.
    async fn begin_run(
        &self,
        run_id: &str,
        repo_path: &str,
        fingerprint: &str,
        resume: bool,
    ) -> Result<RunResume, CheckpointError>;

    /// Durable once this returns. A Done, non-partial record is never
    /// replaced within a run.
    async fn record(&self, run_id: &str, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    async fn flush(&self) -> Result<(), CheckpointError>;

    /// Mark the run complete. Node records are dropped unless `retain_records`.
    async fn finish_run(&self, run_id: &str, retain_records: bool) -> Result<(), CheckpointError>;

    async fn latest_incomplete_run(&self, repo_path: &str)
        -> Result<Option<RunInfo>, CheckpointError>;
}

#[derive(Clone)]
pub struct SqliteCheckpointStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=FULL; \
             CREATE TABLE IF NOT EXISTS runs ( \
               run_id TEXT PRIMARY KEY, \
               repo_path TEXT NOT NULL, \
               fingerprint TEXT NOT NULL, \
               created_at INTEGER NOT NULL, \
               completed_at INTEGER \
             ); \
             CREATE TABLE IF NOT EXISTS checkpoints ( \
               run_id TEXT NOT NULL, \
               node_id TEXT NOT NULL, \
               status TEXT NOT NULL, \
               summary TEXT, \
               failure TEXT, \
               cache_key TEXT NOT NULL, \
               partial INTEGER NOT NULL, \
               input_tokens INTEGER NOT NULL, \
               output_tokens INTEGER NOT NULL, \
               cost_nanodollars INTEGER NOT NULL, \
               updated_at INTEGER NOT NULL, \
               PRIMARY KEY (run_id, node_id) \
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SYNOPSIS_CHECKPOINT_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".synopsis_checkpoints.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CheckpointError>
    where
        F: FnOnce(&mut Connection) -> Result<R, CheckpointError>,
    {
        let mut guard = self.conn.lock().map_err(|_| CheckpointError::Poisoned)?;
        f(&mut *guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CheckpointError>
    where
        F: FnOnce(&mut Connection) -> Result<R, CheckpointError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| CheckpointError::Join(e.to_string()))?
    }

    pub async fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>, CheckpointError> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| load_run(conn, &run_id)).await
    }
}

fn load_run(conn: &Connection, run_id: &str) -> Result<Option<RunInfo>, CheckpointError> {
    let info = conn
        .query_row(
            "SELECT run_id, repo_path, fingerprint, created_at, completed_at \
             FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok(RunInfo {
                    run_id: row.get(0)?,
                    repo_path: row.get(1)?,
                    fingerprint: row.get(2)?,
                    created_at: row.get(3)?,
                    completed_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

fn load_records(
    conn: &Connection,
    run_id: &str,
) -> Result<HashMap<String, CheckpointRecord>, CheckpointError> {
    let mut stmt = conn.prepare(
        "SELECT node_id, status, summary, failure, cache_key, partial, \
                input_tokens, output_tokens, cost_nanodollars \
         FROM checkpoints WHERE run_id = ?1",
    )?;
    let mut rows = stmt.query(params![run_id])?;
    let mut out = HashMap::new();
    while let Some(row) = rows.next()? {
        let status: String = row.get(1)?;
        let record = CheckpointRecord {
            node_id: row.get(0)?,
            status: CheckpointStatus::parse(&status)?,
            summary: row.get(2)?,
            failure: row.get(3)?,
            cache_key: row.get(4)?,
            partial: row.get::<_, i64>(5)? != 0,
            input_tokens: row.get::<_, i64>(6)? as u32,
            output_tokens: row.get::<_, i64>(7)? as u32,
            cost_nanodollars: row.get(8)?,
        };
        out.insert(record.node_id.clone(), record);
    }
    Ok(out)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn begin_run(
        &self,
        run_id: &str,
        repo_path: &str,
        fingerprint: &str,
        resume: bool,
    ) -> Result<RunResume, CheckpointError> {
        let run_id = run_id.to_string();
        let repo_path = repo_path.to_string();
        let fingerprint = fingerprint.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let existing = load_run(&tx, &run_id)?;
            let now = now_epoch();

            let outcome = match existing {
                Some(info) if resume && info.fingerprint == fingerprint => {
                    let records = load_records(&tx, &run_id)?;
                    tx.execute(
                        "UPDATE runs SET completed_at = NULL WHERE run_id = ?1",
                        params![run_id],
                    )?;
                    RunResume::Resumed(records)
                }
                Some(info) => {
                    tx.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])?;
                    tx.execute(
                        "UPDATE runs SET repo_path = ?2, fingerprint = ?3, created_at = ?4, \
                                completed_at = NULL \
                         WHERE run_id = ?1",
                        params![run_id, repo_path, fingerprint, now],
                    )?;
                    if info.fingerprint != fingerprint {
                        RunResume::Mismatch {
                            previous_fingerprint: info.fingerprint,
                        }
                    } else {
                        RunResume::Fresh
                    }
                }
                None => {
                    tx.execute(
                        "INSERT INTO runs (run_id, repo_path, fingerprint, created_at) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![run_id, repo_path, fingerprint, now],
                    )?;
                    RunResume::Fresh
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn record(&self, run_id: &str, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let run_id = run_id.to_string();
        let record = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints ( \
                    run_id, node_id, status, summary, failure, cache_key, partial, \
                    input_tokens, output_tokens, cost_nanodollars, updated_at \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(run_id, node_id) DO UPDATE SET \
                    status = excluded.status, \
                    summary = excluded.summary, \
                    failure = excluded.failure, \
                    cache_key = excluded.cache_key, \
                    partial = excluded.partial, \
                    input_tokens = excluded.input_tokens, \
                    output_tokens = excluded.output_tokens, \
                    cost_nanodollars = excluded.cost_nanodollars, \
                    updated_at = excluded.updated_at \
                 WHERE checkpoints.status != 'done' OR checkpoints.partial = 1 \
                    OR checkpoints.cache_key != excluded.cache_key",
                params![
                    run_id,
                    record.node_id,
                    record.status.as_str(),
                    record.summary,
                    record.failure,
                    record.cache_key,
                    if record.partial { 1 } else { 0 },
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.cost_nanodollars,
                    now_epoch(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<(), CheckpointError> {
        self.blocking(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn finish_run(&self, run_id: &str, retain_records: bool) -> Result<(), CheckpointError> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE runs SET completed_at = ?2 WHERE run_id = ?1",
                params![run_id, now_epoch()],
            )?;
            if updated == 0 {
                return Err(CheckpointError::UnknownRun(run_id));
            }
            if !retain_records {
                tx.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn latest_incomplete_run(
        &self,
        repo_path: &str,
    ) -> Result<Option<RunInfo>, CheckpointError> {
        let repo_path = repo_path.to_string();
        self.blocking(move |conn| {
            let info = conn
                .query_row(
                    "SELECT run_id, repo_path, fingerprint, created_at, completed_at \
                     FROM runs WHERE repo_path = ?1 AND completed_at IS NULL \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![repo_path],
                    |row| {
                        Ok(RunInfo {
                            run_id: row.get(0)?,
                            repo_path: row.get(1)?,
                            fingerprint: row.get(2)?,
                            created_at: row.get(3)?,
                            completed_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(info)
        })
        .await
    }
}

/// In-process store for tests and runs that opt out of persistence.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<String, RunInfo>,
    records: HashMap<String, HashMap<String, CheckpointRecord>>,
    seq: i64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, run_id: &str) -> HashMap<String, CheckpointRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.records.get(run_id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn begin_run(
        &self,
        run_id: &str,
        repo_path: &str,
        fingerprint: &str,
        resume: bool,
    ) -> Result<RunResume, CheckpointError> {
        let mut state = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        state.seq += 1;
        let created_at = state.seq;
        let previous = state.runs.get(run_id).cloned();
        let outcome = match previous {
            Some(info) if resume && info.fingerprint == fingerprint => {
                RunResume::Resumed(state.records.get(run_id).cloned().unwrap_or_default())
            }
            Some(info) => {
                state.records.remove(run_id);
                if info.fingerprint != fingerprint {
                    RunResume::Mismatch {
                        previous_fingerprint: info.fingerprint,
                    }
                } else {
                    RunResume::Fresh
                }
            }
            None => RunResume::Fresh,
        };
        let resumed = matches!(outcome, RunResume::Resumed(_));
        let entry = state.runs.entry(run_id.to_string()).or_insert(RunInfo {
            run_id: run_id.to_string(),
            repo_path: repo_path.to_string(),
            fingerprint: fingerprint.to_string(),
            created_at,
            completed_at: None,
        });
        if !resumed {
            entry.repo_path = repo_path.to_string();
            entry.fingerprint = fingerprint.to_string();
            entry.created_at = created_at;
        }
        entry.completed_at = None;
        Ok(outcome)
    }

    async fn record(&self, run_id: &str, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let mut state = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        let records = state.records.entry(run_id.to_string()).or_default();
        let locked = records
            .get(&record.node_id)
            .map(|r| {
                r.status == CheckpointStatus::Done && !r.partial && r.cache_key == record.cache_key
            })
            .unwrap_or(false);
        if !locked {
            records.insert(record.node_id.clone(), record.clone());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, retain_records: bool) -> Result<(), CheckpointError> {
        let mut state = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        state.seq += 1;
        let now = state.seq;
        let info = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| CheckpointError::UnknownRun(run_id.to_string()))?;
        info.completed_at = Some(now);
        if !retain_records {
            state.records.remove(run_id);
        }
        Ok(())
    }

    async fn latest_incomplete_run(
        &self,
        repo_path: &str,
    ) -> Result<Option<RunInfo>, CheckpointError> {
        let state = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(state
            .runs
            .values()
            .filter(|r| r.repo_path == repo_path && r.completed_at.is_none())
            .max_by_key(|r| r.created_at)
            .cloned())
    }
}
