//! Content-addressed summary cache.
//!
//! Keys are derived from everything that can influence a summary, so the
//! cache never needs invalidation: a changed input yields a new key. Puts are
//! append-only and durable once they return.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::caller::Tier;
use crate::engine::graph::Level;
use crate::hashing::hash_fields;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryCacheKey {
    pub level: Level,
    pub node_id: String,
    pub tier: Tier,
    pub model: String,
    pub template_slug: String,
    pub template_hash: String,
    pub key_hash: String,
}

impl SummaryCacheKey {
    /// `child_hashes` must be in child order; failed children contribute a
    /// `failed:<id>` marker instead of a summary hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        level: Level,
        node_id: &str,
        own_hash: &str,
        child_hashes: &[String],
        template_slug: &str,
        template_hash: &str,
        tier: Tier,
        model: &str,
    ) -> Self {
        let level_tag = level.as_u8().to_string();
        let mut fields: Vec<&str> = Vec::with_capacity(child_hashes.len() + 7);
        fields.push(&level_tag);
        fields.push(node_id);
        fields.push(own_hash);
        fields.extend(child_hashes.iter().map(String::as_str));
        fields.push(template_slug);
        fields.push(template_hash);
        fields.push(tier.as_str());
        fields.push(model);
        let key_hash = hash_fields(&fields);

        Self {
            level,
            node_id: node_id.to_string(),
            tier,
            model: model.to_string(),
            template_slug: template_slug.to_string(),
            template_hash: template_hash.to_string(),
            key_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub summary: String,
    pub tier: Tier,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    /// Epoch seconds of the original write.
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("unknown tier {0:?} in cache row")]
    BadTier(String),
}

#[async_trait]
pub trait SummaryCache: Send + Sync {
    async fn get(&self, key: &SummaryCacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert if absent. An existing entry for the key is never overwritten.
    async fn put(&self, key: &SummaryCacheKey, entry: &CacheEntry) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteSummaryCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSummaryCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=FULL; \
             CREATE TABLE IF NOT EXISTS summary_cache ( \
               key_hash TEXT PRIMARY KEY, \
               level INTEGER NOT NULL, \
               node_id TEXT NOT NULL, \
               tier TEXT NOT NULL, \
               model TEXT NOT NULL, \
               template_slug TEXT NOT NULL, \
               template_hash TEXT NOT NULL, \
               summary TEXT NOT NULL, \
               input_tokens INTEGER NOT NULL, \
               output_tokens INTEGER NOT NULL, \
               cost_nanodollars INTEGER NOT NULL, \
               created_at INTEGER NOT NULL, \
               last_hit_at INTEGER NOT NULL, \
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SYNOPSIS_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".synopsis_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM summary_cache", [], |row| row.get(0))?;
                Ok(count.max(0) as usize)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn parse_tier(raw: &str) -> Result<Tier, CacheError> {
    match raw {
        "fast" => Ok(Tier::Fast),
        "strong" => Ok(Tier::Strong),
        other => Err(CacheError::BadTier(other.to_string())),
    }
}

#[async_trait]
impl SummaryCache for SqliteSummaryCache {
    async fn get(&self, key: &SummaryCacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT summary, tier, model, input_tokens, output_tokens, \
                            cost_nanodollars, created_at \
                     FROM summary_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let tier: String = row.get(1)?;
                    let entry = CacheEntry {
                        summary: row.get(0)?,
                        tier: parse_tier(&tier)?,
                        model: row.get(2)?,
                        input_tokens: row.get::<_, i64>(3)? as u32,
                        output_tokens: row.get::<_, i64>(4)? as u32,
                        cost_nanodollars: row.get(5)?,
                        created_at: row.get(6)?,
                    };
                    conn.execute(
                        "UPDATE summary_cache \
                         SET hit_count = hit_count + 1, last_hit_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &SummaryCacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let key = key.clone();
        let entry = entry.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO summary_cache ( \
                        key_hash, level, node_id, tier, model, template_slug, template_hash, \
                        summary, input_tokens, output_tokens, cost_nanodollars, \
                        created_at, last_hit_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) \
                     ON CONFLICT(key_hash) DO NOTHING",
                    params![
                        key.key_hash,
                        key.level.as_u8() as i64,
                        key.node_id,
                        key.tier.as_str(),
                        key.model,
                        key.template_slug,
                        key.template_hash,
                        entry.summary,
                        entry.input_tokens as i64,
                        entry.output_tokens as i64,
                        entry.cost_nanodollars,
                        entry.created_at,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// In-process cache for tests and one-shot runs.
#[derive(Debug, Default, Clone)]
pub struct MemorySummaryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemorySummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SummaryCache for MemorySummaryCache {
    async fn get(&self, key: &SummaryCacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(&key.key_hash).cloned())
    }

    async fn put(&self, key: &SummaryCacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries
            .entry(key.key_hash.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }
}

/// Exclusive advisory lock on `<db>.lock`, held for maintenance operations.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub level: u8,
    pub node_id: String,
    pub tier: String,
    pub model: String,
    pub template_slug: String,
    pub template_hash: String,
    pub summary: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub created_at: i64,
    pub last_hit_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteSummaryCache {
    /// Write every row as one JSON object per line, most recently used first.
    /// Returns the number of rows written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, level, node_id, tier, model, template_slug, template_hash, \
                            summary, input_tokens, output_tokens, cost_nanodollars, \
                            created_at, last_hit_at, hit_count \
                     FROM summary_cache ORDER BY last_hit_at DESC, key_hash ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                let mut written = 0usize;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        level: row.get::<_, i64>(1)? as u8,
                        node_id: row.get(2)?,
                        tier: row.get(3)?,
                        model: row.get(4)?,
                        template_slug: row.get(5)?,
                        template_hash: row.get(6)?,
                        summary: row.get(7)?,
                        input_tokens: row.get::<_, i64>(8)? as u32,
                        output_tokens: row.get::<_, i64>(9)? as u32,
                        cost_nanodollars: row.get(10)?,
                        created_at: row.get(11)?,
                        last_hit_at: row.get(12)?,
                        hit_count: row.get(13)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                use std::io::Write;
                file.flush()?;
                Ok(written)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Explicit maintenance: drop rows unused for `max_age_days`, then keep
    /// only the `max_rows` most recently used.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM summary_cache WHERE last_hit_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM summary_cache", [], |row| {
                            row.get(0)
                        })?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM summary_cache WHERE key_hash IN ( \
                                SELECT key_hash FROM summary_cache \
                                ORDER BY last_hit_at DESC, key_hash ASC LIMIT -1 OFFSET ?1 \
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM summary_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
