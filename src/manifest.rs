//! Run manifests: one durable snapshot per completed run, plus diffing.
//!
//! A manifest records every file's content hash and final summary. Two
//! manifests diff into added / deleted / modified / unchanged paths; the
//! same classification against the working tree drives diff-only runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{RunOutcome, RunStats};
use crate::hashing::{hash_bytes, hash_fields, hash_text, short_hash};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no manifest found for {0}")]
    NotFound(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ManifestError + '_ {
    move |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content_hash: String,
    pub summary_hash: String,
    pub summary: String,
    pub language: String,
    pub unit_count: usize,
    pub last_seen: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub repo_path: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    /// RFC 3339, UTC.
    pub timestamp: String,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub total_files: usize,
    #[serde(default)]
    pub total_units: usize,
    #[serde(default)]
    pub api_cost_usd: f64,
    #[serde(default)]
    pub final_summary: String,
    #[serde(default)]
    pub stats: RunStats,
    /// Repository-relative path with `/` separators.
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedFile {
    pub path: String,
    pub language: String,
    pub old_summary: String,
    pub new_summary: String,
    pub unit_count_delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub modified: Vec<ModifiedFile>,
    pub unchanged: Vec<String>,
    pub churn_hotspots: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    /// Reorder `modified` so the heaviest churn comes first.
    pub fn sort_by_churn(&mut self, weighting: ChurnWeighting, history_desc: &[RunManifest]) {
        let rank: HashMap<String, usize> = rank_churn(self, weighting, history_desc)
            .into_iter()
            .enumerate()
            .map(|(i, (path, _))| (path, i))
            .collect();
        self.modified
            .sort_by_key(|m| rank.get(&m.path).copied().unwrap_or(usize::MAX));
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Canonical form of a repository path, falling back to the input when the
/// path cannot be resolved.
pub fn canonical_repo_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Last two path components joined with `_`.
pub fn repo_slug(repo_path: &str) -> String {
    let parts: Vec<&str> = repo_path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty())
        .collect();
    let tail = if parts.len() >= 2 {
        &parts[parts.len() - 2..]
    } else {
        &parts[..]
    };
    let slug = tail.join("_");
    if slug.is_empty() {
        "repo".to_string()
    } else {
        slug
    }
}

pub fn new_run_id(repo_path: &str) -> String {
    let seed = hash_fields(&[repo_path, &now_rfc3339()]);
    short_hash(&seed, 16).to_string()
}

// =============================================================================
// Store
// =============================================================================

pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self { dir })
    }

    pub fn default_dir() -> PathBuf {
        std::env::var("SYNOPSIS_MANIFEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".synopsis_manifests"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, manifest: &RunManifest) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            repo_slug(&manifest.repo_path),
            short_hash(&manifest.run_id, 8)
        ))
    }

    /// Write atomically: temp file, then rename.
    pub fn save(&self, manifest: &RunManifest) -> Result<PathBuf, ManifestError> {
        let path = self.manifest_path(manifest);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(manifest).map_err(|source| ManifestError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, payload).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        tracing::debug!(path = %path.display(), run_id = %manifest.run_id, "saved manifest");
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<RunManifest, ManifestError> {
        let raw = std::fs::read(path).map_err(io_err(path))?;
        serde_json::from_slice(&raw).map_err(|source| ManifestError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    fn entries(&self, repo_path: &str) -> Result<Vec<(PathBuf, RunManifest)>, ManifestError> {
        let mut out = Vec::new();
        let read_dir = std::fs::read_dir(&self.dir).map_err(io_err(&self.dir))?;
        for entry in read_dir {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load(&path) {
                Ok(manifest) if manifest.repo_path == repo_path => out.push((path, manifest)),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable manifest"),
            }
        }
        out.sort_by(|a, b| {
            b.1.timestamp
                .cmp(&a.1.timestamp)
                .then_with(|| b.1.run_id.cmp(&a.1.run_id))
        });
        Ok(out)
    }

    /// Manifests for `repo_path`, newest first.
    pub fn find_all(&self, repo_path: &str, limit: usize) -> Result<Vec<RunManifest>, ManifestError> {
        Ok(self
            .entries(repo_path)?
            .into_iter()
            .take(limit)
            .map(|(_, m)| m)
            .collect())
    }

    pub fn find_latest(
        &self,
        repo_path: &str,
        run_id_prefix: Option<&str>,
    ) -> Result<Option<RunManifest>, ManifestError> {
        Ok(self
            .entries(repo_path)?
            .into_iter()
            .map(|(_, m)| m)
            .find(|m| run_id_prefix.map_or(true, |p| m.run_id.starts_with(p))))
    }

    /// Delete all but the newest `keep` manifests for `repo_path`.
    pub fn prune(&self, repo_path: &str, keep: usize) -> Result<Vec<PathBuf>, ManifestError> {
        let mut removed = Vec::new();
        for (path, manifest) in self.entries(repo_path)?.into_iter().skip(keep) {
            std::fs::remove_file(&path).map_err(io_err(&path))?;
            tracing::debug!(run_id = %manifest.run_id, "pruned manifest");
            removed.push(path);
        }
        Ok(removed)
    }
}

// =============================================================================
// Diffing
// =============================================================================

pub fn diff(old: &RunManifest, new: &RunManifest) -> ManifestDiff {
    let old_paths: BTreeSet<&String> = old.files.keys().collect();
    let new_paths: BTreeSet<&String> = new.files.keys().collect();

    let mut out = ManifestDiff {
        added: new_paths.difference(&old_paths).map(|p| (*p).clone()).collect(),
        deleted: old_paths.difference(&new_paths).map(|p| (*p).clone()).collect(),
        ..ManifestDiff::default()
    };

    for path in old_paths.intersection(&new_paths) {
        let (old_rec, new_rec) = (&old.files[*path], &new.files[*path]);
        if old_rec.content_hash == new_rec.content_hash {
            out.unchanged.push((*path).clone());
        } else {
            out.modified.push(ModifiedFile {
                path: (*path).clone(),
                language: new_rec.language.clone(),
                old_summary: old_rec.summary.clone(),
                new_summary: new_rec.summary.clone(),
                unit_count_delta: new_rec.unit_count as i64 - old_rec.unit_count as i64,
            });
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnWeighting {
    /// Absolute change in summary length.
    SummaryDelta,
    /// Absolute change in unit count.
    UnitDelta,
    /// Times modified across the supplied history (newest first).
    Frequency,
}

/// Order modified paths by descending weight, then path.
pub fn rank_churn(
    diff: &ManifestDiff,
    weighting: ChurnWeighting,
    history_desc: &[RunManifest],
) -> Vec<(String, u64)> {
    let frequency = match weighting {
        ChurnWeighting::Frequency => modification_counts(history_desc, history_desc.len()),
        _ => HashMap::new(),
    };
    let mut ranked: Vec<(String, u64)> = diff
        .modified
        .iter()
        .map(|m| {
            let weight = match weighting {
                ChurnWeighting::SummaryDelta => {
                    (m.new_summary.len() as i64 - m.old_summary.len() as i64).unsigned_abs()
                }
                ChurnWeighting::UnitDelta => m.unit_count_delta.unsigned_abs(),
                ChurnWeighting::Frequency => frequency.get(&m.path).copied().unwrap_or(0),
            };
            (m.path.clone(), weight)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn modification_counts(manifests_desc: &[RunManifest], window: usize) -> HashMap<String, u64> {
    let window = &manifests_desc[..manifests_desc.len().min(window)];
    let mut counts: HashMap<String, u64> = HashMap::new();
    for pair in window.windows(2) {
        for m in diff(&pair[1], &pair[0]).modified {
            *counts.entry(m.path).or_default() += 1;
        }
    }
    counts
}

/// Paths modified in at least `min_hits` consecutive diffs among the newest
/// `window` manifests. Sorted.
pub fn compute_churn_hotspots(
    manifests_desc: &[RunManifest],
    min_hits: u64,
    window: usize,
) -> Vec<String> {
    if manifests_desc.len() < 2 {
        return Vec::new();
    }
    let mut hot: Vec<String> = modification_counts(manifests_desc, window)
        .into_iter()
        .filter(|(_, count)| *count >= min_hits)
        .map(|(path, _)| path)
        .collect();
    hot.sort();
    hot
}

/// Working-tree changes relative to a previous manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoChanges {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
    /// Current content hash per scanned path.
    pub hashes: BTreeMap<String, String>,
}

/// Hash the current bytes of `current_paths` and classify them against
/// `previous`.
pub fn compute_repo_changes(
    repo_root: &Path,
    current_paths: &[String],
    previous: &RunManifest,
) -> Result<RepoChanges, ManifestError> {
    let mut changes = RepoChanges::default();
    for rel in current_paths {
        let full = repo_root.join(rel);
        let bytes = std::fs::read(&full).map_err(io_err(&full))?;
        let hash = hash_bytes(&bytes);
        match previous.files.get(rel) {
            None => changes.added.push(rel.clone()),
            Some(record) if record.content_hash == hash => changes.unchanged.push(rel.clone()),
            Some(_) => changes.modified.push(rel.clone()),
        }
        changes.hashes.insert(rel.clone(), hash);
    }
    changes.deleted = previous
        .files
        .keys()
        .filter(|p| !changes.hashes.contains_key(*p))
        .cloned()
        .collect();
    changes.added.sort();
    changes.modified.sort();
    changes.unchanged.sort();
    Ok(changes)
}

/// Snapshot a finished run. Files without a complete summary (failed or
/// partial) are left out so the next diff-only run recomputes them.
pub fn build_run_manifest(
    outcome: &RunOutcome,
    repo_path: &str,
    repo_url: Option<String>,
    duration_secs: f64,
) -> RunManifest {
    let now = now_rfc3339();
    let files: BTreeMap<String, FileRecord> = outcome
        .files
        .values()
        .filter(|f| !f.failed && !f.partial)
        .filter_map(|f| {
            let summary = f.summary.clone()?;
            Some((
                f.path.clone(),
                FileRecord {
                    content_hash: f.content_hash.clone(),
                    summary_hash: hash_text(&summary),
                    summary,
                    language: f.language.clone(),
                    unit_count: f.unit_count,
                    last_seen: now.clone(),
                },
            ))
        })
        .collect();

    RunManifest {
        run_id: outcome.run_id.clone(),
        repo_path: repo_path.to_string(),
        repo_url,
        timestamp: now,
        duration_secs,
        total_files: files.len(),
        total_units: files.values().map(|f| f.unit_count).sum(),
        api_cost_usd: outcome.stats.estimated_cost_usd(),
        final_summary: outcome.root_summary.clone(),
        stats: outcome.stats.clone(),
        files,
    }
}
