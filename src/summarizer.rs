//! One end-to-end run: scan, extract, build the graph, execute, then record
//! the manifest and report what changed since the previous run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::checkpoint::CheckpointStore;
use crate::config::ScanConfig;
use crate::diff_report::{
    build_diff_only_summary, generate_diff_digest, manifest_diff_to_payload, DiffPayload,
};
use crate::engine::{
    Engine, EngineError, GraphError, PinnedFile, RunInterrupt, RunOutcome, RunSpec, SummaryGraph,
};
use crate::extract::{extract_repository, scan_repository, ExtractError, ExtractorRegistry};
use crate::manifest::{
    build_run_manifest, canonical_repo_path, compute_churn_hotspots, compute_repo_changes, diff,
    new_run_id, ChurnWeighting, ManifestError, ManifestStore, RunManifest,
};

/// Manifests consulted when looking for churn hotspots.
const HOTSPOT_WINDOW: usize = 5;
const HOTSPOT_MIN_HITS: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("no summarizable files under {0}")]
    NoSources(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub repo: PathBuf,
    pub repo_url: Option<String>,
    /// Resume this run id instead of picking one.
    pub resume_run_id: Option<String>,
    /// Force diff-only mode regardless of configuration.
    pub diff_only: bool,
    /// Ask the strong tier for a prose digest of the changes.
    pub digest: bool,
}

#[derive(Debug)]
pub struct SummarizerOutput {
    pub outcome: RunOutcome,
    pub manifest: RunManifest,
    pub manifest_path: PathBuf,
    pub pruned_manifests: Vec<PathBuf>,
    /// Present when an earlier manifest exists for the repository.
    pub diff: Option<DiffPayload>,
    /// Diff-only runs: change counts followed by the previous root summary.
    pub change_note: Option<String>,
}

pub struct Summarizer {
    engine: Engine,
    checkpoints: Arc<dyn CheckpointStore>,
    manifests: ManifestStore,
    registry: ExtractorRegistry,
    scan: ScanConfig,
    retention: usize,
}

impl Summarizer {
    /// `checkpoints` must be the store the engine was built with.
    pub fn new(
        engine: Engine,
        checkpoints: Arc<dyn CheckpointStore>,
        manifests: ManifestStore,
        scan: ScanConfig,
        retention: usize,
    ) -> Self {
        Self {
            engine,
            checkpoints,
            manifests,
            registry: ExtractorRegistry::with_defaults(),
            scan,
            retention,
        }
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub async fn run(
        &self,
        options: &RunOptions,
        interrupt: &RunInterrupt,
    ) -> Result<SummarizerOutput, SummarizerError> {
        let started = Instant::now();
        let repo_path = canonical_repo_path(&options.repo);
        let repo_name = repo_name(&options.repo, &repo_path);

        let scan = scan_repository(&options.repo, &self.scan, &self.registry)?;
        let paths = scan.paths;
        let previous = self.manifests.find_latest(&repo_path, None)?;
        let diff_only = options.diff_only || self.engine.config().diff_only;

        let mut warnings = scan.warnings;
        let mut pinned = Vec::new();
        let mut change_counts = None;
        let to_extract: Vec<String> = match (&previous, diff_only) {
            (Some(prev), true) => {
                let changes = compute_repo_changes(&options.repo, &paths, prev)?;
                tracing::info!(
                    added = changes.added.len(),
                    modified = changes.modified.len(),
                    deleted = changes.deleted.len(),
                    unchanged = changes.unchanged.len(),
                    "diff-only run"
                );
                pinned = changes
                    .unchanged
                    .iter()
                    .filter_map(|path| {
                        prev.files.get(path).map(|record| PinnedFile {
                            path: path.clone(),
                            language: record.language.clone(),
                            content_hash: record.content_hash.clone(),
                            unit_count: record.unit_count,
                            summary: record.summary.clone(),
                        })
                    })
                    .collect();
                change_counts = Some((
                    changes.added.len(),
                    changes.modified.len(),
                    changes.deleted.len(),
                ));
                changes
                    .added
                    .into_iter()
                    .chain(changes.modified)
                    .filter(|p| self.registry.supports(p))
                    .collect()
            }
            (None, true) => {
                warnings.push("diff-only requested but no previous manifest exists; summarizing everything".to_string());
                paths
            }
            (_, false) => paths,
        };

        let extraction = extract_repository(&options.repo, &to_extract, &self.registry);
        warnings.extend(extraction.warnings);
        if extraction.files.is_empty() && pinned.is_empty() {
            return Err(SummarizerError::NoSources(repo_path));
        }

        let graph = SummaryGraph::build(&repo_name, &extraction.files, &pinned, self.engine.config())?;
        let run_id = self.pick_run_id(options, &repo_path).await;
        tracing::info!(run_id = %run_id, nodes = graph.len(), "starting run");

        let spec = RunSpec {
            run_id,
            repo_path: repo_path.clone(),
        };
        let mut outcome = self.engine.execute(&spec, graph, interrupt).await?;
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;

        let change_note = match (&previous, change_counts) {
            (Some(prev), Some((added, modified, deleted))) => Some(build_diff_only_summary(
                &prev.final_summary,
                added,
                modified,
                deleted,
            )),
            _ => None,
        };

        let manifest = build_run_manifest(
            &outcome,
            &repo_path,
            options.repo_url.clone(),
            started.elapsed().as_secs_f64(),
        );
        let manifest_path = self.manifests.save(&manifest)?;
        let pruned_manifests = self.manifests.prune(&repo_path, self.retention.max(1))?;

        let diff = match &previous {
            Some(prev) => Some(self.report(prev, &manifest, options.digest, &mut outcome).await?),
            None => None,
        };

        Ok(SummarizerOutput {
            outcome,
            manifest,
            manifest_path,
            pruned_manifests,
            diff,
            change_note,
        })
    }

    /// Explicit id, else the newest unfinished run with the same fingerprint,
    /// else a fresh id.
    async fn pick_run_id(&self, options: &RunOptions, repo_path: &str) -> String {
        if let Some(id) = &options.resume_run_id {
            return id.clone();
        }
        if self.engine.config().resume {
            match self.checkpoints.latest_incomplete_run(repo_path).await {
                Ok(Some(info)) if info.fingerprint == self.engine.fingerprint(repo_path) => {
                    tracing::info!(run_id = %info.run_id, "resuming unfinished run");
                    return info.run_id;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "could not look up unfinished runs"),
            }
        }
        new_run_id(repo_path)
    }

    async fn report(
        &self,
        previous: &RunManifest,
        current: &RunManifest,
        digest: bool,
        outcome: &mut RunOutcome,
    ) -> Result<DiffPayload, SummarizerError> {
        let mut changes = diff(previous, current);
        let history = self
            .manifests
            .find_all(&current.repo_path, HOTSPOT_WINDOW)?;
        changes.sort_by_churn(ChurnWeighting::SummaryDelta, &history);
        changes.churn_hotspots = compute_churn_hotspots(&history, HOTSPOT_MIN_HITS, HOTSPOT_WINDOW);
        let mut payload =
            manifest_diff_to_payload(&changes, Some(&previous.run_id), &current.run_id);

        if digest {
            match generate_diff_digest(
                self.engine.caller().as_ref(),
                self.engine.prompts(),
                &changes,
                Some(previous),
                current,
            )
            .await
            {
                Ok(generation) => payload.digest = Some(generation.text),
                Err(e) => {
                    tracing::warn!(error = %e, "diff digest failed");
                    outcome.warnings.push(format!("diff digest unavailable: {e}"));
                }
            }
        }
        Ok(payload)
    }
}

fn repo_name(repo: &Path, canonical: &str) -> String {
    Path::new(canonical)
        .file_name()
        .or_else(|| repo.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string())
}
