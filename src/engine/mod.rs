//! Execution engine: schedules the summary graph wave by wave.
//!
//! Within a wave every node is independent, so nodes run concurrently;
//! remote calls are bounded per tier by semaphores. Results are applied to
//! the graph single-threaded once the wave settles, so no two tasks ever
//! mutate the same node.
//!
//! Per node: a reusable checkpoint wins, then the content cache, then a
//! remote call. Every terminal result is checkpointed before the next wave
//! starts.

pub mod graph;
pub mod root_loop;
pub mod sizing;
pub mod trace;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};

use crate::cache::{now_epoch, CacheEntry, SummaryCache, SummaryCacheKey};
use crate::caller::{ContextEntry, Generation, ModelCaller, Tier};
use crate::checkpoint::{CheckpointRecord, CheckpointStatus, CheckpointStore, RunResume};
use crate::config::EngineConfig;
use crate::extract::SourceUnit;
use crate::gateway::{nanodollars_to_usd, ProviderError};
use crate::hashing::{hash_fields, hash_text};
use crate::prompts::{parse_batch_response, PromptInstance, PromptSet};
use crate::tokens::count_tokens;

pub use graph::{
    GraphError, Level, Node, NodePayload, NodeSource, NodeStatus, PinnedFile, SummaryGraph,
    ROOT_ID,
};
pub use root_loop::{RootLoop, RootLoopOutcome, RootState};
pub use sizing::{
    cluster_directories, partition_directory, plan_leaf_batches, should_use_deep_mode,
    BatchLimits, ModuleGroup,
};
pub use trace::{JsonlTraceSink, NodeTrace, TraceError, TraceSink, TraceWorker};

// =============================================================================
// Interrupts
// =============================================================================

/// External stop signal. Clones share one flag.
#[derive(Clone)]
pub struct RunInterrupt {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for RunInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl RunInterrupt {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `trigger` has been called.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub nodes_total: usize,
    pub remote_calls: u64,
    /// Remote calls that carried more than one unit.
    pub batched_calls: u64,
    pub cache_hits: u64,
    pub checkpoint_hits: u64,
    pub pinned: u64,
    pub failed: u64,
    pub partial: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl RunStats {
    pub fn estimated_cost_usd(&self) -> f64 {
        nanodollars_to_usd(self.cost_nanodollars)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub id: String,
    pub level: Level,
    pub label: String,
    pub status: NodeStatus,
    pub source: Option<NodeSource>,
    pub partial: bool,
    pub summary: Option<String>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: String,
    pub language: String,
    pub content_hash: String,
    pub unit_count: usize,
    pub summary: Option<String>,
    pub partial: bool,
    pub failed: bool,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub repo_name: String,
    /// Root summary, or a best-effort concatenation when the root failed.
    pub root_summary: String,
    pub root_status: NodeStatus,
    pub resumed: bool,
    pub deep_mode: bool,
    /// Every node, ordered by level then id.
    pub nodes: Vec<NodeOutcome>,
    pub files: BTreeMap<String, FileOutcome>,
    pub warnings: Vec<String>,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn node(&self, id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn summaries_at(&self, level: Level) -> BTreeMap<String, String> {
        self.nodes
            .iter()
            .filter(|n| n.level == level)
            .filter_map(|n| n.summary.clone().map(|s| (n.id.clone(), s)))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("fatal provider error at {node}: {source}")]
    Fatal {
        node: String,
        #[source]
        source: ProviderError,
    },
    #[error("run {run_id} interrupted after {completed} nodes completed")]
    Interrupted { run_id: String, completed: usize },
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: String,
    /// Canonical repository path; scopes checkpoints and the fingerprint.
    pub repo_path: String,
}

pub struct Engine {
    caller: Arc<dyn ModelCaller>,
    cache: Arc<dyn SummaryCache>,
    checkpoints: Arc<dyn CheckpointStore>,
    prompts: PromptSet,
    config: EngineConfig,
    trace: Option<Arc<dyn TraceSink>>,
}

/// Shared by every task of one run.
struct RunState<'a> {
    run_id: &'a str,
    records: HashMap<String, CheckpointRecord>,
    checkpoints_ok: AtomicBool,
    abort: AtomicBool,
    fatal: Mutex<Option<(String, ProviderError)>>,
    warnings: Mutex<Vec<String>>,
    fast: Semaphore,
    strong: Semaphore,
    interrupt: &'a RunInterrupt,
}

impl RunState<'_> {
    fn semaphore(&self, tier: Tier) -> &Semaphore {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Strong => &self.strong,
        }
    }

    fn warn(&self, message: String) {
        if let Ok(mut warnings) = self.warnings.lock() {
            warnings.push(message);
        }
    }
}

enum PreparedKind {
    /// Every child failed; no call is made.
    Placeholder { failure: String },
    Call {
        prompt: PromptInstance,
        context: Vec<ContextEntry>,
        /// Labels of failed children.
        missing: Vec<String>,
        partial: bool,
        /// Repository name when the root gathers iteratively.
        deep: Option<String>,
    },
}

struct Prepared {
    idx: usize,
    id: String,
    level: Level,
    tier: Tier,
    key: SummaryCacheKey,
    unit: Option<SourceUnit>,
    kind: PreparedKind,
}

struct Evaluated {
    idx: usize,
    node_id: String,
    status: NodeStatus,
    summary: Option<String>,
    failure: Option<String>,
    partial: bool,
    source: NodeSource,
    cache_key: String,
    input_tokens: u32,
    output_tokens: u32,
    cost_nanodollars: i64,
    cancelled: bool,
    deep: bool,
}

impl Evaluated {
    fn new(prep: &Prepared, status: NodeStatus, source: NodeSource) -> Self {
        Self {
            idx: prep.idx,
            node_id: prep.id.clone(),
            status,
            summary: None,
            failure: None,
            partial: false,
            source,
            cache_key: prep.key.key_hash.clone(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            cancelled: false,
            deep: false,
        }
    }

    fn cancelled(prep: &Prepared) -> Self {
        let mut ev = Self::new(prep, NodeStatus::Pending, NodeSource::Remote);
        ev.cancelled = true;
        ev
    }
}

#[derive(Default)]
struct JobOutput {
    evaluated: Vec<Evaluated>,
    remote_calls: u64,
    batched_calls: u64,
}

enum Job {
    Single(Prepared),
    Batch(Vec<Prepared>),
}

impl Engine {
    pub fn new(
        caller: Arc<dyn ModelCaller>,
        cache: Arc<dyn SummaryCache>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            caller,
            cache,
            checkpoints,
            prompts: PromptSet::current(),
            config,
            trace: None,
        }
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    pub fn caller(&self) -> &Arc<dyn ModelCaller> {
        &self.caller
    }

    /// Identity of a run's inputs other than file content: the repository,
    /// graph-shaping settings, tier models and the prompt set.
    pub fn fingerprint(&self, repo_path: &str) -> String {
        let c = &self.config;
        let numbers = [
            c.directory_chunk_size,
            c.module_cluster_size,
            c.max_batch_units,
            c.max_batch_tokens,
            c.batchable_unit_tokens,
            c.deep_mode_threshold_tokens,
            c.max_root_iterations,
        ]
        .map(|n| n.to_string());
        let prompt_hash = self.prompts.hash();
        let mut fields: Vec<&str> = vec![repo_path];
        fields.extend(numbers.iter().map(String::as_str));
        fields.push(self.caller.model_id(Tier::Fast));
        fields.push(self.caller.model_id(Tier::Strong));
        fields.push(&prompt_hash);
        hash_fields(&fields)
    }

    pub async fn execute(
        &self,
        spec: &RunSpec,
        mut graph: SummaryGraph,
        interrupt: &RunInterrupt,
    ) -> Result<RunOutcome, EngineError> {
        graph.validate()?;
        let waves = graph.waves()?;
        let fingerprint = self.fingerprint(&spec.repo_path);

        let mut warnings = Vec::new();
        let mut checkpoints_ok = true;
        let mut resumed = false;
        let records = match self
            .checkpoints
            .begin_run(&spec.run_id, &spec.repo_path, &fingerprint, self.config.resume)
            .await
        {
            Ok(RunResume::Resumed(records)) => {
                resumed = true;
                tracing::info!(run_id = %spec.run_id, records = records.len(), "resuming run");
                records
            }
            Ok(RunResume::Mismatch { .. }) => {
                tracing::warn!(run_id = %spec.run_id, "configuration changed, discarding checkpoints");
                warnings.push(format!(
                    "run {} was started with different settings; its checkpoints were discarded",
                    spec.run_id
                ));
                HashMap::new()
            }
            Ok(RunResume::Fresh) => HashMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint store unavailable, run is not resumable");
                warnings.push(format!("checkpoints disabled: {e}"));
                checkpoints_ok = false;
                HashMap::new()
            }
        };

        let state = RunState {
            run_id: &spec.run_id,
            records,
            checkpoints_ok: AtomicBool::new(checkpoints_ok),
            abort: AtomicBool::new(false),
            fatal: Mutex::new(None),
            warnings: Mutex::new(Vec::new()),
            fast: Semaphore::new(self.config.fast_concurrency.max(1)),
            strong: Semaphore::new(self.config.strong_concurrency.max(1)),
            interrupt,
        };

        let mut stats = RunStats {
            nodes_total: graph.len(),
            pinned: graph
                .nodes()
                .iter()
                .filter(|n| n.source == Some(NodeSource::Pinned))
                .count() as u64,
            ..RunStats::default()
        };
        let mut deep_mode = false;
        let mut trace_failed = false;
        let parallelism = (self.config.fast_concurrency + self.config.strong_concurrency).max(1) * 2;

        for (wave_idx, wave) in waves.iter().enumerate() {
            if interrupt.is_triggered() {
                return Err(self.interrupted(&state, &graph).await);
            }
            tracing::debug!(wave = wave_idx, nodes = wave.len(), "evaluating wave");

            let jobs = self.plan_wave(&graph, wave);
            for idx in wave {
                graph.node_mut(*idx).status = NodeStatus::Running;
            }

            let outputs = stream::iter(jobs.into_iter().map(|job| self.run_job(job, &state)))
                .buffer_unordered(parallelism)
                .collect::<Vec<_>>()
                .await;

            let mut evaluated: Vec<Evaluated> = Vec::new();
            for output in outputs {
                stats.remote_calls += output.remote_calls;
                stats.batched_calls += output.batched_calls;
                evaluated.extend(output.evaluated);
            }
            evaluated.sort_by_key(|ev| ev.idx);

            for ev in evaluated {
                let node = graph.node_mut(ev.idx);
                if ev.cancelled {
                    node.status = NodeStatus::Pending;
                    continue;
                }
                node.status = ev.status;
                node.summary = ev.summary;
                node.failure = ev.failure;
                node.partial = ev.partial;
                node.source = Some(ev.source);
                node.cache_key = Some(ev.cache_key);
                node.input_tokens = ev.input_tokens;
                node.output_tokens = ev.output_tokens;
                node.cost_nanodollars = ev.cost_nanodollars;
                deep_mode |= ev.deep;

                match ev.source {
                    NodeSource::Checkpoint => stats.checkpoint_hits += 1,
                    NodeSource::Cache => stats.cache_hits += 1,
                    _ => {}
                }
                if node.status == NodeStatus::Failed {
                    stats.failed += 1;
                    let reason = node.failure.clone().unwrap_or_default();
                    tracing::warn!(node = %node.id, reason = %reason, "node failed");
                    warnings.push(format!("{}: {reason}", node.id));
                } else if node.partial {
                    stats.partial += 1;
                }
                stats.input_tokens += u64::from(ev.input_tokens);
                stats.output_tokens += u64::from(ev.output_tokens);
                stats.cost_nanodollars += ev.cost_nanodollars;

                if let Some(sink) = &self.trace {
                    let event = NodeTrace {
                        timestamp_ms: trace::now_epoch_ms(),
                        run_id: spec.run_id.clone(),
                        node_id: node.id.clone(),
                        level: node.level,
                        tier: Tier::for_level(node.level).as_str(),
                        status: node.status,
                        source: node.source,
                        cache_key: node.cache_key.clone(),
                        partial: node.partial,
                        input_tokens: node.input_tokens,
                        output_tokens: node.output_tokens,
                        cost_nanodollars: node.cost_nanodollars,
                        error: node.failure.clone(),
                    };
                    if let Err(e) = sink.record(event) {
                        if !trace_failed {
                            tracing::warn!(error = %e, "trace sink failed, dropping events");
                            trace_failed = true;
                        }
                    }
                }
            }

            let fatal = state.fatal.lock().ok().and_then(|mut slot| slot.take());
            if let Some((node, source)) = fatal {
                self.flush(&state).await;
                return Err(EngineError::Fatal { node, source });
            }
            if interrupt.is_triggered() {
                return Err(self.interrupted(&state, &graph).await);
            }
        }

        if let Ok(mut extra) = state.warnings.lock() {
            warnings.append(&mut extra);
        }

        let (root_summary, root_status) = self.root_result(&graph, &mut warnings);

        if state.checkpoints_ok.load(AtomicOrdering::Relaxed) {
            let retain = stats.failed > 0 || stats.partial > 0;
            if let Err(e) = self.checkpoints.finish_run(&spec.run_id, retain).await {
                tracing::warn!(error = %e, "failed to close run checkpoints");
            }
        }

        tracing::info!(
            run_id = %spec.run_id,
            remote_calls = stats.remote_calls,
            cache_hits = stats.cache_hits,
            checkpoint_hits = stats.checkpoint_hits,
            failed = stats.failed,
            "run complete"
        );

        Ok(build_outcome(
            spec,
            &graph,
            root_summary,
            root_status,
            resumed,
            deep_mode,
            warnings,
            stats,
        ))
    }

    async fn flush(&self, state: &RunState<'_>) {
        if state.checkpoints_ok.load(AtomicOrdering::Relaxed) {
            if let Err(e) = self.checkpoints.flush().await {
                tracing::warn!(error = %e, "checkpoint flush failed");
            }
        }
    }

    async fn interrupted(&self, state: &RunState<'_>, graph: &SummaryGraph) -> EngineError {
        self.flush(state).await;
        let completed = graph
            .nodes()
            .iter()
            .filter(|n| n.status.is_done() && n.source != Some(NodeSource::Pinned))
            .count();
        tracing::warn!(run_id = %state.run_id, completed, "run interrupted");
        EngineError::Interrupted {
            run_id: state.run_id.to_string(),
            completed,
        }
    }

    fn root_result(&self, graph: &SummaryGraph, warnings: &mut Vec<String>) -> (String, NodeStatus) {
        let Some(root) = graph.root() else {
            return (String::new(), NodeStatus::Failed);
        };
        if root.status.is_done() {
            return (root.summary.clone().unwrap_or_default(), root.status);
        }
        let reason = root
            .failure
            .clone()
            .unwrap_or_else(|| "root was not evaluated".to_string());
        warnings.push(format!("root summary unavailable, using module summaries: {reason}"));
        let mut text = format!("Repository overview unavailable ({reason}).");
        for child_id in &root.children {
            if let Some(child) = graph.get(child_id) {
                if let Some(summary) = child.summary.as_deref().filter(|_| child.status.is_done()) {
                    text.push_str(&format!("\n\n## {}\n{}", child.label, summary.trim()));
                }
            }
        }
        (text, NodeStatus::Failed)
    }

    // -------------------------------------------------------------------------
    // Planning
    // -------------------------------------------------------------------------

    fn plan_wave(&self, graph: &SummaryGraph, wave: &[usize]) -> Vec<Job> {
        let mut jobs = Vec::new();
        // Units grouped per file in wave order.
        let mut unit_groups: BTreeMap<String, Vec<Prepared>> = BTreeMap::new();

        for &idx in wave {
            let prep = self.prepare(graph, idx);
            match &prep.unit {
                Some(unit) => unit_groups.entry(unit.path.clone()).or_default().push(prep),
                None => jobs.push(Job::Single(prep)),
            }
        }

        let limits = BatchLimits {
            max_units: self.config.max_batch_units,
            max_tokens: self.config.max_batch_tokens,
            batchable_unit_tokens: self.config.batchable_unit_tokens,
        };
        for (_, preps) in unit_groups {
            let tokens: Vec<usize> = preps
                .iter()
                .map(|p| p.unit.as_ref().map(|u| count_tokens(&u.text)).unwrap_or(0))
                .collect();
            let plan = plan_leaf_batches(&tokens, limits);
            let mut slots: Vec<Option<Prepared>> = preps.into_iter().map(Some).collect();
            for group in plan {
                let mut members: Vec<Prepared> =
                    group.iter().filter_map(|&i| slots[i].take()).collect();
                if members.len() == 1 {
                    if let Some(prep) = members.pop() {
                        jobs.push(Job::Single(prep));
                    }
                } else if !members.is_empty() {
                    jobs.push(Job::Batch(members));
                }
            }
        }
        jobs
    }

    fn prepare(&self, graph: &SummaryGraph, idx: usize) -> Prepared {
        let node = graph.node(idx);
        let tier = Tier::for_level(node.level);
        let template = self.prompts.for_level(node.level);

        let mut child_hashes = Vec::with_capacity(node.children.len());
        let mut context = Vec::with_capacity(node.children.len());
        let mut missing = Vec::new();
        let mut child_partial = false;
        for child_id in &node.children {
            match graph.get(child_id) {
                Some(child) if child.status.is_done() && child.summary.is_some() => {
                    let summary = child.summary.clone().unwrap_or_default();
                    child_hashes.push(hash_text(&summary));
                    context.push(ContextEntry::present(child.label.clone(), summary));
                    child_partial |= child.partial;
                }
                Some(child) => {
                    child_hashes.push(format!("failed:{}", child.id));
                    let reason = child
                        .failure
                        .clone()
                        .unwrap_or_else(|| "unavailable".to_string());
                    context.push(ContextEntry::missing(child.label.clone(), reason));
                    missing.push(child.label.clone());
                }
                None => {
                    child_hashes.push(format!("failed:{child_id}"));
                    missing.push(child_id.clone());
                }
            }
        }

        let key = SummaryCacheKey::new(
            node.level,
            &node.id,
            &node.content_hash,
            &child_hashes,
            template.slug,
            &template.hash(),
            tier,
            self.caller.model_id(tier),
        );

        let unit = match &node.payload {
            NodePayload::Unit(unit) => Some(unit.clone()),
            _ => None,
        };

        let kind = if !node.children.is_empty() && missing.len() == node.children.len() {
            PreparedKind::Placeholder {
                failure: format!("all inputs unavailable: {}", missing.join(", ")),
            }
        } else {
            let members: Vec<String> = node
                .children
                .iter()
                .filter_map(|c| graph.get(c).map(|n| n.label.clone()))
                .collect();
            let prompt = match &node.payload {
                NodePayload::Unit(unit) => self.prompts.render_unit(unit),
                NodePayload::File {
                    path,
                    language,
                    unit_count,
                } => self.prompts.render_file(path, language, *unit_count),
                NodePayload::Directory { .. } => {
                    self.prompts
                        .render_group(Level::Directory, &node.label, &members)
                }
                NodePayload::Module { name, directories } => {
                    self.prompts.render_group(Level::Module, name, directories)
                }
                NodePayload::Root { name } => {
                    self.prompts.render_group(Level::Root, name, &members)
                }
            };
            let deep = match &node.payload {
                NodePayload::Root { name } => {
                    let tokens: usize = context
                        .iter()
                        .filter(|c| !c.missing)
                        .map(|c| count_tokens(&c.summary))
                        .sum();
                    should_use_deep_mode(
                        tokens,
                        node.children.len(),
                        self.config.deep_mode_threshold_tokens,
                    )
                    .then(|| name.clone())
                }
                _ => None,
            };
            PreparedKind::Call {
                prompt,
                context,
                partial: child_partial || !missing.is_empty(),
                missing,
                deep,
            }
        };

        Prepared {
            idx,
            id: node.id.clone(),
            level: node.level,
            tier,
            key,
            unit,
            kind,
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    async fn run_job(&self, job: Job, state: &RunState<'_>) -> JobOutput {
        match job {
            Job::Single(prep) => {
                let mut output = JobOutput::default();
                if let Some(ev) = self.resolve_without_call(&prep, state).await {
                    output.evaluated.push(ev);
                } else {
                    let ev = self.call_and_finish(&prep, state, &mut output).await;
                    output.evaluated.push(ev);
                }
                output
            }
            Job::Batch(preps) => self.run_batch(preps, state).await,
        }
    }

    /// Checkpoint reuse, placeholder, or cache hit.
    async fn resolve_without_call(
        &self,
        prep: &Prepared,
        state: &RunState<'_>,
    ) -> Option<Evaluated> {
        if let Some(record) = state.records.get(&prep.id) {
            if record.is_reusable(&prep.key.key_hash) {
                let mut ev = Evaluated::new(prep, NodeStatus::Done, NodeSource::Checkpoint);
                ev.summary = record.summary.clone();
                return Some(ev);
            }
        }

        let partial = match &prep.kind {
            PreparedKind::Placeholder { failure } => {
                let mut ev = Evaluated::new(prep, NodeStatus::Failed, NodeSource::Placeholder);
                ev.failure = Some(failure.clone());
                ev.partial = true;
                self.checkpoint(state, &ev).await;
                return Some(ev);
            }
            PreparedKind::Call { partial, .. } => *partial,
        };

        match self.cache.get(&prep.key).await {
            Ok(Some(entry)) => {
                let mut ev = Evaluated::new(prep, NodeStatus::Cached, NodeSource::Cache);
                ev.summary = Some(entry.summary);
                ev.partial = partial;
                self.checkpoint(state, &ev).await;
                Some(ev)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node = %prep.id, error = %e, "cache read failed, recomputing");
                None
            }
        }
    }

    async fn call_and_finish(
        &self,
        prep: &Prepared,
        state: &RunState<'_>,
        output: &mut JobOutput,
    ) -> Evaluated {
        let PreparedKind::Call {
            prompt,
            context,
            deep,
            ..
        } = &prep.kind
        else {
            // Placeholders never reach here.
            return Evaluated::new(prep, NodeStatus::Failed, NodeSource::Placeholder);
        };

        let result = if let Some(repo_name) = deep {
            self.call_root_loop(prep, repo_name, prompt, context, state, output)
                .await
        } else {
            let r = self.call_remote(state, prep.tier, prompt, context).await;
            if !matches!(r, Err(ProviderError::Cancelled)) {
                output.remote_calls += 1;
            }
            r
        };

        match result {
            Ok(generation) => {
                let mut ev = self
                    .finish_success(prep, generation, NodeSource::Remote, state)
                    .await;
                ev.deep = deep.is_some();
                ev
            }
            Err(e) => self.finish_failure(prep, e, state).await,
        }
    }

    async fn run_batch(&self, preps: Vec<Prepared>, state: &RunState<'_>) -> JobOutput {
        let mut output = JobOutput::default();
        let mut pending = Vec::new();
        for prep in preps {
            match self.resolve_without_call(&prep, state).await {
                Some(ev) => output.evaluated.push(ev),
                None => pending.push(prep),
            }
        }

        let mut leftovers = Vec::new();
        if pending.len() >= 2 {
            let units: Vec<&SourceUnit> = pending.iter().filter_map(|p| p.unit.as_ref()).collect();
            let prompt = self.prompts.render_unit_batch(&units);
            match self.call_remote(state, Tier::Fast, &prompt, &[]).await {
                Ok(generation) => {
                    output.remote_calls += 1;
                    output.batched_calls += 1;
                    let sections = parse_batch_response(&generation.text, pending.len());
                    let shares = split_usage(&generation, sections.len());
                    let mut share_iter = shares.into_iter();
                    for (i, prep) in pending.into_iter().enumerate() {
                        match sections.get(&(i + 1)) {
                            Some(text) => {
                                let mut share = share_iter.next().unwrap_or_default();
                                share.text = text.clone();
                                let ev = self
                                    .finish_success(&prep, share, NodeSource::Batched, state)
                                    .await;
                                output.evaluated.push(ev);
                            }
                            None => leftovers.push(prep),
                        }
                    }
                    if !leftovers.is_empty() {
                        tracing::debug!(
                            missing = leftovers.len(),
                            "batch response incomplete, summarizing remaining units individually"
                        );
                    }
                }
                Err(ProviderError::Cancelled) => {
                    output
                        .evaluated
                        .extend(pending.iter().map(Evaluated::cancelled));
                    return output;
                }
                Err(e) if e.is_fatal() => {
                    output.remote_calls += 1;
                    let reason = e.to_string();
                    let mut iter = pending.into_iter();
                    if let Some(first) = iter.next() {
                        output.evaluated.push(self.finish_failure(&first, e, state).await);
                    }
                    for prep in iter {
                        let mut ev = Evaluated::new(&prep, NodeStatus::Failed, NodeSource::Remote);
                        ev.failure = Some(reason.clone());
                        output.evaluated.push(ev);
                    }
                    return output;
                }
                Err(e) => {
                    output.remote_calls += 1;
                    tracing::warn!(error = %e, "batch call failed, summarizing units individually");
                    leftovers = pending;
                }
            }
        } else {
            leftovers = pending;
        }

        for prep in leftovers {
            let ev = self.call_and_finish(&prep, state, &mut output).await;
            output.evaluated.push(ev);
        }
        output
    }

    /// One remote call under the tier's permit. Returns `Cancelled` when the
    /// run is interrupted or aborted before or during the call.
    async fn call_remote(
        &self,
        state: &RunState<'_>,
        tier: Tier,
        prompt: &PromptInstance,
        context: &[ContextEntry],
    ) -> Result<Generation, ProviderError> {
        let _permit = tokio::select! {
            biased;
            _ = state.interrupt.triggered() => return Err(ProviderError::Cancelled),
            permit = state.semaphore(tier).acquire() => {
                permit.map_err(|_| ProviderError::Cancelled)?
            }
        };
        if state.abort.load(AtomicOrdering::SeqCst) {
            return Err(ProviderError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = state.interrupt.triggered() => Err(ProviderError::Cancelled),
            r = self.caller.call(tier, prompt, context) => r,
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                state.abort.store(true, AtomicOrdering::SeqCst);
            }
        }
        result
    }

    async fn call_root_loop(
        &self,
        prep: &Prepared,
        repo_name: &str,
        prompt: &PromptInstance,
        context: &[ContextEntry],
        state: &RunState<'_>,
        output: &mut JobOutput,
    ) -> Result<Generation, ProviderError> {
        let _permit = tokio::select! {
            biased;
            _ = state.interrupt.triggered() => return Err(ProviderError::Cancelled),
            permit = state.semaphore(prep.tier).acquire() => {
                permit.map_err(|_| ProviderError::Cancelled)?
            }
        };
        if state.abort.load(AtomicOrdering::SeqCst) {
            return Err(ProviderError::Cancelled);
        }
        let root_loop = RootLoop {
            prompts: &self.prompts,
            caller: self.caller.as_ref(),
            repo_name,
            synthesis: prompt,
            modules: context,
            max_iterations: self.config.max_root_iterations,
        };
        tracing::info!(node = %prep.id, modules = context.len(), "root using deep mode");
        let result = tokio::select! {
            biased;
            _ = state.interrupt.triggered() => Err(ProviderError::Cancelled),
            r = root_loop.run() => r,
        };
        match result {
            Ok(outcome) => {
                output.remote_calls += u64::from(outcome.calls);
                Ok(outcome.generation)
            }
            Err(e) => {
                if !matches!(e, ProviderError::Cancelled) {
                    output.remote_calls += 1;
                }
                if e.is_fatal() {
                    state.abort.store(true, AtomicOrdering::SeqCst);
                }
                Err(e)
            }
        }
    }

    async fn finish_success(
        &self,
        prep: &Prepared,
        generation: Generation,
        source: NodeSource,
        state: &RunState<'_>,
    ) -> Evaluated {
        let (missing, partial) = match &prep.kind {
            PreparedKind::Call {
                missing, partial, ..
            } => (missing.as_slice(), *partial),
            PreparedKind::Placeholder { .. } => (&[][..], true),
        };
        let mut summary = generation.text.trim().to_string();
        if !missing.is_empty() {
            summary.push_str(&format!("\n\n(unavailable: {})", missing.join(", ")));
        }

        let entry = CacheEntry {
            summary: summary.clone(),
            tier: prep.tier,
            model: prep.key.model.clone(),
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
            cost_nanodollars: generation.cost_nanodollars,
            created_at: now_epoch(),
        };
        if let Err(e) = self.cache.put(&prep.key, &entry).await {
            tracing::warn!(node = %prep.id, error = %e, "cache write failed");
        }

        let mut ev = Evaluated::new(prep, NodeStatus::Done, source);
        ev.summary = Some(summary);
        ev.partial = partial;
        ev.input_tokens = generation.input_tokens;
        ev.output_tokens = generation.output_tokens;
        ev.cost_nanodollars = generation.cost_nanodollars;
        self.checkpoint(state, &ev).await;
        tracing::debug!(node = %prep.id, level = prep.level.name(), source = ?source, "node done");
        ev
    }

    async fn finish_failure(
        &self,
        prep: &Prepared,
        error: ProviderError,
        state: &RunState<'_>,
    ) -> Evaluated {
        if matches!(error, ProviderError::Cancelled) {
            return Evaluated::cancelled(prep);
        }
        let mut ev = Evaluated::new(prep, NodeStatus::Failed, NodeSource::Remote);
        ev.failure = Some(error.to_string());
        self.checkpoint(state, &ev).await;
        // Non-fatal failures do not cancel siblings, even in the same batch or file.
        if error.is_fatal() {
            if let Ok(mut slot) = state.fatal.lock() {
                if slot.is_none() {
                    *slot = Some((prep.id.clone(), error));
                }
            }
        }
        ev
    }

    async fn checkpoint(&self, state: &RunState<'_>, ev: &Evaluated) {
        if !state.checkpoints_ok.load(AtomicOrdering::Relaxed) {
            return;
        }
        let record = CheckpointRecord {
            node_id: ev.node_id.clone(),
            status: if ev.status.is_done() {
                CheckpointStatus::Done
            } else {
                CheckpointStatus::Failed
            },
            summary: ev.summary.clone(),
            failure: ev.failure.clone(),
            cache_key: ev.cache_key.clone(),
            partial: ev.partial,
            input_tokens: ev.input_tokens,
            output_tokens: ev.output_tokens,
            cost_nanodollars: ev.cost_nanodollars,
        };
        if let Err(e) = self.checkpoints.record(state.run_id, &record).await {
            tracing::warn!(error = %e, "checkpoint write failed, run is no longer resumable");
            state.checkpoints_ok.store(false, AtomicOrdering::Relaxed);
            state.warn(format!("checkpoints disabled: {e}"));
        }
    }
}

/// Split one batched call's usage across `parts` units; the remainder goes
/// to the first unit.
fn split_usage(generation: &Generation, parts: usize) -> Vec<Generation> {
    if parts == 0 {
        return Vec::new();
    }
    let n = parts as u32;
    let cost_n = parts as i64;
    (0..parts)
        .map(|i| {
            let first = i == 0;
            Generation {
                text: String::new(),
                input_tokens: generation.input_tokens / n
                    + if first { generation.input_tokens % n } else { 0 },
                output_tokens: generation.output_tokens / n
                    + if first { generation.output_tokens % n } else { 0 },
                cost_nanodollars: generation.cost_nanodollars / cost_n
                    + if first {
                        generation.cost_nanodollars % cost_n
                    } else {
                        0
                    },
            }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn build_outcome(
    spec: &RunSpec,
    graph: &SummaryGraph,
    root_summary: String,
    root_status: NodeStatus,
    resumed: bool,
    deep_mode: bool,
    warnings: Vec<String>,
    stats: RunStats,
) -> RunOutcome {
    let mut nodes: Vec<NodeOutcome> = graph
        .nodes()
        .iter()
        .map(|n| NodeOutcome {
            id: n.id.clone(),
            level: n.level,
            label: n.label.clone(),
            status: n.status,
            source: n.source,
            partial: n.partial,
            summary: n.summary.clone(),
            failure: n.failure.clone(),
        })
        .collect();
    nodes.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));

    let files = graph
        .nodes()
        .iter()
        .filter_map(|n| match &n.payload {
            NodePayload::File {
                path,
                language,
                unit_count,
            } => Some((
                path.clone(),
                FileOutcome {
                    path: path.clone(),
                    language: language.clone(),
                    content_hash: n.content_hash.clone(),
                    unit_count: *unit_count,
                    summary: n.summary.clone(),
                    partial: n.partial,
                    failed: n.status == NodeStatus::Failed,
                    pinned: n.source == Some(NodeSource::Pinned),
                },
            )),
            _ => None,
        })
        .collect();

    let repo_name = graph
        .root()
        .map(|r| r.label.clone())
        .unwrap_or_default();

    RunOutcome {
        run_id: spec.run_id.clone(),
        repo_name,
        root_summary,
        root_status,
        resumed,
        deep_mode,
        nodes,
        files,
        warnings,
        stats,
    }
}
