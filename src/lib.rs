#![forbid(unsafe_code)]

//! # synopsis-harness
//!
//! Multi-level natural-language summaries of a source repository.
//!
//! A repository is split into units (functions, classes, items), which are
//! summarized bottom-up through a fixed hierarchy: unit, file, directory,
//! module, root. Each layer's summaries become the context of the layer
//! above. Leaf layers run on a fast model tier, upper layers on a strong one,
//! each under its own concurrency ceiling.
//!
//! Every summary is content-addressed in a persistent cache, every finished
//! node is checkpointed so an interrupted run resumes where it stopped, and
//! each completed run leaves a manifest that later runs diff against to
//! re-summarize only what changed.

pub mod cache;
pub mod caller;
pub mod checkpoint;
pub mod config;
pub mod diff_report;
pub mod engine;
pub mod extract;
pub mod gateway;
pub mod hashing;
pub mod manifest;
pub mod prompts;
pub mod summarizer;
pub mod tokens;

pub use cache::{MemorySummaryCache, SqliteSummaryCache, SummaryCache, SummaryCacheKey};
pub use caller::{ContextEntry, GatewayCaller, Generation, ModelCaller, Tier, TierModels};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::{EngineConfig, SynopsisConfig};
pub use engine::{
    Engine, EngineError, Level, NodeStatus, RunInterrupt, RunOutcome, RunSpec, RunStats,
    SummaryGraph,
};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use manifest::{ManifestDiff, ManifestStore, RunManifest};
pub use prompts::{PromptSet, PromptTemplate};
pub use summarizer::{RunOptions, Summarizer, SummarizerError, SummarizerOutput};
