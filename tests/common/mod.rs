#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use synopsis_harness::caller::{render_context, ContextEntry, Generation, ModelCaller, Tier};
use synopsis_harness::checkpoint::CheckpointStore;
use synopsis_harness::config::{EngineConfig, ScanConfig};
use synopsis_harness::engine::{Engine, RunInterrupt};
use synopsis_harness::gateway::{ErrorContext, ProviderError};
use synopsis_harness::hashing::{hash_fields, short_hash};
use synopsis_harness::manifest::ManifestStore;
use synopsis_harness::prompts::PromptInstance;
use synopsis_harness::summarizer::Summarizer;
use synopsis_harness::SummaryCache;

pub enum Script {
    /// Fail this many times, then succeed.
    FailTimes(usize),
    /// Always fail, non-fatally.
    Fail,
    /// Fail with an authentication error.
    Fatal,
    /// Trigger the interrupt, then never answer.
    Interrupt(RunInterrupt),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tier: Tier,
    pub slug: String,
    pub user: String,
}

/// Deterministic `ModelCaller`: the answer is a hash of the prompt and its
/// context. Targets are matched by substring of the user prompt.
pub struct StubCaller {
    delay: Duration,
    scripts: Mutex<Vec<(String, Script)>>,
    in_flight: [AtomicUsize; 2],
    peak: [AtomicUsize; 2],
    started: AtomicUsize,
    completed: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
    drop_last_batch_section: AtomicBool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn tier_index(tier: Tier) -> usize {
    match tier {
        Tier::Fast => 0,
        Tier::Strong => 1,
    }
}

impl StubCaller {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            scripts: Mutex::new(Vec::new()),
            in_flight: [AtomicUsize::new(0), AtomicUsize::new(0)],
            peak: [AtomicUsize::new(0), AtomicUsize::new(0)],
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            drop_last_batch_section: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, target: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push((target.to_string(), script));
        self
    }

    pub fn drop_last_batch_section(self) -> Self {
        self.drop_last_batch_section.store(true, Ordering::SeqCst);
        self
    }

    pub fn peak(&self, tier: Tier) -> usize {
        self.peak[tier_index(tier)].load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_with_slug(&self, slug: &str) -> usize {
        self.calls().iter().filter(|c| c.slug == slug).count()
    }

    pub fn calls_mentioning(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.user.contains(needle)).count()
    }

    pub fn calls_at(&self, tier: Tier) -> usize {
        self.calls().iter().filter(|c| c.tier == tier).count()
    }

    fn scripted_failure(&self, user: &str) -> Option<Result<(), RunInterrupt>> {
        let mut scripts = self.scripts.lock().unwrap();
        for (target, script) in scripts.iter_mut() {
            if !user.contains(target.as_str()) {
                continue;
            }
            match script {
                Script::FailTimes(0) => continue,
                Script::FailTimes(n) => {
                    *n -= 1;
                    return Some(Ok(()));
                }
                Script::Fail | Script::Fatal => return Some(Ok(())),
                Script::Interrupt(interrupt) => return Some(Err(interrupt.clone())),
            }
        }
        None
    }

    fn is_fatal_target(&self, user: &str) -> bool {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .any(|(target, s)| matches!(s, Script::Fatal) && user.contains(target.as_str()))
    }

    fn respond(&self, prompt: &PromptInstance, context: &[ContextEntry]) -> String {
        let digest = hash_fields(&[&prompt.user, &render_context(context)]);
        let tag = short_hash(&digest, 12);
        match prompt.template_slug.as_str() {
            "unit_batch_v1" => {
                let mut count = prompt.user.matches("=== U").count();
                if self.drop_last_batch_section.load(Ordering::SeqCst) {
                    count = count.saturating_sub(1);
                }
                (1..=count)
                    .map(|i| format!("=== U{i} ===\nbatched unit {i} of {tag}"))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            "root_gather_v1" => {
                if prompt.user.contains("<expanded>none</expanded>") {
                    let first = prompt
                        .user
                        .lines()
                        .find_map(|l| l.strip_prefix("- "))
                        .and_then(|l| l.split(": ").next())
                        .unwrap_or("");
                    format!("EXPAND: {first}")
                } else {
                    "READY".to_string()
                }
            }
            slug => format!("{slug} summary {tag}. More detail follows."),
        }
    }
}

#[async_trait]
impl ModelCaller for StubCaller {
    async fn call(
        &self,
        tier: Tier,
        prompt: &PromptInstance,
        context: &[ContextEntry],
    ) -> Result<Generation, ProviderError> {
        let idx = tier_index(tier);
        self.started.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            tier,
            slug: prompt.template_slug.clone(),
            user: prompt.user.clone(),
        });
        let now = self.in_flight[idx].fetch_add(1, Ordering::SeqCst) + 1;
        self.peak[idx].fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight[idx]);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.scripted_failure(&prompt.user) {
            Some(Err(interrupt)) => {
                interrupt.trigger();
                std::future::pending::<()>().await;
            }
            Some(Ok(())) if self.is_fatal_target(&prompt.user) => {
                return Err(ProviderError::unauthorized(
                    "invalid api key",
                    ErrorContext::new().with_status(401),
                ));
            }
            Some(Ok(())) => {
                return Err(ProviderError::provider("stub", "scripted failure", false));
            }
            None => {}
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Generation {
            text: self.respond(prompt, context),
            input_tokens: 10,
            output_tokens: 5,
            cost_nanodollars: 100,
        })
    }

    fn model_id(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => "stub/fast",
            Tier::Strong => "stub/strong",
        }
    }
}

pub fn write_repo(root: &Path, files: &[(&str, &str)]) {
    for (rel, body) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }
}

pub fn python_fn(name: &str) -> String {
    format!("def {name}(x):\n    return x + 1\n\n")
}

/// Small three-directory repository.
pub fn sample_repo(root: &Path) {
    let a = format!("{}{}{}", python_fn("alpha"), python_fn("beta"), python_fn("gamma"));
    let b = format!("{}{}", python_fn("delta"), python_fn("epsilon"));
    let c = python_fn("zeta");
    let d = "pub fn run() {}\n\npub struct Config;\n".to_string();
    write_repo(
        root,
        &[
            ("pkg/a.py", &a),
            ("pkg/b.py", &b),
            ("lib/c.py", &c),
            ("tools/main.rs", &d),
        ],
    );
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        fast_concurrency: 4,
        strong_concurrency: 2,
        ..EngineConfig::default()
    }
}

pub fn engine(
    caller: Arc<StubCaller>,
    cache: Arc<dyn SummaryCache>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: EngineConfig,
) -> Engine {
    Engine::new(caller, cache, checkpoints, config)
}

pub fn summarizer(
    caller: Arc<StubCaller>,
    cache: Arc<dyn SummaryCache>,
    checkpoints: Arc<dyn CheckpointStore>,
    manifest_dir: &Path,
    config: EngineConfig,
) -> Summarizer {
    Summarizer::new(
        engine(caller, cache, checkpoints.clone(), config),
        checkpoints,
        ManifestStore::new(manifest_dir).unwrap(),
        ScanConfig::default(),
        10,
    )
}
