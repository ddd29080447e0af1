//! Usage tracking via the `UsageSink` trait.
//!
//! The gateway reports every attempt (successful or not) to a sink:
//! - the CLI uses `TracingUsageSink`
//! - tests use `NoopUsageSink` or `TallyUsageSink`

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// One provider attempt.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub run_id: Option<String>,
    pub caller: &'static str,
    pub attempt: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            run_id: None,
            caller,
            attempt: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn run(mut self, run_id: Option<String>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Sink for provider usage. Recording is fire-and-forget: implementations
/// log their own failures instead of returning them.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one `tracing` event per attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::debug!(
            provider = record.provider,
            model = %record.model,
            caller = record.caller,
            run_id = record.run_id.as_deref().unwrap_or("-"),
            attempt = record.attempt,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_nanos = record.cost_nanodollars,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error = record.error_code.as_deref().unwrap_or(""),
            "provider call"
        );
    }
}

/// Running totals across every attempt, including failed ones.
#[derive(Debug, Default)]
pub struct TallyUsageSink {
    attempts: AtomicU64,
    errors: AtomicU64,
    tokens: AtomicU64,
    cost_nanodollars: AtomicI64,
}

impl TallyUsageSink {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn cost_nanodollars(&self) -> i64 {
        self.cost_nanodollars.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UsageSink for TallyUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if record.status == CallStatus::Error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.tokens.fetch_add(
            u64::from(record.input_tokens) + u64::from(record.output_tokens),
            Ordering::Relaxed,
        );
        self.cost_nanodollars
            .fetch_add(record.cost_nanodollars, Ordering::Relaxed);
    }
}
