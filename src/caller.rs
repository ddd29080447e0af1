//! The model-call seam between the engine and a summarization backend.
//!
//! The engine only sees `ModelCaller`: a tier, a rendered prompt and the
//! child summaries it should draw on. Retries for transient failures happen
//! below this seam; anything returned as `Err` is terminal for that attempt.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::graph::Level;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};
use crate::prompts::{escape_xml_chars, PromptInstance};

/// Cost/capability class of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Strong,
}

impl Tier {
    /// Units and files go to the fast tier; everything above to the strong one.
    pub fn for_level(level: Level) -> Self {
        match level {
            Level::Unit | Level::File => Tier::Fast,
            Level::Directory | Level::Module | Level::Root => Tier::Strong,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Strong => "strong",
        }
    }

    fn caller_tag(&self) -> &'static str {
        match self {
            Tier::Fast => "synopsis::fast",
            Tier::Strong => "synopsis::strong",
        }
    }
}

/// One child summary handed to the model as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub label: String,
    pub summary: String,
    /// The child failed; `summary` holds the failure reason.
    pub missing: bool,
}

impl ContextEntry {
    pub fn present(label: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            summary: summary.into(),
            missing: false,
        }
    }

    pub fn missing(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            summary: reason.into(),
            missing: true,
        }
    }
}

/// Generated text plus usage counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(
        &self,
        tier: Tier,
        prompt: &PromptInstance,
        context: &[ContextEntry],
    ) -> Result<Generation, ProviderError>;

    /// Model identifier for `tier`; part of every cache key.
    fn model_id(&self, tier: Tier) -> &str;
}

/// Render context entries as tagged blocks appended to the user message.
pub fn render_context(context: &[ContextEntry]) -> String {
    let mut out = String::new();
    for entry in context {
        let label = escape_xml_chars(&entry.label);
        if entry.missing {
            out.push_str(&format!(
                "<summary label=\"{label}\" status=\"unavailable\">{}</summary>\n",
                escape_xml_chars(&entry.summary)
            ));
        } else {
            out.push_str(&format!(
                "<summary label=\"{label}\">\n{}\n</summary>\n",
                escape_xml_chars(entry.summary.trim())
            ));
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierModels {
    pub fast_model: String,
    pub strong_model: String,
    pub fast_max_output_tokens: u32,
    pub strong_max_output_tokens: u32,
}

/// `ModelCaller` backed by the provider gateway.
pub struct GatewayCaller {
    gateway: Arc<dyn ChatGateway>,
    models: TierModels,
    run_id: Option<String>,
}

impl GatewayCaller {
    pub fn new(gateway: Arc<dyn ChatGateway>, models: TierModels) -> Self {
        Self {
            gateway,
            models,
            run_id: None,
        }
    }

    /// Tag every request with `run_id` for usage attribution.
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    fn max_tokens(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Fast => self.models.fast_max_output_tokens,
            Tier::Strong => self.models.strong_max_output_tokens,
        }
    }
}

#[async_trait]
impl ModelCaller for GatewayCaller {
    async fn call(
        &self,
        tier: Tier,
        prompt: &PromptInstance,
        context: &[ContextEntry],
    ) -> Result<Generation, ProviderError> {
        let mut user = String::new();
        if !context.is_empty() {
            user.push_str("<context>\n");
            user.push_str(&render_context(context));
            user.push_str("</context>\n\n");
        }
        user.push_str(&prompt.user);

        let mut attribution = Attribution::new(tier.caller_tag());
        if let Some(run_id) = &self.run_id {
            attribution = attribution.with_run(run_id.clone());
        }
        let request = ChatRequest::new(
            ChatModel::openrouter(self.model_id(tier)),
            vec![Message::system(&prompt.system), Message::user(user)],
            attribution,
        )
        .temperature(0.0)
        .max_tokens(self.max_tokens(tier));

        let response = self.gateway.chat(request).await?;
        Ok(Generation {
            text: response.content.trim().to_string(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost_nanodollars: response.cost_nanodollars,
        })
    }

    fn model_id(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.models.fast_model,
            Tier::Strong => &self.models.strong_model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_split_between_file_and_directory() {
        assert_eq!(Tier::for_level(Level::Unit), Tier::Fast);
        assert_eq!(Tier::for_level(Level::File), Tier::Fast);
        assert_eq!(Tier::for_level(Level::Directory), Tier::Strong);
        assert_eq!(Tier::for_level(Level::Root), Tier::Strong);
    }

    #[test]
    fn missing_context_is_marked_unavailable() {
        let rendered = render_context(&[
            ContextEntry::present("file:a.rs", "Parses <args>."),
            ContextEntry::missing("file:b.rs", "timeout"),
        ]);
        assert!(rendered.contains("Parses &lt;args&gt;."));
        assert!(rendered.contains("status=\"unavailable\">timeout"));
    }
}
