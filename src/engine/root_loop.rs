//! Iterative root synthesis for large repositories.
//!
//! Instead of one prompt carrying every module summary, the model first sees
//! a one-line outline per module and asks for the modules it needs in full.
//! The loop is a bounded state machine; after `max_iterations` gathering
//! rounds it synthesizes with whatever it has.

use crate::caller::{ContextEntry, Generation, ModelCaller, Tier};
use crate::gateway::ProviderError;
use crate::prompts::{parse_expand_requests, GatherReply, PromptInstance, PromptSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootState {
    Gathering,
    ToolInvocation(Vec<String>),
    Synthesizing,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootLoopOutcome {
    /// Final text plus usage summed over every call of the loop.
    pub generation: Generation,
    pub calls: u32,
    pub gather_rounds: usize,
    /// Module labels expanded in full, in request order.
    pub expanded: Vec<String>,
}

/// First sentence of `text`, capped at 200 chars.
pub fn first_sentence(text: &str) -> String {
    let text = text.trim();
    let line = text.lines().next().unwrap_or("");
    let end = line
        .find(". ")
        .map(|i| i + 1)
        .unwrap_or(line.len());
    let sentence = &line[..end];
    if sentence.chars().count() > 200 {
        let cut: String = sentence.chars().take(200).collect();
        format!("{cut}...")
    } else {
        sentence.to_string()
    }
}

pub struct RootLoop<'a> {
    pub prompts: &'a PromptSet,
    pub caller: &'a dyn ModelCaller,
    pub repo_name: &'a str,
    /// Final synthesis prompt.
    pub synthesis: &'a PromptInstance,
    /// Module summaries in child order; failed modules are `missing`.
    pub modules: &'a [ContextEntry],
    pub max_iterations: usize,
}

impl RootLoop<'_> {
    pub async fn run(&self) -> Result<RootLoopOutcome, ProviderError> {
        let mut outcome = RootLoopOutcome::default();
        let mut state = RootState::Gathering;

        loop {
            state = match state {
                RootState::Gathering => {
                    if outcome.gather_rounds >= self.max_iterations {
                        RootState::Synthesizing
                    } else {
                        self.gather(&mut outcome).await?
                    }
                }
                RootState::ToolInvocation(labels) => {
                    tracing::debug!(modules = ?labels, "root expanding modules");
                    outcome.expanded.extend(labels);
                    RootState::Gathering
                }
                RootState::Synthesizing => {
                    let context = self.synthesis_context(&outcome.expanded);
                    let generation = self
                        .caller
                        .call(Tier::Strong, self.synthesis, &context)
                        .await?;
                    add_usage(&mut outcome, &generation);
                    outcome.generation.text = generation.text;
                    RootState::Done
                }
                RootState::Done => break,
            };
        }
        Ok(outcome)
    }

    async fn gather(&self, outcome: &mut RootLoopOutcome) -> Result<RootState, ProviderError> {
        let outline: Vec<(String, String)> = self
            .modules
            .iter()
            .map(|m| {
                let line = if m.missing {
                    "(unavailable)".to_string()
                } else {
                    first_sentence(&m.summary)
                };
                (m.label.clone(), line)
            })
            .collect();
        let prompt =
            self.prompts
                .render_root_gather(self.repo_name, &outline, &outcome.expanded);
        let context: Vec<ContextEntry> = self
            .modules
            .iter()
            .filter(|m| outcome.expanded.contains(&m.label))
            .cloned()
            .collect();

        let generation = self.caller.call(Tier::Strong, &prompt, &context).await?;
        add_usage(outcome, &generation);
        outcome.gather_rounds += 1;

        Ok(match parse_expand_requests(&generation.text) {
            GatherReply::Ready => RootState::Synthesizing,
            GatherReply::Expand(labels) => {
                let fresh: Vec<String> = labels
                    .into_iter()
                    .filter(|label| {
                        !outcome.expanded.contains(label)
                            && self
                                .modules
                                .iter()
                                .any(|m| &m.label == label && !m.missing)
                    })
                    .collect();
                if fresh.is_empty() {
                    RootState::Synthesizing
                } else {
                    RootState::ToolInvocation(fresh)
                }
            }
        })
    }

    /// Expanded modules in full, the rest as their outline line.
    fn synthesis_context(&self, expanded: &[String]) -> Vec<ContextEntry> {
        self.modules
            .iter()
            .map(|m| {
                if m.missing || expanded.contains(&m.label) {
                    m.clone()
                } else {
                    ContextEntry::present(m.label.clone(), first_sentence(&m.summary))
                }
            })
            .collect()
    }
}

fn add_usage(outcome: &mut RootLoopOutcome, generation: &Generation) {
    outcome.calls += 1;
    outcome.generation.input_tokens = outcome
        .generation
        .input_tokens
        .saturating_add(generation.input_tokens);
    outcome.generation.output_tokens = outcome
        .generation
        .output_tokens
        .saturating_add(generation.output_tokens);
    outcome.generation.cost_nanodollars = outcome
        .generation
        .cost_nanodollars
        .saturating_add(generation.cost_nanodollars);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sentence_stops_at_period() {
        assert_eq!(
            first_sentence("Handles auth. Also caches tokens."),
            "Handles auth."
        );
        assert_eq!(first_sentence("One line\nsecond line"), "One line");
        assert!(first_sentence(&"x".repeat(500)).ends_with("..."));
    }
}
