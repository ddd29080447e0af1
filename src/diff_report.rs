//! Change reports between two runs: a JSON payload and an optional prose
//! digest written by the strong tier.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::caller::{Generation, ModelCaller, Tier};
use crate::gateway::ProviderError;
use crate::manifest::{ManifestDiff, ModifiedFile, RunManifest};
use crate::prompts::PromptSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPayload {
    pub old_run_id: Option<String>,
    pub new_run_id: String,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub modified: Vec<ModifiedFile>,
    pub unchanged: Vec<String>,
    pub churn_hotspots: Vec<String>,
    pub counts: DiffCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

pub fn manifest_diff_to_payload(
    diff: &ManifestDiff,
    old_run_id: Option<&str>,
    new_run_id: &str,
) -> DiffPayload {
    DiffPayload {
        old_run_id: old_run_id.map(str::to_string),
        new_run_id: new_run_id.to_string(),
        added: diff.added.clone(),
        deleted: diff.deleted.clone(),
        modified: diff.modified.clone(),
        unchanged: diff.unchanged.clone(),
        churn_hotspots: diff.churn_hotspots.clone(),
        counts: DiffCounts {
            added: diff.added.len(),
            deleted: diff.deleted.len(),
            modified: diff.modified.len(),
            unchanged: diff.unchanged.len(),
        },
        digest: None,
    }
}

pub fn write_diff_json(path: &Path, payload: &DiffPayload) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(payload).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// One strong-tier call describing what changed between two runs.
pub async fn generate_diff_digest(
    caller: &dyn ModelCaller,
    prompts: &PromptSet,
    diff: &ManifestDiff,
    old: Option<&RunManifest>,
    new: &RunManifest,
) -> Result<Generation, ProviderError> {
    let prompt = prompts.render_diff_digest(
        old.map(|m| m.run_id.as_str()),
        &new.run_id,
        old.map(|m| m.final_summary.as_str()),
        &new.final_summary,
        diff,
    );
    caller.call(Tier::Strong, &prompt, &[]).await
}

/// Change note prepended to the previous root summary for diff-only runs.
pub fn build_diff_only_summary(
    old_summary: &str,
    added: usize,
    modified: usize,
    deleted: usize,
) -> String {
    format!(
        "Changes since previous run: +{added} added, {modified} modified, -{deleted} deleted.\n\n{}",
        old_summary.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_note_carries_counts() {
        let text = build_diff_only_summary("old summary here", 2, 3, 1);
        assert!(text.contains("+2 added"));
        assert!(text.contains("3 modified"));
        assert!(text.contains("-1 deleted"));
        assert!(text.ends_with("old summary here"));
    }

    #[test]
    fn payload_counts_match_lists() {
        let diff = ManifestDiff {
            added: vec!["c.py".into()],
            deleted: vec!["a.py".into()],
            modified: vec![],
            unchanged: vec!["b.py".into(), "d.py".into()],
            churn_hotspots: vec![],
        };
        let payload = manifest_diff_to_payload(&diff, Some("old"), "new");
        assert_eq!(
            payload.counts,
            DiffCounts {
                added: 1,
                deleted: 1,
                modified: 0,
                unchanged: 2
            }
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["old_run_id"], "old");
        assert!(json.get("digest").is_none());
    }
}
