//! Pure sizing heuristics: directory chunking, module clustering, leaf
//! batching and the deep-mode switch. None of these touch the network.

use std::collections::BTreeMap;
use std::ops::Range;

/// Split a directory of `file_count` sorted files into consecutive chunks.
/// Returns no ranges when the directory fits in one chunk.
pub fn partition_directory(file_count: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    if file_count <= chunk_size {
        return Vec::new();
    }
    (0..file_count)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(file_count))
        .collect()
}

/// Directories grouped under one module node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleGroup {
    pub name: String,
    /// Set when a top-level group had to be split.
    pub cluster: Option<usize>,
    pub directories: Vec<String>,
}

impl ModuleGroup {
    pub fn node_name(&self) -> String {
        match self.cluster {
            Some(i) => format!("{}#cluster-{i}", self.name),
            None => self.name.clone(),
        }
    }
}

fn top_level_component(dir: &str) -> &str {
    dir.split('/').next().unwrap_or(dir)
}

/// Up to `cluster_size` directories each become their own module. Beyond
/// that, directories are grouped by top-level path component and each group
/// is split into clusters of at most `cluster_size`.
pub fn cluster_directories(dirs: &[String], cluster_size: usize) -> Vec<ModuleGroup> {
    let cluster_size = cluster_size.max(1);
    let mut sorted: Vec<String> = dirs.to_vec();
    sorted.sort();
    sorted.dedup();

    if sorted.len() <= cluster_size {
        return sorted
            .into_iter()
            .map(|dir| ModuleGroup {
                name: dir.clone(),
                cluster: None,
                directories: vec![dir],
            })
            .collect();
    }

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for dir in sorted {
        groups
            .entry(top_level_component(&dir).to_string())
            .or_default()
            .push(dir);
    }

    let mut out = Vec::new();
    for (name, members) in groups {
        if members.len() <= cluster_size {
            out.push(ModuleGroup {
                name,
                cluster: None,
                directories: members,
            });
        } else {
            for (i, chunk) in members.chunks(cluster_size).enumerate() {
                out.push(ModuleGroup {
                    name: name.clone(),
                    cluster: Some(i),
                    directories: chunk.to_vec(),
                });
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_units: usize,
    pub max_tokens: usize,
    pub batchable_unit_tokens: usize,
}

/// Plan calls for one file's units, given each unit's token count in order.
/// Returns groups of indices; a group of one is an individual call.
pub fn plan_leaf_batches(unit_tokens: &[usize], limits: BatchLimits) -> Vec<Vec<usize>> {
    let max_units = limits.max_units.max(1);
    let mut plan = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for (idx, &tokens) in unit_tokens.iter().enumerate() {
        if tokens > limits.batchable_unit_tokens {
            if !current.is_empty() {
                plan.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            plan.push(vec![idx]);
            continue;
        }
        let overflow = current.len() + 1 > max_units
            || (!current.is_empty() && current_tokens + tokens > limits.max_tokens);
        if overflow {
            plan.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(idx);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        plan.push(current);
    }
    plan
}

/// The root gathers iteratively when its inputs are too large for one
/// prompt and there is more than one module to choose from.
pub fn should_use_deep_mode(child_tokens: usize, module_count: usize, threshold: usize) -> bool {
    module_count > 1 && child_tokens > threshold
}
