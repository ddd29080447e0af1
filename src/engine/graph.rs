//! The five-layer summary graph.
//!
//! Units feed files, files feed directories (optionally through chunk
//! sub-nodes), directories feed modules, modules feed the single root.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::sizing::{cluster_directories, partition_directory};
use crate::config::EngineConfig;
use crate::extract::{SourceFile, SourceUnit};
use crate::hashing::hash_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Unit = 1,
    File = 2,
    Directory = 3,
    Module = 4,
    Root = 5,
}

impl Level {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Level::Unit => "unit",
            Level::File => "file",
            Level::Directory => "directory",
            Level::Module => "module",
            Level::Root => "root",
        }
    }

    pub fn all() -> [Level; 5] {
        [
            Level::Unit,
            Level::File,
            Level::Directory,
            Level::Module,
            Level::Root,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Cached,
    Running,
    Done,
    Failed,
}

impl NodeStatus {
    /// Cached counts as done: the summary is available to parents.
    pub fn is_done(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Cached)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Cached | NodeStatus::Failed)
    }
}

/// Where a node's result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSource {
    Checkpoint,
    Cache,
    Remote,
    Batched,
    /// Prior summary carried over in diff-only mode.
    Pinned,
    /// Decided without a remote call (all children failed, or aborted).
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePayload {
    Unit(SourceUnit),
    File {
        path: String,
        language: String,
        unit_count: usize,
    },
    Directory {
        path: String,
        chunk: Option<usize>,
    },
    Module {
        name: String,
        directories: Vec<String>,
    },
    Root {
        name: String,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub level: Level,
    pub label: String,
    /// Ordered child ids.
    pub children: Vec<String>,
    /// Hash of the node's own content: unit text, file bytes, or identity
    /// for aggregate nodes.
    pub content_hash: String,
    pub cache_key: Option<String>,
    pub status: NodeStatus,
    pub summary: Option<String>,
    pub partial: bool,
    pub failure: Option<String>,
    pub source: Option<NodeSource>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub payload: NodePayload,
}

impl Node {
    fn new(
        id: String,
        level: Level,
        label: String,
        children: Vec<String>,
        content_hash: String,
        payload: NodePayload,
    ) -> Self {
        Self {
            id,
            level,
            label,
            children,
            content_hash,
            cache_key: None,
            status: NodeStatus::Pending,
            summary: None,
            partial: false,
            failure: None,
            source: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            payload,
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self.payload, NodePayload::Directory { chunk: Some(_), .. })
    }
}

pub fn unit_id(unit: &SourceUnit) -> String {
    format!("unit:{}::{}#{}", unit.path, unit.symbol, unit.ordinal)
}

pub fn file_id(path: &str) -> String {
    format!("file:{path}")
}

pub fn dir_id(path: &str) -> String {
    format!("dir:{path}")
}

pub fn chunk_id(path: &str, index: usize) -> String {
    format!("dir:{path}#chunk-{index}")
}

pub fn module_id(name: &str) -> String {
    format!("module:{name}")
}

pub const ROOT_ID: &str = "root";

/// Directory part of a repository-relative path; `.` for top-level files.
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".")
}

/// A file carried over from a prior run without re-extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedFile {
    pub path: String,
    pub language: String,
    pub content_hash: String,
    pub unit_count: usize,
    pub summary: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("nothing to summarize: no files")]
    Empty,
    #[error("node {node} references missing child {child}")]
    MissingChild { node: String, child: String },
    #[error("node {node} at {level:?} depends on {child} at {child_level:?}")]
    BadLayering {
        node: String,
        level: Level,
        child: String,
        child_level: Level,
    },
    #[error("cycle through {0}")]
    Cycle(String),
    #[error("duplicate node id {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone)]
pub struct SummaryGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl SummaryGraph {
    /// Build the graph for `files` (extracted) and `pinned` (carried over).
    pub fn build(
        repo_name: &str,
        files: &[SourceFile],
        pinned: &[PinnedFile],
        config: &EngineConfig,
    ) -> Result<Self, GraphError> {
        if files.is_empty() && pinned.is_empty() {
            return Err(GraphError::Empty);
        }
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        };

        // dir path -> sorted file paths
        let mut dirs: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for file in files {
            let mut unit_ids = Vec::with_capacity(file.units.len());
            for unit in &file.units {
                let id = unit_id(unit);
                let label = if unit.ordinal == 0 {
                    unit.symbol.clone()
                } else {
                    format!("{}#{}", unit.symbol, unit.ordinal)
                };
                graph.push(Node::new(
                    id.clone(),
                    Level::Unit,
                    label,
                    Vec::new(),
                    unit.content_hash.clone(),
                    NodePayload::Unit(unit.clone()),
                ))?;
                unit_ids.push(id);
            }
            graph.push(Node::new(
                file_id(&file.path),
                Level::File,
                file.path.clone(),
                unit_ids,
                file.content_hash.clone(),
                NodePayload::File {
                    path: file.path.clone(),
                    language: file.language.clone(),
                    unit_count: file.units.len(),
                },
            ))?;
            dirs.entry(parent_dir(&file.path).to_string())
                .or_default()
                .push(file.path.clone());
        }

        for file in pinned {
            let mut node = Node::new(
                file_id(&file.path),
                Level::File,
                file.path.clone(),
                Vec::new(),
                file.content_hash.clone(),
                NodePayload::File {
                    path: file.path.clone(),
                    language: file.language.clone(),
                    unit_count: file.unit_count,
                },
            );
            node.status = NodeStatus::Done;
            node.source = Some(NodeSource::Pinned);
            node.summary = Some(file.summary.clone());
            graph.push(node)?;
            dirs.entry(parent_dir(&file.path).to_string())
                .or_default()
                .push(file.path.clone());
        }

        for (dir, paths) in dirs.iter_mut() {
            paths.sort();
            let file_ids: Vec<String> = paths.iter().map(|p| file_id(p)).collect();
            let chunks = partition_directory(file_ids.len(), config.directory_chunk_size);
            let children = if chunks.is_empty() {
                file_ids
            } else {
                let total = chunks.len();
                let mut chunk_ids = Vec::with_capacity(total);
                for (i, range) in chunks.into_iter().enumerate() {
                    let id = chunk_id(dir, i);
                    graph.push(Node::new(
                        id.clone(),
                        Level::Directory,
                        format!("{dir} (part {} of {total})", i + 1),
                        file_ids[range].to_vec(),
                        hash_text(&id),
                        NodePayload::Directory {
                            path: dir.clone(),
                            chunk: Some(i),
                        },
                    ))?;
                    chunk_ids.push(id);
                }
                chunk_ids
            };
            let id = dir_id(dir);
            graph.push(Node::new(
                id.clone(),
                Level::Directory,
                dir.clone(),
                children,
                hash_text(&id),
                NodePayload::Directory {
                    path: dir.clone(),
                    chunk: None,
                },
            ))?;
        }

        let dir_paths: Vec<String> = dirs.keys().cloned().collect();
        let mut module_ids = Vec::new();
        for group in cluster_directories(&dir_paths, config.module_cluster_size) {
            let name = group.node_name();
            let id = module_id(&name);
            graph.push(Node::new(
                id.clone(),
                Level::Module,
                name.clone(),
                group.directories.iter().map(|d| dir_id(d)).collect(),
                hash_text(&id),
                NodePayload::Module {
                    name,
                    directories: group.directories.clone(),
                },
            ))?;
            module_ids.push(id);
        }

        graph.push(Node::new(
            ROOT_ID.to_string(),
            Level::Root,
            repo_name.to_string(),
            module_ids,
            hash_text(&format!("{ROOT_ID}:{repo_name}")),
            NodePayload::Root {
                name: repo_name.to_string(),
            },
        ))?;

        graph.validate()?;
        Ok(graph)
    }

    fn push(&mut self, node: Node) -> Result<(), GraphError> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::Duplicate(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    pub fn root(&self) -> Option<&Node> {
        self.get(ROOT_ID)
    }

    pub fn count_at(&self, level: Level) -> usize {
        self.nodes.iter().filter(|n| n.level == level).count()
    }

    /// Every node depends only on the level directly below, except a
    /// chunked directory, whose children are its own chunk sub-nodes.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for child_id in &node.children {
                let child = self.get(child_id).ok_or_else(|| GraphError::MissingChild {
                    node: node.id.clone(),
                    child: child_id.clone(),
                })?;
                let layered = child.level.as_u8() + 1 == node.level.as_u8();
                let chunk_merge =
                    node.level == Level::Directory && !node.is_chunk() && child.is_chunk();
                if !layered && !chunk_merge {
                    return Err(GraphError::BadLayering {
                        node: node.id.clone(),
                        level: node.level,
                        child: child.id.clone(),
                        child_level: child.level,
                    });
                }
            }
        }
        self.depths().map(|_| ())
    }

    /// Dependency depth per node: leaves are 0, everything else is one more
    /// than its deepest child.
    fn depths(&self) -> Result<Vec<usize>, GraphError> {
        const UNSEEN: usize = usize::MAX;
        const VISITING: usize = usize::MAX - 1;
        let mut depth = vec![UNSEEN; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if depth[start] != UNSEEN {
                continue;
            }
            // Iterative post-order walk.
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            depth[start] = VISITING;
            while let Some((idx, next_child)) = stack.pop() {
                let children = &self.nodes[idx].children;
                if next_child < children.len() {
                    stack.push((idx, next_child + 1));
                    let child = self.index[&children[next_child]];
                    match depth[child] {
                        VISITING => return Err(GraphError::Cycle(self.nodes[child].id.clone())),
                        UNSEEN => {
                            depth[child] = VISITING;
                            stack.push((child, 0));
                        }
                        _ => {}
                    }
                } else {
                    depth[idx] = children
                        .iter()
                        .map(|c| depth[self.index[c]] + 1)
                        .max()
                        .unwrap_or(0);
                }
            }
        }
        Ok(depth)
    }

    /// Non-terminal nodes grouped by dependency depth, shallowest first.
    /// Every node in a wave has all its children in earlier waves (or
    /// already terminal).
    pub fn waves(&self) -> Result<Vec<Vec<usize>>, GraphError> {
        let depths = self.depths()?;
        let mut by_depth: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.status.is_terminal() {
                by_depth.entry(depths[idx]).or_default().push(idx);
            }
        }
        Ok(by_depth.into_values().collect())
    }

    /// Summaries of terminal nodes at `level`, keyed by node id.
    pub fn summaries_at(&self, level: Level) -> BTreeMap<String, String> {
        self.nodes
            .iter()
            .filter(|n| n.level == level)
            .filter_map(|n| n.summary.clone().map(|s| (n.id.clone(), s)))
            .collect()
    }
}
