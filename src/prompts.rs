//! Prompt templates for each summarization layer.
//!
//! Templates are compile-time constants. A `PromptSet` captures the full set
//! used by one engine instance; its hash is part of every run fingerprint and
//! each template's own hash is part of every cache key at its layer.

use std::collections::BTreeMap;

use crate::engine::graph::Level;
use crate::extract::SourceUnit;
use crate::gateway::Message;
use crate::hashing::hash_fields;
use crate::manifest::ManifestDiff;

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for a model call. Child summaries travel separately
/// as context entries.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with `{name}` placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Content hash of the template text; changes whenever wording changes.
    pub fn hash(&self) -> String {
        hash_fields(&[self.slug, self.system, self.user])
    }

    /// Substitute placeholders. Values are XML-escaped.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        let mut system = self.system.to_string();
        let mut user = self.user.to_string();
        for (name, value) in vars {
            let placeholder = format!("{{{name}}}");
            let safe = escape_xml_chars(value);
            system = system.replace(&placeholder, &safe);
            user = user.replace(&placeholder, &safe);
        }
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const UNIT_V1: PromptTemplate = PromptTemplate {
    slug: "unit_v1",
    system: r#"You summarize one fragment of source code for an engineer who has not read it. Describe what it does, its inputs and outputs, and any side effects. Two to four sentences. No code blocks."#,
    user: r#"<path>{path}</path>
<symbol>{symbol}</symbol>
<language>{language}</language>
<code>
{code}
</code>"#,
};

pub const UNIT_BATCH_V1: PromptTemplate = PromptTemplate {
    slug: "unit_batch_v1",
    system: r#"You summarize several fragments of source code from the same file. For every fragment, describe what it does in two to four sentences. Answer with one section per fragment, each starting with its marker line exactly as given (for example `=== U1 ===`). Do not add other text."#,
    user: r#"<path>{path}</path>
<language>{language}</language>

{fragments}"#,
};

pub const FILE_V1: PromptTemplate = PromptTemplate {
    slug: "file_v1",
    system: r#"You summarize a source file from the summaries of its parts. State the file's responsibility, its main entry points, and how the parts relate. One short paragraph. If some parts are marked unavailable, summarize what is known and say which parts are missing."#,
    user: r#"<path>{path}</path>
<language>{language}</language>
<unit_count>{unit_count}</unit_count>

Summarize this file from the unit summaries in the context."#,
};

pub const DIRECTORY_V1: PromptTemplate = PromptTemplate {
    slug: "directory_v1",
    system: r#"You summarize a directory of a code repository from summaries of its members. State what the directory is for, its key files, and how they collaborate. One paragraph. If some members are marked unavailable, say so."#,
    user: r#"<directory>{name}</directory>
<members>{members}</members>

Summarize this directory from the member summaries in the context."#,
};

pub const MODULE_V1: PromptTemplate = PromptTemplate {
    slug: "module_v1",
    system: r#"You summarize a module of a code repository, a group of related directories, from their summaries. Explain the module's role in the system, its main abstractions, and its boundaries. One or two paragraphs. If some directories are marked unavailable, say so."#,
    user: r#"<module>{name}</module>
<directories>{members}</directories>

Summarize this module from the directory summaries in the context."#,
};

pub const ROOT_V1: PromptTemplate = PromptTemplate {
    slug: "root_v1",
    system: r#"You write the top-level overview of a code repository from summaries of its modules. Cover the purpose of the system, its architecture, the main data flow, and where a newcomer should start reading. Three to five paragraphs. If some modules are marked unavailable, say so."#,
    user: r#"<repository>{name}</repository>
<modules>{members}</modules>

Write the repository overview from the module summaries in the context."#,
};

pub const ROOT_GATHER_V1: PromptTemplate = PromptTemplate {
    slug: "root_gather_v1",
    system: r#"You are preparing to write the overview of a large code repository. You see a one-line outline of every module and the full summaries of modules already expanded. Decide which additional modules you need in full. Answer only with lines of the form `EXPAND: <module label>`, or the single word `READY` when you have enough."#,
    user: r#"<repository>{name}</repository>
<outline>
{outline}
</outline>
<expanded>{expanded}</expanded>

Which modules should be expanded next?"#,
};

pub const DIFF_DIGEST_V1: PromptTemplate = PromptTemplate {
    slug: "diff_digest_v1",
    system: r#"You explain how a code repository changed between two summarization runs. Use the previous and current overviews and the list of changed files. Lead with the most significant change. One or two paragraphs, then a short bullet list of notable files."#,
    user: r#"Previous run: {old_run_id}
Current run: {new_run_id}

<previous_overview>
{old_summary}
</previous_overview>

<current_overview>
{new_summary}
</current_overview>

<changes>
{changes}
</changes>"#,
};

/// The templates one engine instance uses, one per layer plus the batch,
/// root-gathering and digest variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub unit: PromptTemplate,
    pub unit_batch: PromptTemplate,
    pub file: PromptTemplate,
    pub directory: PromptTemplate,
    pub module: PromptTemplate,
    pub root: PromptTemplate,
    pub root_gather: PromptTemplate,
    pub diff_digest: PromptTemplate,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::current()
    }
}

impl PromptSet {
    pub fn current() -> Self {
        Self {
            unit: UNIT_V1,
            unit_batch: UNIT_BATCH_V1,
            file: FILE_V1,
            directory: DIRECTORY_V1,
            module: MODULE_V1,
            root: ROOT_V1,
            root_gather: ROOT_GATHER_V1,
            diff_digest: DIFF_DIGEST_V1,
        }
    }

    /// Template whose slug and hash enter the cache key at `level`.
    pub fn for_level(&self, level: Level) -> &PromptTemplate {
        match level {
            Level::Unit => &self.unit,
            Level::File => &self.file,
            Level::Directory => &self.directory,
            Level::Module => &self.module,
            Level::Root => &self.root,
        }
    }

    pub fn hash(&self) -> String {
        let hashes = [
            self.unit.hash(),
            self.unit_batch.hash(),
            self.file.hash(),
            self.directory.hash(),
            self.module.hash(),
            self.root.hash(),
            self.root_gather.hash(),
            self.diff_digest.hash(),
        ];
        let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();
        hash_fields(&refs)
    }

    pub fn render_unit(&self, unit: &SourceUnit) -> PromptInstance {
        self.unit.render(&[
            ("path", &unit.path),
            ("symbol", &unit.symbol),
            ("language", &unit.language),
            ("code", &unit.text),
        ])
    }

    /// Several units from one file in a single prompt, delimited by
    /// `=== U<n> ===` markers (1-based).
    pub fn render_unit_batch(&self, units: &[&SourceUnit]) -> PromptInstance {
        let (path, language) = units
            .first()
            .map(|u| (u.path.as_str(), u.language.as_str()))
            .unwrap_or(("", ""));
        let fragments = units
            .iter()
            .enumerate()
            .map(|(idx, unit)| {
                format!(
                    "{}\n<symbol>{}</symbol>\n<code>\n{}\n</code>",
                    batch_marker(idx + 1),
                    escape_xml_chars(&unit.symbol),
                    escape_xml_chars(&unit.text)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        // Fragments are pre-escaped; substituting them through `render` would
        // escape their tags too.
        let mut prompt = self
            .unit_batch
            .render(&[("path", path), ("language", language)]);
        prompt.user = prompt.user.replace("{fragments}", &fragments);
        prompt
    }

    pub fn render_file(&self, path: &str, language: &str, unit_count: usize) -> PromptInstance {
        self.file.render(&[
            ("path", path),
            ("language", language),
            ("unit_count", &unit_count.to_string()),
        ])
    }

    pub fn render_group(&self, level: Level, name: &str, members: &[String]) -> PromptInstance {
        let members = members.join(", ");
        self.for_level(level)
            .render(&[("name", name), ("members", &members)])
    }

    pub fn render_root_gather(
        &self,
        name: &str,
        outline: &[(String, String)],
        expanded: &[String],
    ) -> PromptInstance {
        let outline = outline
            .iter()
            .map(|(label, line)| format!("- {label}: {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        let expanded = if expanded.is_empty() {
            "none".to_string()
        } else {
            expanded.join(", ")
        };
        self.root_gather.render(&[
            ("name", name),
            ("outline", &outline),
            ("expanded", &expanded),
        ])
    }

    pub fn render_diff_digest(
        &self,
        old_run_id: Option<&str>,
        new_run_id: &str,
        old_summary: Option<&str>,
        new_summary: &str,
        diff: &ManifestDiff,
    ) -> PromptInstance {
        let mut changes = Vec::new();
        for path in &diff.added {
            changes.push(format!("+ {path}"));
        }
        for path in &diff.deleted {
            changes.push(format!("- {path}"));
        }
        for modified in &diff.modified {
            changes.push(format!(
                "~ {} (units {:+})",
                modified.path, modified.unit_count_delta
            ));
        }
        if changes.is_empty() {
            changes.push("no file changes".to_string());
        }
        self.diff_digest.render(&[
            ("old_run_id", old_run_id.unwrap_or("none")),
            ("new_run_id", new_run_id),
            ("old_summary", old_summary.unwrap_or("(no previous run)")),
            ("new_summary", new_summary),
            ("changes", &changes.join("\n")),
        ])
    }
}

// =============================================================================
// Response parsing
// =============================================================================

pub fn batch_marker(index: usize) -> String {
    format!("=== U{index} ===")
}

/// Split a batched response on `=== U<n> ===` markers. Keys are the 1-based
/// unit indices; sections with empty bodies or indices beyond `expected` are
/// dropped.
pub fn parse_batch_response(text: &str, expected: usize) -> BTreeMap<usize, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<usize> = None;
    let mut body = String::new();

    let mut flush = |current: Option<usize>, body: &mut String| {
        if let Some(idx) = current {
            let trimmed = body.trim();
            if !trimmed.is_empty() && (1..=expected).contains(&idx) {
                sections.entry(idx).or_insert_with(|| trimmed.to_string());
            }
        }
        body.clear();
    };

    for line in text.lines() {
        if let Some(idx) = parse_marker(line) {
            flush(current, &mut body);
            current = Some(idx);
        } else if current.is_some() {
            body.push_str(line);
            body.push('\n');
        }
    }
    flush(current, &mut body);
    sections
}

fn parse_marker(line: &str) -> Option<usize> {
    let inner = line
        .trim()
        .strip_prefix("===")?
        .strip_suffix("===")?
        .trim();
    inner.strip_prefix('U')?.trim().parse().ok()
}

/// Reply to a root gathering prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatherReply {
    Ready,
    Expand(Vec<String>),
}

/// `EXPAND: <label>` lines request modules; `READY` (or a reply with no
/// requests) ends gathering.
pub fn parse_expand_requests(text: &str) -> GatherReply {
    let mut labels = Vec::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*']).trim();
        if let Some(rest) = line
            .strip_prefix("EXPAND:")
            .or_else(|| line.strip_prefix("expand:"))
        {
            let label = rest.trim().trim_matches('`').trim();
            if !label.is_empty() && !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
    }
    if labels.is_empty() {
        GatherReply::Ready
    } else {
        GatherReply::Expand(labels)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_escapes_values() {
        let p = DIRECTORY_V1.render(&[("name", "src/<evil>"), ("members", "a.rs")]);
        assert!(p.user.contains("src/&lt;evil&gt;"));
        assert!(!p.user.contains("<evil>"));
        assert_eq!(p.template_slug, "directory_v1");
    }

    #[test]
    fn prompt_set_hash_tracks_template_text() {
        let current = PromptSet::current();
        let mut changed = PromptSet::current();
        changed.file = PromptTemplate {
            slug: "file_v1",
            system: "different wording",
            user: FILE_V1.user,
        };
        assert_eq!(current.hash(), PromptSet::current().hash());
        assert_ne!(current.hash(), changed.hash());
        assert_ne!(current.file.hash(), changed.file.hash());
    }

    #[test]
    fn batch_response_parsing() {
        let text = "=== U1 ===\nParses input.\n\n=== U2 ===\n\n=== U3 ===\nWrites output.\n=== U9 ===\nstray";
        let parsed = parse_batch_response(text, 3);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&1], "Parses input.");
        assert_eq!(parsed[&3], "Writes output.");
        assert!(!parsed.contains_key(&2));
    }

    #[test]
    fn expand_requests() {
        assert_eq!(parse_expand_requests("READY"), GatherReply::Ready);
        assert_eq!(
            parse_expand_requests("EXPAND: core\n- EXPAND: `api`\nEXPAND: core"),
            GatherReply::Expand(vec!["core".into(), "api".into()])
        );
    }
}
