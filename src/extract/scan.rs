//! Repository walking.

use std::path::Path;

use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;

use super::{ExtractError, ExtractorRegistry};
use crate::config::ScanConfig;

/// Paths found by a scan plus entries the walk could not read.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Repository-relative, sorted, `/`-separated.
    pub paths: Vec<String>,
    pub warnings: Vec<String>,
}

/// Every file an extractor is registered for, minus ignored and oversized
/// files. `.gitignore` files inside the repository are honored.
pub fn scan_repository(
    repo_root: &Path,
    config: &ScanConfig,
    registry: &ExtractorRegistry,
) -> Result<ScanOutcome, ExtractError> {
    let overrides = ignore_overrides(repo_root, &config.ignore)?;

    let mut builder = WalkBuilder::new(repo_root);
    builder
        .hidden(false)
        .parents(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .require_git(false)
        .overrides(overrides);

    let mut out = ScanOutcome::default();
    for result in builder.build() {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read repository entry");
                out.warnings.push(format!("scan: {e}"));
                continue;
            }
        };
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let Some(rel) = relative_path(repo_root, entry.path()) else {
            continue;
        };
        if !registry.supports(&rel) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) if meta.len() > config.max_file_bytes => {
                tracing::debug!(path = %rel, size = meta.len(), "skipping oversized file");
            }
            Ok(_) => out.paths.push(rel),
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "skipping file without metadata");
                out.warnings.push(format!("skipped {rel}: {e}"));
            }
        }
    }
    out.paths.sort();
    Ok(out)
}

/// Each configured pattern becomes a gitignore-style exclusion, so a bare
/// name like `target` prunes that directory at every depth.
fn ignore_overrides(repo_root: &Path, patterns: &[String]) -> Result<Override, ExtractError> {
    let mut builder = OverrideBuilder::new(repo_root);
    for pat in patterns {
        builder
            .add(&format!("!{pat}"))
            .map_err(|e| ExtractError::Pattern {
                pattern: pat.clone(),
                message: e.to_string(),
            })?;
    }
    builder.build().map_err(|e| ExtractError::Pattern {
        pattern: patterns.join(","),
        message: e.to_string(),
    })
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_filters_ignored_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::create_dir_all(root.join("src/target")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        std::fs::write(root.join("src/nested/b.py"), "def b():\n    pass\n").unwrap();
        std::fs::write(root.join("src/notes.txt"), "hi").unwrap();
        std::fs::write(root.join("target/debug/gen.rs"), "fn x() {}").unwrap();
        std::fs::write(root.join("src/target/gen.rs"), "fn y() {}").unwrap();

        let config = ScanConfig::default();
        let scan = scan_repository(root, &config, &ExtractorRegistry::with_defaults()).unwrap();
        assert_eq!(scan.paths, vec!["src/lib.rs".to_string(), "src/nested/b.py".to_string()]);
        assert!(scan.warnings.is_empty());
    }

    #[test]
    fn scan_honors_gitignore_and_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("gen")).unwrap();
        std::fs::write(root.join(".gitignore"), "gen/\n").unwrap();
        std::fs::write(root.join("gen/out.py"), "def g():\n    pass\n").unwrap();
        std::fs::write(root.join("big.py"), "x = 1\n".repeat(100)).unwrap();
        std::fs::write(root.join("small.py"), "x = 1\n").unwrap();

        let config = ScanConfig {
            max_file_bytes: 64,
            ..ScanConfig::default()
        };
        let scan = scan_repository(root, &config, &ExtractorRegistry::with_defaults()).unwrap();
        assert_eq!(scan.paths, vec!["small.py".to_string()]);
    }

    #[test]
    fn invalid_ignore_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig {
            ignore: vec!["src/[".to_string()],
            ..ScanConfig::default()
        };
        let err = scan_repository(dir.path(), &config, &ExtractorRegistry::with_defaults())
            .unwrap_err();
        assert!(matches!(err, ExtractError::Pattern { .. }));
    }
}
