//! Splitting source files into summarizable units.
//!
//! Extractors are registered per file extension in an `ExtractorRegistry`;
//! the engine never branches on language. Extraction is synchronous and a
//! pure function of the file's bytes.

mod boundary;
mod scan;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hashing::{hash_bytes, hash_text};

pub use boundary::{BoundaryExtractor, WholeFileExtractor};
pub use scan::{scan_repository, ScanOutcome};

/// Symbol used for units that cover a whole file.
pub const WHOLE_FILE_SYMBOL: &str = "<file>";

/// One summarizable fragment of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Repository-relative path with `/` separators.
    pub path: String,
    pub symbol: String,
    /// Disambiguates repeated symbols within one file (0-based).
    pub ordinal: usize,
    /// 1-based inclusive line range.
    pub start_line: usize,
    pub end_line: usize,
    pub language: String,
    pub text: String,
    pub content_hash: String,
}

impl SourceUnit {
    pub fn new(
        path: impl Into<String>,
        symbol: impl Into<String>,
        ordinal: usize,
        lines: (usize, usize),
        language: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            path: path.into(),
            symbol: symbol.into(),
            ordinal,
            start_line: lines.0,
            end_line: lines.1,
            language: language.into(),
            content_hash: hash_text(&text),
            text,
        }
    }

    pub fn is_whole_file(&self) -> bool {
        self.symbol == WHOLE_FILE_SYMBOL
    }
}

/// A file and its ordered units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub language: String,
    /// Hash of the raw file bytes.
    pub content_hash: String,
    pub units: Vec<SourceUnit>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not valid UTF-8")]
    NotUtf8 { path: String },
    #[error("no extractor registered for {path}")]
    Unsupported { path: String },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid ignore pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },
}

pub trait UnitExtractor: Send + Sync {
    fn language(&self) -> &'static str;

    /// Ordered units for `source`. `path` is repository-relative.
    fn extract(&self, path: &str, source: &str) -> Result<Vec<SourceUnit>, ExtractError>;
}

/// Extension → extractor table.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_extension: HashMap<String, Arc<dyn UnitExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Python and Rust get symbol-level extraction; other common source
    /// languages are summarized whole-file.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("py", Arc::new(BoundaryExtractor::python()));
        registry.register("rs", Arc::new(BoundaryExtractor::rust()));
        for (ext, language) in [
            ("js", "javascript"),
            ("jsx", "javascript"),
            ("ts", "typescript"),
            ("tsx", "typescript"),
            ("go", "go"),
            ("java", "java"),
            ("kt", "kotlin"),
            ("swift", "swift"),
            ("c", "c"),
            ("h", "c"),
            ("cc", "cpp"),
            ("cpp", "cpp"),
            ("hpp", "cpp"),
            ("cs", "csharp"),
            ("rb", "ruby"),
            ("php", "php"),
            ("scala", "scala"),
            ("lua", "lua"),
            ("sh", "shell"),
        ] {
            registry.register(ext, Arc::new(WholeFileExtractor::new(language)));
        }
        registry
    }

    pub fn register(&mut self, extension: &str, extractor: Arc<dyn UnitExtractor>) {
        self.by_extension
            .insert(extension.trim_start_matches('.').to_ascii_lowercase(), extractor);
    }

    pub fn lookup(&self, path: &str) -> Option<&Arc<dyn UnitExtractor>> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext)
    }

    pub fn supports(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Extract one file from already-read bytes. An extractor failure or
    /// invalid UTF-8 falls back to a single whole-file unit and is reported
    /// as the second element. The content hash always covers the raw bytes.
    pub fn extract_source(
        &self,
        path: &str,
        bytes: &[u8],
    ) -> Result<(SourceFile, Option<ExtractError>), ExtractError> {
        let extractor = self.lookup(path).ok_or_else(|| ExtractError::Unsupported {
            path: path.to_string(),
        })?;
        let language = extractor.language();

        let (units, degraded) = match std::str::from_utf8(bytes) {
            Ok(source) => match extractor.extract(path, source) {
                Ok(units) if !units.is_empty() => (units, None),
                Ok(_) => (WholeFileExtractor::new(language).units(path, source), None),
                Err(err) => {
                    tracing::warn!(path, error = %err, "extraction failed, using whole file");
                    (WholeFileExtractor::new(language).units(path, source), Some(err))
                }
            },
            Err(_) => {
                let err = ExtractError::NotUtf8 {
                    path: path.to_string(),
                };
                tracing::warn!(path, error = %err, "decoding lossily, using whole file");
                let source = String::from_utf8_lossy(bytes);
                (WholeFileExtractor::new(language).units(path, &source), Some(err))
            }
        };

        Ok((
            SourceFile {
                path: path.to_string(),
                language: language.to_string(),
                content_hash: hash_bytes(bytes),
                units,
            },
            degraded,
        ))
    }
}

/// Files extracted from a repository plus the problems met on the way.
#[derive(Debug, Default)]
pub struct Extraction {
    pub files: Vec<SourceFile>,
    pub warnings: Vec<String>,
}

/// Read and extract `paths` (repository-relative) under `repo_root`.
/// Unreadable files are skipped with a warning; the run continues.
pub fn extract_repository(
    repo_root: &Path,
    paths: &[String],
    registry: &ExtractorRegistry,
) -> Extraction {
    let mut out = Extraction::default();
    for path in paths {
        let bytes = match std::fs::read(repo_root.join(path)) {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = ExtractError::Io {
                    path: path.clone(),
                    source,
                };
                tracing::warn!(path = %path, error = %err, "skipping unreadable file");
                out.warnings.push(format!("skipped {path}: {err}"));
                continue;
            }
        };
        match registry.extract_source(path, &bytes) {
            Ok((file, degraded)) => {
                if let Some(err) = degraded {
                    out.warnings
                        .push(format!("{path}: {err}; summarized as a whole file"));
                }
                out.files.push(file);
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "skipping file");
                out.warnings.push(format!("skipped {path}: {err}"));
            }
        }
    }
    out.files.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_by_extension() {
        let registry = ExtractorRegistry::with_defaults();
        assert_eq!(registry.lookup("src/lib.rs").map(|e| e.language()), Some("rust"));
        assert_eq!(registry.lookup("app/Main.PY").map(|e| e.language()), Some("python"));
        assert!(registry.supports("web/index.ts"));
        assert!(!registry.supports("notes.txt"));
        assert!(!registry.supports("Makefile"));
    }

    #[test]
    fn content_hash_is_a_function_of_bytes() {
        let registry = ExtractorRegistry::with_defaults();
        let (a, _) = registry.extract_source("a.py", b"def f():\n    return 1\n").unwrap();
        let (b, _) = registry.extract_source("b/c.py", b"def f():\n    return 1\n").unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.units[0].content_hash, b.units[0].content_hash);
    }

    #[test]
    fn non_utf8_falls_back_to_a_lossy_whole_file_unit() {
        let registry = ExtractorRegistry::with_defaults();
        let bytes = b"def caf\xe9():\n    pass\n";
        let (file, degraded) = registry.extract_source("pkg/latin.py", bytes).unwrap();

        assert!(matches!(degraded, Some(ExtractError::NotUtf8 { .. })));
        assert_eq!(file.content_hash, hash_bytes(bytes));
        assert_eq!(file.language, "python");
        assert_eq!(file.units.len(), 1);
        assert!(file.units[0].is_whole_file());
        assert!(file.units[0].text.contains('\u{FFFD}'));
    }

    #[test]
    fn non_utf8_file_stays_in_the_extraction() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.py"), "def ok():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("latin.py"), b"x = '\xe9'\n").unwrap();

        let paths = vec!["latin.py".to_string(), "ok.py".to_string()];
        let extraction =
            extract_repository(dir.path(), &paths, &ExtractorRegistry::with_defaults());
        let extracted: Vec<&str> = extraction.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(extracted, vec!["latin.py", "ok.py"]);
        assert_eq!(extraction.warnings.len(), 1);
        assert!(extraction.warnings[0].contains("summarized as a whole file"));
    }
}
