//! Line-boundary extractors.
//!
//! A top-level item starts at a column-0 line matching the item pattern and
//! runs until the next item starts. Attribute, decorator and doc-comment
//! lines directly above an item belong to it. Anything before the first item
//! becomes a `<preamble>` unit.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ExtractError, SourceUnit, UnitExtractor, WHOLE_FILE_SYMBOL};

const PREAMBLE_SYMBOL: &str = "<preamble>";

static PYTHON_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:async\s+def|def|class)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Invalid python item regex")
});
static PYTHON_TRIVIA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:@|#)").expect("Invalid python trivia regex"));

static RUST_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"^(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|unsafe|const|extern(?:\s+"[^"]*")?)\s+)*"#,
        r#"(?:fn|struct|enum|trait|mod|type|static|const|union)\s+([A-Za-z_][A-Za-z0-9_]*)"#,
        r"|^(?:unsafe\s+)?(impl\b[^{;]*)",
        r"|^macro_rules!\s*([A-Za-z_][A-Za-z0-9_]*)",
    ))
    .expect("Invalid rust item regex")
});
static RUST_TRIVIA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:#\[|///)").expect("Invalid rust trivia regex"));

pub struct BoundaryExtractor {
    language: &'static str,
    item: &'static Lazy<Regex>,
    trivia: &'static Lazy<Regex>,
}

impl BoundaryExtractor {
    pub fn python() -> Self {
        Self {
            language: "python",
            item: &PYTHON_ITEM,
            trivia: &PYTHON_TRIVIA,
        }
    }

    pub fn rust() -> Self {
        Self {
            language: "rust",
            item: &RUST_ITEM,
            trivia: &RUST_TRIVIA,
        }
    }

    fn item_name(&self, line: &str) -> Option<String> {
        let caps = self.item.captures(line)?;
        let raw = caps.iter().skip(1).flatten().next()?.as_str();
        let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        (!name.is_empty()).then_some(name)
    }
}

impl UnitExtractor for BoundaryExtractor {
    fn language(&self) -> &'static str {
        self.language
    }

    fn extract(&self, path: &str, source: &str) -> Result<Vec<SourceUnit>, ExtractError> {
        let lines: Vec<&str> = source.lines().collect();

        // (first line, symbol) for every item, trivia included.
        let mut starts: Vec<(usize, String)> = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            let Some(name) = self.item_name(line) else {
                continue;
            };
            let floor = starts.last().map(|(s, _)| *s + 1).unwrap_or(0);
            let mut start = idx;
            while start > floor && self.trivia.is_match(lines[start - 1]) {
                start -= 1;
            }
            starts.push((start, name));
        }
        if starts.is_empty() {
            return Ok(Vec::new());
        }

        let mut spans: Vec<(usize, usize, String)> = Vec::new();
        let first = starts[0].0;
        if lines[..first].iter().any(|l| !l.trim().is_empty()) {
            spans.push((0, first, PREAMBLE_SYMBOL.to_string()));
        }
        for (i, (start, name)) in starts.iter().enumerate() {
            let end = starts.get(i + 1).map(|(s, _)| *s).unwrap_or(lines.len());
            spans.push((*start, end, name.clone()));
        }

        let mut ordinals: HashMap<String, usize> = HashMap::new();
        let mut units = Vec::with_capacity(spans.len());
        for (start, mut end, symbol) in spans {
            while end > start + 1 && lines[end - 1].trim().is_empty() {
                end -= 1;
            }
            let ordinal = ordinals.entry(symbol.clone()).or_insert(0);
            units.push(SourceUnit::new(
                path,
                symbol,
                *ordinal,
                (start + 1, end),
                self.language,
                lines[start..end].join("\n"),
            ));
            *ordinal += 1;
        }
        Ok(units)
    }
}

/// One unit per file.
pub struct WholeFileExtractor {
    language: &'static str,
}

impl WholeFileExtractor {
    pub fn new(language: &'static str) -> Self {
        Self { language }
    }

    pub(crate) fn units(&self, path: &str, source: &str) -> Vec<SourceUnit> {
        let line_count = source.lines().count().max(1);
        vec![SourceUnit::new(
            path,
            WHOLE_FILE_SYMBOL,
            0,
            (1, line_count),
            self.language,
            source,
        )]
    }
}

impl UnitExtractor for WholeFileExtractor {
    fn language(&self) -> &'static str {
        self.language
    }

    fn extract(&self, path: &str, source: &str) -> Result<Vec<SourceUnit>, ExtractError> {
        Ok(self.units(path, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_items_with_decorators() {
        let src = "import os\n\n@cache\ndef load(p):\n    return p\n\n\nclass Store:\n    def get(self):\n        pass\n";
        let units = BoundaryExtractor::python().extract("app/io.py", src).unwrap();
        let symbols: Vec<&str> = units.iter().map(|u| u.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["<preamble>", "load", "Store"]);
        assert!(units[1].text.starts_with("@cache"));
        assert_eq!((units[1].start_line, units[1].end_line), (3, 5));
        assert!(units[2].text.contains("def get"));
    }

    #[test]
    fn rust_items_and_repeated_symbols() {
        let src = "use std::fmt;\n\n/// A point.\n#[derive(Debug)]\npub struct Point;\n\nimpl Point {\n    fn x() {}\n}\n\nimpl Point {\n}\n\npub(crate) async fn run() {}\n";
        let units = BoundaryExtractor::rust().extract("src/p.rs", src).unwrap();
        let ids: Vec<(String, usize)> = units.iter().map(|u| (u.symbol.clone(), u.ordinal)).collect();
        assert_eq!(
            ids,
            vec![
                ("<preamble>".to_string(), 0),
                ("Point".to_string(), 0),
                ("impl Point".to_string(), 0),
                ("impl Point".to_string(), 1),
                ("run".to_string(), 0),
            ]
        );
        assert!(units[1].text.starts_with("/// A point."));
    }

    #[test]
    fn no_items_yields_nothing() {
        let units = BoundaryExtractor::python().extract("x.py", "print('hi')\n").unwrap();
        assert!(units.is_empty());
    }
}
