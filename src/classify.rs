//! Pattern Classifier
//!
//! Decides per document whether the native compiler can take the fast path.
//! The only syntax the native path cannot handle is an import of a module the
//! host has not allow-listed, so classification reduces to: strip frontmatter
//! and (optionally) fenced code, find import statements, and test every
//! specifier against the compiled allow-list.

#[cfg(feature = "napi")]
use napi_derive::napi;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigError;
use crate::scan::{strip_code_fences, strip_frontmatter};

/// Disallowed specifiers listed in a route reason before summarizing.
const REASON_LIST_LIMIT: usize = 3;

lazy_static! {
    /// `import <clause> from '<spec>'` including default, named, namespace and type-only forms.
    static ref IMPORT_FROM_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+(?:type\s+)?[\w$*{}\s,]+?\s+from\s*['"]([^'"\n]+)['"]"#
    )
    .unwrap();

    /// Bare side-effect import: `import '<spec>'`.
    static ref IMPORT_BARE_RE: Regex =
        Regex::new(r#"(?m)^[ \t]*import\s*['"]([^'"\n]+)['"]"#).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct CompilationRoute {
    pub use_fast_path: bool,
    pub has_problematic_patterns: bool,
    pub reason: Option<String>,
    pub disallowed_imports: Vec<String>,
}

impl CompilationRoute {
    pub fn fast_path() -> Self {
        Self {
            use_fast_path: true,
            has_problematic_patterns: false,
            reason: None,
            disallowed_imports: Vec::new(),
        }
    }

    pub fn fallback(reason: String, disallowed_imports: Vec<String>) -> Self {
        Self {
            use_fast_path: false,
            has_problematic_patterns: true,
            reason: Some(reason),
            disallowed_imports,
        }
    }
}

/// Compile allow-list globs. Only `*` is a wildcard; patterns are anchored.
pub fn compile_allow_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns.iter().map(|pattern| compile_allow_pattern(pattern)).collect()
}

fn compile_allow_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(|e| ConfigError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Compiled `allowImports`, built once per build context.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    patterns: Vec<Regex>,
    configured: bool,
}

impl AllowList {
    pub fn compile(patterns: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            patterns: compile_allow_patterns(patterns)?,
            configured: !patterns.is_empty(),
        })
    }

    /// Patterns that fail to compile are dropped and match nothing.
    pub fn lenient(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| compile_allow_pattern(p).ok())
                .collect(),
            configured: !patterns.is_empty(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn allows(&self, specifier: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(specifier))
    }
}

/// Collect import specifiers in order of first appearance.
pub fn find_import_specifiers(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = IMPORT_FROM_RE
        .captures_iter(text)
        .chain(IMPORT_BARE_RE.captures_iter(text))
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str()))
        .collect();
    found.sort_by_key(|(offset, _)| *offset);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|(_, spec)| seen.insert(*spec))
        .map(|(_, spec)| spec.to_string())
        .collect()
}

/// Route a document to the fast or fallback path.
///
/// Never fails: an allow-list pattern that cannot be compiled matches nothing,
/// which errs on the side of the fallback path.
pub fn classify(source: &str, allow_imports: &[String], ignore_code_fences: bool) -> CompilationRoute {
    classify_with(source, &AllowList::lenient(allow_imports), ignore_code_fences)
}

/// [`classify`] against an already compiled allow-list.
pub fn classify_with(source: &str, allow_list: &AllowList, ignore_code_fences: bool) -> CompilationRoute {
    if source.is_empty() {
        return CompilationRoute::fast_path();
    }

    let body = strip_frontmatter(source);
    let scanned;
    let text = if ignore_code_fences {
        scanned = strip_code_fences(body);
        scanned.as_str()
    } else {
        body
    };

    let specifiers = find_import_specifiers(text);
    if specifiers.is_empty() {
        return CompilationRoute::fast_path();
    }

    if !allow_list.is_configured() {
        let reason = format!(
            "Contains imports with no allowImports configured: {}",
            summarize(&specifiers)
        );
        return CompilationRoute::fallback(reason, specifiers);
    }

    let disallowed: Vec<String> = specifiers
        .into_iter()
        .filter(|spec| !allow_list.allows(spec))
        .collect();

    if disallowed.is_empty() {
        CompilationRoute::fast_path()
    } else {
        let reason = format!(
            "Contains imports not in allowImports: {}",
            summarize(&disallowed)
        );
        CompilationRoute::fallback(reason, disallowed)
    }
}

fn summarize(specifiers: &[String]) -> String {
    let shown = specifiers
        .iter()
        .take(REASON_LIST_LIMIT)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if specifiers.len() > REASON_LIST_LIMIT {
        format!("{} (and {} more)", shown, specifiers.len() - REASON_LIST_LIMIT)
    } else {
        shown
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn classify_native(
    source: String,
    allow_imports: Vec<String>,
    ignore_code_fences: Option<bool>,
) -> CompilationRoute {
    classify(&source, &allow_imports, ignore_code_fences.unwrap_or(true))
}
