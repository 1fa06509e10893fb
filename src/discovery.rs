//! Document Discovery
//!
//! Recursively scans a content directory for Markdown/MDX files and reads them
//! into [`SourceDocument`]s for a build pass.

#[cfg(feature = "napi")]
use napi_derive::napi;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

use crate::cache::compute_digest;

pub const DEFAULT_EXTENSIONS: [&str; 2] = ["md", "mdx"];

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE DOCUMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// One document as read for a build pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub id: String,
    pub source: String,
    /// Supplied by the host when it already hashed the content. It then
    /// stands in for the source text in every stage digest.
    pub digest: Option<String>,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Stage digest under `fingerprint`.
    pub fn digest_with(&self, fingerprint: &str) -> String {
        compute_digest(self.digest.as_deref().unwrap_or(&self.source), fingerprint)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

/// Read every file under `root` with one of `extensions`. Ids are paths
/// relative to `root` with `/` separators; the result is sorted by id.
/// Unreadable entries are skipped with a warning.
pub fn discover_documents(root: &Path, extensions: &[&str]) -> Vec<SourceDocument> {
    let mut documents = Vec::new();
    if !root.exists() {
        return documents;
    }

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !has_extension(path, extensions) {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        match fs::read_to_string(path) {
            Ok(source) => documents.push(SourceDocument::new(id, source)),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read document"),
        }
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    documents
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn discover_documents_native(root: String, extensions: Option<Vec<String>>) -> Vec<SourceDocument> {
    let extensions = extensions.unwrap_or_else(|| DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect());
    let refs: Vec<&str> = extensions.iter().map(String::as_str).collect();
    discover_documents(Path::new(&root), &refs)
}
