//! Error types for the fallback build pipeline.
//!
//! Most stages degrade instead of failing: the classifier, the directive
//! rewriter and the heading reconciler never return errors, and cache reads
//! turn every failure into a miss. The enums here cover the seams where a
//! failure has to be reported to the caller.

use std::path::PathBuf;

/// Errors raised while loading a [`BuildConfig`](crate::config::BuildConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid build config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid allowImports pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Errors from the multi-stage cache. Only writes surface these; reads are
/// fail-safe.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cache serialization error: {reason}")]
    Serialization { reason: String },
}

/// Errors produced while lowering generated markup into executable code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoweringError {
    /// The markup could not be parsed as a JSX module.
    #[error("failed to parse generated markup: {0}")]
    Parse(String),

    /// Both lowering strategies rejected the module.
    #[error("lowering failed: {0}")]
    Transform(String),

    /// The worker running this job's chunk timed out or died. Sibling jobs in
    /// the same chunk share this error.
    #[error("worker chunk {chunk} failed: {reason}")]
    ChunkFailed { chunk: usize, reason: String },
}

/// An error reported by one of the external compilers.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{compiler} failed for {path}: {message}")]
pub struct ExternalError {
    pub compiler: &'static str,
    pub path: String,
    pub message: String,
}

impl ExternalError {
    pub fn native(path: &str, message: impl Into<String>) -> Self {
        Self {
            compiler: "native compiler",
            path: path.to_string(),
            message: message.into(),
        }
    }

    pub fn fallback(path: &str, message: impl Into<String>) -> Self {
        Self {
            compiler: "fallback compiler",
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Build-level failures. Only these abort a build pass.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The native fast-path compiler failed. This is treated as a whole-process
    /// failure rather than a per-document degradation.
    #[error(transparent)]
    Native(ExternalError),

    #[error("hook '{hook}' failed for {id}: {message}")]
    Hook {
        hook: String,
        id: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_failure_display() {
        let err = LoweringError::ChunkFailed {
            chunk: 3,
            reason: "timed out after 60000ms".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("chunk 3"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn external_error_names_compiler() {
        let err = ExternalError::fallback("docs/a.mdx", "unexpected token");
        assert_eq!(
            err.to_string(),
            "fallback compiler failed for docs/a.mdx: unexpected token"
        );
    }

    #[test]
    fn config_parse_error_wraps_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ConfigError::from(serde_err);
        assert!(err.to_string().starts_with("invalid build config"));
    }

    #[test]
    fn cache_io_error_mentions_path() {
        let err = CacheError::Io {
            path: PathBuf::from("/tmp/cache/manifest.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("manifest.json"));
    }
}
