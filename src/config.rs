//! Build configuration consumed from the host's config layer.
//!
//! The host serializes its resolved options as camelCase JSON. Anything that
//! can change generated output also feeds a fingerprint, so that the cache
//! never serves an artifact compiled under different options.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::compile_allow_patterns;
use crate::error::ConfigError;
use crate::registry::{ComponentLibrary, ComponentRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoweringConfig {
    /// Upper bound on worker units per batch.
    pub max_workers: usize,
    /// Per-chunk deadline.
    pub timeout_ms: u64,
    /// Package providing `jsx-runtime` for lowered modules.
    pub jsx_import_source: String,
    pub source_maps: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            timeout_ms: 60_000,
            jsx_import_source: "react".to_string(),
            source_maps: true,
        }
    }
}

impl LoweringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    /// Glob-style module specifiers the fast path may import.
    pub allow_imports: Vec<String>,
    pub ignore_code_fences: bool,
    /// Enable the built-in `:::note`-style directive set.
    pub default_directives: bool,
    pub component_libraries: Vec<ComponentLibrary>,
    /// Extension appended to convention-based default component imports.
    pub component_extension: String,
    /// Durable cache location; `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    pub lowering: LoweringConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            allow_imports: Vec::new(),
            ignore_code_fences: true,
            default_directives: true,
            component_libraries: Vec::new(),
            component_extension: ".astro".to_string(),
            cache_dir: None,
            lowering: LoweringConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    /// Reject allow-list patterns that cannot be compiled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        compile_allow_patterns(&self.allow_imports).map(|_| ())
    }

    /// Registry built from the configured libraries plus, when enabled and
    /// nothing else declares directives, the built-in directive set.
    pub fn registry(&self) -> ComponentRegistry {
        ComponentRegistry::merge(&self.component_libraries)
            .with_default_directives(self.default_directives)
    }

    /// Fingerprint of everything that changes fallback compile output.
    pub fn compile_fingerprint(&self) -> String {
        fingerprint(&(
            "compile",
            &self.component_libraries,
            self.default_directives,
            &self.component_extension,
        ))
    }

    /// Fingerprint of everything that changes lowered code.
    pub fn lowering_fingerprint(&self) -> String {
        fingerprint(&(
            "lowering",
            &self.lowering.jsx_import_source,
            self.lowering.source_maps,
        ))
    }
}

fn fingerprint<T: Serialize>(value: &T) -> String {
    // Serializing plain data into a Vec cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = BuildConfig::from_json("{}").unwrap();
        assert!(config.ignore_code_fences);
        assert!(config.default_directives);
        assert_eq!(config.lowering.max_workers, 8);
        assert_eq!(config.lowering.timeout(), Duration::from_secs(60));
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let config = BuildConfig::from_json(
            r#"{
                "allowImports": ["@astrojs/*", "./components/*"],
                "ignoreCodeFences": false,
                "cacheDir": ".cache/mdx",
                "lowering": { "maxWorkers": 2, "jsxImportSource": "preact" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.allow_imports.len(), 2);
        assert!(!config.ignore_code_fences);
        assert_eq!(config.cache_dir, Some(PathBuf::from(".cache/mdx")));
        assert_eq!(config.lowering.max_workers, 2);
        assert_eq!(config.lowering.timeout_ms, 60_000);
        assert_eq!(config.lowering.jsx_import_source, "preact");
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            BuildConfig::from_json("{ allowImports: }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_fingerprints_track_relevant_options() {
        let a = BuildConfig::default();
        let mut b = BuildConfig::default();
        b.allow_imports.push("react".to_string());
        assert_eq!(a.compile_fingerprint(), b.compile_fingerprint());

        b.component_extension = ".tsx".to_string();
        assert_ne!(a.compile_fingerprint(), b.compile_fingerprint());
        assert_eq!(a.lowering_fingerprint(), b.lowering_fingerprint());

        b.lowering.jsx_import_source = "preact".to_string();
        assert_ne!(a.lowering_fingerprint(), b.lowering_fingerprint());
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildConfig::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
