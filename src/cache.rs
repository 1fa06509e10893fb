//! Multi-Stage Cache
//!
//! Content-addressed memoization for the three expensive stages of the
//! fallback path: frontmatter parsing, fallback compilation and lowering.
//! Artifacts are keyed by a digest of the normalized input plus a fingerprint
//! of the options that affect the stage, so identical input always maps to
//! the same entry and concurrent writers are harmless.
//!
//! A manifest maps each document id to the digest it had at the end of the
//! previous build, per stage. It is what makes the cache useful across build
//! passes: an unchanged digest means the stored artifact can be reused, a
//! changed digest evicts the stale artifact for that document only.
//!
//! All reads are fail-safe. Missing or corrupt files are cache misses.

#[cfg(feature = "napi")]
use napi_derive::napi;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::headings::HeadingRecord;
use crate::lowering::LoweredModule;

/// Name of the manifest file within the cache directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Bump when the on-disk layout of the manifest or artifacts changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheStage {
    Frontmatter,
    Compile,
    Lowering,
}

impl CacheStage {
    pub const ALL: [CacheStage; 3] = [CacheStage::Frontmatter, CacheStage::Compile, CacheStage::Lowering];

    pub fn namespace(self) -> &'static str {
        match self {
            CacheStage::Frontmatter => "frontmatter",
            CacheStage::Compile => "compile",
            CacheStage::Lowering => "lowering",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIGESTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Line endings are normalized so a checkout on another platform hits the
/// same entries.
pub fn normalize_source(source: &str) -> Cow<'_, str> {
    if source.contains('\r') {
        Cow::Owned(source.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(source)
    }
}

/// SHA-256 hex digest of the normalized source and a config fingerprint.
pub fn compute_digest(source: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_source(source).as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARTIFACTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontmatterArtifact {
    pub data: serde_json::Value,
}

/// Fallback compiler output with heading ids, before post-processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    pub code: String,
    pub headings: Vec<HeadingRecord>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANIFEST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub version: u32,
    /// namespace -> document id -> digest
    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for CacheManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManifest {
    pub fn new() -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            namespaces: BTreeMap::new(),
        }
    }

    /// Load the manifest from `cache_dir`. Missing, unreadable, corrupt or
    /// incompatible manifests all yield an empty manifest.
    pub fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join(MANIFEST_FILE);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(_) => return Self::new(),
        };
        match serde_json::from_str::<Self>(&data) {
            Ok(manifest) if manifest.version == CACHE_FORMAT_VERSION => manifest,
            Ok(manifest) => {
                debug!(found = manifest.version, "discarding cache manifest from another format version");
                Self::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache manifest is corrupt, starting from an empty cache");
                Self::new()
            }
        }
    }

    pub fn save(&self, cache_dir: &Path) -> Result<(), CacheError> {
        fs::create_dir_all(cache_dir).map_err(|e| CacheError::Io {
            path: cache_dir.to_path_buf(),
            source: e,
        })?;
        let path = cache_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        fs::write(&path, json).map_err(|e| CacheError::Io { path, source: e })
    }

    pub fn digest_for(&self, stage: CacheStage, id: &str) -> Option<&str> {
        self.namespaces
            .get(stage.namespace())
            .and_then(|ids| ids.get(id))
            .map(String::as_str)
    }

    /// Record `digest` for `id`, returning the digest it replaced.
    pub fn record(&mut self, stage: CacheStage, id: &str, digest: &str) -> Option<String> {
        self.namespaces
            .entry(stage.namespace().to_string())
            .or_default()
            .insert(id.to_string(), digest.to_string())
    }

    fn references(&self, stage: CacheStage, digest: &str) -> bool {
        self.namespaces
            .get(stage.namespace())
            .is_some_and(|ids| ids.values().any(|d| d == digest))
    }

    pub fn remove(&mut self, id: &str) {
        for ids in self.namespaces.values_mut() {
            ids.remove(id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STAGE CACHE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// One stage's digest -> artifact map, optionally mirrored to
/// `<cache_dir>/<namespace>/<digest>.json`.
pub struct StageCache<T> {
    stage: CacheStage,
    entries: RwLock<HashMap<String, T>>,
    dir: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T> StageCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn new(stage: CacheStage, cache_root: Option<&Path>) -> Self {
        Self {
            stage,
            entries: RwLock::new(HashMap::new()),
            dir: cache_root.map(|root| root.join(stage.namespace())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> CacheStage {
        self.stage
    }

    fn artifact_path(&self, digest: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", digest)))
    }

    pub fn get(&self, digest: &str) -> Option<T> {
        let found = self.lookup(digest);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn lookup(&self, digest: &str) -> Option<T> {
        if let Some(hit) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
        {
            return Some(hit.clone());
        }

        let path = self.artifact_path(digest)?;
        let data = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<T>(&data) {
            Ok(artifact) => {
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(digest.to_string(), artifact.clone());
                Some(artifact)
            }
            Err(e) => {
                warn!(stage = self.stage.namespace(), digest, error = %e, "dropping corrupt cache artifact");
                fs::remove_file(&path).ok();
                None
            }
        }
    }

    /// Store an artifact. Identical digests carry identical artifacts, so the
    /// last writer wins without harm.
    pub fn put(&self, digest: &str, artifact: T) -> Result<(), CacheError> {
        if let Some(path) = self.artifact_path(digest) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| CacheError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
            }
            let json = serde_json::to_string(&artifact).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
            fs::write(&path, json).map_err(|e| CacheError::Io { path, source: e })?;
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.to_string(), artifact);
        Ok(())
    }

    /// Return the cached artifact or compute and store it. A failure to
    /// persist is logged; the computed artifact is still returned.
    pub fn get_or_compute<E>(&self, digest: &str, compute: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        if let Some(hit) = self.get(digest) {
            return Ok(hit);
        }
        let artifact = compute()?;
        if let Err(e) = self.put(digest, artifact.clone()) {
            warn!(stage = self.stage.namespace(), error = %e, "failed to persist cache artifact");
        }
        Ok(artifact)
    }

    pub fn evict(&self, digest: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(digest);
        if let Some(path) = self.artifact_path(digest) {
            fs::remove_file(path).ok();
        }
    }

    /// Drop in-memory entries and reset counters. Durable artifacts stay.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILD CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of comparing a document's current digest with the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Freshness {
    New,
    Changed,
    Unchanged,
}

/// Process-wide cache context, opened at build start and saved at build end.
pub struct BuildCache {
    root: Option<PathBuf>,
    manifest: RwLock<CacheManifest>,
    pub frontmatter: StageCache<FrontmatterArtifact>,
    pub compile: StageCache<CompiledArtifact>,
    pub lowering: StageCache<LoweredModule>,
}

impl BuildCache {
    /// Open the cache rooted at `root`; `None` keeps everything in memory.
    pub fn open(root: Option<&Path>) -> Self {
        let manifest = root.map(CacheManifest::load).unwrap_or_default();
        Self {
            root: root.map(Path::to_path_buf),
            manifest: RwLock::new(manifest),
            frontmatter: StageCache::new(CacheStage::Frontmatter, root),
            compile: StageCache::new(CacheStage::Compile, root),
            lowering: StageCache::new(CacheStage::Lowering, root),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(None)
    }

    pub fn freshness(&self, stage: CacheStage, id: &str, digest: &str) -> Freshness {
        match self
            .manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .digest_for(stage, id)
        {
            None => Freshness::New,
            Some(previous) if previous == digest => Freshness::Unchanged,
            Some(_) => Freshness::Changed,
        }
    }

    /// Record the digest `id` has now. If it replaced a different digest that
    /// no other document still uses, that stale artifact is evicted.
    pub fn record(&self, stage: CacheStage, id: &str, digest: &str) {
        let mut manifest = self.manifest.write().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = manifest.record(stage, id, digest) else {
            return;
        };
        if previous == digest || manifest.references(stage, &previous) {
            return;
        }
        drop(manifest);
        debug!(stage = stage.namespace(), id, "digest changed, evicting stale artifact");
        self.evict(stage, &previous);
    }

    fn evict(&self, stage: CacheStage, digest: &str) {
        match stage {
            CacheStage::Frontmatter => self.frontmatter.evict(digest),
            CacheStage::Compile => self.compile.evict(digest),
            CacheStage::Lowering => self.lowering.evict(digest),
        }
    }

    /// Forget a document across every stage (watch-mode deletion or rename).
    pub fn invalidate(&self, id: &str) {
        let mut manifest = self.manifest.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<(CacheStage, String)> = CacheStage::ALL
            .iter()
            .filter_map(|&stage| manifest.digest_for(stage, id).map(|d| (stage, d.to_string())))
            .collect();
        manifest.remove(id);
        let stale: Vec<_> = stale
            .into_iter()
            .filter(|(stage, digest)| !manifest.references(*stage, digest))
            .collect();
        drop(manifest);
        for (stage, digest) in stale {
            self.evict(stage, &digest);
        }
    }

    /// Drop all in-memory state and the manifest contents.
    pub fn clear(&self) {
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = CacheManifest::new();
        self.frontmatter.clear();
        self.compile.clear();
        self.lowering.clear();
    }

    /// Persist the manifest. A memory-only cache has nothing to write.
    pub fn save(&self) -> Result<(), CacheError> {
        match &self.root {
            Some(root) => self
                .manifest
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .save(root),
            None => Ok(()),
        }
    }

    pub fn manifest(&self) -> CacheManifest {
        self.manifest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats(&self) -> BTreeMap<CacheStage, CacheStats> {
        BTreeMap::from([
            (CacheStage::Frontmatter, self.frontmatter.stats()),
            (CacheStage::Compile, self.compile.stats()),
            (CacheStage::Lowering, self.lowering.stats()),
        ])
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn compute_digest_native(source: String, fingerprint: Option<String>) -> String {
    compute_digest(&source, fingerprint.as_deref().unwrap_or(""))
}
