//! Build Orchestration
//!
//! A [`BuildContext`] owns everything that lives for a build session: the
//! merged component registry, the multi-stage cache, the lowering executor,
//! source hooks and the two external compilers. It is created at build start,
//! reused across watch-mode passes and saved at build end.
//!
//! Per document: hooks, then classification. Fast-path documents go to the
//! native compiler. Fallback documents go through frontmatter parsing,
//! directive rewriting, import injection, the fallback compiler and
//! heading-id injection, then post-processing, then join one lowering batch.
//! Every fallback stage probes the cache first.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
    compute_digest, BuildCache, CacheStage, CacheStats, CompiledArtifact, Freshness, FrontmatterArtifact,
};
use crate::classify::{classify_with, AllowList, CompilationRoute};
use crate::config::BuildConfig;
use crate::directives::{inject_fallback_imports, rewrite, RewriteOptions};
use crate::discovery::SourceDocument;
use crate::error::{ExternalError, PipelineError};
use crate::headings::{inject_heading_ids, HeadingRecord};
use crate::hooks::HookPipeline;
use crate::lowering::{LoweringExecutor, LoweringJob};
use crate::module::{post_process, ModuleMetadata};
use crate::registry::ComponentRegistry;

const FRONTMATTER_FINGERPRINT: &str = "frontmatter";

// ═══════════════════════════════════════════════════════════════════════════════
// EXTERNAL COMPILERS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOptions {
    pub file: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeOutput {
    pub code: String,
    pub frontmatter: serde_json::Value,
    pub headings: Vec<HeadingRecord>,
    pub imports: Vec<String>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

/// The fast-path compiler.
pub trait NativeCompiler: Send + Sync {
    fn compile(
        &self,
        source: &str,
        file_path: &str,
        options: &CompileOptions,
    ) -> Result<NativeOutput, ExternalError>;

    fn parse_frontmatter(&self, source: &str, file_path: &str) -> Result<serde_json::Value, ExternalError>;

    /// Canonical heading list for a document.
    fn extract_headings(&self, source: &str, file_path: &str) -> Result<Vec<HeadingRecord>, ExternalError>;
}

/// Markdown extensions the fallback compiler is asked to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackPlugin {
    Gfm,
    DirectivePassThrough,
    TaskListNormalization,
    HeadingIds,
}

pub const FALLBACK_PLUGINS: [FallbackPlugin; 4] = [
    FallbackPlugin::Gfm,
    FallbackPlugin::DirectivePassThrough,
    FallbackPlugin::TaskListNormalization,
    FallbackPlugin::HeadingIds,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackOutput {
    pub code: String,
    /// Headings collected by the fallback compiler itself. Used only when the
    /// native extractor is unavailable for a document.
    #[serde(default)]
    pub headings: Vec<HeadingRecord>,
}

/// The embedded fallback markup compiler.
pub trait FallbackCompiler: Send + Sync {
    fn compile(
        &self,
        source: &str,
        file_path: &str,
        plugins: &[FallbackPlugin],
    ) -> Result<FallbackOutput, ExternalError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentStatus {
    Compiled,
    /// Output was produced but lost some richness (e.g. left unlowered).
    Degraded,
    /// No usable output; see diagnostics.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentOutput {
    pub id: String,
    pub route: CompilationRoute,
    pub status: DocumentStatus,
    pub code: String,
    pub map: Option<String>,
    pub frontmatter: serde_json::Value,
    pub headings: Vec<HeadingRecord>,
    /// Fallback documents only: freshness against the previous build pass.
    pub freshness: Option<Freshness>,
    pub diagnostics: Vec<String>,
}

impl DocumentOutput {
    fn new(id: &str, route: CompilationRoute) -> Self {
        Self {
            id: id.to_string(),
            route,
            status: DocumentStatus::Compiled,
            code: String::new(),
            map: None,
            frontmatter: serde_json::Value::Null,
            headings: Vec::new(),
            freshness: None,
            diagnostics: Vec::new(),
        }
    }

    fn fail(mut self, diagnostic: String) -> Self {
        self.status = DocumentStatus::Failed;
        self.diagnostics.push(diagnostic);
        self
    }

    fn degrade(&mut self, diagnostic: String) {
        if self.status == DocumentStatus::Compiled {
            self.status = DocumentStatus::Degraded;
        }
        self.diagnostics.push(diagnostic);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub documents: Vec<DocumentOutput>,
    pub fast_path: usize,
    pub fallback: usize,
    pub failed: usize,
    pub cache: BTreeMap<CacheStage, CacheStats>,
}

impl BuildReport {
    pub fn document(&self, id: &str) -> Option<&DocumentOutput> {
        self.documents.iter().find(|d| d.id == id)
    }
}

/// A document after the per-document stages, before the lowering batch.
enum Prepared {
    Done(DocumentOutput),
    Lower { output: DocumentOutput, digest: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILD CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BuildContext {
    config: BuildConfig,
    registry: ComponentRegistry,
    allow_list: AllowList,
    cache: BuildCache,
    executor: LoweringExecutor,
    hooks: HookPipeline,
    native: Arc<dyn NativeCompiler>,
    fallback: Arc<dyn FallbackCompiler>,
    compile_fingerprint: String,
    lowering_fingerprint: String,
}

impl BuildContext {
    pub fn init(
        config: BuildConfig,
        native: Arc<dyn NativeCompiler>,
        fallback: Arc<dyn FallbackCompiler>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let registry = config.registry();
        let allow_list = AllowList::compile(&config.allow_imports)?;
        let cache = BuildCache::open(config.cache_dir.as_deref());
        let executor = LoweringExecutor::new(config.lowering.clone());
        debug!(
            directives = registry.directive_names().count(),
            parallelism = executor.parallelism(),
            cache_dir = ?config.cache_dir,
            "build context initialized"
        );
        Ok(Self {
            compile_fingerprint: config.compile_fingerprint(),
            lowering_fingerprint: config.lowering_fingerprint(),
            config,
            registry,
            allow_list,
            cache,
            executor,
            hooks: HookPipeline::new(),
            native,
            fallback,
        })
    }

    pub fn with_executor(mut self, executor: LoweringExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn hooks_mut(&mut self) -> &mut HookPipeline {
        &mut self.hooks
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Run one build pass. Only a native compiler failure aborts the pass;
    /// everything else degrades the affected document.
    pub fn build(&self, documents: Vec<SourceDocument>) -> Result<BuildReport, PipelineError> {
        let prepared = documents
            .par_iter()
            .map(|doc| self.prepare(doc))
            .collect::<Result<Vec<_>, PipelineError>>()?;

        let jobs: Vec<LoweringJob> = prepared
            .iter()
            .filter_map(|p| match p {
                Prepared::Lower { output, .. } => Some(LoweringJob::new(&output.id, &output.code)),
                Prepared::Done(_) => None,
            })
            .collect();
        let mut lowered = if jobs.is_empty() {
            HashMap::new()
        } else {
            self.executor.lower(jobs)
        };

        let mut report = BuildReport::default();
        for item in prepared {
            let output = match item {
                Prepared::Done(output) => output,
                Prepared::Lower { mut output, digest } => {
                    match lowered.remove(&output.id) {
                        Some(Ok(module)) => {
                            if let Err(e) = self.cache.lowering.put(&digest, module.clone()) {
                                warn!(document = %output.id, error = %e, "failed to persist lowered module");
                            }
                            self.cache.record(CacheStage::Lowering, &output.id, &digest);
                            output.code = module.code;
                            output.map = module.map;
                        }
                        Some(Err(e)) => output.degrade(format!("left unlowered: {}", e)),
                        None => output.degrade("left unlowered: no lowering result".to_string()),
                    }
                    output
                }
            };

            if output.route.use_fast_path {
                report.fast_path += 1;
            } else {
                report.fallback += 1;
            }
            if output.status == DocumentStatus::Failed {
                report.failed += 1;
            }
            report.documents.push(output);
        }
        report.cache = self.cache.stats();

        info!(
            documents = report.documents.len(),
            fast_path = report.fast_path,
            fallback = report.fallback,
            failed = report.failed,
            "build pass complete"
        );
        Ok(report)
    }

    fn prepare(&self, doc: &SourceDocument) -> Result<Prepared, PipelineError> {
        let source = match self.hooks.run(&doc.id, doc.source.clone()) {
            Ok(source) => source,
            Err(e) => {
                warn!(document = %doc.id, error = %e, "source hook failed");
                let route = classify_with(&doc.source, &self.allow_list, self.config.ignore_code_fences);
                return Ok(Prepared::Done(DocumentOutput::new(&doc.id, route).fail(e.to_string())));
            }
        };

        let route = classify_with(&source, &self.allow_list, self.config.ignore_code_fences);
        debug!(document = %doc.id, fast_path = route.use_fast_path, reason = ?route.reason, "routed");

        if route.use_fast_path {
            return self.compile_fast(&doc.id, &source, route).map(Prepared::Done);
        }
        Ok(self.compile_fallback(doc, &source, route))
    }

    fn compile_fast(&self, id: &str, source: &str, route: CompilationRoute) -> Result<DocumentOutput, PipelineError> {
        let options = CompileOptions {
            file: Some(id.to_string()),
            url: None,
        };
        let native = self
            .native
            .compile(source, id, &options)
            .map_err(PipelineError::Native)?;

        let mut output = DocumentOutput::new(id, route);
        output.code = native.code;
        output.frontmatter = native.frontmatter;
        output.headings = native.headings;
        output.diagnostics = native.diagnostics;
        Ok(output)
    }

    fn compile_fallback(&self, doc: &SourceDocument, source: &str, route: CompilationRoute) -> Prepared {
        let id = doc.id.as_str();
        let mut output = DocumentOutput::new(id, route);

        // The host digest describes the document before hooks ran.
        let stage_doc = if source == doc.source {
            None
        } else {
            Some(SourceDocument::new(id, source))
        };
        let keyed = stage_doc.as_ref().unwrap_or(doc);

        let fm_digest = keyed.digest_with(FRONTMATTER_FINGERPRINT);
        match self.cache.frontmatter.get_or_compute(&fm_digest, || {
            self.native
                .parse_frontmatter(source, id)
                .map(|data| FrontmatterArtifact { data })
        }) {
            Ok(fm) => {
                output.frontmatter = fm.data;
                self.cache.record(CacheStage::Frontmatter, id, &fm_digest);
            }
            Err(e) => {
                warn!(document = %id, error = %e, "frontmatter parse failed");
                output.degrade(e.to_string());
            }
        }

        let compile_digest = keyed.digest_with(&self.compile_fingerprint);
        output.freshness = Some(self.cache.freshness(CacheStage::Compile, id, &compile_digest));
        debug!(document = %id, freshness = ?output.freshness, "fallback compile");

        let compiled = match self
            .cache
            .compile
            .get_or_compute(&compile_digest, || self.run_fallback_compiler(id, source))
        {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!(document = %id, error = %e, "fallback compile failed");
                return Prepared::Done(output.fail(e.to_string()));
            }
        };
        self.cache.record(CacheStage::Compile, id, &compile_digest);

        // The compile artifact is shared by every document with the same
        // content; per-document exports are added after the lookup.
        let metadata = ModuleMetadata {
            frontmatter: output.frontmatter.clone(),
            headings: compiled.headings.clone(),
            file: id.to_string(),
            url: None,
        };
        output.code = post_process(&compiled.code, &metadata);
        output.headings = compiled.headings;

        let lowering_digest = compute_digest(&output.code, &self.lowering_fingerprint);
        if let Some(module) = self.cache.lowering.get(&lowering_digest) {
            self.cache.record(CacheStage::Lowering, id, &lowering_digest);
            output.code = module.code;
            output.map = module.map;
            return Prepared::Done(output);
        }
        Prepared::Lower {
            output,
            digest: lowering_digest,
        }
    }

    /// Rewrite, compile and inject heading ids. The result depends only on
    /// the source and the compile options, never on the document id.
    fn run_fallback_compiler(&self, id: &str, source: &str) -> Result<CompiledArtifact, ExternalError> {
        let rewritten = rewrite(
            source,
            &self.registry,
            RewriteOptions {
                default_directives: self.config.default_directives,
            },
        );
        let prepared = if rewritten.changed {
            inject_fallback_imports(
                &rewritten.code,
                &rewritten.used_components,
                &self.registry,
                self.registry.default_directives_active(),
                &self.config.component_extension,
            )
        } else {
            rewritten.code
        };

        let compiled = self.fallback.compile(&prepared, id, &FALLBACK_PLUGINS)?;

        let headings = match self.native.extract_headings(source, id) {
            Ok(headings) => headings,
            Err(e) => {
                debug!(document = %id, error = %e, "native heading extraction failed, using fallback headings");
                compiled.headings
            }
        };

        Ok(CompiledArtifact {
            code: inject_heading_ids(&compiled.code, &headings),
            headings,
        })
    }

    /// Persist the cache manifest. Call at build end.
    pub fn finish(&self) -> Result<(), PipelineError> {
        self.cache.save()?;
        Ok(())
    }

    /// Forget a document (watch-mode change or removal).
    pub fn invalidate(&self, id: &str) {
        self.cache.invalidate(id);
    }

    /// Drop all cached state.
    pub fn clear(&self) {
        self.cache.clear();
    }
}
