//! # MDX Fallback Build Pipeline
//!
//! Build orchestration for Markdown/MDX documents around a native fast-path
//! compiler:
//!
//! 1. **Classification**: documents whose imports are all allow-listed take
//!    the native fast path; anything else takes the fallback path.
//! 2. **Directive rewriting**: `:::name[title]{attrs}` blocks become component
//!    markup, and imports for the components used are injected.
//! 3. **Heading reconciliation**: heading render calls in the fallback
//!    compiler's output are matched against the native heading list and
//!    receive stable `id`s.
//! 4. **Lowering**: generated markup is lowered to executable module code by a
//!    bounded pool of worker threads.
//!
//! Each fallback stage is memoized in a content-addressed cache with an
//! optional on-disk store, so unchanged documents are never recompiled.
//!
//! ## Failure Model
//!
//! Only a native compiler failure aborts a build pass. A failed hook or
//! fallback compile fails that one document; a failed lowering leaves the
//! document unlowered; unmatched headings simply get no anchor.

#[cfg(feature = "napi")]
use napi_derive::napi;

pub mod cache;
pub mod classify;
pub mod config;
pub mod directives;
pub mod discovery;
pub mod error;
pub mod headings;
pub mod hooks;
pub mod jsx_lowerer;
pub mod lowering;
pub mod module;
pub mod pipeline;
pub mod registry;
pub mod scan;


pub use cache::{compute_digest, BuildCache, CacheManifest, CacheStage, Freshness, StageCache};
pub use classify::{classify, classify_with, AllowList, CompilationRoute};
pub use config::{BuildConfig, LoweringConfig};
pub use directives::{inject_fallback_imports, rewrite, RewriteOptions, RewriteResult};
pub use discovery::{discover_documents, SourceDocument};
pub use error::{CacheError, ConfigError, ExternalError, LoweringError, PipelineError};
pub use headings::{inject_heading_ids, HeadingRecord};
pub use hooks::{FnHook, HookOrder, HookPipeline, SourceHook};
pub use lowering::{LoweredModule, LoweringExecutor, LoweringJob};
pub use pipeline::{
    BuildContext, BuildReport, CompileOptions, DocumentOutput, DocumentStatus, FallbackCompiler,
    FallbackOutput, FallbackPlugin, NativeCompiler, NativeOutput,
};
pub use registry::{
    ComponentDefinition, ComponentLibrary, ComponentRegistry, DirectiveMapping, ExportKind,
    InjectedProp, PropSource, SlotNormalization,
};

#[cfg(feature = "napi")]
#[napi]
pub fn compile_bridge() -> String {
    format!("mdx-fallback-native {}", env!("CARGO_PKG_VERSION"))
}
