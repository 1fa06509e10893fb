//! Parallel Lowering Executor
//!
//! Turns generated markup (JSX-bearing module text) into executable module
//! code. A batch of jobs is split into balanced, order-preserving chunks; each
//! chunk runs on its own named worker thread and reports back over a typed
//! channel. Per-job failures travel inside the worker report. A chunk whose
//! worker times out or dies fails every job it carried, and the rest of the
//! batch is unaffected.
//!
//! Each worker lowers with the oxc transformer (automatic JSX runtime) and
//! falls back to [`JsxLowerer`] when the transformer reports errors.

#[cfg(feature = "napi")]
use napi_derive::napi;
use oxc_allocator::Allocator;
use oxc_ast::ast::Program;
use oxc_ast_visit::VisitMut;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{JsxOptions, JsxRuntime, TransformOptions, Transformer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::LoweringConfig;
use crate::error::LoweringError;
use crate::jsx_lowerer::JsxLowerer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct LoweringJob {
    pub job_id: String,
    pub generated_markup: String,
}

impl LoweringJob {
    pub fn new(job_id: impl Into<String>, generated_markup: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            generated_markup: generated_markup.into(),
        }
    }
}

/// Final module code plus its source map (JSON), if requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct LoweredModule {
    pub code: String,
    pub map: Option<String>,
}

pub type LoweringOutcome = Result<LoweredModule, LoweringError>;

/// The routine a worker runs for each job.
pub type LowerFn = fn(&LoweringJob, &LoweringConfig) -> LoweringOutcome;

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub job_id: String,
    pub code: String,
    pub map: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    pub job_id: String,
    pub error: LoweringError,
}

/// What a worker sends back for its chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub results: Vec<WorkerResult>,
    pub errors: Vec<WorkerError>,
}

fn run_chunk(jobs: &[LoweringJob], config: &LoweringConfig, routine: LowerFn) -> WorkerReport {
    let mut report = WorkerReport::default();
    for job in jobs {
        match routine(job, config) {
            Ok(module) => report.results.push(WorkerResult {
                job_id: job.job_id.clone(),
                code: module.code,
                map: module.map,
            }),
            Err(error) => report.errors.push(WorkerError {
                job_id: job.job_id.clone(),
                error,
            }),
        }
    }
    report
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARTITIONING
// ═══════════════════════════════════════════════════════════════════════════════

/// `min(max(1, available - 1), max_workers)`, never below one.
pub fn compute_parallelism(available: usize, max_workers: usize) -> usize {
    available.saturating_sub(1).max(1).min(max_workers.max(1))
}

/// Split `items` into at most `chunks` contiguous groups whose sizes differ by
/// at most one. Never produces empty groups.
pub fn partition<T>(items: Vec<T>, chunks: usize) -> Vec<Vec<T>> {
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let count = chunks.clamp(1, total);
    let base = total / count;
    let extra = total % count;

    let mut iter = items.into_iter();
    (0..count)
        .map(|i| {
            let size = base + usize::from(i < extra);
            iter.by_ref().take(size).collect()
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOWERING ROUTINE
// ═══════════════════════════════════════════════════════════════════════════════

fn source_type() -> SourceType {
    SourceType::default().with_module(true).with_jsx(true)
}

fn parse_program<'a>(allocator: &'a Allocator, source: &'a str) -> Result<Program<'a>, LoweringError> {
    let ret = Parser::new(allocator, source, source_type()).parse();
    if ret.errors.is_empty() {
        Ok(ret.program)
    } else {
        Err(LoweringError::Parse(join_diagnostics(&ret.errors)))
    }
}

fn join_diagnostics<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn print_program(program: &Program<'_>, file_name: &str, config: &LoweringConfig) -> LoweredModule {
    let options = CodegenOptions {
        source_map_path: config.source_maps.then(|| PathBuf::from(file_name)),
        ..CodegenOptions::default()
    };
    let ret = Codegen::new().with_options(options).build(program);
    LoweredModule {
        code: ret.code,
        map: ret.map.map(|map| map.to_json_string()),
    }
}

/// Primary strategy: semantic analysis plus the oxc transformer.
fn lower_with_transformer(
    job: &LoweringJob,
    config: &LoweringConfig,
) -> Result<LoweredModule, LoweringError> {
    let allocator = Allocator::default();
    let mut program = parse_program(&allocator, &job.generated_markup)?;

    let scoping = SemanticBuilder::new().build(&program).semantic.into_scoping();
    let options = TransformOptions {
        jsx: JsxOptions {
            jsx_plugin: true,
            runtime: JsxRuntime::Automatic,
            import_source: Some(config.jsx_import_source.clone()),
            ..JsxOptions::default()
        },
        ..TransformOptions::default()
    };
    let ret = Transformer::new(&allocator, Path::new(&job.job_id), &options)
        .build_with_scoping(scoping, &mut program);
    if !ret.errors.is_empty() {
        return Err(LoweringError::Transform(join_diagnostics(&ret.errors)));
    }
    Ok(print_program(&program, &job.job_id, config))
}

/// Secondary strategy: syntactic JSX rewrite with an injected runtime import.
fn lower_with_visitor(
    job: &LoweringJob,
    config: &LoweringConfig,
) -> Result<LoweredModule, LoweringError> {
    let allocator = Allocator::default();
    let mut program = parse_program(&allocator, &job.generated_markup)?;

    let mut lowerer = JsxLowerer::new(&allocator);
    lowerer.visit_program(&mut program);

    if let Some(import) = lowerer.runtime_import(&config.jsx_import_source) {
        let import: &str = allocator.alloc_str(&import);
        let header = parse_program(&allocator, import)?;
        for (i, stmt) in header.body.into_iter().enumerate() {
            program.body.insert(i, stmt);
        }
    }
    Ok(print_program(&program, &job.job_id, config))
}

/// Lower one job: parse errors are final, transformer errors retry with the
/// visitor.
pub fn lower_job(job: &LoweringJob, config: &LoweringConfig) -> LoweringOutcome {
    match lower_with_transformer(job, config) {
        Ok(module) => Ok(module),
        Err(err @ LoweringError::Parse(_)) => Err(err),
        Err(err) => {
            debug!(job = %job.job_id, error = %err, "transformer rejected module, using JSX visitor");
            lower_with_visitor(job, config)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXECUTOR
// ═══════════════════════════════════════════════════════════════════════════════

pub struct LoweringExecutor {
    config: LoweringConfig,
    parallelism: usize,
    routine: LowerFn,
}

struct PendingChunk {
    index: usize,
    job_ids: Vec<String>,
    receiver: Result<Receiver<WorkerReport>, String>,
}

impl LoweringExecutor {
    /// Parallelism derived from the machine's available cores.
    pub fn new(config: LoweringConfig) -> Self {
        let available = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let parallelism = compute_parallelism(available, config.max_workers);
        Self::with_parallelism(config, parallelism)
    }

    pub fn with_parallelism(config: LoweringConfig, parallelism: usize) -> Self {
        Self {
            config,
            parallelism: parallelism.max(1),
            routine: lower_job,
        }
    }

    pub fn with_routine(mut self, routine: LowerFn) -> Self {
        self.routine = routine;
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    /// Lower a batch. The returned map has exactly one entry per distinct job
    /// id; ordering is not preserved.
    pub fn lower(&self, jobs: Vec<LoweringJob>) -> HashMap<String, LoweringOutcome> {
        let mut outcomes = HashMap::with_capacity(jobs.len());
        if jobs.is_empty() {
            return outcomes;
        }

        let chunks = partition(jobs, self.parallelism);
        debug!(chunks = chunks.len(), parallelism = self.parallelism, "dispatching lowering batch");

        let deadline = Instant::now() + self.config.timeout();
        let pending: Vec<PendingChunk> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| self.dispatch(index, chunk))
            .collect();

        for chunk in pending {
            let received = chunk.receiver.and_then(|rx| {
                let wait = deadline.saturating_duration_since(Instant::now());
                rx.recv_timeout(wait).map_err(|e| match e {
                    RecvTimeoutError::Timeout => format!("timed out after {}ms", self.config.timeout_ms),
                    RecvTimeoutError::Disconnected => "worker exited abnormally".to_string(),
                })
            });

            match received {
                Ok(report) => {
                    for result in report.results {
                        outcomes.insert(
                            result.job_id,
                            Ok(LoweredModule {
                                code: result.code,
                                map: result.map,
                            }),
                        );
                    }
                    for failure in report.errors {
                        outcomes.insert(failure.job_id, Err(failure.error));
                    }
                    for id in chunk.job_ids {
                        outcomes.entry(id).or_insert_with(|| {
                            Err(LoweringError::ChunkFailed {
                                chunk: chunk.index,
                                reason: "worker reported no result".to_string(),
                            })
                        });
                    }
                }
                Err(reason) => {
                    for id in chunk.job_ids {
                        warn!(chunk = chunk.index, document = %id, %reason, "lowering worker failed");
                        outcomes.insert(
                            id,
                            Err(LoweringError::ChunkFailed {
                                chunk: chunk.index,
                                reason: reason.clone(),
                            }),
                        );
                    }
                }
            }
        }
        outcomes
    }

    fn dispatch(&self, index: usize, chunk: Vec<LoweringJob>) -> PendingChunk {
        let job_ids = chunk.iter().map(|job| job.job_id.clone()).collect();
        let (tx, rx) = mpsc::channel();
        let config = self.config.clone();
        let routine = self.routine;

        let spawned = thread::Builder::new()
            .name(format!("lowering-worker-{}", index))
            .spawn(move || {
                // The collector may have given up on this chunk already.
                let _ = tx.send(run_chunk(&chunk, &config, routine));
            });

        PendingChunk {
            index,
            job_ids,
            receiver: spawned
                .map(|_| rx)
                .map_err(|e| format!("failed to spawn worker: {}", e)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Returns `{ results: [{jobId, code, map?}], errors: [{jobId, message}] }`.
#[cfg(feature = "napi")]
#[napi]
pub fn lower_batch_native(
    jobs: Vec<LoweringJob>,
    config_json: Option<String>,
) -> napi::Result<serde_json::Value> {
    let config: LoweringConfig = match config_json {
        Some(json) => serde_json::from_str(&json).map_err(|e| napi::Error::from_reason(e.to_string()))?,
        None => LoweringConfig::default(),
    };

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for (job_id, outcome) in LoweringExecutor::new(config).lower(jobs) {
        match outcome {
            Ok(module) => results.push(serde_json::json!({
                "jobId": job_id,
                "code": module.code,
                "map": module.map,
            })),
            Err(e) => errors.push(serde_json::json!({
                "jobId": job_id,
                "message": e.to_string(),
            })),
        }
    }
    Ok(serde_json::json!({ "results": results, "errors": errors }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn jobs(n: usize) -> Vec<LoweringJob> {
        (0..n)
            .map(|i| LoweringJob::new(format!("doc-{}.mdx", i), format!("export const n = {};", i)))
            .collect()
    }

    fn quick_config() -> LoweringConfig {
        LoweringConfig {
            timeout_ms: 5_000,
            source_maps: false,
            ..LoweringConfig::default()
        }
    }

    fn echo(job: &LoweringJob, _: &LoweringConfig) -> LoweringOutcome {
        Ok(LoweredModule {
            code: job.generated_markup.clone(),
            map: None,
        })
    }

    fn fail_odd(job: &LoweringJob, config: &LoweringConfig) -> LoweringOutcome {
        let n: usize = job.job_id.trim_start_matches("doc-").trim_end_matches(".mdx").parse().unwrap();
        if n % 2 == 1 {
            Err(LoweringError::Transform(format!("odd job {}", n)))
        } else {
            echo(job, config)
        }
    }

    fn hang_on_three(job: &LoweringJob, config: &LoweringConfig) -> LoweringOutcome {
        if job.job_id == "doc-3.mdx" {
            thread::sleep(Duration::from_secs(5));
        }
        echo(job, config)
    }

    fn panic_on_zero(job: &LoweringJob, config: &LoweringConfig) -> LoweringOutcome {
        if job.job_id == "doc-0.mdx" {
            panic!("worker crashed");
        }
        echo(job, config)
    }

    #[test]
    fn test_compute_parallelism() {
        assert_eq!(compute_parallelism(1, 8), 1);
        assert_eq!(compute_parallelism(2, 8), 1);
        assert_eq!(compute_parallelism(4, 8), 3);
        assert_eq!(compute_parallelism(64, 8), 8);
        assert_eq!(compute_parallelism(64, 0), 1);
    }

    #[test]
    fn test_partition_twenty_into_eight() {
        let chunks = partition((0..20).collect::<Vec<_>>(), 8);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 3, 2, 2, 2, 2]);
        let flat: Vec<i32> = chunks.into_iter().flatten().collect();
        assert_eq!(flat, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_never_empty_chunks() {
        assert_eq!(partition(vec![1, 2, 3], 8).len(), 3);
        assert!(partition(Vec::<u8>::new(), 8).is_empty());
        assert_eq!(partition(vec![1, 2, 3], 0), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_batch_covers_every_job_once() {
        let executor = LoweringExecutor::with_parallelism(quick_config(), 8).with_routine(echo);
        let out = executor.lower(jobs(20));
        assert_eq!(out.len(), 20);
        let ids: HashSet<_> = out.keys().cloned().collect();
        let expected: HashSet<_> = jobs(20).into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, expected);
        assert!(out.values().all(Result::is_ok));
    }

    #[test]
    fn test_job_errors_do_not_affect_siblings() {
        let executor = LoweringExecutor::with_parallelism(quick_config(), 2).with_routine(fail_odd);
        let out = executor.lower(jobs(6));
        assert_eq!(out.len(), 6);
        assert!(out["doc-0.mdx"].is_ok());
        assert!(matches!(out["doc-1.mdx"], Err(LoweringError::Transform(_))));
        assert!(out["doc-2.mdx"].is_ok());
    }

    #[test]
    fn test_timeout_fails_only_that_chunk() {
        let config = LoweringConfig {
            timeout_ms: 300,
            ..quick_config()
        };
        // Chunks: [0,1] [2,3] [4,5]
        let executor = LoweringExecutor::with_parallelism(config, 3).with_routine(hang_on_three);
        let out = executor.lower(jobs(6));
        assert_eq!(out.len(), 6);
        for id in ["doc-2.mdx", "doc-3.mdx"] {
            match &out[id] {
                Err(LoweringError::ChunkFailed { chunk, reason }) => {
                    assert_eq!(*chunk, 1);
                    assert!(reason.contains("timed out"));
                }
                other => panic!("unexpected outcome for {}: {:?}", id, other),
            }
        }
        for id in ["doc-0.mdx", "doc-1.mdx", "doc-4.mdx", "doc-5.mdx"] {
            assert!(out[id].is_ok(), "{}", id);
        }
    }

    #[test]
    fn test_worker_crash_fails_chunk() {
        let executor = LoweringExecutor::with_parallelism(quick_config(), 2).with_routine(panic_on_zero);
        let out = executor.lower(jobs(4));
        assert!(matches!(
            &out["doc-1.mdx"],
            Err(LoweringError::ChunkFailed { chunk: 0, reason }) if reason.contains("abnormally")
        ));
        assert!(out["doc-2.mdx"].is_ok());
        assert!(out["doc-3.mdx"].is_ok());
    }

    #[test]
    fn test_lower_job_converts_jsx() {
        let job = LoweringJob::new(
            "guide.mdx",
            "export default function MDXContent() { return <h1 id=\"x\">Hi</h1>; }",
        );
        let module = lower_job(&job, &LoweringConfig::default()).unwrap();
        assert!(!module.code.contains("<h1"), "{}", module.code);
        assert!(module.code.contains("react/jsx-runtime"), "{}", module.code);
        assert!(module.map.is_some());
    }

    #[test]
    fn test_lower_job_respects_import_source_and_maps() {
        let config = LoweringConfig {
            jsx_import_source: "preact".to_string(),
            source_maps: false,
            ..LoweringConfig::default()
        };
        let module = lower_job(&LoweringJob::new("a.mdx", "const a = <p>x</p>;"), &config).unwrap();
        assert!(module.code.contains("preact/jsx-runtime"), "{}", module.code);
        assert!(module.map.is_none());
    }

    #[test]
    fn test_parse_error_is_per_job() {
        let err = lower_job(&LoweringJob::new("bad.mdx", "const = <;"), &quick_config()).unwrap_err();
        assert!(matches!(err, LoweringError::Parse(_)));
    }

    #[test]
    fn test_visitor_strategy_injects_runtime_import() {
        let module = lower_with_visitor(
            &LoweringJob::new("a.mdx", "export const a = <Aside type=\"note\">x</Aside>;"),
            &quick_config(),
        )
        .unwrap();
        assert!(module.code.starts_with("import { jsx as _jsx } from \"react/jsx-runtime\""), "{}", module.code);
        assert!(module.code.contains("_jsx(Aside"), "{}", module.code);
    }

    fn assert_valid_module(code: &str) {
        let allocator = Allocator::default();
        let program = parse_program(&allocator, code).unwrap();
        let ret = SemanticBuilder::new().with_check_syntax_error(true).build(&program);
        assert!(ret.errors.is_empty(), "{:?}\n{}", ret.errors, code);
    }

    #[test]
    fn test_transformer_rejection_falls_back_to_visitor() {
        // Namespaced tags and spread children are rejected by the transformer.
        let job = LoweringJob::new(
            "svg.mdx",
            concat!(
                "import { jsx as _jsx } from \"react/jsx-runtime\";\n",
                "export const icon = <svg:g>{_jsx(\"title\", { children: \"t\" })}{...items}</svg:g>;\n",
            ),
        );
        assert!(matches!(
            lower_with_transformer(&job, &quick_config()),
            Err(LoweringError::Transform(_))
        ));

        let module = lower_job(&job, &quick_config()).unwrap();
        assert!(module.code.contains("_jsxs(\"svg:g\""), "{}", module.code);
        assert!(module.code.contains("items"), "{}", module.code);
        assert_eq!(module.code.matches("jsx as _jsx").count(), 1, "{}", module.code);
        assert!(module.code.contains("jsxs as _jsxs"), "{}", module.code);
        assert_valid_module(&module.code);
    }

    #[test]
    fn test_executor_reports_visitor_output() {
        let executor = LoweringExecutor::with_parallelism(quick_config(), 1);
        let results = executor.lower(vec![LoweringJob::new("ns.mdx", "export const a = <x:y>{...rest}</x:y>;")]);
        let module = results["ns.mdx"].as_ref().unwrap();
        assert!(module.code.contains("_jsx(\"x:y\""), "{}", module.code);
        assert!(module.code.contains("rest"), "{}", module.code);
        assert_valid_module(&module.code);
    }
}
