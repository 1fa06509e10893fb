//! Source hooks run over each document before routing.
//!
//! Hooks are an explicit ordered list: `Pre` hooks first, then hooks with no
//! stated order, then `Post` hooks. Within an order class, registration order
//! is kept. Each hook receives the previous hook's output.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookOrder {
    Pre,
    #[default]
    Normal,
    Post,
}

pub trait SourceHook: Send + Sync {
    fn name(&self) -> &str;

    fn order(&self) -> HookOrder {
        HookOrder::Normal
    }

    /// Transform `source` for document `id`. An `Err` aborts that document.
    fn apply(&self, id: &str, source: String) -> Result<String, String>;
}

type HookFn = Box<dyn Fn(&str, String) -> Result<String, String> + Send + Sync>;

/// A hook built from a closure.
pub struct FnHook {
    name: String,
    order: HookOrder,
    f: HookFn,
}

impl FnHook {
    pub fn new(
        name: impl Into<String>,
        order: HookOrder,
        f: impl Fn(&str, String) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            order,
            f: Box::new(f),
        }
    }
}

impl SourceHook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> HookOrder {
        self.order
    }

    fn apply(&self, id: &str, source: String) -> Result<String, String> {
        (self.f)(id, source)
    }
}

#[derive(Default)]
pub struct HookPipeline {
    hooks: Vec<Box<dyn SourceHook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl SourceHook + 'static) {
        self.hooks.push(Box::new(hook));
        self.hooks.sort_by_key(|h| h.order());
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn run(&self, id: &str, source: String) -> Result<String, PipelineError> {
        self.hooks.iter().try_fold(source, |source, hook| {
            hook.apply(id, source).map_err(|message| PipelineError::Hook {
                hook: hook.name().to_string(),
                id: id.to_string(),
                message,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(name: &str, order: HookOrder) -> FnHook {
        let tag = name.to_string();
        FnHook::new(name, order, move |_, source| Ok(format!("{}[{}]", source, tag)))
    }

    #[test]
    fn test_pre_normal_post_with_stable_ties() {
        let mut hooks = HookPipeline::new();
        hooks.register(append("post", HookOrder::Post));
        hooks.register(append("a", HookOrder::Normal));
        hooks.register(append("pre", HookOrder::Pre));
        hooks.register(append("b", HookOrder::Normal));

        assert_eq!(hooks.names(), vec!["pre", "a", "b", "post"]);
        assert_eq!(hooks.run("doc", String::new()).unwrap(), "[pre][a][b][post]");
    }

    #[test]
    fn test_failing_hook_reports_name_and_document() {
        let mut hooks = HookPipeline::new();
        hooks.register(append("first", HookOrder::Pre));
        hooks.register(FnHook::new("strict", HookOrder::Normal, |_, _| {
            Err("bad input".to_string())
        }));
        hooks.register(append("never", HookOrder::Post));

        match hooks.run("docs/a.mdx", "x".to_string()) {
            Err(PipelineError::Hook { hook, id, message }) => {
                assert_eq!(hook, "strict");
                assert_eq!(id, "docs/a.mdx");
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let hooks = HookPipeline::new();
        assert!(hooks.is_empty());
        assert_eq!(hooks.run("a", "same".to_string()).unwrap(), "same");
    }
}
