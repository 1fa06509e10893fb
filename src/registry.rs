//! Component Registry
//!
//! Maps directive names to the components that render them and records where
//! each component is imported from. Libraries are merged in order; a later
//! library overrides components and directives of the same name from an
//! earlier one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Component rendered by the built-in directive set.
pub const DEFAULT_ASIDE_COMPONENT: &str = "Aside";

/// Directive names mapped to [`DEFAULT_ASIDE_COMPONENT`] when no library
/// declares any directive.
pub const DEFAULT_DIRECTIVE_NAMES: &[&str] = &[
    "note",
    "tip",
    "info",
    "caution",
    "warning",
    "danger",
    "important",
];

// ═══════════════════════════════════════════════════════════════════════════════
// DEFINITIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportKind {
    /// One module per component, default-exported: `import Name from 'path/Name.ext'`.
    #[default]
    Default,
    /// Components are named exports of `module_path`.
    Named,
}

/// How a component's children are laid out by the rewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SlotNormalization {
    /// Children are Markdown blocks; the rewriter pads the tags with blank lines.
    #[default]
    Markdown,
    /// Children are emitted verbatim directly between the tags.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub name: String,
    pub module_path: String,
    #[serde(default)]
    pub export_kind: ExportKind,
    #[serde(default)]
    pub slots: SlotNormalization,
}

/// Where an injected prop gets its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "camelCase")]
pub enum PropSource {
    DirectiveName,
    BracketTitle,
    Literal { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectedProp {
    pub name: String,
    pub source: PropSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveMapping {
    pub directive: String,
    pub component: String,
    #[serde(default)]
    pub inject_props: Vec<InjectedProp>,
}

/// A named set of components and directives as supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLibrary {
    pub name: String,
    #[serde(default)]
    pub components: Vec<ComponentDefinition>,
    #[serde(default)]
    pub directives: Vec<DirectiveMapping>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentRegistry {
    components: BTreeMap<String, ComponentDefinition>,
    directives: BTreeMap<String, DirectiveMapping>,
    default_directives_active: bool,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge libraries in order. Later entries replace earlier ones with the
    /// same component name or directive name.
    pub fn merge(libraries: &[ComponentLibrary]) -> Self {
        let mut registry = Self::new();
        for library in libraries {
            for component in &library.components {
                registry
                    .components
                    .insert(component.name.clone(), component.clone());
            }
            for mapping in &library.directives {
                let key = mapping.directive.to_ascii_lowercase();
                registry.directives.insert(
                    key.clone(),
                    DirectiveMapping {
                        directive: key,
                        ..mapping.clone()
                    },
                );
            }
        }
        registry
    }

    /// Union in the built-in directive set when no directive mapping exists.
    pub fn with_default_directives(mut self, enabled: bool) -> Self {
        if enabled && self.directives.is_empty() {
            for name in DEFAULT_DIRECTIVE_NAMES {
                self.directives
                    .insert((*name).to_string(), default_mapping(name));
            }
            self.default_directives_active = true;
        }
        self
    }

    /// True when directive mappings came from the built-in set.
    pub fn default_directives_active(&self) -> bool {
        self.default_directives_active
    }

    /// Case-insensitive directive lookup.
    pub fn directive(&self, name: &str) -> Option<&DirectiveMapping> {
        self.directives.get(&name.to_ascii_lowercase())
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDefinition> {
        self.components.get(name)
    }

    pub fn has_directives(&self) -> bool {
        !self.directives.is_empty()
    }

    pub fn directive_names(&self) -> impl Iterator<Item = &str> {
        self.directives.keys().map(String::as_str)
    }

    /// Slot layout for a component; unregistered components are Markdown.
    pub fn slots_for(&self, component: &str) -> SlotNormalization {
        self.component(component)
            .map(|c| c.slots)
            .unwrap_or_default()
    }
}

fn default_mapping(name: &str) -> DirectiveMapping {
    DirectiveMapping {
        directive: name.to_string(),
        component: DEFAULT_ASIDE_COMPONENT.to_string(),
        inject_props: vec![InjectedProp {
            name: "type".to_string(),
            source: PropSource::DirectiveName,
        }],
    }
}
