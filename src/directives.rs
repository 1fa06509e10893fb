//! Directive Rewriter
//!
//! Fallback-path only. Rewrites container directives
//!
//! ```text
//! :::note[Heads up]{.wide}
//! Body
//! :::
//! ```
//!
//! into component markup the fallback compiler understands, then makes sure
//! every component used that way is imported.
//!
//! The rewriter is a single pass over lines. Each line is split into a
//! structural prefix (indentation and `>` markers) and a remainder; fences are
//! tracked so that directive-looking lines inside code are left alone. Open
//! directives live on a stack and closing tags reuse the *opening* line's
//! prefix so nesting inside lists and block quotes stays symmetric.

#[cfg(feature = "napi")]
use napi_derive::napi;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::registry::{
    ComponentRegistry, DirectiveMapping, ExportKind, PropSource, SlotNormalization,
    DEFAULT_ASIDE_COMPONENT,
};
use crate::scan::{find_frontmatter, split_line_prefix, FenceTracker};

pub const DIRECTIVE_MARKER: &str = ":::";

/// Provenance attribute carried by every synthesized opening tag.
pub const PROVENANCE_ATTR: &str = "data-directive";

/// Import used for `Aside` when it came from the built-in directive set.
pub const BUILTIN_ASIDE_IMPORT: &str = "import Aside from 'virtual:fallback-components/Aside';";

/// Keys synthesized by the rewriter and therefore dropped from raw attributes.
const SYNTHESIZED_KEYS: &[&str] = &["type", "title"];

lazy_static! {
    static ref OPENING_RE: Regex =
        Regex::new(r"^:::([A-Za-z][A-Za-z0-9-]*)(?:\[([^\]]*)\])?(.*)$").unwrap();

    static ref ATTR_TOKEN_RE: Regex =
        Regex::new(r#"([^\s=]+)(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"']+))?"#).unwrap();

    static ref IMPORT_CLAUSE_RE: Regex = Regex::new(
        r#"(?m)^[ \t]*import\s+(?:type\s+)?([\w$*{}\s,]+?)\s+from\s*['"]"#
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteOptions {
    /// Use the built-in directive set when the registry declares none.
    pub default_directives: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteResult {
    pub code: String,
    pub used_components: BTreeSet<String>,
    pub changed: bool,
}

/// One open directive on the rewrite stack.
#[derive(Debug, Clone)]
struct DirectiveBlock {
    name: String,
    bracket_title: Option<String>,
    raw_attrs: String,
    line_prefix: String,
    component_name: String,
    slots: SlotNormalization,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REWRITE
// ═══════════════════════════════════════════════════════════════════════════════

pub fn rewrite(source: &str, registry: &ComponentRegistry, options: RewriteOptions) -> RewriteResult {
    let defaults;
    let registry = if options.default_directives && !registry.has_directives() {
        defaults = registry.clone().with_default_directives(true);
        &defaults
    } else {
        registry
    };

    let newline = line_ending(source);
    let mut out = String::with_capacity(source.len() + 64);
    let mut stack: Vec<DirectiveBlock> = Vec::new();
    let mut fences = FenceTracker::new();
    let mut used_components = BTreeSet::new();
    let mut changed = false;

    for raw_line in source.split_inclusive('\n') {
        let (line, eol) = split_eol(raw_line);
        let (prefix, remainder) = split_line_prefix(line);

        if fences.observe(remainder).is_fenced() {
            out.push_str(raw_line);
            continue;
        }

        if remainder.trim() == DIRECTIVE_MARKER {
            match stack.pop() {
                Some(block) => {
                    out.push_str(&closing_markup(&block, newline));
                    out.push_str(eol);
                    changed = true;
                }
                None => out.push_str(raw_line),
            }
            continue;
        }

        if let Some(block) = parse_opening(prefix, remainder, registry) {
            let mapping = registry.directive(&block.name);
            out.push_str(&opening_markup(&block, mapping, newline));
            out.push_str(eol);
            used_components.insert(block.component_name.clone());
            stack.push(block);
            changed = true;
            continue;
        }

        out.push_str(raw_line);
    }

    if !stack.is_empty() {
        debug!(open = stack.len(), "force-closing unterminated directives");
        if !out.is_empty() && !out.ends_with('\n') {
            out.push_str(newline);
        }
        while let Some(block) = stack.pop() {
            out.push_str(&closing_markup(&block, newline));
            out.push_str(newline);
        }
    }

    RewriteResult {
        code: out,
        used_components,
        changed,
    }
}

/// The document's line ending; synthesized lines reuse it.
fn line_ending(text: &str) -> &'static str {
    if text.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

fn split_eol(raw_line: &str) -> (&str, &str) {
    let content = raw_line.trim_end_matches(['\n', '\r']);
    (content, &raw_line[content.len()..])
}

fn parse_opening(prefix: &str, remainder: &str, registry: &ComponentRegistry) -> Option<DirectiveBlock> {
    let caps = OPENING_RE.captures(remainder.trim_end())?;
    let name = caps[1].to_ascii_lowercase();
    let mapping = registry.directive(&name)?;

    let bracket_title = caps.get(2).map(|m| m.as_str().trim().to_string());
    let trailing = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");
    let trailing = trailing
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .unwrap_or(trailing);

    Some(DirectiveBlock {
        name,
        bracket_title,
        raw_attrs: filter_attributes(trailing),
        line_prefix: prefix.to_string(),
        component_name: mapping.component.clone(),
        slots: registry.slots_for(&mapping.component),
    })
}

/// Drop attributes the rewriter synthesizes itself; keep the rest verbatim.
fn filter_attributes(raw: &str) -> String {
    ATTR_TOKEN_RE
        .captures_iter(raw)
        .filter(|caps| !SYNTHESIZED_KEYS.contains(&caps[1].to_ascii_lowercase().as_str()))
        .map(|caps| caps[0].to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn opening_markup(block: &DirectiveBlock, mapping: Option<&DirectiveMapping>, newline: &str) -> String {
    let mut attrs = vec![format!("{}=\"{}\"", PROVENANCE_ATTR, escape_attr(&block.name))];
    let mut has_title = false;

    for prop in mapping.map(|m| m.inject_props.as_slice()).unwrap_or_default() {
        let value = match &prop.source {
            PropSource::DirectiveName => Some(block.name.as_str()),
            PropSource::BracketTitle => block.bracket_title.as_deref(),
            PropSource::Literal { value } => Some(value.as_str()),
        };
        if let Some(value) = value {
            has_title |= prop.name == "title";
            attrs.push(format!("{}=\"{}\"", prop.name, escape_attr(value)));
        }
    }

    if let (Some(title), false) = (&block.bracket_title, has_title) {
        attrs.push(format!("title=\"{}\"", escape_attr(title)));
    }
    if !block.raw_attrs.is_empty() {
        attrs.push(block.raw_attrs.clone());
    }

    let tag = format!("{}<{} {}>", block.line_prefix, block.component_name, attrs.join(" "));
    match block.slots {
        SlotNormalization::Markdown => format!("{}{}{}", tag, newline, block.line_prefix.trim_end()),
        SlotNormalization::Raw => tag,
    }
}

fn closing_markup(block: &DirectiveBlock, newline: &str) -> String {
    let tag = format!("{}</{}>", block.line_prefix, block.component_name);
    match block.slots {
        SlotNormalization::Markdown => format!("{}{}{}", block.line_prefix.trim_end(), newline, tag),
        SlotNormalization::Raw => tag,
    }
}

pub fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

// ═══════════════════════════════════════════════════════════════════════════════
// IMPORT INJECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Names already bound by import statements in `code`.
pub fn imported_bindings(code: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    for caps in IMPORT_CLAUSE_RE.captures_iter(code) {
        let clause = &caps[1];
        let (outside, named) = match (clause.find('{'), clause.rfind('}')) {
            (Some(open), Some(close)) if open < close => (
                format!("{}{}", &clause[..open], &clause[close + 1..]),
                Some(&clause[open + 1..close]),
            ),
            _ => (clause.to_string(), None),
        };

        for part in outside.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let binding = part.rsplit(char::is_whitespace).next().unwrap_or(part);
            names.insert(binding.to_string());
        }
        for part in named.into_iter().flat_map(|n| n.split(',')) {
            let binding = part.trim().rsplit(" as ").next().unwrap_or("").trim();
            let binding = binding.strip_prefix("type ").unwrap_or(binding).trim();
            if !binding.is_empty() {
                names.insert(binding.to_string());
            }
        }
    }
    names
}

/// Emit imports for used components that `code` does not already import.
pub fn inject_fallback_imports(
    code: &str,
    used_components: &BTreeSet<String>,
    registry: &ComponentRegistry,
    default_directives_active: bool,
    component_extension: &str,
) -> String {
    let bound = imported_bindings(code);
    let mut named: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut lines = Vec::new();

    for component in used_components.iter().filter(|c| !bound.contains(*c)) {
        match registry.component(component) {
            Some(def) if def.export_kind == ExportKind::Named => {
                named.entry(def.module_path.as_str()).or_default().push(&def.name);
            }
            Some(def) => lines.push(format!(
                "import {} from '{}/{}{}';",
                def.name,
                def.module_path.trim_end_matches('/'),
                def.name,
                component_extension
            )),
            None if component == DEFAULT_ASIDE_COMPONENT && default_directives_active => {
                lines.push(BUILTIN_ASIDE_IMPORT.to_string());
            }
            None => warn!(component = %component, "no import source registered for component"),
        }
    }

    for (module, names) in named {
        lines.push(format!("import {{ {} }} from '{}';", names.join(", "), module));
    }

    if lines.is_empty() {
        return code.to_string();
    }

    lines.sort();
    let newline = line_ending(code);
    let block = lines.join(newline);
    match find_frontmatter(code) {
        Some(fm) => format!(
            "{}{}{nl}{nl}{}",
            &code[..fm.body_start],
            block,
            &code[fm.body_start..],
            nl = newline
        ),
        None => format!("{}{nl}{nl}{}", block, code, nl = newline),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn rewrite_directives_native(
    source: String,
    config_json: String,
) -> napi::Result<serde_json::Value> {
    let config = crate::config::BuildConfig::from_json(&config_json)
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    let registry = config.registry();
    let mut result = rewrite(
        &source,
        &registry,
        RewriteOptions {
            default_directives: config.default_directives,
        },
    );
    result.code = inject_fallback_imports(
        &result.code,
        &result.used_components,
        &registry,
        registry.default_directives_active(),
        &config.component_extension,
    );
    serde_json::to_value(result).map_err(|e| napi::Error::from_reason(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ComponentDefinition, ComponentLibrary, InjectedProp};

    fn defaults() -> (ComponentRegistry, RewriteOptions) {
        (
            ComponentRegistry::new(),
            RewriteOptions {
                default_directives: true,
            },
        )
    }

    fn count(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn test_note_directive() {
        let (registry, options) = defaults();
        let result = rewrite(":::note\nBody\n:::", &registry, options);
        assert_eq!(
            result.code,
            "<Aside data-directive=\"note\" type=\"note\">\n\nBody\n\n</Aside>"
        );
        assert!(result.changed);
        assert_eq!(result.used_components.into_iter().collect::<Vec<_>>(), vec!["Aside"]);
    }

    #[test]
    fn test_bracket_title_and_attributes() {
        let (registry, options) = defaults();
        let result = rewrite(
            ":::TIP[Use \"quotes\" & more]{type=\"x\" .wide id=main title='t'}\nBody\n:::\n",
            &registry,
            options,
        );
        let first = result.code.lines().next().unwrap();
        assert_eq!(
            first,
            "<Aside data-directive=\"tip\" type=\"tip\" title=\"Use &quot;quotes&quot; &amp; more\" .wide id=main>"
        );
    }

    #[test]
    fn test_unknown_directive_and_stray_closer_pass_through() {
        let (registry, options) = defaults();
        let src = ":::mystery\ntext\n:::\n";
        let result = rewrite(src, &registry, options);
        assert_eq!(result.code, src);
        assert!(!result.changed);
        assert!(result.used_components.is_empty());
    }

    #[test]
    fn test_nested_directives_balance() {
        let (registry, options) = defaults();
        let src = ":::note\nouter\n:::tip\ninner\n:::\nafter\n:::\n";
        let result = rewrite(src, &registry, options);
        assert_eq!(count(&result.code, "<Aside "), 2);
        assert_eq!(count(&result.code, "</Aside>"), 2);
        let inner_close = result.code.find("</Aside>").unwrap();
        assert!(result.code[..inner_close].contains("inner"));
        assert!(result.code[inner_close..].contains("after"));
    }

    #[test]
    fn test_closer_uses_opening_prefix() {
        let (registry, options) = defaults();
        let src = "> :::note\n> quoted\n:::\n";
        let result = rewrite(src, &registry, options);
        assert_eq!(
            result.code,
            "> <Aside data-directive=\"note\" type=\"note\">\n>\n> quoted\n>\n> </Aside>\n"
        );
    }

    #[test]
    fn test_fenced_directives_untouched() {
        let (registry, options) = defaults();
        let src = "```md\n:::note\n:::\n```\n";
        let result = rewrite(src, &registry, options);
        assert_eq!(result.code, src);
        assert!(!result.changed);
    }

    #[test]
    fn test_unclosed_directives_force_closed_lifo() {
        let (registry, options) = defaults();
        let src = ":::note\n  :::tip\n  body";
        let result = rewrite(src, &registry, options);
        assert!(result.code.ends_with("  </Aside>\n\n</Aside>\n"));
        assert_eq!(count(&result.code, "</Aside>"), 2);
    }

    #[test]
    fn test_registry_mapping_with_injected_props() {
        let registry = ComponentRegistry::merge(&[ComponentLibrary {
            name: "ui".to_string(),
            components: vec![ComponentDefinition {
                name: "Steps".to_string(),
                module_path: "@ui".to_string(),
                export_kind: ExportKind::Named,
                slots: SlotNormalization::Raw,
            }],
            directives: vec![DirectiveMapping {
                directive: "steps".to_string(),
                component: "Steps".to_string(),
                inject_props: vec![
                    InjectedProp {
                        name: "label".to_string(),
                        source: PropSource::BracketTitle,
                    },
                    InjectedProp {
                        name: "variant".to_string(),
                        source: PropSource::Literal {
                            value: "numbered".to_string(),
                        },
                    },
                ],
            }],
        }]);
        let result = rewrite(
            ":::steps[Setup]\n1. one\n:::\n",
            &registry,
            RewriteOptions {
                default_directives: true,
            },
        );
        assert_eq!(
            result.code,
            "<Steps data-directive=\"steps\" label=\"Setup\" variant=\"numbered\" title=\"Setup\">\n1. one\n</Steps>\n"
        );
        // The built-in set is not unioned in once a library declares directives.
        assert!(!rewrite(":::note\n:::\n", &registry, RewriteOptions { default_directives: true }).changed);
    }

    #[test]
    fn test_imported_bindings() {
        let code = "import A from 'a';\nimport { B, C as D, type E } from 'b';\nimport * as NS from 'ns';\nimport F, { G } from 'f';\n";
        let names = imported_bindings(code);
        for name in ["A", "B", "D", "E", "NS", "F", "G"] {
            assert!(names.contains(name), "missing {name}");
        }
        assert!(!names.contains("C"));
    }

    #[test]
    fn test_inject_imports_grouped_and_default() {
        let registry = ComponentRegistry::merge(&[ComponentLibrary {
            name: "ui".to_string(),
            components: vec![
                ComponentDefinition {
                    name: "Tabs".to_string(),
                    module_path: "@ui/components".to_string(),
                    export_kind: ExportKind::Named,
                    slots: SlotNormalization::Markdown,
                },
                ComponentDefinition {
                    name: "Card".to_string(),
                    module_path: "@ui/components".to_string(),
                    export_kind: ExportKind::Named,
                    slots: SlotNormalization::Markdown,
                },
                ComponentDefinition {
                    name: "Badge".to_string(),
                    module_path: "~/components/".to_string(),
                    export_kind: ExportKind::Default,
                    slots: SlotNormalization::Markdown,
                },
            ],
            directives: vec![],
        }]);
        let used: BTreeSet<String> = ["Tabs", "Card", "Badge"].iter().map(|s| s.to_string()).collect();
        let code = "---\ntitle: x\n---\n# Hi\n";
        let out = inject_fallback_imports(code, &used, &registry, false, ".astro");
        assert_eq!(
            out,
            "---\ntitle: x\n---\nimport Badge from '~/components/Badge.astro';\nimport { Card, Tabs } from '@ui/components';\n\n# Hi\n"
        );
    }

    #[test]
    fn test_inject_skips_bound_and_adds_builtin_aside() {
        let used: BTreeSet<String> = ["Aside".to_string()].into_iter().collect();
        let registry = ComponentRegistry::new();

        let out = inject_fallback_imports("body", &used, &registry, true, ".astro");
        assert_eq!(out, format!("{}\n\nbody", BUILTIN_ASIDE_IMPORT));

        let already = "import Aside from './Aside.astro';\nbody";
        assert_eq!(inject_fallback_imports(already, &used, &registry, true, ".astro"), already);

        // Without the built-in set there is no source for Aside.
        assert_eq!(inject_fallback_imports("body", &used, &registry, false, ".astro"), "body");
    }

    #[test]
    fn test_crlf_line_endings_preserved() {
        let (registry, options) = defaults();
        let result = rewrite(":::note\r\nBody\r\n:::\r\n", &registry, options);
        assert_eq!(
            result.code,
            "<Aside data-directive=\"note\" type=\"note\">\r\n\r\nBody\r\n\r\n</Aside>\r\n"
        );

        let unterminated = rewrite(":::note\r\nBody", &registry, options);
        assert_eq!(
            unterminated.code,
            "<Aside data-directive=\"note\" type=\"note\">\r\n\r\nBody\r\n\r\n</Aside>\r\n"
        );

        let used: BTreeSet<String> = ["Aside".to_string()].into_iter().collect();
        let out = inject_fallback_imports(&result.code, &used, &registry, true, ".astro");
        assert!(out.starts_with(&format!("{}\r\n\r\n<Aside", BUILTIN_ASIDE_IMPORT)), "{:?}", out);
        assert!(!out.replace("\r\n", "").contains('\n'), "{:?}", out);
    }
}
