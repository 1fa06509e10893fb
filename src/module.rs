//! Post-processing of fallback compiler output.
//!
//! The fallback compiler emits a module whose default export is the content
//! component. The build wants a uniform component module instead: metadata
//! exports (`frontmatter`, `getHeadings`, `file`, `url`) next to a single
//! default export that this layer owns.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::headings::HeadingRecord;

pub const CONTENT_COMPONENT: &str = "MDXContent";

lazy_static! {
    static ref DEFAULT_FUNCTION_RE: Regex =
        Regex::new(r"(?m)^export\s+default\s+(async\s+)?function(\s*\*)?\s*([A-Za-z_$][\w$]*)?\s*\(").unwrap();
    static ref DEFAULT_BINDING_RE: Regex =
        Regex::new(r"(?m)^export\s+default\s+([A-Za-z_$][\w$]*)\s*;?[ \t]*\r?\n?").unwrap();
}

/// Metadata exported alongside the content component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    pub frontmatter: serde_json::Value,
    pub headings: Vec<HeadingRecord>,
    pub file: String,
    pub url: Option<String>,
}

/// Strip the default export from compiled output, returning the rewritten
/// code and the name of the component it exported.
///
/// `export default function MDXContent(` becomes a plain declaration, an
/// anonymous default function is named [`CONTENT_COMPONENT`], and a trailing
/// `export default MDXContent;` statement is dropped.
pub fn normalize_default_export(code: &str) -> (String, Option<String>) {
    if let Some(caps) = DEFAULT_FUNCTION_RE.captures(code) {
        let name = caps
            .get(3)
            .map_or(CONTENT_COMPONENT, |m| m.as_str())
            .to_string();
        let replacement = format!(
            "{}function{} {}(",
            caps.get(1).map_or("", |m| m.as_str()),
            caps.get(2).map_or("", |m| m.as_str()),
            name
        );
        let range = caps.get(0).map_or(0..0, |m| m.range());
        let mut out = String::with_capacity(code.len());
        out.push_str(&code[..range.start]);
        out.push_str(&replacement);
        out.push_str(&code[range.end..]);
        return (out, Some(name));
    }

    if let Some(caps) = DEFAULT_BINDING_RE.captures(code) {
        let name = caps.get(1).map(|m| m.as_str().to_string());
        let range = caps.get(0).map_or(0..0, |m| m.range());
        let mut out = String::with_capacity(code.len());
        out.push_str(&code[..range.start]);
        out.push_str(&code[range.end..]);
        return (out, name);
    }

    (code.to_string(), None)
}

fn exports_binding(code: &str, name: &str) -> bool {
    let pattern = format!(
        r"(?m)^export\s+(?:const|let|var|(?:async\s+)?function)\s+{}\b",
        regex::escape(name)
    );
    Regex::new(&pattern).map_or(false, |re| re.is_match(code))
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Append metadata exports and the default export for `component`. Exports
/// the code already declares are not duplicated.
pub fn wrap_component_module(code: &str, component: &str, metadata: &ModuleMetadata) -> String {
    let mut out = code.trim_end().to_string();
    out.push_str("\n\n");

    if !exports_binding(code, "frontmatter") {
        out.push_str(&format!("export const frontmatter = {};\n", json(&metadata.frontmatter)));
    }
    if !exports_binding(code, "getHeadings") {
        out.push_str(&format!(
            "export function getHeadings() {{\n  return {};\n}}\n",
            json(&metadata.headings)
        ));
    }
    if !exports_binding(code, "file") {
        out.push_str(&format!("export const file = {};\n", json(&metadata.file)));
    }
    if let Some(url) = &metadata.url {
        if !exports_binding(code, "url") {
            out.push_str(&format!("export const url = {};\n", json(url)));
        }
    }
    out.push_str(&format!("export default {};\n", component));
    out
}

/// Normalize then wrap. Output without a content component gets
/// [`CONTENT_COMPONENT`] as its default export.
pub fn post_process(code: &str, metadata: &ModuleMetadata) -> String {
    let (normalized, component) = normalize_default_export(code);
    let component = component.unwrap_or_else(|| CONTENT_COMPONENT.to_string());
    wrap_component_module(&normalized, &component, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> ModuleMetadata {
        ModuleMetadata {
            frontmatter: json!({ "title": "Guide" }),
            headings: vec![HeadingRecord::new(2, "setup", "Setup")],
            file: "/site/docs/guide.mdx".to_string(),
            url: Some("/docs/guide".to_string()),
        }
    }

    #[test]
    fn test_default_function_becomes_declaration() {
        let code = "import {jsx as _jsx} from \"react/jsx-runtime\";\nexport default function MDXContent(props = {}) {\n  return _jsx(\"p\", {});\n}\n";
        let (out, name) = normalize_default_export(code);
        assert_eq!(name.as_deref(), Some("MDXContent"));
        assert!(out.contains("\nfunction MDXContent(props = {})"));
        assert!(!out.contains("export default"));
    }

    #[test]
    fn test_anonymous_default_function_is_named() {
        let (out, name) = normalize_default_export("export default function (props) {}\n");
        assert_eq!(name.as_deref(), Some(CONTENT_COMPONENT));
        assert_eq!(out, "function MDXContent(props) {}\n");
    }

    #[test]
    fn test_default_binding_statement_removed() {
        let code = "function _createMdxContent() {}\nfunction Content() {}\nexport default Content;\n";
        let (out, name) = normalize_default_export(code);
        assert_eq!(name.as_deref(), Some("Content"));
        assert_eq!(out, "function _createMdxContent() {}\nfunction Content() {}\n");
    }

    #[test]
    fn test_wrap_appends_metadata_exports() {
        let out = post_process("export default function MDXContent() {}\n", &metadata());
        assert!(out.starts_with("function MDXContent() {}\n\n"));
        assert!(out.contains("export const frontmatter = {\"title\":\"Guide\"};"));
        assert!(out.contains("return [{\"depth\":2,\"slug\":\"setup\",\"text\":\"Setup\"}];"));
        assert!(out.contains("export const file = \"/site/docs/guide.mdx\";"));
        assert!(out.contains("export const url = \"/docs/guide\";"));
        assert!(out.ends_with("export default MDXContent;\n"));
        assert_eq!(out.matches("export default").count(), 1);
    }

    #[test]
    fn test_existing_exports_not_duplicated() {
        let mut meta = metadata();
        meta.url = None;
        let code = "export const frontmatter = {a: 1};\nfunction MDXContent() {}\n";
        let out = post_process(code, &meta);
        assert_eq!(out.matches("export const frontmatter").count(), 1);
        assert!(!out.contains("export const url"));
        assert!(out.ends_with("export default MDXContent;\n"));
    }
}
