//! Heading Reconciler
//!
//! The fallback compiler emits heading render calls without anchors, while
//! the native extractor has already produced the canonical `(depth, slug,
//! text)` list for the same document. No syntax tree is shared between the
//! two, so this module locates heading calls in the generated module text and
//! aligns them with the extracted list:
//!
//! 1. **Exact text.** Calls whose children reduce to literal text claim the
//!    first unused record with the same `depth:text`. Duplicate headings are
//!    queued per key so repeated text is assigned in document order.
//! 2. **Prefix fallback.** Calls whose children mix text and nested calls
//!    match the first unclaimed record at their depth whose text starts with
//!    the literal prefix. With no prefix at all, a call is only matched when
//!    exactly one record remains at its depth.
//!
//! Unmatched calls keep rendering without an `id`.

#[cfg(feature = "napi")]
use napi_derive::napi;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

lazy_static! {
    /// Header of a heading render call up to and including the props `{`.
    static ref HEADING_CALL_RE: Regex =
        Regex::new(r#"\b_?jsxs?\(\s*(?:_components\.h([1-6])|"h([1-6])")\s*,\s*\{"#).unwrap();

    /// Header of any render call, anchored at the start of the slice.
    static ref RENDER_CALL_RE: Regex = Regex::new(
        r#"^_?jsxs?\(\s*(?:_components\.([A-Za-z][\w]*)|"([A-Za-z][\w-]*)"|([A-Za-z_$][\w$]*(?:\.[\w$]+)*))\s*,\s*\{"#
    )
    .unwrap();
}

/// Inline formatting elements whose text counts as heading text.
const INLINE_TAGS: &[&str] = &["em", "strong", "a", "del", "s", "b", "i"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
pub struct HeadingRecord {
    pub depth: u8,
    pub slug: String,
    pub text: String,
}

impl HeadingRecord {
    pub fn new(depth: u8, slug: &str, text: &str) -> Self {
        Self {
            depth,
            slug: slug.to_string(),
            text: text.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATED CODE SCANNING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum ChildValue {
    Text(String),
    Array(Vec<ChildValue>),
    Call(NestedCall),
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
struct NestedCall {
    tag: String,
    children: Option<Box<ChildValue>>,
}

impl NestedCall {
    fn is_inline(&self) -> bool {
        INLINE_TAGS.contains(&self.tag.as_str())
    }
}

/// A heading render call located in generated code.
#[derive(Debug, Clone, PartialEq)]
struct HeadingCall {
    /// Offset just past the props `{`; the identifier is inserted here.
    offset: usize,
    /// Length of the call header token.
    length: usize,
    depth: u8,
    children: Option<ChildValue>,
    existing_id: Option<String>,
    assigned_slug: Option<String>,
}

impl HeadingCall {
    fn extracted_text(&self) -> Option<String> {
        self.children.as_ref().and_then(full_text)
    }

    fn literal_prefix(&self) -> Option<String> {
        self.children.as_ref().and_then(prefix_text)
    }
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Index just past the closing quote of the literal starting at `start`.
fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Index of the bracket closing the one at `open`.
fn find_matching(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i)?;
                continue;
            }
            b'{' | b'[' | b'(' => depth += 1,
            b'}' | b']' | b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the next `,` or closing bracket at nesting depth zero, or `limit`.
fn skip_to_delimiter(bytes: &[u8], mut i: usize, limit: usize) -> usize {
    let mut depth = 0usize;
    while i < limit {
        match bytes[i] {
            b'"' | b'\'' | b'`' => match skip_string(bytes, i) {
                Some(next) => {
                    i = next;
                    continue;
                }
                None => return limit,
            },
            b'{' | b'[' | b'(' => depth += 1,
            b'}' | b']' | b')' => {
                if depth == 0 {
                    return i;
                }
                depth -= 1;
            }
            b',' if depth == 0 => return i,
            _ => {}
        }
        i += 1;
    }
    limit
}

fn decode_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let rest = chars.as_str();
                let (hex, consumed) = if let Some(braced) = rest.strip_prefix('{') {
                    let end = braced.find('}').unwrap_or(braced.len());
                    (&braced[..end], end + 2)
                } else {
                    (rest.get(..4).unwrap_or(rest), 4)
                };
                match u32::from_str_radix(hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) => {
                        out.push(ch);
                        chars = rest.get(consumed..).unwrap_or("").chars();
                    }
                    None => out.push('u'),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Key of a property starting at `i`, and the index just past it.
fn read_key(code: &str, i: usize) -> (String, usize) {
    let bytes = code.as_bytes();
    match bytes.get(i) {
        Some(b'"') | Some(b'\'') => match skip_string(bytes, i) {
            Some(end) => (decode_string(&code[i + 1..end - 1]), end),
            None => (String::new(), i),
        },
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' || *b == b'$' => {
            let mut end = i;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || matches!(bytes[end], b'_' | b'$')) {
                end += 1;
            }
            (code[i..end].to_string(), end)
        }
        _ => (String::new(), i),
    }
}

/// Start of the value of top-level property `key` in the object `open..=close`.
fn find_property(code: &str, open: usize, close: usize, key: &str) -> Option<usize> {
    let bytes = code.as_bytes();
    let mut i = open + 1;
    loop {
        i = skip_ws(bytes, i);
        if i >= close {
            return None;
        }
        let (name, after) = read_key(code, i);
        let colon = skip_ws(bytes, after);
        if name == key && bytes.get(colon) == Some(&b':') {
            return Some(skip_ws(bytes, colon + 1));
        }
        let next = skip_to_delimiter(bytes, colon, close);
        if next >= close || bytes[next] != b',' {
            return None;
        }
        i = next + 1;
    }
}

/// Parse a children value starting at `start`. Returns the value and the
/// index just past it.
fn parse_value(code: &str, start: usize, limit: usize) -> (ChildValue, usize) {
    let bytes = code.as_bytes();
    let i = skip_ws(bytes, start);
    if i >= limit {
        return (ChildValue::Opaque, limit);
    }

    match bytes[i] {
        b'"' | b'\'' => {
            if let Some(end) = skip_string(bytes, i) {
                return (ChildValue::Text(decode_string(&code[i + 1..end - 1])), end);
            }
        }
        b'`' => {
            if let Some(end) = skip_string(bytes, i) {
                let inner = &code[i + 1..end - 1];
                if !inner.contains("${") {
                    return (ChildValue::Text(decode_string(inner)), end);
                }
            }
        }
        b'[' => {
            if let Some(close) = find_matching(bytes, i) {
                return (ChildValue::Array(parse_elements(code, i + 1, close)), close + 1);
            }
        }
        _ => {
            if let Some((call, end)) = parse_call(code, i) {
                return (ChildValue::Call(call), end);
            }
        }
    }

    (ChildValue::Opaque, skip_to_delimiter(bytes, i, limit))
}

fn parse_elements(code: &str, start: usize, close: usize) -> Vec<ChildValue> {
    let bytes = code.as_bytes();
    let mut items = Vec::new();
    let mut i = start;
    loop {
        i = skip_ws(bytes, i);
        if i >= close {
            break;
        }
        let (value, end) = parse_value(code, i, close);
        items.push(value);
        let next = skip_to_delimiter(bytes, end, close);
        if next >= close || bytes[next] != b',' {
            break;
        }
        i = next + 1;
    }
    items
}

fn parse_call(code: &str, start: usize) -> Option<(NestedCall, usize)> {
    let caps = RENDER_CALL_RE.captures(&code[start..])?;
    let tag = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .to_string();

    let bytes = code.as_bytes();
    let paren = start + code[start..].find('(')?;
    let open = start + caps.get(0)?.end() - 1;
    let props_close = find_matching(bytes, open)?;
    let call_close = find_matching(bytes, paren)?;

    let children = find_property(code, open, props_close, "children")
        .map(|v| Box::new(parse_value(code, v, props_close).0));

    Some((NestedCall { tag, children }, call_close + 1))
}

fn literal_text(value: &ChildValue) -> Option<String> {
    match value {
        ChildValue::Text(s) => Some(s.clone()),
        ChildValue::Array(items) => items
            .iter()
            .map(|item| match item {
                ChildValue::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat()),
        _ => None,
    }
}

/// Full literal text: plain strings, string-only arrays, or one inline
/// formatting call wrapping either of those.
fn full_text(value: &ChildValue) -> Option<String> {
    literal_text(value).or_else(|| match value {
        ChildValue::Call(call) if call.is_inline() => call.children.as_deref().and_then(literal_text),
        ChildValue::Array(items) => match items.as_slice() {
            [ChildValue::Call(call)] if call.is_inline() => {
                call.children.as_deref().and_then(literal_text)
            }
            _ => None,
        },
        _ => None,
    })
}

/// Literal text preceding the first nested call.
fn prefix_text(value: &ChildValue) -> Option<String> {
    match value {
        ChildValue::Text(s) => Some(s.clone()),
        ChildValue::Call(call) => nested_text(call),
        ChildValue::Array(items) => {
            if let [ChildValue::Call(call)] = items.as_slice() {
                return nested_text(call);
            }
            let prefix: String = items
                .iter()
                .map_while(|item| match item {
                    ChildValue::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            (!prefix.trim().is_empty()).then_some(prefix)
        }
        ChildValue::Opaque => None,
    }
}

fn nested_text(call: &NestedCall) -> Option<String> {
    let children = call.children.as_deref()?;
    full_text(children).or_else(|| prefix_text(children))
}

fn locate_heading_calls(code: &str) -> Vec<HeadingCall> {
    let bytes = code.as_bytes();
    HEADING_CALL_RE
        .captures_iter(code)
        .filter_map(|caps| {
            let header = caps.get(0)?;
            let depth = caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()?;
            let open = header.end() - 1;
            let close = find_matching(bytes, open)?;

            let children = find_property(code, open, close, "children")
                .map(|v| parse_value(code, v, close).0);
            let existing_id = find_property(code, open, close, "id")
                .map(|v| match parse_value(code, v, close).0 {
                    ChildValue::Text(id) => id,
                    _ => String::new(),
                });

            Some(HeadingCall {
                offset: header.end(),
                length: header.len(),
                depth,
                children,
                existing_id,
                assigned_slug: None,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONCILIATION
// ═══════════════════════════════════════════════════════════════════════════════

fn match_key(depth: u8, text: &str) -> String {
    format!("{}:{}", depth, text.trim())
}

fn assign_slugs(calls: &mut [HeadingCall], headings: &[HeadingRecord]) {
    let mut claimed = vec![false; headings.len()];

    // Calls that already carry an id keep it and claim the matching record.
    for call in calls.iter().filter(|c| c.existing_id.is_some()) {
        let id = call.existing_id.as_deref().unwrap_or_default();
        if let Some(idx) = (0..headings.len())
            .find(|&i| !claimed[i] && headings[i].depth == call.depth && headings[i].slug == id)
        {
            claimed[idx] = true;
        }
    }

    // Phase 1: exact text, duplicate-aware.
    let mut queues: HashMap<String, VecDeque<usize>> = HashMap::new();
    for (idx, heading) in headings.iter().enumerate() {
        queues
            .entry(match_key(heading.depth, &heading.text))
            .or_default()
            .push_back(idx);
    }

    for call in calls.iter_mut().filter(|c| c.existing_id.is_none()) {
        let Some(text) = call.extracted_text() else {
            continue;
        };
        if let Some(queue) = queues.get_mut(&match_key(call.depth, &text)) {
            while let Some(idx) = queue.pop_front() {
                if !claimed[idx] {
                    claimed[idx] = true;
                    call.assigned_slug = Some(headings[idx].slug.clone());
                    break;
                }
            }
        }
    }

    // Phase 2: prefix or sole-remaining record, for calls without full text.
    for call in calls
        .iter_mut()
        .filter(|c| c.existing_id.is_none() && c.assigned_slug.is_none())
    {
        if call.extracted_text().is_some() {
            continue;
        }
        let unclaimed: Vec<usize> = (0..headings.len())
            .filter(|&i| !claimed[i] && headings[i].depth == call.depth)
            .collect();

        let chosen = match call.literal_prefix() {
            Some(prefix) if !prefix.trim().is_empty() => {
                // Trailing whitespace is part of the prefix: "The " must not
                // match "Theory".
                let prefix = prefix.trim_start();
                unclaimed
                    .iter()
                    .copied()
                    .find(|&i| headings[i].text.trim_start().starts_with(prefix))
            }
            _ if unclaimed.len() == 1 => {
                debug!(
                    depth = call.depth,
                    slug = %headings[unclaimed[0]].slug,
                    "assigning sole unclaimed heading to call without text"
                );
                Some(unclaimed[0])
            }
            _ => None,
        };

        if let Some(idx) = chosen {
            claimed[idx] = true;
            call.assigned_slug = Some(headings[idx].slug.clone());
        }
    }
}

/// Insert `id` fields into heading render calls of generated code.
pub fn inject_heading_ids(code: &str, headings: &[HeadingRecord]) -> String {
    if headings.is_empty() {
        return code.to_string();
    }

    let mut calls = locate_heading_calls(code);
    if calls.is_empty() {
        return code.to_string();
    }
    assign_slugs(&mut calls, headings);

    let unmatched = calls
        .iter()
        .filter(|c| c.existing_id.is_none() && c.assigned_slug.is_none())
        .count();
    if unmatched > 0 {
        debug!(unmatched, total = calls.len(), "heading calls left without id");
    }

    let mut out = String::with_capacity(code.len() + calls.len() * 24);
    let mut cursor = 0;
    for call in &calls {
        let Some(slug) = &call.assigned_slug else {
            continue;
        };
        debug_assert!(call.length <= call.offset);
        out.push_str(&code[cursor..call.offset]);
        out.push_str(" id: ");
        out.push_str(&serde_json::to_string(slug).unwrap_or_else(|_| format!("\"{}\"", slug)));
        out.push(',');
        cursor = call.offset;
    }
    out.push_str(&code[cursor..]);
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
#[napi]
pub fn inject_heading_ids_native(code: String, headings: Vec<HeadingRecord>) -> String {
    inject_heading_ids(&code, &headings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(depth: u8, slug: &str, text: &str) -> HeadingRecord {
        HeadingRecord::new(depth, slug, text)
    }

    #[test]
    fn test_literal_headings() {
        let code = r#"_jsxs(_Fragment, { children: [_jsx(_components.h1, { children: "Test" }), "\n", _jsx(_components.h2, { children: "Subheading" })] })"#;
        let out = inject_heading_ids(code, &[h(1, "test", "Test"), h(2, "subheading", "Subheading")]);
        assert!(out.contains(r#"_jsx(_components.h1, { id: "test", children: "Test" })"#));
        assert!(out.contains(r#"_jsx(_components.h2, { id: "subheading", children: "Subheading" })"#));
    }

    #[test]
    fn test_duplicate_text_assigned_in_order() {
        let code = r#"_jsx(_components.h2, { children: "Second Heading" }); _jsx(_components.h2, { children: "Second Heading" });"#;
        let out = inject_heading_ids(
            code,
            &[
                h(2, "second-heading", "Second Heading"),
                h(2, "second-heading-1", "Second Heading"),
            ],
        );
        let first = out.find(r#"id: "second-heading","#).unwrap();
        let second = out.find(r#"id: "second-heading-1","#).unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_distinct_headings_in_document_order() {
        let texts = ["Alpha", "Beta", "Gamma", "Delta"];
        let code: String = texts
            .iter()
            .map(|t| format!("_jsx(_components.h3, {{ children: \"{}\" }})\n", t))
            .collect();
        let records: Vec<_> = texts
            .iter()
            .map(|t| h(3, &t.to_lowercase(), t))
            .collect();
        let out = inject_heading_ids(&code, &records);
        let positions: Vec<usize> = records
            .iter()
            .map(|r| out.find(&format!("id: \"{}\"", r.slug)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_string_array_and_inline_call() {
        let code = concat!(
            r#"_jsxs(_components.h2, { children: ["Hello", " ", "World"] })"#,
            "\n",
            r#"_jsx(_components.h2, { children: _jsx(_components.strong, { children: "Bold" }) })"#,
        );
        let out = inject_heading_ids(code, &[h(2, "hello-world", "Hello World"), h(2, "bold", "Bold")]);
        assert!(out.contains(r#"_jsxs(_components.h2, { id: "hello-world", children"#));
        assert!(out.contains(r#"_jsx(_components.h2, { id: "bold", children: _jsx"#));
    }

    #[test]
    fn test_prefix_fallback_for_mixed_children() {
        let code = concat!(
            r#"_jsx(_components.h2, { children: "Intro" })"#,
            "\n",
            r#"_jsxs(_components.h2, { children: ["The ", _jsx(_components.code, { children: "render" }), " API"] })"#,
        );
        let out = inject_heading_ids(
            code,
            &[h(2, "intro", "Intro"), h(2, "the-render-api", "The render API")],
        );
        assert!(out.contains(r#"{ id: "the-render-api", children: ["The ""#));
    }

    #[test]
    fn test_prefix_keeps_trailing_space() {
        let code = concat!(
            r#"_jsxs(_components.h2, { children: ["The ", _jsx(_components.code, { children: "x" })] })"#,
            "\n",
            r#"_jsxs(_components.h2, { children: ["Theory ", _jsx(Badge, { text: "y" })] })"#,
        );
        let out = inject_heading_ids(code, &[h(2, "theory-y", "Theory y"), h(2, "the-x", "The x")]);
        assert!(out.contains(r#"{ id: "the-x", children: ["The ""#), "{}", out);
        assert!(out.contains(r#"{ id: "theory-y", children: ["Theory ""#), "{}", out);
    }

    #[test]
    fn test_sole_remaining_record_without_prefix() {
        let code = r#"_jsx(_components.h4, { children: _jsx(Badge, { text: "new" }) })"#;
        let out = inject_heading_ids(code, &[h(4, "whats-new", "What's new")]);
        assert!(out.contains(r#"{ id: "whats-new", children"#));
    }

    #[test]
    fn test_ambiguous_without_prefix_left_alone() {
        let code = r#"_jsx(_components.h4, { children: value })"#;
        let records = [h(4, "one", "One"), h(4, "two", "Two")];
        assert_eq!(inject_heading_ids(code, &records), code);
    }

    #[test]
    fn test_unmatched_text_left_alone() {
        let code = r#"_jsx(_components.h2, { children: "Other" })"#;
        assert_eq!(inject_heading_ids(code, &[h(2, "x", "Something")]), code);
        assert_eq!(inject_heading_ids(code, &[h(3, "other", "Other")]), code);
    }

    #[test]
    fn test_existing_id_is_kept_and_claims_record() {
        let code = concat!(
            r#"_jsx("h2", { id: "custom", children: "Custom" })"#,
            "\n",
            r#"_jsx(_components.h2, { children: _jsx(Icon, {}) })"#,
        );
        let out = inject_heading_ids(code, &[h(2, "custom", "Custom"), h(2, "icon", "Icon")]);
        assert!(out.starts_with(r#"_jsx("h2", { id: "custom", children"#));
        assert_eq!(out.matches("id:").count(), 2);
        assert!(out.contains(r#"_jsx(_components.h2, { id: "icon", children"#));
    }

    #[test]
    fn test_slug_is_json_escaped() {
        let code = r#"_jsx(_components.h1, { children: "Quote \"me\"" })"#;
        let out = inject_heading_ids(code, &[h(1, "quote-\"me\"", "Quote \"me\"")]);
        assert!(out.contains(r#"id: "quote-\"me\"","#));
    }

    #[test]
    fn test_decode_string_escapes() {
        assert_eq!(decode_string(r"a\nb"), "a\nb");
        assert_eq!(decode_string(r"café"), "café");
        assert_eq!(decode_string(r"\u{1F600}!"), "😀!");
        assert_eq!(decode_string(r#"say \"hi\""#), "say \"hi\"");
    }

    #[test]
    fn test_locate_reports_header_extent() {
        let code = r#"x = _jsx(_components.h5, { children: "Five" });"#;
        let calls = locate_heading_calls(code);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].depth, 5);
        assert_eq!(&code[calls[0].offset - calls[0].length..calls[0].offset], r#"_jsx(_components.h5, {"#);
        assert_eq!(calls[0].extracted_text().as_deref(), Some("Five"));
    }
}
