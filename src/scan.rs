//! Line Scanning Primitives
//!
//! Shared by the classifier and the directive rewriter: frontmatter
//! detection, block-quote/indent prefix splitting, and a single-pass fence
//! tracker that remembers the marker character and run length of the open
//! fence so that nested and block-quoted fences resolve correctly.

const BOM: char = '\u{feff}';

/// A leading `---` delimited frontmatter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontmatter<'a> {
    /// Text between the delimiter lines (without the delimiters).
    pub content: &'a str,
    /// Byte offset in the original source where the document body begins.
    pub body_start: usize,
}

/// Locate the frontmatter block at the very start of `source`.
///
/// Unterminated frontmatter is not a frontmatter block.
pub fn find_frontmatter(source: &str) -> Option<Frontmatter<'_>> {
    let bom_len = if source.starts_with(BOM) { BOM.len_utf8() } else { 0 };
    let text = &source[bom_len..];

    let mut lines = text.split_inclusive('\n');
    let first = lines.next()?;
    if first.trim_end() != "---" {
        return None;
    }

    let content_start = bom_len + first.len();
    let mut offset = content_start;
    for line in lines {
        if line.trim_end() == "---" {
            return Some(Frontmatter {
                content: &source[content_start..offset],
                body_start: offset + line.len(),
            });
        }
        offset += line.len();
    }
    None
}

/// Returns the document body with any leading frontmatter removed.
pub fn strip_frontmatter(source: &str) -> &str {
    match find_frontmatter(source) {
        Some(fm) => &source[fm.body_start..],
        None => source,
    }
}

/// Split a line into its structural prefix (leading whitespace and block-quote
/// markers, including the whitespace between markers) and the remainder.
pub fn split_line_prefix(line: &str) -> (&str, &str) {
    let bytes = line.as_bytes();
    let mut end = 0;
    while end < bytes.len() && matches!(bytes[end], b' ' | b'\t' | b'>') {
        end += 1;
    }
    line.split_at(end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenFence {
    marker: u8,
    len: usize,
}

/// How a line relates to fenced code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceLine {
    /// Not fenced.
    Outside,
    /// This line opens a fence.
    Open,
    /// Inside an open fence.
    Inside,
    /// This line closes the open fence.
    Close,
}

impl FenceLine {
    /// True for every line that belongs to a fence, delimiters included.
    pub fn is_fenced(self) -> bool {
        self != FenceLine::Outside
    }
}

/// Tracks fenced code regions across lines.
#[derive(Debug, Default)]
pub struct FenceTracker {
    open: Option<OpenFence>,
}

impl FenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_fence(&self) -> bool {
        self.open.is_some()
    }

    /// Feed the prefix-stripped remainder of the next line.
    pub fn observe(&mut self, remainder: &str) -> FenceLine {
        let run = fence_run(remainder);
        match self.open {
            Some(open) => {
                if let Some((marker, len)) = run {
                    let rest = &remainder[len..];
                    if marker == open.marker && len >= open.len && rest.trim().is_empty() {
                        self.open = None;
                        return FenceLine::Close;
                    }
                }
                FenceLine::Inside
            }
            None => match run {
                Some((marker, len)) => {
                    // A backtick fence's info string may not contain backticks.
                    if marker == b'`' && remainder[len..].contains('`') {
                        return FenceLine::Outside;
                    }
                    self.open = Some(OpenFence { marker, len });
                    FenceLine::Open
                }
                None => FenceLine::Outside,
            },
        }
    }
}

fn fence_run(remainder: &str) -> Option<(u8, usize)> {
    let bytes = remainder.as_bytes();
    let marker = *bytes.first()?;
    if marker != b'`' && marker != b'~' {
        return None;
    }
    let len = bytes.iter().take_while(|&&b| b == marker).count();
    (len >= 3).then_some((marker, len))
}

/// Blank out every fenced line (delimiters included) while keeping line
/// structure intact.
pub fn strip_code_fences(text: &str) -> String {
    let mut tracker = FenceTracker::new();
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (_, remainder) = split_line_prefix(line);
        if tracker.observe(remainder).is_fenced() {
            if line.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(line);
        }
    }
    out
}
