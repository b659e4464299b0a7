//! Regex-driven chunking for JavaScript and TypeScript.
//!
//! There is no embedded parser for these languages, so declarations are found
//! with line-anchored patterns and their extent is estimated by counting
//! braces. Each construct kind is scanned in its own pass with its own set of
//! seen names: a name matched by two passes (say a function and a class) yields
//! two chunks, and that overlap is kept as-is.
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{Chunk, ChunkError, ChunkKind, Chunker, LineIndex, extension};

const DEFAULT_MAX_SIZE: usize = 1500;
const TRUNCATION_MARKER: &str = "\n// ... truncated";

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:export\s+(?:default\s+)?)?(?:async\s+)?function\s+(\w+)\s*\([^)]*\)")
        .expect("valid function regex")
});

static BOUND_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:export\s+)?(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s+)?(?:\([^)]*\)|[^=])\s*(?:=>|function)",
    )
    .expect("valid bound function regex")
});

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:export\s+(?:default\s+)?)?(?:abstract\s+)?class\s+(\w+)")
        .expect("valid class regex")
});

static INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:export\s+)?interface\s+(\w+)").expect("valid interface regex")
});

static TYPE_ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:export\s+)?type\s+(\w+)\s*=").expect("valid type alias regex")
});

/// How far a matched construct extends.
#[derive(Debug, Clone, Copy)]
enum Extent {
    /// Up to the line closing the first opened brace.
    Block,
    /// Up to a `;` or the line before the next top-level declaration.
    Statement,
}

/// How the one-line signature is derived.
#[derive(Debug, Clone, Copy)]
enum Signature {
    FirstLine,
    Keyword(&'static str),
}

struct Pass {
    pattern: &'static LazyLock<Regex>,
    kind: ChunkKind,
    extent: Extent,
    signature: Signature,
}

static PASSES: [Pass; 5] = [
    Pass {
        pattern: &FUNCTION_RE,
        kind: ChunkKind::Function,
        extent: Extent::Block,
        signature: Signature::FirstLine,
    },
    Pass {
        pattern: &BOUND_FUNCTION_RE,
        kind: ChunkKind::Function,
        extent: Extent::Block,
        signature: Signature::FirstLine,
    },
    Pass {
        pattern: &CLASS_RE,
        kind: ChunkKind::Struct,
        extent: Extent::Block,
        signature: Signature::Keyword("class"),
    },
    Pass {
        pattern: &INTERFACE_RE,
        kind: ChunkKind::Interface,
        extent: Extent::Block,
        signature: Signature::Keyword("interface"),
    },
    Pass {
        pattern: &TYPE_ALIAS_RE,
        kind: ChunkKind::Struct,
        extent: Extent::Statement,
        signature: Signature::Keyword("type"),
    },
];

const DECLARATION_PREFIXES: [&str; 8] = [
    "type ",
    "interface ",
    "class ",
    "function ",
    "const ",
    "let ",
    "var ",
    "export ",
];

/// Heuristic chunker for `js`, `jsx`, `ts`, `tsx`, `mjs` and `cjs`.
#[derive(Debug, Clone)]
pub struct PatternChunker {
    max_size: usize,
}

impl PatternChunker {
    /// A `max_size` of zero selects the default of 1500 bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
        }
    }
}

impl Default for PatternChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

/// Joins lines `start..=end` (0-based), truncating at a line boundary past
/// the half-way mark when over `max_size` and appending a marker.
pub(super) fn extract_lines(lines: &[&str], start: usize, end: usize, max_size: usize) -> String {
    let end = end.min(lines.len().saturating_sub(1));
    if start > end {
        return String::new();
    }
    let content = lines[start..=end].join("\n");
    if content.len() <= max_size {
        return content;
    }
    let mut cut = super::floor_char_boundary(&content, max_size);
    if let Some(nl) = content[..cut].rfind('\n') {
        if nl > max_size / 2 {
            cut = nl;
        }
    }
    format!("{}{TRUNCATION_MARKER}", &content[..cut])
}

/// 1-based line number of the line containing the last brace that closes
/// the first opened block, scanning from `start`. A declaration with no
/// braces ends on its own line.
pub(super) fn block_end(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i64;
    let mut opened = false;
    for (i, line) in lines.iter().enumerate().skip(start) {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => {
                    depth -= 1;
                    if opened && depth == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            }
        }
    }
    if opened { lines.len() } else { start + 1 }
}

/// 1-based line number where a single-statement construct ends.
fn statement_end(lines: &[&str], start: usize) -> usize {
    for (i, line) in lines.iter().enumerate().skip(start) {
        let trimmed = line.trim();
        if trimmed.contains(';') {
            return i + 1;
        }
        if i > start && DECLARATION_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            return i;
        }
    }
    lines.len()
}

pub(super) fn first_line_signature(line: &str) -> String {
    line.trim().trim_end_matches('{').trim().to_string()
}

impl Chunker for PatternChunker {
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        if content.is_empty() {
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(content);
        let lines: Vec<&str> = text.split('\n').collect();
        let index = LineIndex::new(&text);
        let language = extension(path).unwrap_or_default();

        let mut chunks = Vec::new();
        for pass in &PASSES {
            let mut seen: HashSet<&str> = HashSet::new();
            for caps in pass.pattern.captures_iter(&text) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                if !seen.insert(name.as_str()) {
                    continue;
                }
                let start_idx = index.line_of(whole.start());
                let end_line = match pass.extent {
                    Extent::Block => block_end(&lines, start_idx),
                    Extent::Statement => statement_end(&lines, start_idx),
                };
                let signature = match pass.signature {
                    Signature::FirstLine => first_line_signature(lines[start_idx]),
                    Signature::Keyword(kw) => format!("{kw} {}", name.as_str()),
                };
                let body = extract_lines(&lines, start_idx, end_line.saturating_sub(1), self.max_size);
                chunks.push(
                    Chunk::new(
                        path,
                        pass.kind,
                        name.as_str(),
                        body,
                        start_idx + 1,
                        end_line,
                        &language,
                    )
                    .with_signature(signature),
                );
            }
        }
        Ok(chunks)
    }

    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["js", "jsx", "ts", "tsx", "mjs", "cjs"]
    }
}
