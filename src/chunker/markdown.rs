//! Header-based structural chunking for markdown.
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::{Chunk, ChunkError, ChunkKind, Chunker, file_stem, floor_char_boundary, part_name};

const DEFAULT_MAX_SIZE: usize = 4000;

/// ATX header; up to three spaces of indentation, four make a code block.
static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.+)$").expect("valid header regex"));

/// Splits markdown at header boundaries, naming each section after its
/// header path (`"guide > Install > Linux"`).
///
/// Fenced code blocks never open a new section, a leading front-matter block
/// becomes its own chunk, and sections over `max_size` bytes are split at line
/// boundaries.
#[derive(Debug, Clone)]
pub struct MarkdownChunker {
    max_size: usize,
}

impl MarkdownChunker {
    /// A `max_size` of zero selects the default of 4000 bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
        }
    }
}

impl Default for MarkdownChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

struct Section {
    hierarchy: Vec<String>,
    content: String,
    start_line: usize,
    end_line: usize,
}

/// Tracks an open code fence: its character and run length.
#[derive(Debug, Clone, Copy, Default)]
struct Fence {
    open: Option<(char, usize)>,
}

impl Fence {
    /// Feed one line; returns whether the line belongs to a fenced block.
    fn observe(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start_matches([' ', '\t']);
        match self.open {
            None => {
                if let Some(marker) = fence_marker(trimmed) {
                    self.open = Some(marker);
                    return true;
                }
                false
            }
            Some((ch, len)) => {
                let count = trimmed.chars().take_while(|c| *c == ch).count();
                if count >= len && trimmed[count..].trim().is_empty() {
                    self.open = None;
                }
                true
            }
        }
    }
}

fn fence_marker(trimmed: &str) -> Option<(char, usize)> {
    for ch in ['`', '~'] {
        let count = trimmed.chars().take_while(|c| *c == ch).count();
        if count >= 3 {
            return Some((ch, count));
        }
    }
    None
}

/// Removes an optional closing run of `#` (`"Title ##"` becomes `"Title"`).
fn strip_closing_hashes(title: &str) -> &str {
    title
        .trim_end_matches([' ', '\t'])
        .trim_end_matches('#')
        .trim_end_matches([' ', '\t'])
}

/// Leading front matter: returns its body and the number of lines it spans,
/// delimiters included. Requires a closing `---` or `...` line.
fn front_matter(lines: &[&str]) -> Option<(String, usize)> {
    if lines.len() < 2 || lines[0].trim() != "---" {
        return None;
    }
    for (i, line) in lines.iter().enumerate().skip(1) {
        let trimmed = line.trim();
        if trimmed == "---" || trimmed == "..." {
            let body = lines[1..i].join("\n");
            return Some((body.trim_end_matches('\n').to_string(), i + 1));
        }
    }
    None
}

impl MarkdownChunker {
    fn section_name(stem: &str, section: &Section) -> String {
        if section.hierarchy.is_empty() {
            return format!("{stem}:preamble");
        }
        let mut parts = Vec::with_capacity(section.hierarchy.len() + 1);
        parts.push(stem);
        parts.extend(section.hierarchy.iter().map(String::as_str));
        parts.join(" > ")
    }

    fn section_chunks(&self, path: &str, stem: &str, section: &Section) -> Vec<Chunk> {
        let content = section.content.trim_end_matches('\n');
        if content.is_empty() {
            return Vec::new();
        }
        let base = Self::section_name(stem, section);
        let make = |part: usize, body: &str, start: usize, end: usize| {
            Chunk::new(path, ChunkKind::File, part_name(&base, part), body, start, end, "markdown")
        };

        if content.len() <= self.max_size {
            return vec![make(1, content, section.start_line, section.end_line)];
        }

        let mut chunks = Vec::new();
        let mut part = 1;
        let mut buf = String::new();
        let mut buf_start = section.start_line;

        for (i, line) in content.split('\n').enumerate() {
            let line_no = section.start_line + i;

            if line.len() > self.max_size {
                warn!(
                    file = path,
                    line = line_no,
                    length = line.len(),
                    "oversized line, splitting at word boundaries"
                );
                if !buf.is_empty() {
                    chunks.push(make(part, buf.trim_end_matches('\n'), buf_start, line_no - 1));
                    buf.clear();
                    part += 1;
                }
                for piece in self.split_long_line(line) {
                    chunks.push(make(part, piece, line_no, line_no));
                    part += 1;
                }
                buf_start = line_no + 1;
                continue;
            }

            if !buf.is_empty() && buf.len() + line.len() + 1 > self.max_size {
                chunks.push(make(part, buf.trim_end_matches('\n'), buf_start, line_no - 1));
                buf.clear();
                buf_start = line_no;
                part += 1;
            }
            buf.push_str(line);
            buf.push('\n');
        }

        if !buf.is_empty() {
            chunks.push(make(part, buf.trim_end_matches('\n'), buf_start, section.end_line));
        }
        chunks
    }

    /// Breaks a single overlong line, preferring the last space in the back
    /// half of the window and falling back to a hard cut.
    fn split_long_line<'a>(&self, line: &'a str) -> Vec<&'a str> {
        let mut parts = Vec::new();
        let mut rest = line;
        while rest.len() > self.max_size {
            let limit = floor_char_boundary(rest, self.max_size);
            let window = &rest[..limit];
            let cut = match window.rfind(' ') {
                Some(idx) if idx > self.max_size / 2 => idx,
                _ => limit.max(1),
            };
            let cut = if rest.is_char_boundary(cut) {
                cut
            } else {
                // max_size smaller than one character
                rest.char_indices().nth(1).map_or(rest.len(), |(i, _)| i)
            };
            parts.push(rest[..cut].trim_end_matches(' '));
            rest = rest[cut..].trim_start_matches(' ');
        }
        if !rest.is_empty() {
            parts.push(rest);
        }
        parts
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        if path.is_empty() {
            return Err(ChunkError::EmptyPath);
        }
        if content.is_empty() {
            return Ok(Vec::new());
        }

        let text = String::from_utf8_lossy(content);
        let lines: Vec<&str> = text.split('\n').collect();
        let stem = file_stem(path);

        let mut chunks = Vec::new();
        let mut first_line = 0;
        if let Some((body, consumed)) = front_matter(&lines) {
            chunks.push(Chunk::new(
                path,
                ChunkKind::File,
                format!("{stem}:frontmatter"),
                body,
                1,
                consumed,
                "yaml",
            ));
            first_line = consumed;
        }

        let mut fence = Fence::default();
        let mut stack: Vec<String> = Vec::new();
        let mut current: Option<Section> = None;

        for (i, line) in lines.iter().enumerate().skip(first_line) {
            let line_no = i + 1;
            let in_fence = fence.observe(line);

            if !in_fence && line.trim_start_matches([' ', '\t']).starts_with('#') {
                if let Some(caps) = HEADER_RE.captures(line) {
                    if let Some(mut done) = current.take() {
                        done.end_line = line_no - 1;
                        chunks.extend(self.section_chunks(path, &stem, &done));
                    }
                    let level = caps[1].len();
                    let title = strip_closing_hashes(caps[2].trim()).to_string();
                    stack.truncate(level.saturating_sub(1).min(stack.len()));
                    stack.push(title);

                    current = Some(Section {
                        hierarchy: stack.clone(),
                        content: format!("{line}\n"),
                        start_line: line_no,
                        end_line: line_no,
                    });
                    continue;
                }
            }

            let section = current.get_or_insert_with(|| Section {
                hierarchy: Vec::new(),
                content: String::new(),
                start_line: line_no,
                end_line: line_no,
            });
            section.content.push_str(line);
            section.content.push('\n');
        }

        if let Some(mut done) = current.take() {
            done.end_line = lines.len();
            chunks.extend(self.section_chunks(path, &stem, &done));
        }
        Ok(chunks)
    }

    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["md", "markdown"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_header_hierarchy_pops_same_or_shallower() {
        let chunker = MarkdownChunker::default();
        let src = "# A\n\ntext\n\n## B\n\ntext\n\n# C\n";
        let chunks = chunker.chunk("doc.md", src.as_bytes()).unwrap();
        assert_eq!(names(&chunks), vec!["doc > A", "doc > A > B", "doc > C"]);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 4);
        assert_eq!(chunks[1].start_line, 5);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::File));
    }

    #[test]
    fn test_skipped_levels_keep_parent() {
        let chunker = MarkdownChunker::default();
        let src = "# A\n### Deep\n## B\n";
        let chunks = chunker.chunk("doc.md", src.as_bytes()).unwrap();
        assert_eq!(names(&chunks), vec!["doc > A", "doc > A > Deep", "doc > A > B"]);
    }

    #[test]
    fn test_headers_indented_up_to_three_spaces() {
        let chunker = MarkdownChunker::default();
        let src = "# A\n   ## B\nbody\n    # code, not a header\n";
        let chunks = chunker.chunk("doc.md", src.as_bytes()).unwrap();
        assert_eq!(names(&chunks), vec!["doc > A", "doc > A > B"]);
        assert_eq!(chunks[1].start_line, 2);
        assert!(chunks[1].content.contains("# code, not a header"));
    }

    #[test]
    fn test_fenced_headers_are_ignored() {
        let chunker = MarkdownChunker::default();
        let src = "# Real\n\n````markdown\n# Fake\n```\n## Still fake\n````\n\n## Sub\n";
        let chunks = chunker.chunk("notes.md", src.as_bytes()).unwrap();
        assert_eq!(names(&chunks), vec!["notes > Real", "notes > Real > Sub"]);
        assert!(chunks[0].content.contains("# Fake"));
        assert!(chunks[0].content.contains("## Still fake"));
    }

    #[test]
    fn test_tilde_fence_not_closed_by_backticks() {
        let chunker = MarkdownChunker::default();
        let src = "# A\n~~~\n```\n# inside\n~~~\n# B\n";
        let chunks = chunker.chunk("x.md", src.as_bytes()).unwrap();
        assert_eq!(names(&chunks), vec!["x > A", "x > B"]);
    }

    #[test]
    fn test_front_matter_and_preamble() {
        let chunker = MarkdownChunker::default();
        let src = "---\ntitle: Hi\ntags: [a]\n---\nIntro line\n\n# Title ##\nBody\n";
        let chunks = chunker.chunk("post.md", src.as_bytes()).unwrap();
        assert_eq!(
            names(&chunks),
            vec!["post:frontmatter", "post:preamble", "post > Title"]
        );
        assert_eq!(chunks[0].content, "title: Hi\ntags: [a]");
        assert_eq!(chunks[0].language, "yaml");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 4));
        assert_eq!(chunks[1].start_line, 5);
        assert_eq!(chunks[2].start_line, 7);
    }

    #[test]
    fn test_front_matter_dot_closer_and_unclosed() {
        let chunker = MarkdownChunker::default();
        let closed = chunker.chunk("a.md", b"---\nk: v\n...\n# H\n").unwrap();
        assert_eq!(closed[0].name, "a:frontmatter");

        let unclosed = chunker.chunk("a.md", b"---\nk: v\n# H\n").unwrap();
        assert!(unclosed.iter().all(|c| c.name != "a:frontmatter"));
    }

    #[test]
    fn test_large_section_split_into_parts() {
        let chunker = MarkdownChunker::new(60);
        let mut src = String::from("# Big\n");
        for i in 0..10 {
            src.push_str(&format!("line number {i} with some words\n"));
        }
        let chunks = chunker.chunk("big.md", src.as_bytes()).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].name, "big > Big");
        assert_eq!(chunks[1].name, "big > Big (part 2)");
        for c in &chunks {
            assert!(c.content.len() <= 60, "chunk too large: {}", c.content.len());
        }
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line > pair[0].end_line);
        }
    }

    #[test]
    fn test_long_line_split_at_words() {
        let chunker = MarkdownChunker::new(20);
        let src = "# T\nalpha beta gamma delta epsilon zeta eta theta\n";
        let chunks = chunker.chunk("t.md", src.as_bytes()).unwrap();
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.content.len() <= 20);
            assert!(!c.content.starts_with(' '));
        }
    }

    #[test]
    fn test_empty_input_and_path() {
        let chunker = MarkdownChunker::default();
        assert!(chunker.chunk("a.md", b"").unwrap().is_empty());
        assert!(matches!(chunker.chunk("", b"# A"), Err(ChunkError::EmptyPath)));
    }

    #[test]
    fn test_deterministic() {
        let chunker = MarkdownChunker::default();
        let src = b"# A\ntext\n## B\nmore\n";
        let a = chunker.chunk("d.md", src).unwrap();
        let b = chunker.chunk("d.md", src).unwrap();
        assert_eq!(a, b);
    }
}
