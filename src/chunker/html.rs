//! Tag-aware chunking for HTML documents.
use std::collections::HashMap;

use scraper::{ElementRef, Html, Node};

use super::{Chunk, ChunkError, ChunkKind, Chunker, LineIndex, file_stem, part_name};

const DEFAULT_MAX_SIZE: usize = 4000;
const MAX_DEPTH: usize = 256;

/// Elements with section semantics; each becomes one chunk.
const SECTION_TAGS: [&str; 4] = ["section", "article", "main", "aside"];

/// Elements dropped with their whole subtree before any text is read.
const STRIP_TAGS: [&str; 6] = ["script", "style", "nav", "footer", "header", "noscript"];

/// Elements whose text keeps its original whitespace.
const PRESERVE_TAGS: [&str; 4] = ["pre", "code", "table", "blockquote"];

/// Elements rendered on their own lines.
const BLOCK_TAGS: [&str; 26] = [
    "p", "div", "section", "article", "header", "footer", "nav", "aside", "main", "h1", "h2",
    "h3", "h4", "h5", "h6", "ul", "ol", "li", "table", "tr", "td", "th", "blockquote", "pre",
    "figure", "figcaption",
];

/// Content blocks gathered when a page has no sectioning elements.
const FALLBACK_BLOCK_TAGS: [&str; 14] = [
    "p", "ul", "ol", "dl", "table", "blockquote", "pre", "figure", "h1", "h2", "h3", "h4", "h5",
    "h6",
];

/// Extracts readable text from HTML.
///
/// Sectioning elements (`section`, `article`, `main`, `aside`) become one
/// chunk each and are not searched for nested sections. Pages without them
/// fall back to packing block elements up to `max_size` bytes, then to the
/// whole document text, then to no chunks at all.
#[derive(Debug, Clone)]
pub struct HtmlChunker {
    max_size: usize,
}

impl HtmlChunker {
    /// A `max_size` of zero selects the default of 4000 bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
        }
    }
}

impl Default for HtmlChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

/// Best-effort mapping from elements back to source lines. Tags are searched
/// in document order. Once an element is located the cursor moves past its
/// matching close tag, so openings nested inside it never shadow a later
/// sibling.
struct SourceLocator {
    lowered: String,
    lines: LineIndex,
    cursor: usize,
}

impl SourceLocator {
    fn new(source: &str) -> Self {
        Self {
            lowered: source.to_ascii_lowercase(),
            lines: LineIndex::new(source),
            cursor: 0,
        }
    }

    /// 1-based line of the next `<tag` opening at or after the cursor.
    fn locate(&mut self, tag: &str) -> Option<usize> {
        let open = format!("<{tag}");
        let at = self.find_tag(&open, self.cursor)?;
        self.cursor = self.close_of(tag, at + open.len());
        Some(self.lines.line_of(at) + 1)
    }

    /// Offset of the next `needle` at or after `from` that is followed by a
    /// tag-name boundary, so `<p` never matches `<pre`.
    fn find_tag(&self, needle: &str, mut from: usize) -> Option<usize> {
        while let Some(rel) = self.lowered.get(from..)?.find(needle) {
            let at = from + rel;
            let after = self.lowered.as_bytes().get(at + needle.len()).copied();
            if matches!(after, None | Some(b'>' | b'/' | b' ' | b'\t' | b'\n' | b'\r')) {
                return Some(at);
            }
            from = at + needle.len();
        }
        None
    }

    /// Offset just past the close tag matching an opening whose name ends at
    /// `from`. An element that is never closed leaves the offset at `from`.
    fn close_of(&self, tag: &str, from: usize) -> usize {
        let open = format!("<{tag}");
        let close = format!("</{tag}");
        let mut depth = 1usize;
        let mut pos = from;
        while let Some(close_at) = self.find_tag(&close, pos) {
            match self.find_tag(&open, pos) {
                Some(open_at) if open_at < close_at => {
                    depth += 1;
                    pos = open_at + open.len();
                }
                _ => {
                    depth -= 1;
                    pos = close_at + close.len();
                    if depth == 0 {
                        return pos;
                    }
                }
            }
        }
        from
    }
}

struct Section {
    name: String,
    text: String,
    start_line: usize,
    end_line: usize,
}

/// A fallback content block with its approximate line span.
struct Block {
    text: String,
    start_line: usize,
    end_line: usize,
}

fn collapse_whitespace(text: &str, out: &mut String) {
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
}

/// Appends the readable text of `el` and its descendants to `out`.
fn extract_text(el: ElementRef<'_>, preserve: bool, depth: usize, out: &mut String) {
    if depth > MAX_DEPTH {
        return;
    }
    let tag = el.value().name();
    if STRIP_TAGS.contains(&tag) {
        return;
    }
    let preserve = preserve || PRESERVE_TAGS.contains(&tag);
    let block = BLOCK_TAGS.contains(&tag);
    if block && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if tag == "br" {
        out.push('\n');
    }
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                if preserve {
                    out.push_str(text);
                } else {
                    collapse_whitespace(text, out);
                }
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    extract_text(child_el, preserve, depth + 1, out);
                }
            }
            _ => {}
        }
    }
    if block {
        out.push('\n');
    }
}

/// Trims line ends and keeps at most one blank line between paragraphs.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.split('\n') {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn text_of(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    extract_text(el, false, 0, &mut raw);
    normalize(&raw)
}

fn span_of(el: ElementRef<'_>, tag: &str, locator: &mut SourceLocator) -> (usize, usize) {
    let start = locator.locate(tag).unwrap_or(1);
    (start, start + el.html().matches('\n').count())
}

fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children().filter_map(ElementRef::wrap)
}

impl HtmlChunker {
    fn collect_sections(
        &self,
        el: ElementRef<'_>,
        depth: usize,
        divs: &mut Vec<&'static str>,
        stem: &str,
        locator: &mut SourceLocator,
        out: &mut Vec<Section>,
    ) {
        if depth > MAX_DEPTH {
            return;
        }
        let tag = el.value().name();
        if STRIP_TAGS.contains(&tag) {
            locator.locate(tag);
            return;
        }
        if let Some(section_tag) = SECTION_TAGS.iter().find(|t| **t == tag) {
            let (start_line, end_line) = span_of(el, section_tag, locator);
            let text = text_of(el);
            if !text.is_empty() {
                let mut parts = vec![stem];
                parts.extend(divs.iter().copied());
                parts.push(*section_tag);
                out.push(Section {
                    name: parts.join(" > "),
                    text,
                    start_line,
                    end_line,
                });
            }
            return;
        }

        let is_div = tag == "div";
        if is_div {
            divs.push("div");
        }
        for child in child_elements(el) {
            self.collect_sections(child, depth + 1, divs, stem, locator, out);
        }
        if is_div {
            divs.pop();
        }
    }

    fn collect_blocks(
        &self,
        el: ElementRef<'_>,
        depth: usize,
        locator: &mut SourceLocator,
        out: &mut Vec<Block>,
    ) {
        if depth > MAX_DEPTH {
            return;
        }
        let tag = el.value().name();
        if STRIP_TAGS.contains(&tag) {
            locator.locate(tag);
            return;
        }
        if let Some(block_tag) = FALLBACK_BLOCK_TAGS.iter().find(|t| **t == tag) {
            let (start_line, end_line) = span_of(el, block_tag, locator);
            let text = text_of(el);
            if !text.is_empty() {
                out.push(Block {
                    text,
                    start_line,
                    end_line,
                });
            }
            return;
        }
        for child in child_elements(el) {
            self.collect_blocks(child, depth + 1, locator, out);
        }
    }

    /// Greedily packs consecutive blocks into chunks of at most `max_size`
    /// bytes; a single larger block stands alone.
    fn pack_blocks(&self, path: &str, stem: &str, blocks: Vec<Block>) -> Vec<Chunk> {
        let base = format!("{stem} > blocks");
        let mut chunks = Vec::new();
        let mut group: Vec<Block> = Vec::new();
        let mut size = 0;

        let flush = |group: &mut Vec<Block>, chunks: &mut Vec<Chunk>| {
            if group.is_empty() {
                return;
            }
            let text = group
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let start = group.first().map_or(1, |b| b.start_line);
            let end = group.last().map_or(start, |b| b.end_line);
            let part = chunks.len() + 1;
            chunks.push(Chunk::new(path, ChunkKind::File, part_name(&base, part), text, start, end, "html"));
            group.clear();
        };

        for block in blocks {
            let separator = if group.is_empty() { 0 } else { 2 };
            if !group.is_empty() && size + separator + block.text.len() > self.max_size {
                flush(&mut group, &mut chunks);
                size = 0;
            }
            size += block.text.len() + if group.is_empty() { 0 } else { 2 };
            group.push(block);
        }
        flush(&mut group, &mut chunks);
        chunks
    }
}

impl Chunker for HtmlChunker {
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        if path.is_empty() {
            return Err(ChunkError::EmptyPath);
        }
        if content.is_empty() {
            return Ok(Vec::new());
        }

        let source = String::from_utf8_lossy(content);
        let document = Html::parse_document(&source);
        let root = document.root_element();
        let stem = file_stem(path);

        let mut locator = SourceLocator::new(&source);
        let mut sections = Vec::new();
        self.collect_sections(root, 0, &mut Vec::new(), &stem, &mut locator, &mut sections);

        if !sections.is_empty() {
            let mut occurrences: HashMap<String, usize> = HashMap::new();
            return Ok(sections
                .into_iter()
                .map(|s| {
                    let seen = occurrences.entry(s.name.clone()).or_insert(0);
                    *seen += 1;
                    let name = if *seen == 1 {
                        s.name
                    } else {
                        format!("{} ({})", s.name, seen)
                    };
                    Chunk::new(path, ChunkKind::File, name, s.text, s.start_line, s.end_line, "html")
                })
                .collect());
        }

        let mut locator = SourceLocator::new(&source);
        let mut blocks = Vec::new();
        self.collect_blocks(root, 0, &mut locator, &mut blocks);
        if !blocks.is_empty() {
            return Ok(self.pack_blocks(path, &stem, blocks));
        }

        let text = text_of(root);
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let end_line = text.matches('\n').count() + 1;
        Ok(vec![Chunk::new(path, ChunkKind::File, stem.as_str(), text, 1, end_line, "html")])
    }

    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["html", "htm"]
    }
}
