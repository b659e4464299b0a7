//! Tree-sitter backed chunking for Go, Rust and Python.
use std::collections::{HashMap, HashSet};

use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator};

use super::languages::LanguageConfig;
use super::{Chunk, ChunkError, ChunkKind, Chunker, extension};

/// Emits one chunk per top-level function, method and type declaration.
///
/// A chunk starts at its leading doc comment (and attributes or decorators)
/// when present. Any syntax error in the tree fails the whole file.
pub struct SyntaxTreeChunker {
    queries: HashMap<&'static str, Query>,
}

impl SyntaxTreeChunker {
    pub fn new() -> Result<Self, ChunkError> {
        let mut queries = HashMap::new();
        for config in LanguageConfig::get_all() {
            let query = Query::new(&config.language, config.query)
                .map_err(|e| ChunkError::Setup(format!("{} query: {e}", config.name)))?;
            queries.insert(config.name, query);
        }
        Ok(Self { queries })
    }

    /// Chunk `source` as the named language.
    pub fn chunk_source(
        &self,
        path: &str,
        source: &[u8],
        lang: &str,
    ) -> Result<Vec<Chunk>, ChunkError> {
        let config = LanguageConfig::get_by_name(lang)
            .ok_or_else(|| ChunkError::UnsupportedLanguage(path.to_string()))?;
        let query = self
            .queries
            .get(config.name)
            .ok_or_else(|| ChunkError::UnsupportedLanguage(path.to_string()))?;

        let mut parser = Parser::new();
        parser
            .set_language(&config.language)
            .map_err(|e| ChunkError::Setup(e.to_string()))?;
        let tree = parser.parse(source, None).ok_or_else(|| ChunkError::Parse {
            path: path.to_string(),
            reason: "parser produced no tree".to_string(),
        })?;

        let root = tree.root_node();
        if root.has_error() {
            let reason = first_error(root)
                .map(|n| format!("syntax error at line {}", n.start_position().row + 1))
                .unwrap_or_else(|| "syntax error".to_string());
            return Err(ChunkError::Parse {
                path: path.to_string(),
                reason,
            });
        }

        self.extract(path, root, source, config.name, query)
    }

    fn extract(
        &self,
        path: &str,
        root: Node,
        source: &[u8],
        lang: &'static str,
        query: &Query,
    ) -> Result<Vec<Chunk>, ChunkError> {
        let mut cursor = QueryCursor::new();
        let mut chunks = Vec::new();
        let mut seen = HashSet::new();

        let mut matches = cursor.matches(query, root, source);
        while let Some(m) = matches.next() {
            let mut decl = None;
            let mut capture = "";
            let mut name = String::new();

            for cap in m.captures {
                let capture_name = query.capture_names()[cap.index as usize];
                if capture_name == "name" {
                    name = node_text(cap.node, source);
                } else {
                    decl = Some(cap.node);
                    capture = capture_name;
                }
            }

            let Some(node) = decl else {
                continue;
            };
            let Some(found) = classify(lang, capture, node, name, source) else {
                continue;
            };
            if found.anchor.parent().map(|p| p.id()) != Some(root.id()) {
                continue;
            }
            if !seen.insert((node.start_byte(), node.end_byte())) {
                continue;
            }

            let start = leading_docs_start(lang, found.span_start);
            let content = String::from_utf8_lossy(&source[start.start_byte()..node.end_byte()]);
            let signature = found
                .signature
                .unwrap_or_else(|| extract_signature(&node_text(node, source), lang));

            chunks.push(
                Chunk::new(
                    path,
                    found.kind,
                    found.name,
                    content.into_owned(),
                    start.start_position().row + 1,
                    node.end_position().row + 1,
                    lang,
                )
                .with_signature(signature),
            );
        }

        chunks.sort_by(|a, b| a.start_line.cmp(&b.start_line).then(a.name.cmp(&b.name)));
        Ok(chunks)
    }
}

impl Chunker for SyntaxTreeChunker {
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        if path.is_empty() {
            return Err(ChunkError::EmptyPath);
        }
        let ext = extension(path).unwrap_or_default();
        let config = LanguageConfig::get_by_extension(&ext)
            .ok_or_else(|| ChunkError::UnsupportedLanguage(path.to_string()))?;
        self.chunk_source(path, content, config.name)
    }

    fn supported_extensions(&self) -> Vec<&'static str> {
        LanguageConfig::get_all()
            .iter()
            .flat_map(|c| c.extensions.iter().copied())
            .collect()
    }
}

/// A declaration accepted for chunking.
struct Declaration<'tree> {
    kind: ChunkKind,
    name: String,
    /// Statement that must sit directly under the root.
    anchor: Node<'tree>,
    /// Where the chunk starts before doc comments are considered.
    span_start: Node<'tree>,
    signature: Option<String>,
}

fn classify<'tree>(
    lang: &str,
    capture: &str,
    node: Node<'tree>,
    name: String,
    source: &[u8],
) -> Option<Declaration<'tree>> {
    let simple = |kind| Declaration {
        kind,
        name: name.clone(),
        anchor: node,
        span_start: node,
        signature: None,
    };

    match (lang, capture) {
        ("go", "function") => Some(simple(ChunkKind::Function)),
        ("go", "method") => Some(simple(ChunkKind::Method)),
        ("go", "type") => {
            let decl = node.parent().filter(|p| p.kind() == "type_declaration")?;
            let kind = match node.child_by_field_name("type").map(|t| t.kind()) {
                Some("interface_type") => ChunkKind::Interface,
                _ => ChunkKind::Struct,
            };
            // A lone `type_spec` owns the `type` keyword and the declaration's doc.
            let span_start = if decl.named_child_count() == 1 { decl } else { node };
            Some(Declaration {
                kind,
                signature: Some(format!("type {name}")),
                name,
                anchor: decl,
                span_start,
            })
        }
        ("rust", "function") => {
            let impl_item = node
                .parent()
                .filter(|p| p.kind() == "declaration_list")
                .and_then(|p| p.parent());
            match impl_item {
                Some(item) if item.kind() == "impl_item" => {
                    let owner = item
                        .child_by_field_name("type")
                        .map(|t| node_text(t, source))
                        .unwrap_or_default();
                    let owner = owner.split('<').next().unwrap_or_default().trim().to_string();
                    Some(Declaration {
                        kind: ChunkKind::Method,
                        name: format!("{owner}::{name}"),
                        anchor: item,
                        span_start: node,
                        signature: None,
                    })
                }
                Some(_) => None,
                None => Some(simple(ChunkKind::Function)),
            }
        }
        ("rust", "struct") => Some(simple(ChunkKind::Struct)),
        ("rust", "interface") => Some(simple(ChunkKind::Interface)),
        ("python", "function") | ("python", "struct") => {
            let kind = if capture == "function" {
                ChunkKind::Function
            } else {
                ChunkKind::Struct
            };
            let anchor = node
                .parent()
                .filter(|p| p.kind() == "decorated_definition")
                .unwrap_or(node);
            Some(Declaration {
                kind,
                name,
                anchor,
                span_start: anchor,
                signature: None,
            })
        }
        _ => None,
    }
}

/// Walks back over contiguous doc comments (and Rust attributes) directly
/// above `node` and returns the earliest one, or `node` itself.
fn leading_docs_start<'tree>(lang: &str, node: Node<'tree>) -> Node<'tree> {
    let mut start = node;
    while let Some(prev) = start.prev_named_sibling() {
        if !is_doc_node(lang, prev) {
            break;
        }
        if last_row(prev) + 1 != start.start_position().row {
            break;
        }
        start = prev;
    }
    start
}

fn is_doc_node(lang: &str, node: Node) -> bool {
    match lang {
        "rust" => match node.kind() {
            "attribute_item" => true,
            "line_comment" | "block_comment" => is_rust_outer_doc(node),
            _ => false,
        },
        "go" | "python" => node.kind() == "comment",
        _ => false,
    }
}

/// `///` and `/**` comments, but not `////` or inner `//!` docs.
fn is_rust_outer_doc(node: Node) -> bool {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .any(|c| c.kind() == "outer_doc_comment_marker")
}

/// Row of the last character of `node`; comments that swallow their
/// trailing newline end at column zero of the following row.
fn last_row(node: Node) -> usize {
    let end = node.end_position();
    if end.column == 0 && end.row > node.start_position().row {
        end.row - 1
    } else {
        end.row
    }
}

fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() {
            if let Some(found) = first_error(child) {
                return Some(found);
            }
        }
    }
    None
}

fn node_text(node: Node, source: &[u8]) -> String {
    String::from_utf8_lossy(&source[node.start_byte()..node.end_byte()]).into_owned()
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Declaration header up to its body: text before `{` for brace languages,
/// the `def`/`class` line without its colon for Python.
fn extract_signature(content: &str, lang: &str) -> String {
    let content = content.trim();
    match lang {
        "python" => {
            let header = content
                .lines()
                .find(|l| {
                    let l = l.trim_start();
                    l.starts_with("def ") || l.starts_with("async def ") || l.starts_with("class ")
                })
                .unwrap_or_else(|| content.lines().next().unwrap_or(""))
                .trim();
            if let Some(stripped) = header.strip_suffix(':') {
                return stripped.to_string();
            }
            match content.find("):") {
                Some(idx) => collapse(&content[..idx + 1]),
                None => header.to_string(),
            }
        }
        _ => match content.find('{') {
            Some(idx) => collapse(&content[..idx]),
            None => content.lines().next().unwrap_or("").trim().to_string(),
        },
    }
}
