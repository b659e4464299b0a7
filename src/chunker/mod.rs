//! Format-aware chunking.
//!
//! Every format implements [`Chunker`]; the [`ChunkerRegistry`] maps file
//! extensions onto chunkers and dispatches by file name.
pub mod chunk;
pub mod generic;
pub mod html;
pub mod languages;
pub mod markdown;
pub mod pattern;
pub mod php;
pub mod registry;
pub mod syntax_tree;

pub use chunk::{Chunk, ChunkKind, UnknownChunkKind, chunk_id};
pub use generic::GenericChunker;
pub use html::HtmlChunker;
pub use markdown::MarkdownChunker;
pub use pattern::PatternChunker;
pub use php::PhpChunker;
pub use registry::ChunkerRegistry;
pub use syntax_tree::SyntaxTreeChunker;

use thiserror::Error;

/// Errors a chunker can report for a whole file.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("path cannot be empty")]
    EmptyPath,

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("unsupported language for {0}")]
    UnsupportedLanguage(String),

    #[error("parser setup failed: {0}")]
    Setup(String),
}

/// Turns raw file bytes into an ordered list of chunks.
///
/// Implementations must be pure functions of `(path, content)`: no state
/// survives between calls and no filesystem access happens beyond the bytes
/// handed in, so re-chunking identical input yields identical chunks.
pub trait Chunker: Send + Sync {
    /// Split `content` (the bytes of the file at `path`) into chunks.
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError>;

    /// Lowercase extensions, without the leading dot, this chunker handles.
    fn supported_extensions(&self) -> Vec<&'static str>;
}

/// Byte offsets of every line start, for offset-to-line lookups.
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    /// 0-based line holding byte `offset`.
    pub(crate) fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset) - 1
    }
}

/// Base file name with its final extension removed.
///
/// Dot-files without a further extension (`.gitignore`) keep their name.
pub(crate) fn file_stem(path: &str) -> String {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    if let Some(rest) = base.strip_prefix('.') {
        if !rest.contains('.') {
            return base.to_string();
        }
    }
    match base.rfind('.') {
        Some(idx) => base[..idx].to_string(),
        None => base.to_string(),
    }
}

/// Lowercase suffix after the final dot of the file name, if any.
pub(crate) fn extension(path: &str) -> Option<String> {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let (_, ext) = base.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

/// Largest char boundary in `s` that is `<= index`.
pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Appends `" (part N)"` for every part after the first.
pub(crate) fn part_name(base: &str, part: usize) -> String {
    if part <= 1 {
        base.to_string()
    } else {
        format!("{base} (part {part})")
    }
}
