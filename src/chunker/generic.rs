//! Size-bounded fallback for plain text and config formats.
use super::{Chunk, ChunkError, ChunkKind, Chunker, extension, file_stem, floor_char_boundary, part_name};

const DEFAULT_MAX_SIZE: usize = 2000;

/// Accumulates whole lines until the next one would push the chunk past
/// `max_size` bytes. No structural awareness.
#[derive(Debug, Clone)]
pub struct GenericChunker {
    max_size: usize,
}

impl GenericChunker {
    /// A `max_size` of zero selects the default of 2000 bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
        }
    }

    /// Cuts a line longer than the limit into char-aligned pieces.
    fn split_line<'a>(&self, line: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::new();
        let mut rest = line;
        while rest.len() > self.max_size {
            let mut cut = floor_char_boundary(rest, self.max_size);
            if cut == 0 {
                cut = rest.char_indices().nth(1).map_or(rest.len(), |(i, _)| i);
            }
            pieces.push(&rest[..cut]);
            rest = &rest[cut..];
        }
        if !rest.is_empty() {
            pieces.push(rest);
        }
        pieces
    }
}

impl Default for GenericChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl Chunker for GenericChunker {
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        if content.is_empty() {
            return Ok(Vec::new());
        }
        let language = extension(path).unwrap_or_else(|| "text".to_string());
        let name = file_stem(path);
        let text = String::from_utf8_lossy(content);

        let mut chunks = Vec::new();
        let mut part = 1;
        let mut buf = String::new();
        let mut buf_start = 1;

        let mut emit = |chunks: &mut Vec<Chunk>, body: &str, start: usize, end: usize| {
            let body = body.trim_end_matches('\n');
            if body.trim().is_empty() {
                return;
            }
            chunks.push(Chunk::new(path, ChunkKind::File, part_name(&name, part), body, start, end, &language));
            part += 1;
        };

        for (i, line) in text.split('\n').enumerate() {
            let line_no = i + 1;
            if line.len() + 1 > self.max_size {
                if !buf.is_empty() {
                    emit(&mut chunks, buf.as_str(), buf_start, line_no - 1);
                    buf.clear();
                }
                for piece in self.split_line(line) {
                    emit(&mut chunks, piece, line_no, line_no);
                }
                buf_start = line_no + 1;
                continue;
            }
            if !buf.is_empty() && buf.len() + line.len() + 1 > self.max_size {
                emit(&mut chunks, buf.as_str(), buf_start, line_no - 1);
                buf.clear();
                buf_start = line_no;
            }
            if buf.is_empty() {
                buf_start = line_no;
            }
            buf.push_str(line);
            buf.push('\n');
        }
        if !buf.is_empty() {
            let end = buf_start + buf.trim_end_matches('\n').matches('\n').count();
            emit(&mut chunks, buf.as_str(), buf_start, end);
        }
        Ok(chunks)
    }

    fn supported_extensions(&self) -> Vec<&'static str> {
        vec![
            "txt", "text", "rst", "adoc", "yaml", "yml", "toml", "ini", "cfg", "conf", "json",
            "xml", "csv", "sh", "bash", "zsh", "fish", "log", "diff", "patch",
        ]
    }
}
