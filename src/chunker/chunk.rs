//! The chunk record produced by every chunker and persisted by storage.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// What kind of unit a chunk represents.
///
/// `File` covers freeform spans such as document sections and text blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Method,
    Struct,
    Interface,
    File,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
            ChunkKind::Struct => "struct",
            ChunkKind::Interface => "interface",
            ChunkKind::File => "file",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown chunk kind: {0}")]
pub struct UnknownChunkKind(pub String);

impl FromStr for ChunkKind {
    type Err = UnknownChunkKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(ChunkKind::Function),
            "method" => Ok(ChunkKind::Method),
            "struct" => Ok(ChunkKind::Struct),
            "interface" => Ok(ChunkKind::Interface),
            "file" => Ok(ChunkKind::File),
            other => Err(UnknownChunkKind(other.to_string())),
        }
    }
}

/// A semantically bounded span of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub kind: ChunkKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    pub content: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Chunk {
    /// Build a chunk and derive its ID from path, name and start line.
    ///
    /// `end_line` is clamped so it never precedes `start_line`.
    pub fn new(
        file_path: &str,
        kind: ChunkKind,
        name: impl Into<String>,
        content: impl Into<String>,
        start_line: usize,
        end_line: usize,
        language: &str,
    ) -> Self {
        let name = name.into();
        let id = chunk_id(file_path, &name, start_line);
        Self {
            id,
            file_path: file_path.to_string(),
            kind,
            name,
            signature: String::new(),
            content: content.into(),
            start_line,
            end_line: end_line.max(start_line),
            language: language.to_string(),
            domain: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Text handed to the embedder, enriched with language and symbol context.
    pub fn embedding_text(&self) -> String {
        format!("{} {}: {}", self.language, self.name, self.content)
    }

    /// One-line summary for listings: the signature when present, else the
    /// content, flattened and capped at 150 characters.
    pub fn preview(&self) -> String {
        let source = if self.signature.is_empty() {
            &self.content
        } else {
            &self.signature
        };
        let flat = source.replace('\n', " ");
        let flat = flat.trim();
        if flat.chars().count() > 150 {
            let cut: String = flat.chars().take(150).collect();
            format!("{cut}...")
        } else {
            flat.to_string()
        }
    }
}

/// Stable chunk identifier: the first 8 bytes of
/// SHA-256(`"<path>:<name>:<start_line>"`) in lowercase hex.
pub fn chunk_id(file_path: &str, name: &str, start_line: usize) -> String {
    let digest = Sha256::digest(format!("{file_path}:{name}:{start_line}").as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
