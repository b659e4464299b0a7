//! Extension-keyed dispatch to chunkers.
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    ChunkError, Chunker, GenericChunker, HtmlChunker, MarkdownChunker, PatternChunker,
    PhpChunker, SyntaxTreeChunker, extension,
};
use crate::config::ChunkingConfig;

/// Maps lowercase file extensions to chunkers. The last registration for an
/// extension wins, so specialised chunkers go in after generic ones.
#[derive(Clone, Default)]
pub struct ChunkerRegistry {
    chunkers: HashMap<String, Arc<dyn Chunker>>,
}

impl ChunkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in chunker, sized from `config`.
    pub fn with_defaults(config: &ChunkingConfig) -> Result<Self, ChunkError> {
        let mut registry = Self::new();
        registry.register_all(Arc::new(GenericChunker::new(config.generic_max_size)));
        registry.register_all(Arc::new(PatternChunker::new(config.pattern_max_size)));
        registry.register_all(Arc::new(PhpChunker::new(config.pattern_max_size)));
        registry.register_all(Arc::new(SyntaxTreeChunker::new()?));
        registry.register_all(Arc::new(MarkdownChunker::new(config.markdown_max_size)));
        registry.register_all(Arc::new(HtmlChunker::new(config.html_max_size)));
        Ok(registry)
    }

    /// Map `ext` to `chunker`. Returns `true` when the extension had no
    /// chunker before.
    pub fn register(&mut self, ext: &str, chunker: Arc<dyn Chunker>) -> bool {
        let key = ext.trim_start_matches('.').to_ascii_lowercase();
        self.chunkers.insert(key, chunker).is_none()
    }

    /// Register `chunker` for every extension it reports.
    pub fn register_all(&mut self, chunker: Arc<dyn Chunker>) {
        for ext in chunker.supported_extensions() {
            self.register(ext, Arc::clone(&chunker));
        }
    }

    /// Chunker for `filename`, chosen by the lowercase suffix after its final
    /// dot. No dot or an unknown extension gives `None`.
    pub fn resolve(&self, filename: &str) -> Option<Arc<dyn Chunker>> {
        let ext = extension(filename)?;
        self.chunkers.get(&ext).cloned()
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.chunkers.keys().cloned().collect();
        exts.sort();
        exts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunk, ChunkKind};

    struct Fixed(&'static str);

    impl Chunker for Fixed {
        fn chunk(&self, path: &str, _content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
            Ok(vec![Chunk::new(path, ChunkKind::File, self.0, "", 1, 1, "text")])
        }

        fn supported_extensions(&self) -> Vec<&'static str> {
            vec!["txt"]
        }
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = ChunkerRegistry::new();
        assert!(registry.register("txt", Arc::new(Fixed("first"))));
        assert!(!registry.register("TXT", Arc::new(Fixed("second"))));

        let chunker = registry.resolve("notes.txt").unwrap();
        let chunks = chunker.chunk("notes.txt", b"x").unwrap();
        assert_eq!(chunks[0].name, "second");
    }

    #[test]
    fn test_resolve_by_final_lowercased_suffix() {
        let mut registry = ChunkerRegistry::new();
        registry.register("gz", Arc::new(Fixed("gz")));
        assert!(registry.resolve("backup.tar.GZ").is_some());
        assert!(registry.resolve("Makefile").is_none());
        assert!(registry.resolve("image.png").is_none());
        assert!(registry.resolve("dir.gz/README").is_none());
    }

    #[test]
    fn test_defaults_route_to_specialised_chunkers() {
        let registry = ChunkerRegistry::with_defaults(&ChunkingConfig::default()).unwrap();
        let md = registry.resolve("README.md").unwrap();
        let chunks = md.chunk("README.md", b"# Title\nbody\n").unwrap();
        assert_eq!(chunks[0].name, "README > Title");

        let go = registry.resolve("main.go").unwrap();
        assert!(go.chunk("main.go", b"package main\nfunc main() {}\n").unwrap()[0].kind == ChunkKind::Function);

        let php = registry.resolve("src/Foo.php").unwrap();
        let chunks = php.chunk("src/Foo.php", b"<?php\nclass Foo {\n}\n").unwrap();
        assert_eq!((chunks[0].name.as_str(), chunks[0].kind), ("Foo", ChunkKind::Struct));

        for ext in ["ts", "html", "yaml", "py", "rs", "php", "phtml"] {
            assert!(registry.extensions().iter().any(|e| e == ext), "missing {ext}");
        }
    }
}
