//! Regex-driven chunking for PHP.
//!
//! Classes, interfaces and traits become one chunk each, with their extent
//! estimated by brace counting. Functions are matched at any indentation; one
//! that sits inside a class, interface or trait is named `Container::method`.
//! Bodiless declarations (abstract and interface methods) end at their `;`.
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::pattern::{block_end, extract_lines, first_line_signature};
use super::{Chunk, ChunkError, ChunkKind, Chunker, LineIndex};

const DEFAULT_MAX_SIZE: usize = 1500;
const LANGUAGE: &str = "php";

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:(?:abstract|final|readonly)\s+)*class\s+(\w+)")
        .expect("valid class regex")
});

static INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*interface\s+(\w+)").expect("valid interface regex")
});

static TRAIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*trait\s+(\w+)").expect("valid trait regex"));

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:(?:public|private|protected|static|final|abstract)\s+)*function\s+&?(\w+)\s*\([^)]*\)",
    )
    .expect("valid function regex")
});

/// A class-like block functions can be nested in. `start` is a 0-based line
/// index, `end` the 1-based closing line.
struct Container<'a> {
    name: &'a str,
    start: usize,
    end: usize,
}

/// Heuristic chunker for `php`, `phtml`, `php5` and `php7`.
#[derive(Debug, Clone)]
pub struct PhpChunker {
    max_size: usize,
}

impl PhpChunker {
    /// A `max_size` of zero selects the default of 1500 bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size },
        }
    }

    fn declaration(
        &self,
        path: &str,
        kind: ChunkKind,
        name: impl Into<String>,
        lines: &[&str],
        start: usize,
        end: usize,
    ) -> Chunk {
        let body = extract_lines(lines, start, end.saturating_sub(1), self.max_size);
        Chunk::new(path, kind, name, body, start + 1, end, LANGUAGE)
    }
}

impl Default for PhpChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl Chunker for PhpChunker {
    fn chunk(&self, path: &str, content: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
        if content.is_empty() {
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(content);
        let lines: Vec<&str> = text.split('\n').collect();
        let index = LineIndex::new(&text);

        let mut chunks = Vec::new();
        let mut containers = Vec::new();
        let passes = [
            (&CLASS_RE, ChunkKind::Struct, "class"),
            (&INTERFACE_RE, ChunkKind::Interface, "interface"),
            (&TRAIT_RE, ChunkKind::Struct, "trait"),
        ];
        for (pattern, kind, keyword) in passes {
            let mut seen: HashSet<&str> = HashSet::new();
            for caps in pattern.captures_iter(&text) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                let name = name.as_str();
                if !seen.insert(name) {
                    continue;
                }
                let start = index.line_of(whole.start());
                let end = block_end(&lines, start);
                chunks.push(
                    self.declaration(path, kind, name, &lines, start, end)
                        .with_signature(format!("{keyword} {name}")),
                );
                containers.push(Container { name, start, end });
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        for caps in FUNCTION_RE.captures_iter(&text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let start = index.line_of(whole.start());
            let qualified = match containers
                .iter()
                .filter(|c| c.start < start && start < c.end)
                .max_by_key(|c| c.start)
            {
                Some(container) => format!("{}::{}", container.name, name.as_str()),
                None => name.as_str().to_string(),
            };
            if !seen.insert(qualified.clone()) {
                continue;
            }

            let rest = &text[whole.end()..];
            let end = match rest.find(['{', ';']) {
                Some(i) if rest.as_bytes()[i] == b';' => index.line_of(whole.end() + i) + 1,
                _ => block_end(&lines, start),
            };
            let signature = first_line_signature(lines[start]);
            chunks.push(
                self.declaration(path, ChunkKind::Function, qualified, &lines, start, end)
                    .with_signature(signature),
            );
        }
        Ok(chunks)
    }

    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["php", "phtml", "php5", "php7"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(chunks: &'a [Chunk], name: &str, kind: ChunkKind) -> &'a Chunk {
        chunks
            .iter()
            .find(|c| c.name == name && c.kind == kind)
            .unwrap_or_else(|| panic!("missing {kind} {name}"))
    }

    #[test]
    fn test_classes_methods_and_functions() {
        let src = r#"<?php

function greet($name) {
    return "Hello, " . $name;
}

class Animal {
    public function speak() {
        echo "Animal speaks";
    }
}

final class Dog extends Animal {
    public function speak() {
        echo "Dog barks";
    }
}

abstract class Vehicle {
    abstract public function move();
}
"#;
        let chunks = PhpChunker::default().chunk("zoo.php", src.as_bytes()).unwrap();
        assert_eq!(chunks.len(), 7);

        let greet = find(&chunks, "greet", ChunkKind::Function);
        assert_eq!((greet.start_line, greet.end_line), (3, 5));
        assert_eq!(greet.signature, "function greet($name)");
        assert_eq!(greet.language, "php");

        let animal = find(&chunks, "Animal", ChunkKind::Struct);
        assert_eq!((animal.start_line, animal.end_line), (7, 11));
        assert_eq!(animal.signature, "class Animal");
        assert_eq!(find(&chunks, "Dog", ChunkKind::Struct).start_line, 13);

        let speak = find(&chunks, "Animal::speak", ChunkKind::Function);
        assert_eq!((speak.start_line, speak.end_line), (8, 10));
        assert_eq!(speak.signature, "public function speak()");
        let bark = find(&chunks, "Dog::speak", ChunkKind::Function);
        assert_eq!((bark.start_line, bark.end_line), (14, 16));

        let abstract_move = find(&chunks, "Vehicle::move", ChunkKind::Function);
        assert_eq!((abstract_move.start_line, abstract_move.end_line), (20, 20));
        assert_eq!(abstract_move.content, "    abstract public function move();");
    }

    #[test]
    fn test_interfaces_and_traits() {
        let src = r#"<?php

interface Moveable {
    public function move(): void;
}

trait Loggable {
    public function log($message) {
        echo $message;
    }
}
"#;
        let chunks = PhpChunker::default().chunk("caps.php", src.as_bytes()).unwrap();

        let moveable = find(&chunks, "Moveable", ChunkKind::Interface);
        assert_eq!((moveable.start_line, moveable.end_line), (3, 5));
        assert_eq!(moveable.signature, "interface Moveable");
        let moves = find(&chunks, "Moveable::move", ChunkKind::Function);
        assert_eq!((moves.start_line, moves.end_line), (4, 4));

        let loggable = find(&chunks, "Loggable", ChunkKind::Struct);
        assert_eq!((loggable.start_line, loggable.end_line), (7, 11));
        assert_eq!(loggable.signature, "trait Loggable");
        let log = find(&chunks, "Loggable::log", ChunkKind::Function);
        assert_eq!((log.start_line, log.end_line), (8, 10));
    }

    #[test]
    fn test_empty_and_declaration_free_input() {
        let chunker = PhpChunker::default();
        assert!(chunker.chunk("e.php", b"").unwrap().is_empty());
        assert!(chunker.chunk("v.phtml", b"<?php echo 'hi'; ?>\n").unwrap().is_empty());
    }

    #[test]
    fn test_oversized_function_is_truncated() {
        let mut src = String::from("<?php\nfunction big() {\n");
        for i in 0..50 {
            src.push_str(&format!("    echo 'line {i}';\n"));
        }
        src.push_str("}\n");
        let chunks = PhpChunker::new(200).chunk("big.php", src.as_bytes()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.ends_with("// ... truncated"));
        assert_eq!(chunks[0].end_line, 53);
    }
}
