//! Source-tree walk with include/exclude filtering.
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use super::IndexError;
use crate::chunker::ChunkerRegistry;

/// File-name globs left out when tests are excluded.
pub const TEST_FILE_PATTERNS: &[&str] = &[
    "*_test.go",
    "*_test.ts",
    "*_test.js",
    "*_test.tsx",
    "*_test.jsx",
    "*.test.ts",
    "*.test.js",
    "*.test.tsx",
    "*.test.jsx",
    "*.spec.ts",
    "*.spec.js",
    "*.spec.tsx",
    "*.spec.jsx",
    "test_*.py",
    "*_test.py",
    "*_test.rs",
    "*_test.php",
    "*Test.php",
    "*_spec.rb",
    "test_*.rb",
];

/// Directory names pruned when tests are excluded.
pub const TEST_DIR_PATTERNS: &[&str] = &[
    "__tests__",
    "__mocks__",
    "test",
    "tests",
    "spec",
    "specs",
    "testdata",
    "test_data",
    "fixtures",
    "__fixtures__",
];

/// One include or exclude glob.
///
/// Patterns containing `**` match the entry name or its path relative to the
/// walk root. Other patterns match the entry name, and when they contain a
/// `/` also match the relative path or any fragment of it.
#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    matcher: GlobMatcher,
    recursive: bool,
}

impl Pattern {
    fn new(raw: &str) -> Result<Self, IndexError> {
        let matcher = GlobBuilder::new(raw)
            .literal_separator(true)
            .build()
            .map_err(|source| IndexError::InvalidPattern {
                pattern: raw.to_string(),
                source,
            })?
            .compile_matcher();
        Ok(Self {
            raw: raw.to_string(),
            matcher,
            recursive: raw.contains("**"),
        })
    }

    fn matches(&self, name: &str, rel: &str) -> bool {
        if self.matcher.is_match(name) {
            return true;
        }
        if self.recursive {
            return self.matcher.is_match(rel);
        }
        self.raw.contains('/') && (self.matcher.is_match(rel) || rel.contains(self.raw.as_str()))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, IndexError> {
    patterns.iter().map(|p| Pattern::new(p)).collect()
}

/// `path` relative to `root`, with `/` separators.
fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Decides which files under a root are eligible for indexing.
///
/// A file is eligible when no exclude pattern matches it or any directory
/// above it, at least one include pattern matches it (if any are given), and
/// the registry has a chunker for its extension.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    includes: Vec<Pattern>,
    dir_excludes: Vec<Pattern>,
    file_excludes: Vec<Pattern>,
}

impl FileDiscovery {
    pub fn new(
        includes: &[String],
        excludes: &[String],
        exclude_tests: bool,
    ) -> Result<Self, IndexError> {
        let includes = compile(includes)?;
        let mut dir_excludes = compile(excludes)?;
        let mut file_excludes = dir_excludes.clone();
        if exclude_tests {
            for pattern in TEST_DIR_PATTERNS {
                dir_excludes.push(Pattern::new(pattern)?);
            }
            for pattern in TEST_FILE_PATTERNS {
                file_excludes.push(Pattern::new(pattern)?);
            }
        }
        Ok(Self {
            includes,
            dir_excludes,
            file_excludes,
        })
    }

    pub fn is_dir_excluded(&self, name: &str, rel: &str) -> bool {
        self.dir_excludes.iter().any(|p| p.matches(name, rel))
    }

    /// Pattern checks only; the chunker check happens during the walk.
    pub fn is_file_eligible(&self, name: &str, rel: &str) -> bool {
        if self.file_excludes.iter().any(|p| p.matches(name, rel)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|p| p.matches(name, rel))
    }

    /// Eligible files under `root`, sorted. Paths are `root` joined with the
    /// relative path, so they keep the spelling of `root`.
    pub fn discover(
        &self,
        root: &Path,
        registry: &ChunkerRegistry,
    ) -> Result<Vec<PathBuf>, IndexError> {
        let meta = std::fs::metadata(root).map_err(|source| IndexError::RootInaccessible {
            path: root.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(IndexError::NotADirectory(root.to_path_buf()));
        }

        let filter = self.clone();
        let walk_root = root.to_path_buf();
        // Walk builder respects .gitignore by default
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().is_some_and(|t| t.is_dir()) {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                if name == ".git" {
                    return false;
                }
                !filter.is_dir_excluded(&name, &relative(&walk_root, entry.path()))
            })
            .build();

        let mut files = Vec::new();
        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !self.is_file_eligible(&name, &relative(root, entry.path())) {
                continue;
            }
            if registry.resolve(&name).is_none() {
                continue;
            }
            files.push(entry.into_path());
        }

        files.sort();
        debug!(root = %root.display(), files = files.len(), "Discovery finished");
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use std::fs;
    use tempfile::tempdir;

    fn registry() -> ChunkerRegistry {
        ChunkerRegistry::with_defaults(&ChunkingConfig::default()).unwrap()
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    fn names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files.iter().map(|f| relative(root, f)).collect()
    }

    fn strings(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_discover_registered_files_sorted() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "z.go");
        touch(root, "a.md");
        touch(root, "src/lib.rs");
        touch(root, "image.png");
        touch(root, "Makefile");

        let discovery = FileDiscovery::new(&[], &[], false).unwrap();
        let files = discovery.discover(root, &registry()).unwrap();
        assert_eq!(names(root, &files), vec!["a.md", "src/lib.rs", "z.go"]);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "main.go");
        touch(root, "gen.go");
        touch(root, "vendor/dep.go");
        touch(root, "notes.md");

        let discovery =
            FileDiscovery::new(&strings(&["*.go"]), &strings(&["gen.go", "vendor"]), false)
                .unwrap();
        let files = discovery.discover(root, &registry()).unwrap();
        assert_eq!(names(root, &files), vec!["main.go"]);
    }

    #[test]
    fn test_recursive_patterns_use_relative_path() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "src/api/handler.go");
        touch(root, "src/api/gen/types.go");
        touch(root, "cmd/main.go");

        let discovery = FileDiscovery::new(
            &strings(&["src/**/*.go"]),
            &strings(&["**/gen/**"]),
            false,
        )
        .unwrap();
        let files = discovery.discover(root, &registry()).unwrap();
        assert_eq!(names(root, &files), vec!["src/api/handler.go"]);
    }

    #[test]
    fn test_path_fragment_exclude() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "web/static/app.js");
        touch(root, "web/src/app.js");

        let discovery = FileDiscovery::new(&[], &strings(&["web/static"]), false).unwrap();
        let files = discovery.discover(root, &registry()).unwrap();
        assert_eq!(names(root, &files), vec!["web/src/app.js"]);
    }

    #[test]
    fn test_exclude_tests() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "pkg/store.go");
        touch(root, "pkg/store_test.go");
        touch(root, "tests/helpers.py");
        touch(root, "app/test_views.py");
        touch(root, "ui/button.spec.ts");
        touch(root, "latest/notes.md");
        touch(root, "src/Cart.php");
        touch(root, "src/CartTest.php");
        touch(root, "src/cart_test.php");

        let discovery = FileDiscovery::new(&[], &[], true).unwrap();
        let files = discovery.discover(root, &registry()).unwrap();
        assert_eq!(
            names(root, &files),
            vec!["latest/notes.md", "pkg/store.go", "src/Cart.php"]
        );

        let all = FileDiscovery::new(&[], &[], false)
            .unwrap()
            .discover(root, &registry())
            .unwrap();
        assert_eq!(all.len(), 9);
    }

    #[test]
    fn test_discovery_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let discovery = FileDiscovery::new(&[], &[], false).unwrap();
        assert!(matches!(
            discovery.discover(&missing, &registry()),
            Err(IndexError::RootInaccessible { .. })
        ));

        touch(dir.path(), "file.txt");
        assert!(matches!(
            discovery.discover(&dir.path().join("file.txt"), &registry()),
            Err(IndexError::NotADirectory(_))
        ));

        assert!(matches!(
            FileDiscovery::new(&strings(&["a[b"]), &[], false),
            Err(IndexError::InvalidPattern { .. })
        ));
    }
}
