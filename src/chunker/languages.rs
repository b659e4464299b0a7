//! Tree-sitter grammars and declaration queries for the syntax-tree chunker.
use tree_sitter::Language;

/// One parseable language: its grammar, file extensions and the query that
/// captures candidate declarations.
///
/// Captures: `@name` for the identifier and one of `@function`, `@method`,
/// `@struct`, `@interface` or `@type` for the declaration node.
pub struct LanguageConfig {
    pub name: &'static str,
    pub language: Language,
    pub extensions: &'static [&'static str],
    pub query: &'static str,
}

impl LanguageConfig {
    pub fn get_all() -> Vec<LanguageConfig> {
        vec![go_config(), python_config(), rust_config()]
    }

    pub fn get_by_extension(ext: &str) -> Option<LanguageConfig> {
        Self::get_all()
            .into_iter()
            .find(|c| c.extensions.contains(&ext))
    }

    pub fn get_by_name(name: &str) -> Option<LanguageConfig> {
        Self::get_all().into_iter().find(|c| c.name == name)
    }
}

fn go_config() -> LanguageConfig {
    LanguageConfig {
        name: "go",
        language: tree_sitter_go::LANGUAGE.into(),
        extensions: &["go"],
        query: r#"
(function_declaration
  name: (identifier) @name) @function

(method_declaration
  name: (field_identifier) @name) @method

(type_spec
  name: (type_identifier) @name) @type

(type_alias
  name: (type_identifier) @name) @type
"#,
    }
}

fn python_config() -> LanguageConfig {
    LanguageConfig {
        name: "python",
        language: tree_sitter_python::LANGUAGE.into(),
        extensions: &["py"],
        query: r#"
(function_definition
  name: (identifier) @name) @function

(class_definition
  name: (identifier) @name) @struct
"#,
    }
}

fn rust_config() -> LanguageConfig {
    LanguageConfig {
        name: "rust",
        language: tree_sitter_rust::LANGUAGE.into(),
        extensions: &["rs"],
        query: r#"
(function_item
  name: (identifier) @name) @function

(struct_item
  name: (type_identifier) @name) @struct

(enum_item
  name: (type_identifier) @name) @struct

(union_item
  name: (type_identifier) @name) @struct

(type_item
  name: (type_identifier) @name) @struct

(trait_item
  name: (type_identifier) @name) @interface
"#,
    }
}
