//! Splitting source files into code segments.
//!
//! [`TreeSitterParser`] cuts Rust, Python, JavaScript, TypeScript and Go
//! files at declaration boundaries (functions, methods, types, impls,
//! classes). Anything else, and files without recognizable declarations,
//! falls back to fixed line windows.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;
use tree_sitter::{Language, Node, Parser};

use crate::error::IndexError;
use crate::workspace::content_hash;

/// Upper bound on a line-window segment, in characters.
pub const MAX_SEGMENT_CHARS: usize = 1000;

/// Segments shorter than this are merged into a neighbour or dropped.
pub const MIN_SEGMENT_CHARS: usize = 50;

/// Declarations larger than this are split into line windows.
const MAX_DECLARATION_CHARS: usize = MAX_SEGMENT_CHARS * 3 / 2;

/// A sub-file unit that is embedded and stored as one vector point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSegment {
    /// Workspace-relative file path
    pub file_path: String,
    /// Declaration name, if any
    pub identifier: Option<String>,
    /// "function", "method", "class", "lines", ...
    pub kind: String,
    /// Start line (1-indexed)
    pub start_line: usize,
    /// End line (1-indexed, inclusive)
    pub end_line: usize,
    pub content: String,
    /// Hash of the whole file this segment came from
    pub file_hash: String,
    /// Hash of this segment's position and text
    pub segment_hash: String,
}

impl CodeSegment {
    pub fn new(
        file_path: &str,
        identifier: Option<String>,
        kind: &str,
        start_line: usize,
        end_line: usize,
        content: String,
        file_hash: &str,
    ) -> Self {
        let segment_hash = content_hash(
            format!("{file_path}\n{start_line}\n{end_line}\n{content}").as_bytes(),
        );
        Self {
            file_path: file_path.to_string(),
            identifier,
            kind: kind.to_string(),
            start_line,
            end_line,
            content,
            file_hash: file_hash.to_string(),
            segment_hash,
        }
    }

    /// Deterministic point id, so re-indexing an unchanged segment
    /// overwrites the existing point.
    pub fn point_id(&self) -> String {
        let key = format!("{}\n{}\n{}", self.file_path, self.segment_hash, self.start_line);
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
    }
}

/// Turns a file's text into segments.
pub trait CodeParser: Send + Sync {
    fn parse(&self, path: &str, source: &str, file_hash: &str) -> Result<Vec<CodeSegment>, IndexError>;
}

/// Tree-sitter backed [`CodeParser`] with a line-window fallback.
pub struct TreeSitterParser {
    parsers: Mutex<HashMap<&'static str, Parser>>,
}

impl TreeSitterParser {
    pub fn new() -> Result<Self, IndexError> {
        let languages: [(&'static str, Language); 5] = [
            ("rust", tree_sitter_rust::LANGUAGE.into()),
            ("python", tree_sitter_python::LANGUAGE.into()),
            ("javascript", tree_sitter_javascript::LANGUAGE.into()),
            ("typescript", tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            ("go", tree_sitter_go::LANGUAGE.into()),
        ];

        let mut parsers = HashMap::new();
        for (name, language) in languages {
            let mut parser = Parser::new();
            parser
                .set_language(&language)
                .map_err(|e| IndexError::Configuration(format!("tree-sitter {name}: {e}")))?;
            parsers.insert(name, parser);
        }

        Ok(Self {
            parsers: Mutex::new(parsers),
        })
    }

    /// Detect language from file extension.
    pub fn detect_language(path: &str) -> Option<&'static str> {
        match path.rsplit_once('.')?.1 {
            "rs" => Some("rust"),
            "py" => Some("python"),
            "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
            "ts" | "tsx" => Some("typescript"),
            "go" => Some("go"),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, Parser>> {
        self.parsers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn parse_declarations(
        &self,
        language: &'static str,
        path: &str,
        source: &str,
        file_hash: &str,
    ) -> Result<Vec<CodeSegment>, IndexError> {
        let tree = {
            let mut parsers = self.lock();
            let parser = parsers.get_mut(language).ok_or_else(|| IndexError::Parse {
                path: path.to_string(),
                message: format!("no parser for {language}"),
            })?;
            parser.parse(source, None).ok_or_else(|| IndexError::Parse {
                path: path.to_string(),
                message: "tree-sitter returned no tree".to_string(),
            })?
        };

        let mut segments = Vec::new();
        collect_declarations(tree.root_node(), source, path, file_hash, false, &mut segments);
        Ok(segments)
    }
}

impl CodeParser for TreeSitterParser {
    fn parse(&self, path: &str, source: &str, file_hash: &str) -> Result<Vec<CodeSegment>, IndexError> {
        if source.trim().is_empty() {
            return Ok(Vec::new());
        }

        let segments = match Self::detect_language(path) {
            Some(language) => self.parse_declarations(language, path, source, file_hash)?,
            None => Vec::new(),
        };

        if segments.is_empty() {
            debug!("No declarations in {}, using line windows", path);
            return Ok(line_windows(path, source, 1, None, "lines", file_hash));
        }
        Ok(segments)
    }
}

/// Kind label for a declaration node, or `None` when the node is not one.
fn declaration_kind(kind: &str, in_container: bool) -> Option<&'static str> {
    let label = match kind {
        // Rust
        "function_item" if in_container => "method",
        "function_item" => "function",
        "struct_item" => "struct",
        "enum_item" => "enum",
        "trait_item" => "trait",
        "impl_item" => "impl",
        "mod_item" => "module",
        // Python
        "function_definition" if in_container => "method",
        "function_definition" => "function",
        "class_definition" => "class",
        // JavaScript / TypeScript
        "function_declaration" => "function",
        "class_declaration" => "class",
        "method_definition" => "method",
        "interface_declaration" => "interface",
        "enum_declaration" => "enum",
        "type_alias_declaration" => "type",
        // Go
        "method_declaration" => "method",
        "type_declaration" => "type",
        _ => return None,
    };
    Some(label)
}

fn is_container(kind: &str) -> bool {
    matches!(
        kind,
        "impl_item" | "trait_item" | "mod_item" | "class_definition" | "class_declaration"
    )
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

fn declaration_name(node: Node, source: &str) -> Option<String> {
    if let Some(name) = node.child_by_field_name("name") {
        return Some(node_text(name, source).to_string());
    }
    // Rust impls name their type; Go type declarations wrap a type_spec.
    if let Some(ty) = node.child_by_field_name("type") {
        return Some(node_text(ty, source).to_string());
    }
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .find(|c| c.kind() == "type_spec")
        .and_then(|spec| spec.child_by_field_name("name"))
        .map(|name| node_text(name, source).to_string());
    found
}

fn collect_declarations(
    node: Node,
    source: &str,
    path: &str,
    file_hash: &str,
    in_container: bool,
    out: &mut Vec<CodeSegment>,
) {
    let Some(kind) = declaration_kind(node.kind(), in_container) else {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_declarations(child, source, path, file_hash, in_container, out);
        }
        return;
    };

    if is_container(node.kind()) {
        let before = out.len();
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_declarations(child, source, path, file_hash, true, out);
        }
        if out.len() > before {
            return;
        }
    }

    let text = node_text(node, source);
    let start_line = node.start_position().row + 1;
    let end_line = node.end_position().row + 1;
    let identifier = declaration_name(node, source);

    if text.len() > MAX_DECLARATION_CHARS {
        out.extend(line_windows(path, text, start_line, identifier, kind, file_hash));
    } else {
        out.push(CodeSegment::new(
            path,
            identifier,
            kind,
            start_line,
            end_line,
            text.to_string(),
            file_hash,
        ));
    }
}

/// Cut a line longer than [`MAX_SEGMENT_CHARS`] bytes at char boundaries.
fn split_long_line(line: &str) -> Vec<&str> {
    if line.len() <= MAX_SEGMENT_CHARS {
        return vec![line];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut last_boundary = 0;
    for (idx, ch) in line.char_indices() {
        let end = idx + ch.len_utf8();
        if end - start > MAX_SEGMENT_CHARS {
            pieces.push(&line[start..last_boundary]);
            start = last_boundary;
        }
        last_boundary = end;
    }
    if start < line.len() {
        pieces.push(&line[start..]);
    }
    pieces
}

/// Split `text` into windows of whole lines up to [`MAX_SEGMENT_CHARS`].
///
/// `first_line` is the 1-indexed line `text` starts at. Lines longer than
/// the cap are cut into pieces. A trailing window shorter than
/// [`MIN_SEGMENT_CHARS`] is merged into the previous one when both fit,
/// and dropped when it is the only one.
pub fn line_windows(
    path: &str,
    text: &str,
    first_line: usize,
    identifier: Option<String>,
    kind: &str,
    file_hash: &str,
) -> Vec<CodeSegment> {
    let mut windows: Vec<(usize, usize, String)> = Vec::new();
    let mut current = String::new();
    let mut current_start = first_line;
    let mut current_end = first_line;

    for (offset, line) in text.lines().enumerate() {
        let line_no = first_line + offset;
        for piece in split_long_line(line) {
            if !current.is_empty() && current.len() + piece.len() + 1 > MAX_SEGMENT_CHARS {
                windows.push((current_start, current_end, std::mem::take(&mut current)));
            }
            if current.is_empty() {
                current_start = line_no;
            } else {
                current.push('\n');
            }
            current.push_str(piece);
            current_end = line_no;
        }
    }
    if !current.trim().is_empty() {
        let end = first_line + text.lines().count().saturating_sub(1);
        windows.push((current_start, end.max(current_end), current));
    }

    let tail = windows.last().map(|(_, _, t)| (t.trim().len(), t.len()));
    if let Some((trimmed, tail_len)) = tail {
        if trimmed < MIN_SEGMENT_CHARS {
            match windows.len() {
                1 => windows.clear(),
                n if windows[n - 2].2.len() + tail_len + 1 <= MAX_SEGMENT_CHARS => {
                    if let Some((_, end, tail)) = windows.pop() {
                        if let Some(prev) = windows.last_mut() {
                            prev.1 = end;
                            prev.2.push('\n');
                            prev.2.push_str(&tail);
                        }
                    }
                }
                // No room in the previous window; the tail stands alone.
                _ => {}
            }
        }
    }

    windows
        .into_iter()
        .map(|(start, end, content)| {
            CodeSegment::new(path, identifier.clone(), kind, start, end, content, file_hash)
        })
        .collect()
}
