//! TS-family AST chunking via tree-sitter.
//!
//! Covers TypeScript, TSX, and JavaScript sources. Emits chunks for
//! top-level named function declarations, variables initialized with an
//! arrow function or function expression, classes (one chunk for the
//! class plus one per method with the class name as parent), interfaces,
//! type aliases, and enums. Declarations wrapped in `export` statements
//! are unwrapped; anonymous default exports are skipped.

use tree_sitter::{Language, Node, Parser};

use crate::models::{ChunkKind, CodeChunk};

use super::slice_lines;

fn language_for(ext: &str) -> Language {
    match ext {
        "ts" | "mts" | "cts" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        "tsx" => tree_sitter_typescript::LANGUAGE_TSX.into(),
        _ => tree_sitter_javascript::LANGUAGE.into(),
    }
}

/// Chunk a TS-family source file. Returns `None` when no tree could be
/// produced; the caller falls back to the sliding window.
pub fn chunk(rel_path: &str, source: &str, ext: &str) -> Option<Vec<CodeChunk>> {
    let mut parser = Parser::new();
    parser.set_language(&language_for(ext)).ok()?;
    let tree = parser.parse(source, None)?;

    let lines: Vec<&str> = source.split('\n').collect();
    let mut chunks = Vec::new();

    let root = tree.root_node();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        extract_statement(child, source, &lines, rel_path, &mut chunks);
    }

    Some(chunks)
}

fn extract_statement(
    node: Node<'_>,
    source: &str,
    lines: &[&str],
    rel_path: &str,
    chunks: &mut Vec<CodeChunk>,
) {
    match node.kind() {
        // `export const f = ...`, `export default class ...`
        "export_statement" => {
            if let Some(declaration) = node.child_by_field_name("declaration") {
                extract_statement(declaration, source, lines, rel_path, chunks);
            }
        }
        "function_declaration" | "generator_function_declaration" => {
            if let Some(name) = field_text(node, "name", source) {
                push_chunk(chunks, rel_path, lines, node, name, ChunkKind::Function, None);
            }
        }
        "class_declaration" => extract_class(node, source, lines, rel_path, chunks),
        "interface_declaration" => {
            if let Some(name) = field_text(node, "name", source) {
                push_chunk(
                    chunks,
                    rel_path,
                    lines,
                    node,
                    name,
                    ChunkKind::Interface,
                    None,
                );
            }
        }
        "type_alias_declaration" => {
            if let Some(name) = field_text(node, "name", source) {
                push_chunk(
                    chunks,
                    rel_path,
                    lines,
                    node,
                    name,
                    ChunkKind::TypeAlias,
                    None,
                );
            }
        }
        "enum_declaration" => {
            if let Some(name) = field_text(node, "name", source) {
                push_chunk(chunks, rel_path, lines, node, name, ChunkKind::Enum, None);
            }
        }
        "lexical_declaration" | "variable_declaration" => {
            extract_function_variables(node, source, lines, rel_path, chunks);
        }
        _ => {}
    }
}

/// `const f = () => ...` and `const f = function () ...` declarators.
fn extract_function_variables(
    node: Node<'_>,
    source: &str,
    lines: &[&str],
    rel_path: &str,
    chunks: &mut Vec<CodeChunk>,
) {
    let mut cursor = node.walk();
    for declarator in node.named_children(&mut cursor) {
        if declarator.kind() != "variable_declarator" {
            continue;
        }
        let Some(value) = declarator.child_by_field_name("value") else {
            continue;
        };
        if !matches!(
            value.kind(),
            "arrow_function" | "function_expression" | "function"
        ) {
            continue;
        }
        if let Some(name) = field_text(declarator, "name", source) {
            push_chunk(
                chunks,
                rel_path,
                lines,
                declarator,
                name,
                ChunkKind::Function,
                None,
            );
        }
    }
}

/// One chunk for the class and one per method, parented to the class.
fn extract_class(
    node: Node<'_>,
    source: &str,
    lines: &[&str],
    rel_path: &str,
    chunks: &mut Vec<CodeChunk>,
) {
    let Some(class_name) = field_text(node, "name", source) else {
        return;
    };
    push_chunk(
        chunks,
        rel_path,
        lines,
        node,
        class_name.clone(),
        ChunkKind::Class,
        None,
    );

    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        if member.kind() != "method_definition" {
            continue;
        }
        let Some(name) = field_text(member, "name", source) else {
            continue;
        };
        push_chunk(
            chunks,
            rel_path,
            lines,
            member,
            name,
            ChunkKind::Method,
            Some(class_name.clone()),
        );
    }
}

fn field_text(node: Node<'_>, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| source[n.byte_range()].to_string())
}

fn push_chunk(
    chunks: &mut Vec<CodeChunk>,
    rel_path: &str,
    lines: &[&str],
    node: Node<'_>,
    identifier: String,
    kind: ChunkKind,
    parent: Option<String>,
) {
    let start_line = node.start_position().row + 1;
    let end_line = node.end_position().row + 1;
    chunks.push(CodeChunk {
        file: rel_path.to_string(),
        identifier,
        kind,
        start_line,
        end_line,
        content: slice_lines(lines, start_line, end_line),
        parent,
    });
}
