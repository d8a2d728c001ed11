//! Rust AST chunking via tree-sitter.
//!
//! Emits one chunk per top-level item: functions, structs, enums, traits,
//! inline modules, and macro definitions. An `impl` block yields one chunk
//! for the whole block (identifier `impl T` or `impl Trait for T`) plus a
//! `method` chunk per contained function, with the impl signature as the
//! method's parent.

use tree_sitter::{Node, Parser};

use crate::models::{ChunkKind, CodeChunk};

use super::slice_lines;

/// Chunk a Rust source file. Returns `None` when the parser cannot
/// produce a tree at all; tree-sitter's error recovery means partially
/// invalid files still yield chunks for the items that parse.
pub fn chunk(rel_path: &str, source: &str) -> Option<Vec<CodeChunk>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_rust::LANGUAGE.into())
        .ok()?;
    let tree = parser.parse(source, None)?;

    let lines: Vec<&str> = source.split('\n').collect();
    let mut chunks = Vec::new();

    let root = tree.root_node();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        extract_item(child, source, &lines, rel_path, &mut chunks);
    }

    Some(chunks)
}

fn extract_item(
    node: Node<'_>,
    source: &str,
    lines: &[&str],
    rel_path: &str,
    chunks: &mut Vec<CodeChunk>,
) {
    let kind = match node.kind() {
        "function_item" => ChunkKind::Function,
        "struct_item" => ChunkKind::Struct,
        "enum_item" => ChunkKind::Enum,
        "trait_item" => ChunkKind::Trait,
        "mod_item" => ChunkKind::Mod,
        "macro_definition" => ChunkKind::Macro,
        "impl_item" => {
            extract_impl(node, source, lines, rel_path, chunks);
            return;
        }
        _ => return,
    };

    let Some(name) = field_text(node, "name", source) else {
        return;
    };
    push_chunk(chunks, rel_path, lines, node, name, kind, None);
}

/// One chunk for the whole impl block plus one per method.
fn extract_impl(
    node: Node<'_>,
    source: &str,
    lines: &[&str],
    rel_path: &str,
    chunks: &mut Vec<CodeChunk>,
) {
    let Some(type_text) = field_text(node, "type", source) else {
        return;
    };
    let signature = match field_text(node, "trait", source) {
        Some(trait_text) => format!("impl {} for {}", trait_text, type_text),
        None => format!("impl {}", type_text),
    };

    push_chunk(
        chunks,
        rel_path,
        lines,
        node,
        signature.clone(),
        ChunkKind::Impl,
        None,
    );

    let Some(body) = node.child_by_field_name("body") else {
        return;
    };
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        if member.kind() != "function_item" {
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
            Some(signature.clone()),
        );
    }
}

fn field_text(node: Node<'_>, field: &str, source: &str) -> Option<String> {
    if let Some(n) = node.child_by_field_name(field) {
        return Some(source[n.byte_range()].to_string());
    }
    // Some grammar versions leave names unfielded; the first identifier
    // child is the name for every item kind handled here.
    if field == "name" {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.kind() == "identifier" || child.kind() == "type_identifier" {
                return Some(source[child.byte_range()].to_string());
            }
        }
    }
    None
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

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"struct Point {
    x: f64,
    y: f64,
}

enum Shape {
    Circle,
    Square,
}

trait Area {
    fn area(&self) -> f64;
}

impl Area for Point {
    fn area(&self) -> f64 {
        0.0
    }
}

impl Point {
    fn flip(&mut self) {
        std::mem::swap(&mut self.x, &mut self.y);
    }
}

fn origin() -> Point {
    Point { x: 0.0, y: 0.0 }
}

mod helpers {
    pub fn noop() {}
}

macro_rules! point {
    () => {};
}
"#;

    fn kinds_and_names(chunks: &[CodeChunk]) -> Vec<(ChunkKind, &str)> {
        chunks
            .iter()
            .map(|c| (c.kind, c.identifier.as_str()))
            .collect()
    }

    #[test]
    fn extracts_top_level_items() {
        let chunks = chunk("src/lib.rs", SOURCE).unwrap();
        let entries = kinds_and_names(&chunks);

        assert!(entries.contains(&(ChunkKind::Struct, "Point")));
        assert!(entries.contains(&(ChunkKind::Enum, "Shape")));
        assert!(entries.contains(&(ChunkKind::Trait, "Area")));
        assert!(entries.contains(&(ChunkKind::Function, "origin")));
        assert!(entries.contains(&(ChunkKind::Mod, "helpers")));
        assert!(entries.contains(&(ChunkKind::Macro, "point")));
    }

    #[test]
    fn impl_blocks_and_methods() {
        let chunks = chunk("src/lib.rs", SOURCE).unwrap();
        let entries = kinds_and_names(&chunks);

        assert!(entries.contains(&(ChunkKind::Impl, "impl Area for Point")));
        assert!(entries.contains(&(ChunkKind::Impl, "impl Point")));

        let area = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::Method && c.identifier == "area")
            .unwrap();
        assert_eq!(area.parent.as_deref(), Some("impl Area for Point"));

        let flip = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::Method && c.identifier == "flip")
            .unwrap();
        assert_eq!(flip.parent.as_deref(), Some("impl Point"));
    }

    #[test]
    fn line_ranges_cover_the_declaration() {
        let chunks = chunk("src/lib.rs", SOURCE).unwrap();
        let point = chunks
            .iter()
            .find(|c| c.identifier == "Point" && c.kind == ChunkKind::Struct)
            .unwrap();
        assert_eq!(point.start_line, 1);
        assert_eq!(point.end_line, 4);
        assert!(point.content.starts_with("struct Point"));
        assert!(point.content.ends_with("}"));
    }

    #[test]
    fn content_matches_file_slice() {
        let lines: Vec<&str> = SOURCE.split('\n').collect();
        for c in chunk("src/lib.rs", SOURCE).unwrap() {
            assert_eq!(c.content, lines[c.start_line - 1..c.end_line].join("\n"));
        }
    }

    #[test]
    fn deterministic() {
        let a = chunk("src/lib.rs", SOURCE).unwrap();
        let b = chunk("src/lib.rs", SOURCE).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.identifier, y.identifier);
            assert_eq!(x.start_line, y.start_line);
        }
    }
}
