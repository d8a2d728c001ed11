//! Language-dispatched chunking: one file in, a list of [`CodeChunk`]s out.
//!
//! The dispatcher routes by file extension to four strategies:
//!
//! | Extensions | Strategy |
//! |---|---|
//! | `.ts .tsx .mts .cts .js .jsx .mjs .cjs` | TS-family AST ([`typescript`]) |
//! | `.rs` | Rust AST ([`rust`]) |
//! | `.md .mdx .markdown` | Headings + fenced code ([`markdown`]) |
//! | otherwise | Sliding window ([`window`]) |
//!
//! Every strategy upholds the same invariants: chunk line ranges are
//! 1-based, inclusive, and lie within the file; `content` is the exact
//! file slice over those lines; output is deterministic for a given
//! input. Files the AST strategies cannot parse fall back to the sliding
//! window.

pub mod markdown;
pub mod rust;
pub mod typescript;
pub mod window;

use crate::models::CodeChunk;

/// Extensions the index engine ingests.
pub const INDEXABLE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs", "rs", "md", "mdx", "markdown",
];

pub fn is_indexable_extension(ext: &str) -> bool {
    INDEXABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Chunk one file, dispatching on its extension.
///
/// `rel_path` is recorded on every emitted chunk. AST strategies that fail
/// to parse the file degrade to the sliding window rather than dropping
/// the file.
pub fn chunk_file(rel_path: &str, source: &str) -> Vec<CodeChunk> {
    let ext = std::path::Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "ts" | "tsx" | "mts" | "cts" | "js" | "jsx" | "mjs" | "cjs" => {
            typescript::chunk(rel_path, source, &ext)
                .unwrap_or_else(|| window::chunk(rel_path, source))
        }
        "rs" => rust::chunk(rel_path, source).unwrap_or_else(|| window::chunk(rel_path, source)),
        "md" | "mdx" | "markdown" => markdown::chunk(rel_path, source),
        _ => window::chunk(rel_path, source),
    }
}

/// Extract the exact text of lines `start..=end` (1-based, inclusive).
///
/// The slice joins the raw lines with `\n` and carries no trailing
/// newline, so a chunk's content always equals the corresponding slice of
/// the file split on `\n`.
pub(crate) fn slice_lines(lines: &[&str], start: usize, end: usize) -> String {
    if start == 0 || start > lines.len() {
        return String::new();
    }
    let end = end.min(lines.len());
    lines[start - 1..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkKind;

    #[test]
    fn dispatch_by_extension() {
        let rs = chunk_file("src/lib.rs", "fn main() {}\n");
        assert!(rs.iter().any(|c| c.kind == ChunkKind::Function));

        let other = chunk_file("notes.txt", "hello\nworld\n");
        assert_eq!(other.len(), 1);
        assert!(other[0].identifier.starts_with("lines_"));
    }

    #[test]
    fn slice_lines_is_exact() {
        let source = "alpha\nbeta\ngamma\ndelta";
        let lines: Vec<&str> = source.split('\n').collect();
        assert_eq!(slice_lines(&lines, 2, 3), "beta\ngamma");
        assert_eq!(slice_lines(&lines, 1, 4), source);
        assert_eq!(slice_lines(&lines, 1, 99), source);
        assert_eq!(slice_lines(&lines, 9, 10), "");
    }

    #[test]
    fn indexable_extensions() {
        assert!(is_indexable_extension("ts"));
        assert!(is_indexable_extension("RS"));
        assert!(!is_indexable_extension("py"));
    }
}
