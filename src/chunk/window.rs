//! Sliding-window fallback for files no AST strategy covers.
//!
//! Partitions the file into fixed windows of [`WINDOW_LINES`] lines with
//! [`OVERLAP_LINES`] lines of overlap between consecutive windows. This is
//! the only strategy whose chunks may overlap.

use crate::models::{ChunkKind, CodeChunk};

use super::slice_lines;

pub const WINDOW_LINES: usize = 50;
pub const OVERLAP_LINES: usize = 15;

pub fn chunk(rel_path: &str, source: &str) -> Vec<CodeChunk> {
    let lines: Vec<&str> = source.split('\n').collect();
    let total = lines.len();
    let stride = WINDOW_LINES - OVERLAP_LINES;

    let mut chunks = Vec::new();
    let mut start = 1usize;

    while start <= total {
        let end = (start + WINDOW_LINES - 1).min(total);
        let content = slice_lines(&lines, start, end);

        if !content.trim().is_empty() {
            chunks.push(CodeChunk {
                file: rel_path.to_string(),
                identifier: format!("lines_{}_{}", start, end),
                kind: ChunkKind::Unknown,
                start_line: start,
                end_line: end,
                content,
                parent: None,
            });
        }

        if end == total {
            break;
        }
        start += stride;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize) -> String {
        (1..=count)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn single_window_for_small_file() {
        let source = numbered(10);
        let chunks = chunk("notes.txt", &source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].identifier, "lines_1_10");
        assert_eq!(chunks[0].content, source);
    }

    #[test]
    fn windows_overlap_by_fifteen() {
        let source = numbered(120);
        let chunks = chunk("notes.txt", &source);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 50);
        assert_eq!(chunks[1].start_line, 36);
        assert_eq!(chunks[1].end_line, 85);
        assert_eq!(chunks[2].start_line, 71);
        assert_eq!(chunks[2].end_line, 120);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn empty_windows_dropped() {
        let chunks = chunk("empty.txt", "\n\n\n");
        assert!(chunks.is_empty());
    }

    #[test]
    fn content_matches_file_slice() {
        let source = numbered(60);
        let lines: Vec<&str> = source.split('\n').collect();
        for c in chunk("notes.txt", &source) {
            assert_eq!(c.content, lines[c.start_line - 1..c.end_line].join("\n"));
        }
    }

    #[test]
    fn deterministic() {
        let source = numbered(200);
        let a = chunk("notes.txt", &source);
        let b = chunk("notes.txt", &source);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.identifier, y.identifier);
            assert_eq!(x.content, y.content);
        }
    }
}
