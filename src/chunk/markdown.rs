//! Markdown chunking: one `section` chunk per heading span, plus a
//! `codeblock` chunk for every fenced code block of meaningful length.
//!
//! A heading span runs from its heading line through the line before the
//! next heading of any level. Content before the first heading becomes the
//! `preamble` section. Heading markers inside fenced code blocks are not
//! headings.

use crate::models::{ChunkKind, CodeChunk};

use super::slice_lines;

/// Fenced blocks whose body is this short are noise, not code.
const MIN_CODEBLOCK_CHARS: usize = 20;

struct Heading {
    /// 1-based line of the `#` marker.
    line: usize,
    text: String,
}

struct CodeBlock {
    /// 1-based lines of the opening and closing fences.
    start_line: usize,
    end_line: usize,
    lang: String,
    /// Body text between the fences.
    body_len: usize,
}

pub fn chunk(rel_path: &str, source: &str) -> Vec<CodeChunk> {
    let lines: Vec<&str> = source.split('\n').collect();
    let (headings, code_blocks) = parse_structure(&lines);

    let mut chunks = Vec::new();

    // Preamble: content before the first heading (or the whole file when
    // there are no headings).
    let first_heading_line = headings.first().map(|h| h.line).unwrap_or(lines.len() + 1);
    if first_heading_line > 1 {
        let content = slice_lines(&lines, 1, first_heading_line - 1);
        if !content.trim().is_empty() {
            chunks.push(CodeChunk {
                file: rel_path.to_string(),
                identifier: "preamble".to_string(),
                kind: ChunkKind::Section,
                start_line: 1,
                end_line: first_heading_line - 1,
                content,
                parent: None,
            });
        }
    }

    for (idx, heading) in headings.iter().enumerate() {
        let end_line = headings
            .get(idx + 1)
            .map(|next| next.line - 1)
            .unwrap_or(lines.len());
        let content = slice_lines(&lines, heading.line, end_line);
        if content.trim().is_empty() {
            continue;
        }
        chunks.push(CodeChunk {
            file: rel_path.to_string(),
            identifier: heading.text.clone(),
            kind: ChunkKind::Section,
            start_line: heading.line,
            end_line,
            content,
            parent: None,
        });
    }

    for block in &code_blocks {
        if block.body_len <= MIN_CODEBLOCK_CHARS {
            continue;
        }
        let content = slice_lines(&lines, block.start_line, block.end_line);
        chunks.push(CodeChunk {
            file: rel_path.to_string(),
            identifier: format!("codeblock_{}_L{}", block.lang, block.start_line),
            kind: ChunkKind::CodeBlock,
            start_line: block.start_line,
            end_line: block.end_line,
            content,
            parent: None,
        });
    }

    chunks
}

struct FenceState {
    marker: char,
    count: usize,
    start_line: usize,
    lang: String,
    body_len: usize,
}

/// Single pass over the lines collecting headings and fenced code blocks.
/// Fence state suppresses heading detection inside blocks.
fn parse_structure(lines: &[&str]) -> (Vec<Heading>, Vec<CodeBlock>) {
    let mut headings = Vec::new();
    let mut blocks = Vec::new();
    let mut fence: Option<FenceState> = None;

    for (i, raw) in lines.iter().enumerate() {
        let line_no = i + 1;
        let trimmed = raw.trim_start();

        if let Some(state) = fence.as_mut() {
            let closes = trimmed.chars().take_while(|c| *c == state.marker).count() >= state.count
                && trimmed.trim_end().chars().all(|c| c == state.marker);
            if closes {
                let state = fence.take().expect("fence open");
                blocks.push(CodeBlock {
                    start_line: state.start_line,
                    end_line: line_no,
                    lang: state.lang,
                    body_len: state.body_len,
                });
            } else {
                state.body_len += raw.len() + 1;
            }
            continue;
        }

        if let Some(marker) = fence_marker(trimmed) {
            let count = trimmed.chars().take_while(|c| *c == marker).count();
            let info = trimmed[count..].trim();
            let lang = info.split_whitespace().next().unwrap_or("").to_string();
            let lang = if lang.is_empty() { "text".to_string() } else { lang };
            fence = Some(FenceState {
                marker,
                count,
                start_line: line_no,
                lang,
                body_len: 0,
            });
            continue;
        }

        if let Some(text) = heading_text(raw) {
            headings.push(Heading {
                line: line_no,
                text,
            });
        }
    }

    // An unclosed fence runs to end of file.
    if let Some(state) = fence {
        blocks.push(CodeBlock {
            start_line: state.start_line,
            end_line: lines.len(),
            lang: state.lang,
            body_len: state.body_len,
        });
    }

    (headings, blocks)
}

fn fence_marker(trimmed: &str) -> Option<char> {
    if trimmed.starts_with("```") {
        Some('`')
    } else if trimmed.starts_with("~~~") {
        Some('~')
    } else {
        None
    }
}

/// ATX heading: 1-6 `#` characters followed by whitespace and text.
fn heading_text(line: &str) -> Option<String> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') && !rest.is_empty() {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "Intro paragraph.\n\n# Alpha\n\nAlpha body.\n\n## Beta\n\n```rust\nfn demo() { println!(\"hello fenced world\"); }\n```\n\n# Gamma\n";

    #[test]
    fn sections_per_heading_with_preamble() {
        let chunks = chunk("README.md", DOC);
        let sections: Vec<&CodeChunk> = chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Section)
            .collect();

        assert_eq!(sections[0].identifier, "preamble");
        assert_eq!(sections[0].start_line, 1);
        assert_eq!(sections[1].identifier, "Alpha");
        assert_eq!(sections[1].start_line, 3);
        assert_eq!(sections[1].end_line, 6);
        assert_eq!(sections[2].identifier, "Beta");
        assert_eq!(sections[3].identifier, "Gamma");
    }

    #[test]
    fn fenced_block_becomes_codeblock_chunk() {
        let chunks = chunk("README.md", DOC);
        let block = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::CodeBlock)
            .expect("codeblock chunk");
        assert_eq!(block.identifier, "codeblock_rust_L9");
        assert!(block.content.starts_with("```rust"));
        assert!(block.content.ends_with("```"));
    }

    #[test]
    fn short_code_blocks_skipped() {
        let doc = "# Title\n\n```\nhi\n```\n";
        let chunks = chunk("README.md", doc);
        assert!(chunks.iter().all(|c| c.kind != ChunkKind::CodeBlock));
    }

    #[test]
    fn heading_inside_fence_is_not_a_heading() {
        let doc = "# Real\n\n```md\n# fake heading inside a fence\n```\n";
        let chunks = chunk("README.md", doc);
        let sections: Vec<_> = chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Section)
            .collect();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].identifier, "Real");
    }

    #[test]
    fn empty_file_yields_nothing() {
        assert!(chunk("README.md", "").is_empty());
        assert!(chunk("README.md", "\n\n").is_empty());
    }

    #[test]
    fn content_matches_file_slice() {
        let lines: Vec<&str> = DOC.split('\n').collect();
        for c in chunk("README.md", DOC) {
            assert_eq!(c.content, lines[c.start_line - 1..c.end_line].join("\n"));
        }
    }
}
