//! Structural pattern matching over tree-sitter syntax trees.
//!
//! A pattern is a code snippet in the target language with metavariables:
//! `$NAME` matches exactly one named node and captures its text;
//! `$$$NAME` matches zero or more sibling nodes and captures the joined
//! text of the named ones. Before parsing, metavariables are rewritten to
//! sentinel identifiers that are valid code in every supported grammar,
//! so a pattern like `function $NAME($$$ARGS)` produces a usable tree;
//! the matcher recognizes the sentinels afterwards by their text.
//!
//! Matching compares node kinds and child sequences (anonymous tokens
//! included, so `a + b` does not match `a - b`), threading a capture map.
//! A metavariable bound twice must bind equal text. Patterns that parse
//! to an "incomplete" variant of a construct (e.g. a body-less
//! `function_signature`) are allowed to leave trailing subject children
//! unmatched, which is what lets a body-less pattern match a full
//! declaration.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use tree_sitter::{Language, Node, Parser, Tree};

use crate::models::AstMatch;

const MVAR_SENTINEL: &str = "ASTGREP_MVAR_";
const MULTI_SENTINEL: &str = "ASTGREP_MULTI_";

/// Languages the matcher can parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    TypeScript,
    Tsx,
    JavaScript,
    Rust,
}

impl Lang {
    pub fn from_extension(ext: &str) -> Option<Lang> {
        match ext.to_ascii_lowercase().as_str() {
            "ts" | "mts" | "cts" => Some(Lang::TypeScript),
            "tsx" => Some(Lang::Tsx),
            "js" | "jsx" | "mjs" | "cjs" => Some(Lang::JavaScript),
            "rs" => Some(Lang::Rust),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Lang> {
        match name.to_ascii_lowercase().as_str() {
            "ts" | "typescript" => Some(Lang::TypeScript),
            "tsx" => Some(Lang::Tsx),
            "js" | "javascript" | "jsx" => Some(Lang::JavaScript),
            "rs" | "rust" => Some(Lang::Rust),
            _ => None,
        }
    }

    fn grammar(&self) -> Language {
        match self {
            Lang::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Lang::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Lang::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Lang::Rust => tree_sitter_rust::LANGUAGE.into(),
        }
    }
}

/// A compiled pattern: the rewritten source, its tree, and the sentinel →
/// metavariable name mapping.
pub struct CompiledPattern {
    source: String,
    tree: Tree,
    lang: Lang,
}

impl CompiledPattern {
    /// Rewrite metavariables and parse the pattern in the given language.
    pub fn compile(pattern: &str, lang: Lang) -> Result<CompiledPattern> {
        let source = rewrite_metavars(pattern);

        let mut parser = Parser::new();
        parser
            .set_language(&lang.grammar())
            .map_err(|e| anyhow::anyhow!("Failed to load grammar: {}", e))?;
        let Some(tree) = parser.parse(&source, None) else {
            bail!("Failed to parse pattern");
        };

        Ok(CompiledPattern { source, tree, lang })
    }

    /// The node the pattern actually describes: descend from the program
    /// root through single-child wrappers (expression statements, error
    /// recovery nodes).
    fn root(&self) -> Node<'_> {
        let mut node = self.tree.root_node();
        while node.named_child_count() == 1 {
            node = node.named_child(0).expect("single child");
        }
        node
    }

    /// Find every match of this pattern inside `source`, up to `limit`.
    pub fn search(&self, file: &str, source: &str, limit: usize) -> Result<Vec<AstMatch>> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.lang.grammar())
            .map_err(|e| anyhow::anyhow!("Failed to load grammar: {}", e))?;
        let Some(tree) = parser.parse(source, None) else {
            bail!("Failed to parse subject");
        };

        let pattern_root = self.root();
        let mut matches = Vec::new();
        collect_matches(
            pattern_root,
            tree.root_node(),
            &self.source,
            source,
            file,
            limit,
            &mut matches,
        );
        Ok(matches)
    }
}

/// Replace `$$$NAME` and `$NAME` tokens with sentinel identifiers that
/// survive parsing in every grammar.
fn rewrite_metavars(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let bytes = pattern.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' {
            let dollars = bytes[i..].iter().take_while(|b| **b == b'$').count();
            let name_start = i + dollars;
            let name_len = pattern[name_start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            let name = &pattern[name_start..name_start + name_len];

            if dollars >= 3 {
                out.push_str(MULTI_SENTINEL);
                out.push_str(name);
                i = name_start + name_len;
                continue;
            }
            if dollars == 1 && name_len > 0 {
                out.push_str(MVAR_SENTINEL);
                out.push_str(name);
                i = name_start + name_len;
                continue;
            }
        }
        let ch = pattern[i..].chars().next().expect("in bounds");
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

/// `Some(name)` when the node's entire text is a single-node sentinel.
fn single_metavar(node: Node<'_>, source: &str) -> Option<String> {
    let text = node_text(node, source).trim();
    let rest = text.strip_prefix(MVAR_SENTINEL)?;
    if rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !rest.is_empty() {
        Some(rest.to_string())
    } else {
        None
    }
}

/// `Some(name)` (possibly empty for an anonymous `$$$`) when the node's
/// entire text is a multi-node sentinel.
fn multi_metavar(node: Node<'_>, source: &str) -> Option<String> {
    let text = node_text(node, source).trim();
    let rest = text.strip_prefix(MULTI_SENTINEL)?;
    if rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Node kinds treated as equivalent so body-less pattern parses can match
/// their complete counterparts. The bool marks the pairing as "partial":
/// trailing subject children the pattern does not mention are allowed.
fn kinds_compatible(pattern_kind: &str, subject_kind: &str) -> Option<bool> {
    if pattern_kind == subject_kind {
        return Some(false);
    }
    let partial = matches!(
        (pattern_kind, subject_kind),
        ("function_signature", "function_declaration")
            | ("function_signature", "generator_function_declaration")
            | ("function_signature_item", "function_item")
    );
    if partial {
        Some(true)
    } else {
        None
    }
}

/// Children relevant to matching: comments and error-recovery "missing"
/// nodes are skipped on both sides.
fn match_children_of<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(|c| !c.is_missing() && !c.is_extra() && c.kind() != "comment")
        .collect()
}

fn bind(
    captures: &mut BTreeMap<String, String>,
    name: &str,
    value: String,
) -> bool {
    if name.is_empty() {
        return true;
    }
    match captures.get(name) {
        Some(existing) => existing == &value,
        None => {
            captures.insert(name.to_string(), value);
            true
        }
    }
}

/// Structural comparison of one pattern node against one subject node.
fn match_node(
    pattern: Node<'_>,
    subject: Node<'_>,
    pattern_src: &str,
    subject_src: &str,
    captures: &mut BTreeMap<String, String>,
) -> bool {
    if let Some(name) = single_metavar(pattern, pattern_src) {
        return subject.is_named() && bind(captures, &name, node_text(subject, subject_src).to_string());
    }

    // Error-recovery wrapper in the pattern: try its children directly.
    if pattern.kind() == "ERROR" {
        let pattern_children = match_children_of(pattern);
        if pattern_children.len() == 1 {
            return match_node(pattern_children[0], subject, pattern_src, subject_src, captures);
        }
        return match_sequences(
            &pattern_children,
            &match_children_of(subject),
            pattern_src,
            subject_src,
            captures,
            true,
        );
    }

    // Anonymous tokens: the kind is the token text; require equality.
    if !pattern.is_named() || !subject.is_named() {
        return pattern.is_named() == subject.is_named() && pattern.kind() == subject.kind();
    }

    let Some(partial) = kinds_compatible(pattern.kind(), subject.kind()) else {
        return false;
    };
    // A pattern node the grammar could not complete (missing body,
    // missing semicolon) may leave trailing subject children unmatched.
    let partial = partial || pattern.has_error();

    let pattern_children = match_children_of(pattern);
    if pattern_children.is_empty() {
        // Leaf vs leaf: token text must agree.
        return subject.named_child_count() == 0
            && node_text(pattern, pattern_src) == node_text(subject, subject_src);
    }

    match_sequences(
        &pattern_children,
        &match_children_of(subject),
        pattern_src,
        subject_src,
        captures,
        partial,
    )
}

/// Match a pattern child sequence against a subject child sequence,
/// backtracking over `$$$` absorption. `allow_trailing` permits unmatched
/// subject children after the pattern is exhausted (partial patterns).
fn match_sequences(
    patterns: &[Node<'_>],
    subjects: &[Node<'_>],
    pattern_src: &str,
    subject_src: &str,
    captures: &mut BTreeMap<String, String>,
    allow_trailing: bool,
) -> bool {
    if patterns.is_empty() {
        return subjects.is_empty() || allow_trailing;
    }

    let head = patterns[0];

    if let Some(name) = multi_metavar(head, pattern_src) {
        // Greedy with backtracking: absorb as many subject children as
        // possible, capturing the named ones.
        for absorbed in (0..=subjects.len()).rev() {
            let mut attempt = captures.clone();
            let joined = subjects[..absorbed]
                .iter()
                .filter(|n| n.is_named())
                .map(|n| node_text(*n, subject_src))
                .collect::<Vec<_>>()
                .join(", ");
            if !bind(&mut attempt, &name, joined) {
                continue;
            }
            if match_sequences(
                &patterns[1..],
                &subjects[absorbed..],
                pattern_src,
                subject_src,
                &mut attempt,
                allow_trailing,
            ) {
                *captures = attempt;
                return true;
            }
        }
        return false;
    }

    if subjects.is_empty() {
        return false;
    }

    let mut attempt = captures.clone();
    if match_node(head, subjects[0], pattern_src, subject_src, &mut attempt)
        && match_sequences(
            &patterns[1..],
            &subjects[1..],
            pattern_src,
            subject_src,
            &mut attempt,
            allow_trailing,
        )
    {
        *captures = attempt;
        return true;
    }

    false
}

/// Walk every node of the subject tree, trying the pattern at each one.
fn collect_matches(
    pattern: Node<'_>,
    subject: Node<'_>,
    pattern_src: &str,
    subject_src: &str,
    file: &str,
    limit: usize,
    matches: &mut Vec<AstMatch>,
) {
    if matches.len() >= limit {
        return;
    }

    if subject.is_named() {
        let mut captures = BTreeMap::new();
        if match_node(pattern, subject, pattern_src, subject_src, &mut captures) {
            let start = subject.start_position();
            let end = subject.end_position();
            matches.push(AstMatch {
                file: file.to_string(),
                line: start.row + 1,
                column: start.column + 1,
                end_line: end.row + 1,
                end_column: end.column + 1,
                text: node_text(subject, subject_src).to_string(),
                metavars: captures,
            });
            if matches.len() >= limit {
                return;
            }
        }
    }

    let mut cursor = subject.walk();
    for child in subject.children(&mut cursor) {
        collect_matches(pattern, child, pattern_src, subject_src, file, limit, matches);
        if matches.len() >= limit {
            return;
        }
    }
}
