//! Core data types shared across the fetch, index, and query pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! fetch spec → ParsedSpec → fetcher → Source (registered on disk)
//!                                        ↓
//!                                  chunk_file() → CodeChunk
//!                                        ↓
//!                                  embed_batch() → store row
//!                                        ↓
//!                                  scan() → SearchResult
//! ```
//!
//! A [`Source`] is one ingested artifact (a registry package or a cloned
//! repository). A [`CodeChunk`] is a named slice of one file inside a
//! source. A [`SearchResult`] is a scored chunk returned by semantic
//! search.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Npm,
    Pypi,
    Crates,
    Repo,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Npm => "npm",
            SourceKind::Pypi => "pypi",
            SourceKind::Crates => "crates",
            SourceKind::Repo => "repo",
        }
    }

    /// True for registry packages (everything except git repositories).
    pub fn is_package(&self) -> bool {
        !matches!(self, SourceKind::Repo)
    }
}

/// One ingested artifact, mirrored between the in-memory registry and the
/// on-disk manifest.
///
/// Invariants: `name` is unique across the registry; `path` is relative to
/// the data root and resolves inside it; a source appears in the registry
/// only after its directory is fully populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Globally unique name. Bare package name for registries,
    /// `host/owner/repo` for repositories.
    pub name: String,
    /// Registry version string, or git ref for repositories.
    pub version: String,
    /// Directory relative to the data root.
    pub path: PathBuf,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: DateTime<Utc>,
}

impl Source {
    /// Absolute on-disk directory for this source.
    pub fn dir(&self, data_root: &Path) -> PathBuf {
        data_root.join(&self.path)
    }
}

/// The category a chunk was extracted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Class,
    Method,
    Interface,
    #[serde(rename = "type")]
    TypeAlias,
    Variable,
    Enum,
    Struct,
    Trait,
    Impl,
    Mod,
    Macro,
    Section,
    #[serde(rename = "codeblock")]
    CodeBlock,
    Unknown,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Class => "class",
            ChunkKind::Method => "method",
            ChunkKind::Interface => "interface",
            ChunkKind::TypeAlias => "type",
            ChunkKind::Variable => "variable",
            ChunkKind::Enum => "enum",
            ChunkKind::Struct => "struct",
            ChunkKind::Trait => "trait",
            ChunkKind::Impl => "impl",
            ChunkKind::Mod => "mod",
            ChunkKind::Macro => "macro",
            ChunkKind::Section => "section",
            ChunkKind::CodeBlock => "codeblock",
            ChunkKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ChunkKind {
        match s {
            "function" => ChunkKind::Function,
            "class" => ChunkKind::Class,
            "method" => ChunkKind::Method,
            "interface" => ChunkKind::Interface,
            "type" => ChunkKind::TypeAlias,
            "variable" => ChunkKind::Variable,
            "enum" => ChunkKind::Enum,
            "struct" => ChunkKind::Struct,
            "trait" => ChunkKind::Trait,
            "impl" => ChunkKind::Impl,
            "mod" => ChunkKind::Mod,
            "macro" => ChunkKind::Macro,
            "section" => ChunkKind::Section,
            "codeblock" => ChunkKind::CodeBlock,
            _ => ChunkKind::Unknown,
        }
    }
}

/// A semantically meaningful fragment of one file.
///
/// `start_line`/`end_line` are 1-based and inclusive; `content` is the
/// exact text of the file over that range. Chunks from one file overlap
/// only for the sliding-window fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    /// Path relative to the source root.
    pub file: String,
    /// Human label: function/type name, heading text, or `lines_<a>_<b>`.
    pub identifier: String,
    pub kind: ChunkKind,
    #[serde(rename = "startLine")]
    pub start_line: usize,
    #[serde(rename = "endLine")]
    pub end_line: usize,
    pub content: String,
    /// Owning context, e.g. a class name or impl signature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// A scored chunk returned by semantic search.
///
/// `score = 1 − cosine distance`, so higher is better.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub source: String,
    pub file: String,
    pub identifier: String,
    pub kind: ChunkKind,
    #[serde(rename = "startLine")]
    pub start_line: usize,
    #[serde(rename = "endLine")]
    pub end_line: usize,
    pub content: String,
    pub score: f32,
}

/// One grep hit. `content` is the matching line, trimmed and capped.
#[derive(Debug, Clone, Serialize)]
pub struct GrepMatch {
    pub source: String,
    pub file: String,
    /// 1-based line number.
    pub line: usize,
    pub content: String,
}

/// Directory entry returned by `files`.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
}

/// Node in the `tree` listing.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: TreeNodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeNodeType {
    File,
    Dir,
}

/// One structural match from `ast_grep`. Line and column numbers are
/// 1-based.
#[derive(Debug, Clone, Serialize)]
pub struct AstMatch {
    pub file: String,
    pub line: usize,
    pub column: usize,
    #[serde(rename = "endLine")]
    pub end_line: usize,
    #[serde(rename = "endColumn")]
    pub end_column: usize,
    pub text: String,
    pub metavars: std::collections::BTreeMap<String, String>,
}

/// A fetch spec after grammar parsing, before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedSpec {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Registry package name, or `host/owner/repo` for repositories.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Per-spec fetch outcome. Failed specs carry `error` and are not
/// registered; sibling specs are unaffected.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedSource {
    pub name: String,
    pub path: String,
    #[serde(rename = "alreadyExisted")]
    pub already_existed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
