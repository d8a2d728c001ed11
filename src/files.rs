//! Sandboxed filesystem operations rooted at one source's directory.
//!
//! Every path supplied by an agent is resolved against the source root
//! and the canonical result must stay inside it; anything else is
//! rejected with [`FileError::PathTraversal`]. Enumerations skip
//! `node_modules` and `.git` everywhere; grep additionally skips minified
//! bundles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use regex::RegexBuilder;
use thiserror::Error;
use walkdir::WalkDir;

use crate::models::{FileEntry, GrepMatch, TreeNode, TreeNodeType};

/// Grep lines are trimmed and capped at this many characters.
const GREP_LINE_CAP: usize = 200;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Path traversal rejected: {path}")]
    PathTraversal { path: String },

    #[error("Failed to read {path}: {cause}")]
    Read { path: String, cause: String },

    #[error("Invalid glob pattern '{pattern}': {cause}")]
    BadGlob { pattern: String, cause: String },

    #[error("Invalid regex '{pattern}': {cause}")]
    BadRegex { pattern: String, cause: String },
}

pub type Result<T> = std::result::Result<T, FileError>;

/// Resolve a user-supplied relative path against a source root.
///
/// The canonical result must have the canonical root as a prefix. The
/// check is component-wise, so `/data/foo` cannot be escaped into
/// `/data/foobar`.
pub fn safe_resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| FileError::Read {
            path: root.display().to_string(),
            cause: e.to_string(),
        })?;

    let joined = canonical_root.join(rel);
    let canonical = joined.canonicalize().map_err(|e| FileError::Read {
        path: rel.to_string(),
        cause: e.to_string(),
    })?;

    if !canonical.starts_with(&canonical_root) {
        return Err(FileError::PathTraversal {
            path: rel.to_string(),
        });
    }

    Ok(canonical)
}

/// Directories never descended into during enumeration.
fn is_ignored_dir(name: &str) -> bool {
    name == "node_modules" || name == ".git"
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| FileError::BadGlob {
            pattern: pattern.to_string(),
            cause: e.to_string(),
        })
}

/// A glob like `*.ts` should match `src/a.ts`; match the relative path
/// and, for patterns without a separator, the file name too.
fn glob_matches(matcher: &GlobMatcher, pattern: &str, rel: &str) -> bool {
    if matcher.is_match(rel) {
        return true;
    }
    if !pattern.contains('/') {
        if let Some(name) = rel.rsplit('/').next() {
            return matcher.is_match(name);
        }
    }
    false
}

/// Walk a source root and return relative paths of all regular files, in
/// sorted order, skipping ignored directories.
pub fn walk_source(root: &Path) -> Vec<String> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(is_ignored_dir)
                    .unwrap_or(false))
        })
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        paths.push(rel);
    }
    paths.sort();
    paths
}

/// List files (and directories when no glob is given) under a source root.
pub fn list_files(root: &Path, glob: Option<&str>) -> Result<Vec<FileEntry>> {
    let matcher = glob.map(|g| compile_glob(g).map(|m| (m, g))).transpose()?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(is_ignored_dir)
                    .unwrap_or(false))
        })
        .flatten()
    {
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let is_dir = entry.file_type().is_dir();

        if let Some((ref m, pattern)) = matcher {
            if is_dir || !glob_matches(m, pattern, &rel) {
                continue;
            }
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(FileEntry {
            path: rel,
            size,
            is_directory: is_dir,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Read one file inside the source root as UTF-8.
pub fn read_file(root: &Path, rel: &str) -> Result<String> {
    let path = safe_resolve(root, rel)?;
    std::fs::read_to_string(&path).map_err(|e| FileError::Read {
        path: rel.to_string(),
        cause: e.to_string(),
    })
}

/// Read a mix of literal paths and glob patterns.
///
/// Globs are expanded against the source root before reading. Per-file
/// failures become `[Error: …]` placeholder values keyed by the original
/// path so partial success stays observable.
pub fn read_many(root: &Path, patterns: &[String]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    for pattern in patterns {
        let is_glob = pattern.contains(['*', '?', '[', '{']);
        if !is_glob {
            let value = match read_file(root, pattern) {
                Ok(content) => content,
                Err(e) => format!("[Error: {}]", e),
            };
            out.insert(pattern.clone(), value);
            continue;
        }

        let matcher = match compile_glob(pattern) {
            Ok(m) => m,
            Err(e) => {
                out.insert(pattern.clone(), format!("[Error: {}]", e));
                continue;
            }
        };

        let mut matched_any = false;
        for rel in walk_source(root) {
            if !glob_matches(&matcher, pattern, &rel) {
                continue;
            }
            matched_any = true;
            let value = match read_file(root, &rel) {
                Ok(content) => content,
                Err(e) => format!("[Error: {}]", e),
            };
            out.insert(rel, value);
        }
        if !matched_any {
            out.insert(pattern.clone(), "[Error: no files matched]".to_string());
        }
    }

    out
}

/// Build a directory tree rooted at the source, down to `depth` levels.
/// `pattern` filters file names.
pub fn tree(root: &Path, depth: usize, pattern: Option<&str>) -> Result<TreeNode> {
    let matcher = pattern.map(compile_glob).transpose()?;
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());
    Ok(build_tree_node(root, &name, depth, matcher.as_ref()))
}

fn build_tree_node(
    dir: &Path,
    name: &str,
    depth: usize,
    matcher: Option<&GlobMatcher>,
) -> TreeNode {
    let mut children = Vec::new();

    if depth > 0 {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .flatten()
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let child_name = entry.file_name().to_string_lossy().to_string();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                if is_ignored_dir(&child_name) {
                    continue;
                }
                children.push(build_tree_node(&entry.path(), &child_name, depth - 1, matcher));
            } else {
                if let Some(m) = matcher {
                    if !m.is_match(&child_name) {
                        continue;
                    }
                }
                children.push(TreeNode {
                    name: child_name,
                    node_type: TreeNodeType::File,
                    children: None,
                });
            }
        }
    }

    TreeNode {
        name: name.to_string(),
        node_type: TreeNodeType::Dir,
        children: Some(children),
    }
}

/// Options for [`grep`].
pub struct GrepOptions<'a> {
    /// Glob restricting which files are scanned.
    pub include: Option<&'a str>,
    /// Stop once this many matches are collected.
    pub max_results: usize,
    /// The pattern is compiled case-insensitively unless set.
    pub case_sensitive: bool,
}

/// Regex search across one or more source roots.
///
/// Files are scanned in glob/walk order; unreadable files are skipped
/// silently; the scan short-circuits at `max_results`. Each match carries
/// the 1-based line number and the trimmed, capped line text.
pub fn grep(
    pattern: &str,
    sources: &[(String, PathBuf)],
    opts: &GrepOptions<'_>,
) -> Result<Vec<GrepMatch>> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(!opts.case_sensitive)
        .build()
        .map_err(|e| FileError::BadRegex {
            pattern: pattern.to_string(),
            cause: e.to_string(),
        })?;

    let include = opts
        .include
        .map(|g| compile_glob(g).map(|m| (m, g)))
        .transpose()?;

    let mut matches = Vec::new();

    'outer: for (source_name, root) in sources {
        for rel in walk_source(root) {
            if rel.ends_with(".min.js") {
                continue;
            }
            if let Some((ref m, pattern)) = include {
                if !glob_matches(m, pattern, &rel) {
                    continue;
                }
            }

            let Ok(content) = std::fs::read_to_string(root.join(&rel)) else {
                continue;
            };

            for (i, line) in content.split('\n').enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                let trimmed = line.trim();
                let capped: String = trimmed.chars().take(GREP_LINE_CAP).collect();
                matches.push(GrepMatch {
                    source: source_name.clone(),
                    file: rel.clone(),
                    line: i + 1,
                    content: capped,
                });
                if matches.len() >= opts.max_results {
                    break 'outer;
                }
            }
        }
    }

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        std::fs::write(root.join("src/a.ts"), "export const one = 1;\n").unwrap();
        std::fs::write(root.join("src/b.ts"), "export const two = 2;\n").unwrap();
        std::fs::write(root.join("README.md"), "# readme\n").unwrap();
        std::fs::write(root.join("node_modules/dep/x.ts"), "export const hidden = 0;\n").unwrap();
        tmp
    }

    #[test]
    fn walk_skips_node_modules() {
        let tmp = fixture();
        let paths = walk_source(tmp.path());
        assert!(paths.contains(&"src/a.ts".to_string()));
        assert!(!paths.iter().any(|p| p.contains("node_modules")));
    }

    #[test]
    fn list_with_glob() {
        let tmp = fixture();
        let entries = list_files(tmp.path(), Some("**/*.ts")).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.ts", "src/b.ts"]);
    }

    #[test]
    fn traversal_rejected() {
        let tmp = fixture();
        let err = read_file(tmp.path(), "../../../etc/passwd").unwrap_err();
        assert!(matches!(err, FileError::PathTraversal { .. }));
        assert!(err.to_string().contains("Path traversal"));
    }

    #[test]
    fn read_many_mixes_paths_and_globs() {
        let tmp = fixture();
        let out = read_many(
            tmp.path(),
            &["README.md".to_string(), "src/*.ts".to_string(), "missing.txt".to_string()],
        );
        assert_eq!(out["README.md"], "# readme\n");
        assert!(out.contains_key("src/a.ts"));
        assert!(out.contains_key("src/b.ts"));
        assert!(out["missing.txt"].starts_with("[Error:"));
    }

    #[test]
    fn grep_is_case_insensitive_and_capped() {
        let tmp = fixture();
        let sources = vec![("demo".to_string(), tmp.path().to_path_buf())];
        let opts = GrepOptions {
            include: Some("*.ts"),
            max_results: 1,
            case_sensitive: false,
        };
        let matches = grep("EXPORT", &sources, &opts).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].source, "demo");
        assert_eq!(matches[0].line, 1);
    }

    #[test]
    fn tree_respects_depth() {
        let tmp = fixture();
        let node = tree(tmp.path(), 1, None).unwrap();
        let children = node.children.unwrap();
        let src = children.iter().find(|c| c.name == "src").unwrap();
        // Depth exhausted below src, so its children list is empty.
        assert!(src.children.as_ref().unwrap().is_empty());
    }
}
