//! Query planner: translates the three query verbs — lexical grep,
//! structural ast_grep, and semantic search — into passes over the file
//! layer, the AST matcher, and the vector store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::astgrep::{CompiledPattern, Lang};
use crate::config::Config;
use crate::embedder::EmbeddingProvider;
use crate::files;
use crate::index::IndexEngine;
use crate::models::{AstMatch, GrepMatch, SearchResult};
use crate::sources::SourceRegistry;
use crate::store::VectorStore;

/// Options for the grep verb.
#[derive(Debug, Default)]
pub struct GrepParams {
    /// Restrict the scan to these sources; all registered sources
    /// otherwise.
    pub sources: Option<Vec<String>>,
    pub include: Option<String>,
    pub max_results: Option<usize>,
    pub case_sensitive: bool,
}

/// Options for the ast_grep verb.
#[derive(Debug, Default)]
pub struct AstGrepParams {
    pub glob: Option<String>,
    /// Language override; file extensions decide otherwise.
    pub langs: Option<Vec<String>>,
    pub limit: Option<usize>,
}

/// Options for semantic search.
#[derive(Debug, Default)]
pub struct SemanticParams {
    pub sources: Option<Vec<String>>,
    pub top_k: Option<usize>,
}

/// Semantic search either produces results or a typed "not ready" shape
/// the agent can retry on.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SemanticOutcome {
    Results(Vec<SearchResult>),
    NotReady {
        error: &'static str,
        sources: Vec<String>,
    },
}

/// Regex search over one, several, or all sources.
pub fn grep(
    registry: &SourceRegistry,
    config: &Config,
    pattern: &str,
    params: &GrepParams,
) -> Result<Vec<GrepMatch>> {
    let mut roots = Vec::new();
    match &params.sources {
        Some(names) => {
            for name in names {
                let root = registry
                    .resolve(name)
                    .with_context(|| format!("Source not found: {}", name))?;
                roots.push((name.clone(), root));
            }
        }
        None => {
            for source in registry.list() {
                roots.push((source.name.clone(), source.dir(&config.data_root)));
            }
        }
    }

    let opts = files::GrepOptions {
        include: params.include.as_deref(),
        max_results: params.max_results.unwrap_or(config.grep_max_results),
        case_sensitive: params.case_sensitive,
    };
    Ok(files::grep(pattern, &roots, &opts)?)
}

/// Structural pattern search over one source's files.
///
/// Files are chosen by the glob (default: every file a grammar covers),
/// parsed with the language their extension implies unless the caller
/// overrides it, and unparseable files are skipped silently. Stops at
/// `limit` matches.
pub fn ast_grep(
    registry: &SourceRegistry,
    config: &Config,
    source: &str,
    pattern: &str,
    params: &AstGrepParams,
) -> Result<Vec<AstMatch>> {
    let root = registry
        .resolve(source)
        .with_context(|| format!("Source not found: {}", source))?;

    let lang_filter: Option<Vec<Lang>> = match &params.langs {
        Some(names) => {
            let mut langs = Vec::new();
            for name in names {
                let lang = Lang::from_name(name)
                    .with_context(|| format!("Unknown ast_grep language: {}", name))?;
                langs.push(lang);
            }
            Some(langs)
        }
        None => None,
    };

    let glob = params.glob.as_deref();
    let limit = params.limit.unwrap_or(config.astgrep_limit);

    let candidates = files::list_files(&root, glob.or(Some("**/*")))?;

    let mut compiled: HashMap<&'static str, CompiledPattern> = HashMap::new();
    let mut matches = Vec::new();

    for entry in candidates {
        if matches.len() >= limit {
            break;
        }
        let ext = std::path::Path::new(&entry.path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let Some(lang) = Lang::from_extension(ext) else {
            continue;
        };
        if let Some(ref allowed) = lang_filter {
            if !allowed.contains(&lang) {
                continue;
            }
        }

        let key = lang_key(lang);
        if !compiled.contains_key(key) {
            match CompiledPattern::compile(pattern, lang) {
                Ok(p) => {
                    compiled.insert(key, p);
                }
                // A pattern the grammar cannot parse matches nothing in
                // that language.
                Err(_) => continue,
            }
        }
        let compiled_pattern = compiled.get(key).expect("just inserted");

        let Ok(content) = files::read_file(&root, &entry.path) else {
            continue;
        };
        let remaining = limit - matches.len();
        if let Ok(mut found) = compiled_pattern.search(&entry.path, &content, remaining) {
            matches.append(&mut found);
        }
    }

    Ok(matches)
}

fn lang_key(lang: Lang) -> &'static str {
    match lang {
        Lang::TypeScript => "ts",
        Lang::Tsx => "tsx",
        Lang::JavaScript => "js",
        Lang::Rust => "rs",
    }
}

/// Embed the query and scan the vector index, with the readiness checks
/// the agent relies on: an empty idle store is `not_indexed`, a source
/// still being ingested is `indexing`.
pub async fn semantic_search(
    store: &VectorStore,
    engine: &Arc<IndexEngine>,
    embedder: &Arc<dyn EmbeddingProvider>,
    config: &Config,
    query: &str,
    params: &SemanticParams,
) -> Result<SemanticOutcome> {
    if query.trim().is_empty() {
        bail!("Query must not be empty");
    }

    if store.count_chunks().await? == 0 && !engine.any_pending() {
        return Ok(SemanticOutcome::NotReady {
            error: "not_indexed",
            sources: Vec::new(),
        });
    }

    if let Some(ref names) = params.sources {
        let mut indexing = Vec::new();
        let mut not_indexed = Vec::new();
        for name in names {
            if engine.pending_state(name).is_some() {
                indexing.push(name.clone());
            } else if !store.is_indexed(name).await? {
                not_indexed.push(name.clone());
            }
        }
        if !indexing.is_empty() {
            return Ok(SemanticOutcome::NotReady {
                error: "indexing",
                sources: indexing,
            });
        }
        if !not_indexed.is_empty() {
            return Ok(SemanticOutcome::NotReady {
                error: "not_indexed",
                sources: not_indexed,
            });
        }
    }

    let top_k = params.top_k.unwrap_or(config.top_k);
    let text = query.to_string();
    let provider = Arc::clone(embedder);
    let vector = tokio::task::spawn_blocking(move || provider.embed_query(&text))
        .await
        .context("embedding task panicked")??;

    let rows = store
        .scan(vector, top_k, params.sources.clone())
        .await?;

    // Scan order is ascending distance; preserve it.
    let results = rows
        .into_iter()
        .map(|(row, distance)| SearchResult {
            source: row.source,
            file: row.file,
            identifier: row.identifier,
            kind: row.kind,
            start_line: row.start_line,
            end_line: row.end_line,
            content: row.content,
            score: 1.0 - distance,
        })
        .collect();

    Ok(SemanticOutcome::Results(results))
}
