//! Index engine: drives a fetched source from on-disk tree to fully
//! indexed rows with bounded concurrency and cooperative yielding.
//!
//! Per-source state machine:
//!
//! ```text
//! unknown ──enqueue──▶ queued ──schedule──▶ indexing ──finalize──▶ indexed
//!                         │                    │
//!                         └─(duplicate: drop)──┘
//!                                              └──error──▶ unknown (rows deleted)
//! ```
//!
//! `enqueue` is idempotent; the scheduler keeps at most
//! `max_concurrent_index` runs active and re-checks the queue whenever a
//! run finishes. A run streams chunks out of a blocking producer through
//! a bounded channel, embeds and inserts them in batches, and yields to
//! the runtime after every batch so interactive searches never wait
//! behind a long ingestion. `finalize` (the quantized-index rebuild) runs
//! once per source, after the last batch.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::chunk;
use crate::config::Config;
use crate::embedder::EmbeddingProvider;
use crate::logging::Logger;
use crate::models::CodeChunk;
use crate::sources::SourceRegistry;
use crate::store::VectorStore;

/// In-memory indexing status. `indexed` is not tracked here: it lives in
/// the store's `indexed_sources` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Queued,
    Indexing,
}

/// Directories never ingested, on top of the global ignore set.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "target",
    "coverage",
];

/// File names ingestion skips even when the extension matches.
const IGNORED_FILES: &[&str] = &["CHANGELOG.md", "HISTORY.md"];

struct EngineState {
    queue: VecDeque<String>,
    pending: HashMap<String, PendingState>,
    active: usize,
}

pub struct IndexEngine {
    config: Config,
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<SourceRegistry>,
    logger: Arc<Logger>,
    state: Mutex<EngineState>,
}

impl IndexEngine {
    pub fn new(
        config: Config,
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<SourceRegistry>,
        logger: Arc<Logger>,
    ) -> Arc<IndexEngine> {
        Arc::new(IndexEngine {
            config,
            store,
            embedder,
            registry,
            logger,
            state: Mutex::new(EngineState {
                queue: VecDeque::new(),
                pending: HashMap::new(),
                active: 0,
            }),
        })
    }

    /// Current in-memory status of a source, if it is queued or indexing.
    pub fn pending_state(&self, name: &str) -> Option<PendingState> {
        self.state
            .lock()
            .expect("engine mutex poisoned")
            .pending
            .get(name)
            .copied()
    }

    /// True when any source is currently queued or indexing.
    pub fn any_pending(&self) -> bool {
        !self
            .state
            .lock()
            .expect("engine mutex poisoned")
            .pending
            .is_empty()
    }

    /// Queue a source for indexing. Idempotent: already-indexed,
    /// already-queued, and currently-indexing sources are left alone.
    pub async fn enqueue(self: &Arc<Self>, name: &str) -> Result<()> {
        if self.store.is_indexed(name).await? {
            return Ok(());
        }

        {
            let mut state = self.state.lock().expect("engine mutex poisoned");
            if state.pending.contains_key(name) {
                return Ok(());
            }
            state.pending.insert(name.to_string(), PendingState::Queued);
            state.queue.push_back(name.to_string());
        }

        self.schedule();
        Ok(())
    }

    /// Start queued runs while capacity remains. Called from `enqueue`
    /// and from every finishing run.
    fn schedule(self: &Arc<Self>) {
        loop {
            let name = {
                let mut state = self.state.lock().expect("engine mutex poisoned");
                if state.active >= self.config.max_concurrent_index {
                    break;
                }
                let Some(name) = state.queue.pop_front() else {
                    break;
                };
                state.active += 1;
                state.pending.insert(name.clone(), PendingState::Indexing);
                name
            };

            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = engine.run(&name).await;
                if let Err(e) = outcome {
                    engine.logger.log(
                        crate::logging::Level::Error,
                        "indexing failed",
                        json!({"source": name, "error": e.to_string()}),
                    );
                    // Roll back partial rows so a later enqueue restarts
                    // from a clean slate.
                    if let Err(e) = engine.store.delete_source(&name).await {
                        engine.logger.error(&format!(
                            "failed to clean up partial rows for {}: {}",
                            name, e
                        ));
                    }
                }

                {
                    let mut state = engine.state.lock().expect("engine mutex poisoned");
                    state.active -= 1;
                    state.pending.remove(&name);
                }
                engine.schedule();
            });
        }
    }

    /// One full ingestion run for a source.
    async fn run(&self, name: &str) -> Result<()> {
        let root = self
            .registry
            .resolve(name)
            .with_context(|| format!("Source '{}' is not registered", name))?;

        self.logger.log(
            crate::logging::Level::Info,
            "indexing started",
            json!({"source": name}),
        );

        let files = enumerate_files(&root);
        let total_files = files.len();

        // Producer: read and chunk files on a blocking thread, pushing
        // chunks through a bounded channel so memory stays flat no matter
        // how large the source is.
        let (tx, mut rx) = mpsc::channel::<CodeChunk>(self.config.batch_size * 2);
        let producer_root = root.clone();
        let producer = tokio::task::spawn_blocking(move || {
            for rel in files {
                let Ok(content) = std::fs::read_to_string(producer_root.join(&rel)) else {
                    continue;
                };
                for chunk in chunk::chunk_file(&rel, &content) {
                    if tx.blocking_send(chunk).is_err() {
                        return;
                    }
                }
            }
        });

        let mut batch: Vec<CodeChunk> = Vec::with_capacity(self.config.batch_size);
        let mut total_chunks = 0usize;

        while let Some(chunk) = rx.recv().await {
            batch.push(chunk);
            if batch.len() >= self.config.batch_size {
                total_chunks += self.flush_batch(name, std::mem::take(&mut batch)).await?;
                // Let queued searches run between batches.
                tokio::task::yield_now().await;
            }
        }
        if !batch.is_empty() {
            total_chunks += self.flush_batch(name, batch).await?;
        }

        producer.await.context("chunk producer panicked")?;

        if total_chunks > 0 {
            self.store.finalize().await?;
        }
        self.store.mark_indexed(name).await?;

        self.logger.log(
            crate::logging::Level::Info,
            "indexing finished",
            json!({"source": name, "files": total_files, "chunks": total_chunks}),
        );
        Ok(())
    }

    /// Embed one batch and insert it in a single transaction.
    async fn flush_batch(&self, name: &str, batch: Vec<CodeChunk>) -> Result<usize> {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let embedder = Arc::clone(&self.embedder);
        let embeddings = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
            .await
            .context("embedding task panicked")??;

        let inserted = self
            .store
            .insert_batch(name, batch, embeddings)
            .await
            .context("insert batch failed")?;
        Ok(inserted)
    }
}

/// Files a run ingests: the chunkable extensions minus declaration files,
/// minified bundles, changelogs, and build-output directories. Sorted so
/// insertion order (and therefore row-id order) is deterministic.
pub fn enumerate_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|n| IGNORED_DIRS.contains(&n))
                    .unwrap_or(false))
        })
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if IGNORED_FILES.iter().any(|f| f.eq_ignore_ascii_case(&name)) {
            continue;
        }
        if name.ends_with(".d.ts") || name.ends_with(".min.js") {
            continue;
        }
        let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !chunk::is_indexable_extension(ext) {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push(rel);
    }

    files.sort();
    files
}
