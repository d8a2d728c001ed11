//! The long-lived application value.
//!
//! Everything mutable lives here — registry, store, embedder, index
//! engine — constructed once in `main` and passed explicitly to the
//! server and sandbox. No file-scope state.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::config::Config;
use crate::embedder::EmbeddingProvider;
use crate::fetch::{parse_spec, Fetcher};
use crate::index::IndexEngine;
use crate::logging::Logger;
use crate::models::{FetchedSource, SourceKind};
use crate::sources::SourceRegistry;
use crate::store::VectorStore;

/// Category filter for [`App::clean`]. All-false means everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanFilter {
    pub packages: bool,
    pub repos: bool,
    pub npm: bool,
    pub pypi: bool,
    pub crates: bool,
}

impl CleanFilter {
    fn is_empty(&self) -> bool {
        !(self.packages || self.repos || self.npm || self.pypi || self.crates)
    }

    fn matches(&self, kind: SourceKind) -> bool {
        if self.is_empty() {
            return true;
        }
        match kind {
            SourceKind::Npm => self.npm || self.packages,
            SourceKind::Pypi => self.pypi || self.packages,
            SourceKind::Crates => self.crates || self.packages,
            SourceKind::Repo => self.repos,
        }
    }
}

pub struct App {
    pub config: Config,
    pub logger: Arc<Logger>,
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub engine: Arc<IndexEngine>,
}

impl App {
    /// Wire up the application: manifest, store, embedder, engine.
    /// Store-open failures (including a missing vector extension) are
    /// fatal here, before the transport connects.
    pub fn init(
        config: Config,
        logger: Arc<Logger>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Arc<App>> {
        std::fs::create_dir_all(&config.data_root).with_context(|| {
            format!("Failed to create data root: {}", config.data_root.display())
        })?;

        let registry = Arc::new(SourceRegistry::load(
            &config.data_root,
            &config.manifest_path(),
        )?);
        let store = Arc::new(VectorStore::open(&config.data_root)?);
        let engine = IndexEngine::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&embedder),
            Arc::clone(&registry),
            Arc::clone(&logger),
        );

        Ok(Arc::new(App {
            config,
            logger,
            registry,
            store,
            embedder,
            engine,
        }))
    }

    /// Enqueue every registered source that is on disk but missing from
    /// `indexed_sources`. Called once at startup.
    pub async fn enqueue_unindexed(self: &Arc<Self>) -> Result<()> {
        for source in self.registry.list() {
            if !self.store.is_indexed(&source.name).await? {
                self.engine.enqueue(&source.name).await?;
            }
        }
        Ok(())
    }

    /// Fetch a list of specs. One record per spec; failures never abort
    /// sibling specs. Newly fetched (or replaced) sources are registered
    /// once their directory is fully populated, then queued for indexing.
    pub async fn fetch(self: &Arc<Self>, specs: &[String], modify: bool) -> Vec<FetchedSource> {
        let mut results = Vec::with_capacity(specs.len());

        for raw in specs {
            let parsed = match parse_spec(raw) {
                Ok(p) => p,
                Err(e) => {
                    results.push(FetchedSource {
                        name: raw.clone(),
                        path: String::new(),
                        already_existed: false,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            let existing = self.registry.get(&parsed.name);
            if let Some(source) = existing {
                if !modify {
                    results.push(FetchedSource {
                        name: source.name.clone(),
                        path: source.path.to_string_lossy().to_string(),
                        already_existed: true,
                        error: None,
                    });
                    continue;
                }
            }

            results.push(self.fetch_one(&parsed).await);
        }

        results
    }

    async fn fetch_one(self: &Arc<Self>, parsed: &crate::models::ParsedSpec) -> FetchedSource {
        let data_root = self.config.data_root.clone();
        let spec = parsed.clone();
        let fetched = tokio::task::spawn_blocking(move || {
            let fetcher = Fetcher::new(&data_root)?;
            fetcher.fetch(&spec)
        })
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("fetch task panicked: {}", e)));

        match fetched {
            Ok(source) => {
                let name = source.name.clone();
                let path = source.path.to_string_lossy().to_string();

                // A replaced tree invalidates whatever was indexed before.
                if let Err(e) = self.store.delete_source(&name).await {
                    self.logger
                        .error(&format!("failed to drop stale rows for {}: {}", name, e));
                }

                if let Err(e) = self.registry.add(source) {
                    return FetchedSource {
                        name,
                        path,
                        already_existed: false,
                        error: Some(e.to_string()),
                    };
                }

                self.logger.log(
                    crate::logging::Level::Info,
                    "source fetched",
                    json!({"source": name}),
                );

                if let Err(e) = self.engine.enqueue(&name).await {
                    self.logger
                        .error(&format!("failed to enqueue {}: {}", name, e));
                }

                FetchedSource {
                    name,
                    path,
                    already_existed: false,
                    error: None,
                }
            }
            Err(e) => FetchedSource {
                name: parsed.name.clone(),
                path: String::new(),
                already_existed: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Remove sources by name: registry entry, on-disk tree, and store
    /// rows. Returns the names actually removed.
    pub async fn remove(&self, names: &[String]) -> Result<Vec<String>> {
        let dirs: Vec<_> = names
            .iter()
            .filter_map(|n| self.registry.resolve(n).map(|d| (n.clone(), d)))
            .collect();

        let removed = self.registry.remove(names)?;

        for (name, dir) in dirs {
            if !removed.contains(&name) {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                self.logger
                    .warn(&format!("failed to delete {}: {}", dir.display(), e));
            }
            self.store.delete_source(&name).await?;
            self.logger.log(
                crate::logging::Level::Info,
                "source removed",
                json!({"source": name}),
            );
        }

        Ok(removed)
    }

    /// Remove every source matching the filter.
    pub async fn clean(&self, filter: CleanFilter) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| filter.matches(s.kind))
            .map(|s| s.name)
            .collect();
        self.remove(&names).await
    }

    /// Persist the manifest; called on shutdown.
    pub fn shutdown(&self) {
        if let Err(e) = self.registry.save() {
            self.logger.error(&format!("failed to persist manifest: {}", e));
        }
        self.logger.info("shutdown complete");
    }
}
