//! Source registry: the in-memory list of ingested sources, mirrored to
//! the `sources.json` manifest.
//!
//! The in-memory list is authoritative for the session; every mutation
//! writes through to disk. The manifest splits sources into `packages`
//! and `repos` arrays, the layout the fetcher also reads.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::{Source, SourceKind};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    packages: Vec<Source>,
    #[serde(default)]
    repos: Vec<Source>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

pub struct SourceRegistry {
    data_root: PathBuf,
    manifest_path: PathBuf,
    sources: Mutex<Vec<Source>>,
}

impl SourceRegistry {
    /// Load the registry from `sources.json`, dropping entries whose
    /// directories no longer exist on disk. A missing manifest is an
    /// empty registry.
    pub fn load(data_root: &Path, manifest_path: &Path) -> Result<SourceRegistry> {
        let mut sources = Vec::new();

        if manifest_path.exists() {
            let content = std::fs::read_to_string(manifest_path).with_context(|| {
                format!("Failed to read manifest: {}", manifest_path.display())
            })?;
            let manifest: Manifest =
                serde_json::from_str(&content).with_context(|| "Failed to parse sources.json")?;

            for source in manifest.packages.into_iter().chain(manifest.repos) {
                if source.dir(data_root).is_dir() {
                    sources.push(source);
                }
            }
        }

        Ok(SourceRegistry {
            data_root: data_root.to_path_buf(),
            manifest_path: manifest_path.to_path_buf(),
            sources: Mutex::new(sources),
        })
    }

    pub fn list(&self) -> Vec<Source> {
        self.sources.lock().expect("registry mutex poisoned").clone()
    }

    pub fn get(&self, name: &str) -> Option<Source> {
        self.sources
            .lock()
            .expect("registry mutex poisoned")
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn has(&self, name: &str, version: Option<&str>) -> bool {
        match self.get(name) {
            Some(source) => version.map(|v| source.version == v).unwrap_or(true),
            None => false,
        }
    }

    /// Absolute on-disk directory for a registered source name.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|s| s.dir(&self.data_root))
    }

    /// Register or replace a source and write the manifest through.
    /// Callers must only do this after the source directory is fully
    /// populated.
    pub fn add(&self, source: Source) -> Result<()> {
        {
            let mut sources = self.sources.lock().expect("registry mutex poisoned");
            sources.retain(|s| s.name != source.name);
            sources.push(source);
            sources.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.save()
    }

    /// Remove sources by name; returns the names actually removed.
    pub fn remove(&self, names: &[String]) -> Result<Vec<String>> {
        let removed: Vec<String>;
        {
            let mut sources = self.sources.lock().expect("registry mutex poisoned");
            removed = sources
                .iter()
                .filter(|s| names.contains(&s.name))
                .map(|s| s.name.clone())
                .collect();
            sources.retain(|s| !names.contains(&s.name));
        }
        if !removed.is_empty() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Persist the current in-memory list to `sources.json`.
    pub fn save(&self) -> Result<()> {
        let sources = self.sources.lock().expect("registry mutex poisoned");
        let mut manifest = Manifest {
            updated_at: Some(Utc::now().to_rfc3339()),
            ..Default::default()
        };
        for source in sources.iter() {
            if source.kind == SourceKind::Repo {
                manifest.repos.push(source.clone());
            } else {
                manifest.packages.push(source.clone());
            }
        }
        drop(sources);

        if let Some(parent) = self.manifest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&self.manifest_path, json).with_context(|| {
            format!("Failed to write manifest: {}", self.manifest_path.display())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, kind: SourceKind, path: &str) -> Source {
        Source {
            kind,
            name: name.to_string(),
            version: "1.0.0".to_string(),
            path: PathBuf::from(path),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn add_list_remove_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("packages/npm/zod")).unwrap();
        let manifest = root.join("sources.json");

        let registry = SourceRegistry::load(root, &manifest).unwrap();
        registry
            .add(sample("zod", SourceKind::Npm, "packages/npm/zod"))
            .unwrap();

        assert!(registry.has("zod", None));
        assert!(registry.has("zod", Some("1.0.0")));
        assert!(!registry.has("zod", Some("2.0.0")));
        assert_eq!(registry.list().len(), 1);
        assert!(manifest.exists());

        // A fresh load sees the persisted entry.
        let reloaded = SourceRegistry::load(root, &manifest).unwrap();
        assert!(reloaded.get("zod").is_some());

        let removed = registry.remove(&["zod".to_string()]).unwrap();
        assert_eq!(removed, vec!["zod".to_string()]);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn load_drops_entries_without_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        let manifest = root.join("sources.json");

        let registry = SourceRegistry::load(root, &manifest).unwrap();
        std::fs::create_dir_all(root.join("packages/npm/kept")).unwrap();
        registry
            .add(sample("kept", SourceKind::Npm, "packages/npm/kept"))
            .unwrap();
        registry
            .add(sample("ghost", SourceKind::Npm, "packages/npm/ghost"))
            .unwrap();

        let reloaded = SourceRegistry::load(root, &manifest).unwrap();
        assert!(reloaded.get("kept").is_some());
        assert!(reloaded.get("ghost").is_none());
    }

    #[test]
    fn resolve_returns_absolute_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("repos/github.com/a/b")).unwrap();
        let registry = SourceRegistry::load(root, &root.join("sources.json")).unwrap();
        registry
            .add(sample("github.com/a/b", SourceKind::Repo, "repos/github.com/a/b"))
            .unwrap();

        let dir = registry.resolve("github.com/a/b").unwrap();
        assert!(dir.starts_with(root));
        assert!(dir.ends_with("repos/github.com/a/b"));
    }
}
