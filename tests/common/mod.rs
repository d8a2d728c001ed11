//! Shared fixtures: a deterministic embedding stub and an app builder
//! rooted in a temp directory, so no test touches the network or loads a
//! model.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use opensrc::app::App;
use opensrc::config::Config;
use opensrc::embedder::{normalize, EmbedError, EmbeddingProvider};
use opensrc::logging::Logger;
use opensrc::models::{Source, SourceKind};

/// Hash-expanded deterministic vectors: identical text always maps to an
/// identical unit vector, so exact-content queries rank their chunk
/// first.
pub struct StubEmbedder;

pub fn text_vector(text: &str) -> Vec<f32> {
    let mut seed: u64 = 0xcbf2_9ce4_8422_2325;
    for b in text.bytes() {
        seed ^= u64::from(b);
        seed = seed.wrapping_mul(0x0000_0100_0000_01b3);
    }

    let mut state = seed | 1;
    let mut vector = Vec::with_capacity(768);
    for _ in 0..768 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        vector.push(((state % 2001) as i64 - 1000) as f32 / 1000.0);
    }
    normalize(&mut vector);
    vector
}

impl EmbeddingProvider for StubEmbedder {
    fn dims(&self) -> usize {
        768
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| text_vector(t)).collect())
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(text_vector(text))
    }
}

/// Build an [`App`] over a temp data root with the stub embedder.
pub fn test_app(data_root: &Path) -> Arc<App> {
    test_app_with(data_root, Config::default())
}

pub fn test_app_with(data_root: &Path, mut config: Config) -> Arc<App> {
    config.data_root = data_root.to_path_buf();
    App::init(config, Arc::new(Logger::stderr_only()), Arc::new(StubEmbedder))
        .expect("app init failed")
}

/// Create a source directory under the data root and register it.
pub fn register_source(app: &Arc<App>, name: &str, files: &[(&str, &str)]) {
    let rel = format!("packages/npm/{}", name);
    let dir = app.config.data_root.join(&rel);
    for (path, content) in files {
        let target = dir.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();

    app.registry
        .add(Source {
            kind: SourceKind::Npm,
            name: name.to_string(),
            version: "0.0.1".to_string(),
            path: rel.into(),
            fetched_at: Utc::now(),
        })
        .unwrap();
}

/// Poll until a source is checkpointed or the budget runs out.
pub async fn wait_indexed(app: &Arc<App>, name: &str) -> bool {
    for _ in 0..400 {
        if app.store.is_indexed(name).await.unwrap() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    false
}

/// Poll until the engine has nothing queued or running.
pub async fn wait_idle(app: &Arc<App>) {
    for _ in 0..400 {
        if !app.engine.any_pending() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}
