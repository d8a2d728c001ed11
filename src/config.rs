use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Resolved runtime configuration.
///
/// Built from [`load_config`]: defaults, overlaid by `opensrc.toml` in the
/// data root when present. The data root itself comes from the environment
/// (`OPENSRC_DIR`, then `$XDG_DATA_HOME/opensrc`, then
/// `~/.local/share/opensrc`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub data_root: PathBuf,

    /// Chunks accumulated between embed/insert rounds during indexing.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sources indexing at the same time.
    #[serde(default = "default_max_concurrent_index")]
    pub max_concurrent_index: usize,

    /// Character budget per embedding input; longer texts are truncated
    /// with a marker.
    #[serde(default = "default_max_embed_chars")]
    pub max_embed_chars: usize,

    /// Default number of semantic search results.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Default cap on grep matches.
    #[serde(default = "default_grep_max_results")]
    pub grep_max_results: usize,

    /// Default cap on ast_grep matches.
    #[serde(default = "default_astgrep_limit")]
    pub astgrep_limit: usize,

    /// Wall-clock budget for one agent script, in seconds.
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,

    /// Tool replies longer than this are cut and given a guidance footer.
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

fn default_batch_size() -> usize {
    50
}
fn default_max_concurrent_index() -> usize {
    2
}
fn default_max_embed_chars() -> usize {
    1800
}
fn default_top_k() -> usize {
    20
}
fn default_grep_max_results() -> usize {
    100
}
fn default_astgrep_limit() -> usize {
    1000
}
fn default_script_timeout_secs() -> u64 {
    30
}
fn default_max_result_chars() -> usize {
    // 8000 tokens at ~4 chars per token.
    32_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::new(),
            batch_size: default_batch_size(),
            max_concurrent_index: default_max_concurrent_index(),
            max_embed_chars: default_max_embed_chars(),
            top_k: default_top_k(),
            grep_max_results: default_grep_max_results(),
            astgrep_limit: default_astgrep_limit(),
            script_timeout_secs: default_script_timeout_secs(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_root.join("vector.db")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_root.join("sources.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_root.join("logs").join("opensrc-mcp.log")
    }
}

/// Resolve the data root from the environment.
///
/// Precedence: `OPENSRC_DIR`, `$XDG_DATA_HOME/opensrc`,
/// `$HOME/.local/share/opensrc`.
pub fn data_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("OPENSRC_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join("opensrc"));
        }
    }
    let home = std::env::var("HOME").context("HOME is not set; set OPENSRC_DIR explicitly")?;
    Ok(PathBuf::from(home).join(".local/share/opensrc"))
}

/// Load the configuration for a given data root.
///
/// Reads `<data_root>/opensrc.toml` when it exists; otherwise every field
/// takes its default. Values are validated before use.
pub fn load_config(root: &Path) -> Result<Config> {
    let config_path = root.join("opensrc.toml");

    let mut config: Config = if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    config.data_root = root.to_path_buf();

    if config.batch_size == 0 {
        anyhow::bail!("batch_size must be > 0");
    }
    if config.max_concurrent_index == 0 {
        anyhow::bail!("max_concurrent_index must be > 0");
    }
    if config.top_k == 0 {
        anyhow::bail!("top_k must be > 0");
    }
    if config.max_embed_chars < 16 {
        anyhow::bail!("max_embed_chars must be >= 16");
    }
    if config.script_timeout_secs == 0 {
        anyhow::bail!("script_timeout_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_concurrent_index, 2);
        assert_eq!(config.max_embed_chars, 1800);
        assert_eq!(config.max_result_chars, 32_000);
    }

    #[test]
    fn load_rejects_zero_batch() {
        let tmp = std::env::temp_dir().join("opensrc-config-test");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("opensrc.toml"), "batch_size = 0\n").unwrap();
        assert!(load_config(&tmp).is_err());
        std::fs::remove_dir_all(&tmp).ok();
    }
}
