//! TOML configuration for the `dedup` binary.
//!
//! Loaded once per invocation by [`load_config`] and validated before any
//! command runs. See `config/dedup.example.toml` for a full example.

use anyhow::{bail, Context, Result};
use imgdedup_core::cluster::BackendKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// File extensions (case-insensitive, without the dot) that are indexed.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 32,
            timeout_secs: 60,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    /// No default: the right value depends on the embedding model.
    pub similarity_threshold: f32,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_ann_candidates")]
    pub ann_candidates: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_ann_candidates() -> usize {
    32
}
fn default_page_size() -> usize {
    1000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Clustering
    let t = config.clustering.similarity_threshold;
    if !(t > 0.0 && t <= 1.0) {
        bail!("clustering.similarity_threshold must be in (0.0, 1.0], got {}", t);
    }
    if config.clustering.ann_candidates == 0 {
        bail!("clustering.ann_candidates must be > 0");
    }
    if config.clustering.page_size == 0 {
        bail!("clustering.page_size must be > 0");
    }

    // Index
    if config.index.extensions.is_empty() {
        bail!("index.extensions must list at least one extension");
    }

    // Embedding
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "thumbnail" => {}
        "http" => {
            if config.embedding.url.is_none() {
                bail!("embedding.url must be specified when provider is 'http'");
            }
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'http'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, http, or thumbnail.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(
            r#"
            [db]
            path = "/tmp/d.sqlite"

            [clustering]
            similarity_threshold = 0.95
            "#,
        )
        .unwrap();
        assert_eq!(cfg.index.extensions, vec!["jpg", "jpeg"]);
        assert_eq!(cfg.embedding.provider, "disabled");
        assert_eq!(cfg.embedding.batch_size, 32);
        assert_eq!(cfg.clustering.backend, BackendKind::Exact);
        assert_eq!(cfg.clustering.page_size, 1000);
    }

    #[test]
    fn threshold_is_required_and_bounded() {
        assert!(parse("[db]\npath = \"x\"\n[clustering]\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[clustering]\nsimilarity_threshold = 0.0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[clustering]\nsimilarity_threshold = 1.2\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[clustering]\nsimilarity_threshold = 1.0\n").is_ok());
    }

    #[test]
    fn http_provider_needs_url_model_and_dims() {
        let base = "[db]\npath = \"x\"\n[clustering]\nsimilarity_threshold = 0.9\n";
        let missing = format!("{}[embedding]\nprovider = \"http\"\nmodel = \"clip\"\n", base);
        assert!(parse(&missing).is_err());
        let full = format!(
            "{}[embedding]\nprovider = \"http\"\nmodel = \"clip\"\ndims = 512\nurl = \"http://localhost:1/embed\"\n",
            base
        );
        assert!(parse(&full).is_ok());
        let unknown = format!("{}[embedding]\nprovider = \"magic\"\n", base);
        assert!(parse(&unknown).is_err());
    }

    #[test]
    fn backend_names_parse() {
        let cfg = parse(
            "[db]\npath = \"x\"\n[clustering]\nsimilarity_threshold = 0.9\nbackend = \"hnsw\"\n",
        )
        .unwrap();
        assert_eq!(cfg.clustering.backend, BackendKind::Hnsw);
    }
}
