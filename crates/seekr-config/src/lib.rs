//! Configuration for seekr.
//!
//! Values are layered, lowest to highest precedence:
//! built-in defaults, the user file (`~/.config/seekr/config.toml`), the
//! workspace file (`<root>/.seekr.toml`), an explicit `--config` file, and
//! finally `SEEKR__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix; keys look like `SEEKR__SEARCH__HYBRID`.
pub const ENV_PREFIX: &str = "SEEKR";

/// Workspace-local configuration file name.
pub const WORKSPACE_FILE: &str = ".seekr.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable '{var}' is not set (from config value '{value}')")]
    MissingEnv { var: String, value: String },

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub enabled: bool,
    /// File extensions to index, without dots
    pub extensions: Vec<String>,
    /// Files larger than this many bytes are skipped
    pub max_file_size: u64,
    pub files_per_batch: usize,
    pub parse_cache_capacity: usize,
    pub recency_window_secs: u64,
    pub respect_gitignore: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extensions: [
                "rs", "py", "js", "jsx", "mjs", "ts", "tsx", "go", "java", "c", "h", "cpp", "hpp",
                "rb", "md",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: 1024 * 1024,
            files_per_batch: 10,
            parse_cache_capacity: 500,
            recency_window_secs: 300,
            respect_gitignore: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    /// Server URL; a bare host name means plain HTTP on port 80
    pub url: Option<String>,
    /// Supports `${ENV_VAR}` syntax
    pub api_key: Option<String>,
    /// Appended to the workspace collection name to isolate a sub-index
    pub collection_suffix: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            collection_suffix: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// OpenAI-compatible API root; requests go to `{base_url}/embeddings`
    pub base_url: String,
    pub model: String,
    /// Supports `${ENV_VAR}` syntax
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub timeout_secs: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: Some("${OPENAI_API_KEY}".to_string()),
            dimensions: 1536,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub hybrid: bool,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub max_results: usize,
    pub min_score: Option<f32>,
    pub rrf_k: f32,
    pub result_ttl_secs: u64,
    pub result_capacity: u64,
    pub embedding_ttl_secs: u64,
    pub embedding_capacity: u64,
    pub keyword_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            hybrid: true,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            max_results: 20,
            min_score: None,
            rrf_k: 60.0,
            result_ttl_secs: 600,
            result_capacity: 100,
            embedding_ttl_secs: 3600,
            embedding_capacity: 1000,
            keyword_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub debounce_ms: u64,
    /// Where fingerprint documents live; `~` is expanded
    pub state_dir: Option<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            state_dir: None,
        }
    }
}

impl FingerprintConfig {
    /// Configured state directory, or the platform data directory.
    pub fn state_dir(&self) -> Option<PathBuf> {
        match &self.state_dir {
            Some(dir) if !dir.is_empty() => Some(PathBuf::from(shellexpand::tilde(dir).into_owned())),
            _ => dirs::data_local_dir().map(|d| d.join("seekr")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub qdrant: QdrantConfig,
    pub embedder: EmbedderConfig,
    pub search: SearchConfig,
    pub fingerprint: FingerprintConfig,
    pub branch: BranchConfig,
    pub watcher: WatcherConfig,
}

impl Config {
    /// Load the layered configuration for `workspace_root`.
    pub fn load(workspace_root: Option<&Path>, config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(user_config_path().as_deref(), workspace_root, config_file, ENV_PREFIX)
    }

    /// Like [`Config::load`] with every source spelled out.
    pub fn load_with(
        user_file: Option<&Path>,
        workspace_root: Option<&Path>,
        config_file: Option<&Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = user_file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        if let Some(root) = workspace_root {
            builder = builder.add_source(config::File::from(root.join(WORKSPACE_FILE)).required(false));
        }
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("index.extensions"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check value ranges. Returns every problem found, joined.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.index.extensions.is_empty() {
            problems.push("index.extensions must not be empty".to_string());
        }
        if self.index.files_per_batch == 0 {
            problems.push("index.files_per_batch must be at least 1".to_string());
        }
        if self.index.parse_cache_capacity == 0 {
            problems.push("index.parse_cache_capacity must be at least 1".to_string());
        }
        if self.embedder.dimensions == 0 {
            problems.push("embedder.dimensions must be at least 1".to_string());
        }
        if self.embedder.model.trim().is_empty() {
            problems.push("embedder.model must be set".to_string());
        }
        if self.embedder.base_url.trim().is_empty() {
            problems.push("embedder.base_url must be set".to_string());
        }
        for (name, weight) in [
            ("search.semantic_weight", self.search.semantic_weight),
            ("search.keyword_weight", self.search.keyword_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                problems.push(format!("{name} must be between 0 and 1, got {weight}"));
            }
        }
        if self.search.max_results == 0 {
            problems.push("search.max_results must be at least 1".to_string());
        }
        if let Some(min) = self.search.min_score {
            if !(-1.0..=1.0).contains(&min) {
                problems.push(format!("search.min_score must be between -1 and 1, got {min}"));
            }
        }
        if self.search.rrf_k <= 0.0 {
            problems.push("search.rrf_k must be positive".to_string());
        }
        if self.search.result_capacity == 0 || self.search.embedding_capacity == 0 {
            problems.push("search cache capacities must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    /// Effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.index.recency_window_secs)
    }
}

/// `~/.config/seekr/config.toml`, when a config directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("seekr").join("config.toml"))
}

/// Expand `${ENV_VAR}` references in a configured value.
pub fn expand_env(value: &str) -> Result<String, ConfigError> {
    shellexpand::env(value)
        .map(|v| v.into_owned())
        .map_err(|e| ConfigError::MissingEnv {
            var: e.var_name,
            value: value.to_string(),
        })
}

/// Resolve an optional secret. Unset or empty values are `None`.
pub fn resolve_secret(value: Option<&str>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => {
            let expanded = expand_env(v)?;
            Ok(if expanded.is_empty() { None } else { Some(expanded) })
        }
        _ => Ok(None),
    }
}
