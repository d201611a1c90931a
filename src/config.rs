//! Layered configuration: built-in defaults, an optional TOML file, then
//! `TRIPVECTOR_*` environment variables (`__` separates nested keys, e.g.
//! `TRIPVECTOR_SYNC__CONCURRENCY=4`).

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::sync::SyncOptions;
use crate::vector::VectorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "TRIPVECTOR";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub embedding: EmbeddingConfig,
    pub index: VectorConfig,
    pub checkpoint: CheckpointConfig,
    pub snapshot: SnapshotConfig,
    pub sync: SyncConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub model: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    /// Ask the API for `index.embedding_dim`-sized vectors.
    pub request_dimensions: bool,
    /// Inputs are cut to this many characters before embedding.
    pub max_input_chars: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Model cache for the local provider.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_dimensions: true,
            max_input_chars: 8_000,
            timeout_secs: 30,
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_max_ms: 16_000,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Rows processed between checkpoint saves.
    pub interval: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("checkpoint.json"),
            interval: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub path: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("snapshot.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Embedding calls in flight at once.
    pub concurrency: usize,
    /// List remote ids on every run, not only when the snapshot is empty.
    pub reconcile_remote: bool,
    /// Timeout for each index call.
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            reconcile_remote: false,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// `top_k` used when the caller gives none.
    pub default_top_k: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { default_top_k: 5 }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("tripvector"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// `<config_dir>/tripvector/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tripvector").join("config.toml"))
}

impl AppConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some((path.to_path_buf(), true)),
            None => default_config_path().map(|path| (path, false)),
        };
        Self::from_sources(file, ::config::Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(
        file: Option<(PathBuf, bool)>,
        environment: ::config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some((path, required)) = file {
            tracing::debug!(path = %path.display(), required, "loading config file");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(required),
            );
        }
        let config: AppConfig = builder
            .add_source(
                environment
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("index.embedding_dim", self.index.embedding_dim),
            ("index.batch_size", self.index.batch_size),
            ("index.batch_attempts", self.index.batch_attempts as usize),
            ("index.list_ids_limit", self.index.list_ids_limit),
            ("index.max_results.hotel", self.index.max_results.hotel),
            ("index.max_results.place", self.index.max_results.place),
            ("index.max_results.restaurant", self.index.max_results.restaurant),
            ("checkpoint.interval", self.checkpoint.interval),
            ("sync.concurrency", self.sync.concurrency),
            ("sync.request_timeout_secs", self.sync.request_timeout_secs as usize),
            ("embedding.max_input_chars", self.embedding.max_input_chars),
            ("embedding.max_attempts", self.embedding.max_attempts as usize),
            ("embedding.timeout_secs", self.embedding.timeout_secs as usize),
            ("query.default_top_k", self.query.default_top_k),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }
        if self.index.table_name.trim().is_empty() {
            return Err(ConfigError::Invalid("index.table_name must not be empty".into()));
        }
        Ok(())
    }

    /// Configured API key, else `OPENAI_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.embedding
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_secs)
    }

    pub fn embedding_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.embedding.max_attempts,
            Duration::from_millis(self.embedding.backoff_base_ms),
            Duration::from_millis(self.embedding.backoff_max_ms),
        )
    }

    /// Retry policy for index calls. Shares the embedding backoff timings.
    pub fn index_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.index.batch_attempts,
            Duration::from_millis(self.embedding.backoff_base_ms),
            Duration::from_millis(self.embedding.backoff_max_ms),
        )
    }

    /// Timeout for each index call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    /// Engine settings derived from the `[sync]`, `[index]` and
    /// `[checkpoint]` sections.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            checkpoint_interval: self.checkpoint.interval,
            concurrency: self.sync.concurrency,
            reconcile_remote: self.sync.reconcile_remote,
            list_ids_limit: self.index.list_ids_limit,
            batch_size: self.index.batch_size,
            index_retry: self.index_retry(),
            request_timeout: self.request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::IndexBackend;

    fn env(vars: &[(&str, &str)]) -> ::config::Environment {
        let source: ::config::Map<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ::config::Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.index.batch_size, 100);
        assert_eq!(config.sync.concurrency, 1);
        assert_eq!(config.embedding.provider, ProviderKind::OpenAi);
    }

    #[test]
    fn test_toml_file_then_env_override() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[embedding]
provider = "local"

[index]
backend = "memory"
batch_size = 25

[index.max_results]
place = 12

[checkpoint]
interval = 10
"#,
        )
        .unwrap();

        let config = AppConfig::from_sources(
            Some((path, true)),
            env(&[
                ("TRIPVECTOR_CHECKPOINT__INTERVAL", "7"),
                ("TRIPVECTOR_SYNC__RECONCILE_REMOTE", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(config.embedding.provider, ProviderKind::Local);
        assert_eq!(config.index.backend, IndexBackend::Memory);
        assert_eq!(config.index.batch_size, 25);
        assert_eq!(config.index.max_results.place, 12);
        assert_eq!(config.index.max_results.hotel, 20);
        assert_eq!(config.checkpoint.interval, 7);
        assert!(config.sync.reconcile_remote);
    }

    #[test]
    fn test_missing_required_file_is_an_error() {
        let result = AppConfig::from_sources(
            Some((PathBuf::from("/nonexistent/tripvector.toml"), true)),
            env(&[]),
        );
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let result =
            AppConfig::from_sources(None, env(&[("TRIPVECTOR_INDEX__BATCH_SIZE", "0")]));
        match result {
            Err(ConfigError::Invalid(message)) => assert!(message.contains("index.batch_size")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_options_follow_config() {
        let mut config = AppConfig::default();
        config.index.batch_size = 2;
        config.index.batch_attempts = 5;
        config.checkpoint.interval = 3;
        let options = config.sync_options();
        assert_eq!(options.batch_size, 2);
        assert_eq!(options.index_retry.max_attempts, 5);
        assert_eq!(options.checkpoint_interval, 3);
        assert_eq!(options.request_timeout, config.request_timeout());
    }
}
