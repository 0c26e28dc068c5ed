use std::{env, net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// Name of the variable holding the streaming side-store URI.
pub const STREAM_URI_VAR: &str = "uri";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    feature_repo_path: PathBuf,
    feature_repo_secrets_dir: PathBuf,
    artifact_root: PathBuf,
    stream_uri: Option<String>,
    db_password: Option<String>,
    num_users: usize,
    num_items: usize,
    reference_time: DateTime<Utc>,
    positive_interactions_path: PathBuf,
    negative_interactions_path: PathBuf,
    stream_positive_table: String,
    stream_negative_table: String,
    embedding_dim: NonZeroUsize,
    top_k: NonZeroUsize,
    retrieval_concurrency: NonZeroUsize,
    train_epochs: usize,
    train_learning_rate: f32,
    train_dropout: f32,
    train_seed: u64,
    entry_point: Option<PathBuf>,
    warmup_config_file: PathBuf,
    stage_max_attempts: usize,
    stage_backoff_base_ms: u64,
    stage_backoff_cap_ms: u64,
    db_max_connections: u32,
    db_acquire_timeout: Duration,
    feature_server_connect_timeout: Duration,
    feature_server_total_timeout: Duration,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Reads and validates the worker configuration from the environment.
    ///
    /// The streaming store URI is optional here; the acquisition stage
    /// rejects a missing one when it needs it.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_bind = parse_socket_addr("RECSYS_WORKER_HTTP_BIND", "0.0.0.0:9105")?;
        let feature_repo_path = parse_path("FEATURE_REPO_PATH", "feature_repo");
        let feature_repo_secrets_dir = env::var("FEATURE_REPO_SECRETS_DIR")
            .map_or_else(|_| feature_repo_path.join("secrets"), PathBuf::from);
        let artifact_root = parse_path("RECSYS_ARTIFACT_ROOT", "artifacts");

        // Streaming side-store
        let stream_uri = optional(STREAM_URI_VAR);
        let db_password = optional("DB_PASSWORD");
        let stream_positive_table =
            env::var("RECSYS_STREAM_POSITIVE_TABLE").unwrap_or_else(|_| "stream_interaction_positive".to_string());
        let stream_negative_table =
            env::var("RECSYS_STREAM_NEGATIVE_TABLE").unwrap_or_else(|_| "stream_interaction_negetive".to_string());
        let db_max_connections = parse_u32("RECSYS_DB_MAX_CONNECTIONS", 5)?;
        let db_acquire_timeout = parse_duration_secs("RECSYS_DB_ACQUIRE_TIMEOUT_SECS", 30)?;

        // Entity universe and curated interactions
        let num_users = parse_usize("RECSYS_NUM_USERS", 1000)?;
        let num_items = parse_usize("RECSYS_NUM_ITEMS", 5000)?;
        let reference_time = parse_timestamp("RECSYS_REFERENCE_TIMESTAMP", "2025-01-01T00:00:00Z")?;
        let positive_interactions_path = env::var("RECSYS_POSITIVE_INTERACTIONS_PATH").map_or_else(
            |_| feature_repo_path.join("data/interactions_item_user_ids.parquet"),
            PathBuf::from,
        );
        let negative_interactions_path = env::var("RECSYS_NEGATIVE_INTERACTIONS_PATH").map_or_else(
            |_| feature_repo_path.join("data/neg_interactions_item_user_ids.parquet"),
            PathBuf::from,
        );

        // Model and retrieval
        let embedding_dim = parse_non_zero_usize("RECSYS_EMBEDDING_DIM", 64)?;
        let top_k = parse_non_zero_usize("RECSYS_TOP_K", 64)?;
        let retrieval_concurrency = parse_non_zero_usize("RECSYS_RETRIEVAL_CONCURRENCY", 8)?;
        let train_epochs = parse_usize("RECSYS_TRAIN_EPOCHS", 5)?;
        #[allow(clippy::cast_possible_truncation)]
        let train_learning_rate = parse_f64("RECSYS_TRAIN_LEARNING_RATE", 0.05)? as f32;
        #[allow(clippy::cast_possible_truncation)]
        let train_dropout = parse_f64("RECSYS_TRAIN_DROPOUT", 0.1)? as f32;
        if !(0.0..1.0).contains(&train_dropout) {
            return Err(ConfigError::Invalid {
                name: "RECSYS_TRAIN_DROPOUT",
                source: anyhow::anyhow!("must be in [0, 1)"),
            });
        }
        let train_seed = parse_u64("RECSYS_TRAIN_SEED", 42)?;

        // Warm-up hook
        let entry_point = optional("RECSYS_ENTRY_POINT").map(PathBuf::from);
        let warmup_config_file = env::var("RECSYS_WARMUP_CONFIG_FILE")
            .map_or_else(|_| feature_repo_path.join("feature_store.yaml"), PathBuf::from);

        // Orchestrator retries
        let stage_max_attempts = parse_usize("RECSYS_STAGE_MAX_ATTEMPTS", 1)?.max(1);
        let stage_backoff_base_ms = parse_u64("RECSYS_STAGE_BACKOFF_BASE_MS", 500)?;
        let stage_backoff_cap_ms = parse_u64("RECSYS_STAGE_BACKOFF_CAP_MS", 30_000)?;

        // Remote feature server
        let feature_server_connect_timeout =
            parse_duration_ms("FEATURE_SERVER_CONNECT_TIMEOUT_MS", 3000)?;
        let feature_server_total_timeout =
            parse_duration_ms("FEATURE_SERVER_TOTAL_TIMEOUT_MS", 60_000)?;

        // OpenTelemetry settings
        let otel_exporter_endpoint = optional("OTEL_EXPORTER_OTLP_ENDPOINT");
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        Ok(Self {
            http_bind,
            feature_repo_path,
            feature_repo_secrets_dir,
            artifact_root,
            stream_uri,
            db_password,
            num_users,
            num_items,
            reference_time,
            positive_interactions_path,
            negative_interactions_path,
            stream_positive_table,
            stream_negative_table,
            embedding_dim,
            top_k,
            retrieval_concurrency,
            train_epochs,
            train_learning_rate,
            train_dropout,
            train_seed,
            entry_point,
            warmup_config_file,
            stage_max_attempts,
            stage_backoff_base_ms,
            stage_backoff_cap_ms,
            db_max_connections,
            db_acquire_timeout,
            feature_server_connect_timeout,
            feature_server_total_timeout,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn feature_repo_path(&self) -> &std::path::Path {
        &self.feature_repo_path
    }

    #[must_use]
    pub fn feature_repo_secrets_dir(&self) -> &std::path::Path {
        &self.feature_repo_secrets_dir
    }

    #[must_use]
    pub fn artifact_root(&self) -> &std::path::Path {
        &self.artifact_root
    }

    #[must_use]
    pub fn stream_uri(&self) -> Option<&str> {
        self.stream_uri.as_deref()
    }

    #[must_use]
    pub fn db_password(&self) -> Option<&str> {
        self.db_password.as_deref()
    }

    #[must_use]
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    #[must_use]
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    #[must_use]
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    #[must_use]
    pub fn positive_interactions_path(&self) -> &std::path::Path {
        &self.positive_interactions_path
    }

    #[must_use]
    pub fn negative_interactions_path(&self) -> &std::path::Path {
        &self.negative_interactions_path
    }

    #[must_use]
    pub fn stream_positive_table(&self) -> &str {
        &self.stream_positive_table
    }

    #[must_use]
    pub fn stream_negative_table(&self) -> &str {
        &self.stream_negative_table
    }

    #[must_use]
    pub fn embedding_dim(&self) -> NonZeroUsize {
        self.embedding_dim
    }

    #[must_use]
    pub fn top_k(&self) -> NonZeroUsize {
        self.top_k
    }

    #[must_use]
    pub fn retrieval_concurrency(&self) -> NonZeroUsize {
        self.retrieval_concurrency
    }

    #[must_use]
    pub fn train_epochs(&self) -> usize {
        self.train_epochs
    }

    #[must_use]
    pub fn train_learning_rate(&self) -> f32 {
        self.train_learning_rate
    }

    #[must_use]
    pub fn train_dropout(&self) -> f32 {
        self.train_dropout
    }

    #[must_use]
    pub fn train_seed(&self) -> u64 {
        self.train_seed
    }

    #[must_use]
    pub fn entry_point(&self) -> Option<&std::path::Path> {
        self.entry_point.as_deref()
    }

    #[must_use]
    pub fn warmup_config_file(&self) -> &std::path::Path {
        &self.warmup_config_file
    }

    #[must_use]
    pub fn stage_max_attempts(&self) -> usize {
        self.stage_max_attempts
    }

    #[must_use]
    pub fn stage_backoff_base_ms(&self) -> u64 {
        self.stage_backoff_base_ms
    }

    #[must_use]
    pub fn stage_backoff_cap_ms(&self) -> u64 {
        self.stage_backoff_cap_ms
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    #[must_use]
    pub fn feature_server_connect_timeout(&self) -> Duration {
        self.feature_server_connect_timeout
    }

    #[must_use]
    pub fn feature_server_total_timeout(&self) -> Duration {
        self.feature_server_total_timeout
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_path(name: &'static str, default: &str) -> PathBuf {
    PathBuf::from(env::var(name).unwrap_or_else(|_| default.to_string()))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_timestamp(name: &'static str, default: &str) -> Result<DateTime<Utc>, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|error| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(error),
        })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(value))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "RECSYS_WORKER_HTTP_BIND",
        "FEATURE_REPO_PATH",
        "FEATURE_REPO_SECRETS_DIR",
        "RECSYS_ARTIFACT_ROOT",
        STREAM_URI_VAR,
        "DB_PASSWORD",
        "RECSYS_NUM_USERS",
        "RECSYS_NUM_ITEMS",
        "RECSYS_REFERENCE_TIMESTAMP",
        "RECSYS_POSITIVE_INTERACTIONS_PATH",
        "RECSYS_NEGATIVE_INTERACTIONS_PATH",
        "RECSYS_STREAM_POSITIVE_TABLE",
        "RECSYS_STREAM_NEGATIVE_TABLE",
        "RECSYS_EMBEDDING_DIM",
        "RECSYS_TOP_K",
        "RECSYS_RETRIEVAL_CONCURRENCY",
        "RECSYS_TRAIN_EPOCHS",
        "RECSYS_TRAIN_LEARNING_RATE",
        "RECSYS_TRAIN_DROPOUT",
        "RECSYS_TRAIN_SEED",
        "RECSYS_ENTRY_POINT",
        "RECSYS_WARMUP_CONFIG_FILE",
        "RECSYS_STAGE_MAX_ATTEMPTS",
        "RECSYS_STAGE_BACKOFF_BASE_MS",
        "RECSYS_STAGE_BACKOFF_CAP_MS",
        "RECSYS_DB_MAX_CONNECTIONS",
        "RECSYS_DB_ACQUIRE_TIMEOUT_SECS",
        "FEATURE_SERVER_CONNECT_TIMEOUT_MS",
        "FEATURE_SERVER_TOTAL_TIMEOUT_MS",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_SAMPLING_RATIO",
    ];

    fn set_env(name: &str, value: &str) {
        // SAFETY: tests holding ENV_MUTEX are the only env writers.
        unsafe {
            env::set_var(name, value);
        }
    }

    fn remove_env(name: &str) {
        // SAFETY: tests holding ENV_MUTEX are the only env writers.
        unsafe {
            env::remove_var(name);
        }
    }

    fn reset_env() {
        for name in VARS {
            remove_env(name);
        }
    }

    #[test]
    fn from_env_uses_defaults() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.http_bind(), "0.0.0.0:9105".parse().unwrap());
        assert_eq!(config.feature_repo_path(), std::path::Path::new("feature_repo"));
        assert_eq!(
            config.feature_repo_secrets_dir(),
            std::path::Path::new("feature_repo/secrets")
        );
        assert_eq!(config.stream_uri(), None);
        assert_eq!(config.num_users(), 1000);
        assert_eq!(config.num_items(), 5000);
        assert_eq!(config.reference_time().to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(
            config.positive_interactions_path(),
            std::path::Path::new("feature_repo/data/interactions_item_user_ids.parquet")
        );
        assert_eq!(config.stream_negative_table(), "stream_interaction_negetive");
        assert_eq!(config.embedding_dim().get(), 64);
        assert_eq!(config.top_k().get(), 64);
        assert_eq!(config.stage_max_attempts(), 1);
        assert_eq!(
            config.warmup_config_file(),
            std::path::Path::new("feature_repo/feature_store.yaml")
        );
        assert_eq!(
            config.feature_server_total_timeout(),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn overrides_are_read() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env(STREAM_URI_VAR, "postgres://feast@db:5432/offline");
        set_env("DB_PASSWORD", "secret");
        set_env("FEATURE_REPO_PATH", "/srv/repo");
        set_env("RECSYS_TOP_K", "16");
        set_env("RECSYS_REFERENCE_TIMESTAMP", "2024-06-01T12:00:00+02:00");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.stream_uri(), Some("postgres://feast@db:5432/offline"));
        assert_eq!(config.db_password(), Some("secret"));
        assert_eq!(config.top_k().get(), 16);
        assert_eq!(
            config.feature_repo_secrets_dir(),
            std::path::Path::new("/srv/repo/secrets")
        );
        assert_eq!(config.reference_time().to_rfc3339(), "2024-06-01T10:00:00+00:00");
        reset_env();
    }

    #[test]
    fn zero_top_k_is_rejected() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("RECSYS_TOP_K", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RECSYS_TOP_K", .. }));
        reset_env();
    }

    #[test]
    fn dropout_outside_unit_interval_is_rejected() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("RECSYS_TRAIN_DROPOUT", "1.5");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RECSYS_TRAIN_DROPOUT", .. }));
        reset_env();
    }
}
