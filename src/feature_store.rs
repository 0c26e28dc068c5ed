//! Feature store boundary: registry resolution, point-in-time joins, pushes,
//! incremental materialization and vector retrieval.

pub mod index;
pub mod local;
pub mod pit;
pub mod repo;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::clients::feature_server::{FeatureServerClient, FeatureServerConfig};
use crate::frame::{DataType, Frame, FrameError};
use crate::registry::SchemaError;

pub use index::SimilarityMetric;
pub use local::LocalFeatureStore;
pub use repo::{Provider, RepoConfig};

/// Column added to retrieval results.
pub const DISTANCE: &str = "distance";

#[derive(Debug, Error)]
pub enum FeatureStoreError {
    #[error("unknown feature service `{0}`")]
    UnknownService(String),
    #[error("unknown feature view `{0}`")]
    UnknownView(String),
    #[error("unknown push source `{0}`")]
    UnknownPushSource(String),
    #[error("unknown feature `{0}`")]
    UnknownFeature(String),
    #[error("invalid feature reference `{0}`, expected `view:feature`")]
    InvalidFeatureRef(String),
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),
    #[error("feature view `{0}` has no vector field")]
    NotVectorView(String),
    #[error("retrieval features span several views: {0:?}")]
    MixedViews(Vec<String>),
    #[error("query has {actual} dimensions, index holds {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("entity frame has a null `{0}` timestamp")]
    NullEntityTimestamp(String),
    #[error("feature repo I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("feature repo yaml is invalid: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("feature server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feature server returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("feature server configuration is invalid: {0}")]
    RemoteConfig(String),
}

/// A `view:feature` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureRef {
    pub view: String,
    pub feature: String,
}

impl FeatureRef {
    pub fn new(view: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            feature: feature.into(),
        }
    }
}

impl FromStr for FeatureRef {
    type Err = FeatureStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((view, feature)) if !view.is_empty() && !feature.is_empty() => {
                Ok(Self::new(view, feature))
            }
            _ => Err(FeatureStoreError::InvalidFeatureRef(s.to_string())),
        }
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.view, self.feature)
    }
}

impl Serialize for FeatureRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FeatureRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    pub dtype: DataType,
}

/// The slice of one feature view a service selects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureViewProjection {
    pub view: String,
    pub join_keys: Vec<String>,
    pub features: Vec<FeatureField>,
}

/// A named bundle of feature view projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureService {
    pub name: String,
    pub projections: Vec<FeatureViewProjection>,
}

impl FeatureService {
    #[must_use]
    pub fn feature_refs(&self) -> Vec<FeatureRef> {
        self.projections
            .iter()
            .flat_map(|p| p.features.iter().map(|f| FeatureRef::new(&p.view, &f.name)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMode {
    Online,
    Offline,
    OnlineAndOffline,
}

impl PushMode {
    #[must_use]
    pub fn writes_online(self) -> bool {
        matches!(self, PushMode::Online | PushMode::OnlineAndOffline)
    }

    #[must_use]
    pub fn writes_offline(self) -> bool {
        matches!(self, PushMode::Offline | PushMode::OnlineAndOffline)
    }
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Reloads the registry so later lookups see the latest definitions.
    async fn refresh_registry(&self) -> Result<(), FeatureStoreError>;

    async fn resolve_service(&self, name: &str) -> Result<FeatureService, FeatureStoreError>;

    /// Resolves the feature view fed by a push source.
    async fn resolve_push_source(
        &self,
        name: &str,
    ) -> Result<FeatureViewProjection, FeatureStoreError>;

    /// For each entity row, attaches the latest feature values whose event
    /// timestamp is not after the row's own timestamp. Rows without a match
    /// get nulls; entity row order is preserved.
    async fn point_in_time_join(
        &self,
        entity_df: &Frame,
        service: &FeatureService,
    ) -> Result<Frame, FeatureStoreError>;

    async fn push(
        &self,
        source: &str,
        frame: &Frame,
        mode: PushMode,
        allow_registry_cache: bool,
    ) -> Result<(), FeatureStoreError>;

    /// Copies rows with event timestamps up to `end` into the online store.
    async fn materialize_incremental(
        &self,
        end: DateTime<Utc>,
        views: &[&str],
    ) -> Result<(), FeatureStoreError>;

    /// Returns at most `top_k` rows of `features` ordered by ascending distance
    /// to `query`, plus a `distance` column.
    async fn nearest_neighbors(
        &self,
        query: &[f32],
        top_k: usize,
        features: &[FeatureRef],
    ) -> Result<Frame, FeatureStoreError>;
}

/// Opens the store configured by `<repo_path>/feature_store.yaml`.
///
/// # Errors
/// Fails when the repo config is unreadable or the selected provider cannot
/// be constructed.
pub fn open(
    repo_path: &Path,
    remote: &FeatureServerConfig,
) -> Result<Arc<dyn FeatureStore>, FeatureStoreError> {
    let config = RepoConfig::load(repo_path)?;
    match config.provider {
        Provider::Local => Ok(Arc::new(LocalFeatureStore::new(repo_path, config))),
        Provider::Remote => {
            let server = config.feature_server.as_ref().ok_or_else(|| {
                FeatureStoreError::RemoteConfig(
                    "provider `remote` requires a `feature_server` section".to_string(),
                )
            })?;
            let mut remote = remote.clone();
            remote.base_url.clone_from(&server.url);
            if let Some(bundle) = &server.ca_bundle {
                remote.ca_bundle = Some(repo_path.join(bundle));
            }
            Ok(Arc::new(FeatureServerClient::new(&remote)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_ref_parses_view_and_feature() {
        let parsed: FeatureRef = "item_embedding:item_id".parse().unwrap();
        assert_eq!(parsed, FeatureRef::new("item_embedding", "item_id"));
        assert_eq!(parsed.to_string(), "item_embedding:item_id");
    }

    #[test]
    fn feature_ref_without_separator_is_rejected() {
        assert!("item_id".parse::<FeatureRef>().is_err());
        assert!(":item_id".parse::<FeatureRef>().is_err());
    }

    #[test]
    fn push_mode_targets() {
        assert!(PushMode::Online.writes_online());
        assert!(!PushMode::Online.writes_offline());
        assert!(PushMode::OnlineAndOffline.writes_offline());
        assert_eq!(
            serde_json::to_string(&PushMode::OnlineAndOffline).unwrap(),
            "\"online_and_offline\""
        );
    }
}
