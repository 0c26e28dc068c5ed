//! Feature repository files: `feature_store.yaml` and the registry document
//! it points at.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{
    FeatureField, FeatureService, FeatureStoreError, FeatureViewProjection, SimilarityMetric,
};

pub const CONFIG_FILE: &str = "feature_store.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureServerSection {
    pub url: String,
    /// CA bundle path, relative to the repo.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepoConfig {
    pub project: String,
    #[serde(default = "default_provider")]
    pub provider: Provider,
    #[serde(default = "default_registry")]
    pub registry: PathBuf,
    #[serde(default)]
    pub vector_metric: SimilarityMetric,
    #[serde(default)]
    pub feature_server: Option<FeatureServerSection>,
}

fn default_provider() -> Provider {
    Provider::Local
}

fn default_registry() -> PathBuf {
    PathBuf::from("registry.yaml")
}

impl RepoConfig {
    /// Reads `<repo>/feature_store.yaml`.
    ///
    /// # Errors
    /// Fails when the file is missing or not valid yaml.
    pub fn load(repo: &Path) -> Result<Self, FeatureStoreError> {
        let path = repo.join(CONFIG_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| FeatureStoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EntityDef {
    name: String,
    join_key: String,
}

/// Exactly one of `path` (parquet file relative to the repo) or `push`.
#[derive(Debug, Clone, Deserialize)]
struct SourceDef {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    push: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ViewDef {
    name: String,
    entities: Vec<String>,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    source: SourceDef,
    schema: Vec<FeatureField>,
    #[serde(default)]
    vector_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceEntry {
    view: String,
    #[serde(default)]
    features: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceDef {
    name: String,
    features: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    entities: Vec<EntityDef>,
    #[serde(default)]
    feature_views: Vec<ViewDef>,
    #[serde(default)]
    feature_services: Vec<ServiceDef>,
}

/// A resolved feature view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureView {
    pub name: String,
    pub join_keys: Vec<String>,
    pub ttl: Option<chrono::Duration>,
    pub batch_source: Option<PathBuf>,
    pub push_source: Option<String>,
    pub features: Vec<FeatureField>,
    pub vector_field: Option<String>,
}

impl FeatureView {
    #[must_use]
    pub fn feature(&self, name: &str) -> Option<&FeatureField> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Projection over every feature of the view.
    #[must_use]
    pub fn projection(&self) -> FeatureViewProjection {
        FeatureViewProjection {
            view: self.name.clone(),
            join_keys: self.join_keys.clone(),
            features: self.features.clone(),
        }
    }
}

/// In-memory registry built from the registry document.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    views: BTreeMap<String, FeatureView>,
    push_sources: HashMap<String, String>,
    services: BTreeMap<String, FeatureService>,
}

impl Registry {
    /// Loads and cross-checks the registry document at `path`.
    ///
    /// Batch source paths are resolved against `repo`.
    ///
    /// # Errors
    /// Fails on unreadable files, invalid yaml or dangling references.
    pub fn load(repo: &Path, path: &Path) -> Result<Self, FeatureStoreError> {
        let full = repo.join(path);
        let raw = fs::read_to_string(&full).map_err(|source| FeatureStoreError::Io {
            path: full.clone(),
            source,
        })?;
        let document: RegistryDocument = serde_yaml::from_str(&raw)?;
        Self::from_document(repo, document)
    }

    fn from_document(repo: &Path, document: RegistryDocument) -> Result<Self, FeatureStoreError> {
        let entities: HashMap<String, String> = document
            .entities
            .into_iter()
            .map(|e| (e.name, e.join_key))
            .collect();

        let mut views = BTreeMap::new();
        let mut push_sources = HashMap::new();
        for def in document.feature_views {
            let join_keys = def
                .entities
                .iter()
                .map(|entity| {
                    entities.get(entity).cloned().ok_or_else(|| {
                        FeatureStoreError::InvalidRegistry(format!(
                            "view `{}` references unknown entity `{entity}`",
                            def.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if let Some(field) = &def.vector_field {
                let declared = def.schema.iter().find(|f| &f.name == field);
                if !declared.is_some_and(|f| f.dtype == crate::frame::DataType::Float32List) {
                    return Err(FeatureStoreError::InvalidRegistry(format!(
                        "vector field `{field}` of view `{}` must be a float32 list",
                        def.name
                    )));
                }
            }

            let (batch_source, push_source) = match (def.source.path, def.source.push) {
                (Some(path), None) => (Some(repo.join(path)), None),
                (None, Some(name)) => {
                    if push_sources.insert(name.clone(), def.name.clone()).is_some() {
                        return Err(FeatureStoreError::InvalidRegistry(format!(
                            "push source `{name}` feeds several views"
                        )));
                    }
                    (None, Some(name))
                }
                _ => {
                    return Err(FeatureStoreError::InvalidRegistry(format!(
                        "view `{}` needs exactly one of `source.path` or `source.push`",
                        def.name
                    )));
                }
            };

            let view = FeatureView {
                name: def.name.clone(),
                join_keys,
                ttl: def.ttl_seconds.map(chrono::Duration::seconds),
                batch_source,
                push_source,
                features: def.schema,
                vector_field: def.vector_field,
            };
            if views.insert(def.name.clone(), view).is_some() {
                return Err(FeatureStoreError::InvalidRegistry(format!(
                    "duplicate feature view `{}`",
                    def.name
                )));
            }
        }

        let mut services = BTreeMap::new();
        for def in document.feature_services {
            let mut projections = Vec::with_capacity(def.features.len());
            for entry in def.features {
                let view = views.get(&entry.view).ok_or_else(|| {
                    FeatureStoreError::InvalidRegistry(format!(
                        "service `{}` references unknown view `{}`",
                        def.name, entry.view
                    ))
                })?;
                let features = match entry.features {
                    None => view.features.clone(),
                    Some(names) => names
                        .iter()
                        .map(|name| {
                            view.feature(name).cloned().ok_or_else(|| {
                                FeatureStoreError::UnknownFeature(format!("{}:{name}", view.name))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                };
                projections.push(FeatureViewProjection {
                    view: view.name.clone(),
                    join_keys: view.join_keys.clone(),
                    features,
                });
            }
            services.insert(
                def.name.clone(),
                FeatureService {
                    name: def.name,
                    projections,
                },
            );
        }

        Ok(Self {
            views,
            push_sources,
            services,
        })
    }

    /// # Errors
    /// Fails when no service has that name.
    pub fn service(&self, name: &str) -> Result<&FeatureService, FeatureStoreError> {
        self.services
            .get(name)
            .ok_or_else(|| FeatureStoreError::UnknownService(name.to_string()))
    }

    /// # Errors
    /// Fails when no view has that name.
    pub fn view(&self, name: &str) -> Result<&FeatureView, FeatureStoreError> {
        self.views
            .get(name)
            .ok_or_else(|| FeatureStoreError::UnknownView(name.to_string()))
    }

    /// Resolves the view fed by a push source.
    ///
    /// # Errors
    /// Fails when no view is fed by that source.
    pub fn push_target(&self, source: &str) -> Result<&FeatureView, FeatureStoreError> {
        let view = self
            .push_sources
            .get(source)
            .ok_or_else(|| FeatureStoreError::UnknownPushSource(source.to_string()))?;
        self.view(view)
    }
}
