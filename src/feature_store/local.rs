//! In-process feature store backed by the repo's parquet sources.
//!
//! Offline data is the union of each view's batch source and rows pushed
//! offline. Online pushes land in a write buffer and only become visible to
//! lookups and retrieval once [`FeatureStore::materialize_incremental`] moves
//! them into the online table.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::index::{self, SimilarityMetric};
use super::pit::{self, key_columns, row_key};
use super::repo::{FeatureView, Registry, RepoConfig};
use super::{
    DISTANCE, FeatureRef, FeatureService, FeatureStore, FeatureStoreError, FeatureViewProjection,
    PushMode,
};
use crate::artifact::columnar;
use crate::frame::{Column, ColumnData, DataType, EVENT_TIMESTAMP, Frame, Value};
use crate::registry::SchemaError;

#[derive(Debug, Clone)]
struct OnlineRow {
    event_timestamp: DateTime<Utc>,
    /// Keyed by feature name; the view's schema may change between
    /// materialization and lookup.
    values: BTreeMap<String, Value>,
}

impl OnlineRow {
    fn value(&self, feature: &str) -> Value {
        self.values.get(feature).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    offline: HashMap<String, Frame>,
    pending: HashMap<String, Frame>,
    online: HashMap<String, BTreeMap<Vec<i64>, OnlineRow>>,
    watermarks: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug)]
pub struct LocalFeatureStore {
    repo_path: PathBuf,
    config: RepoConfig,
    registry: RwLock<Option<Arc<Registry>>>,
    state: Mutex<StoreState>,
}

impl LocalFeatureStore {
    pub fn new(repo_path: impl Into<PathBuf>, config: RepoConfig) -> Self {
        Self {
            repo_path: repo_path.into(),
            config,
            registry: RwLock::new(None),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Opens `<repo_path>/feature_store.yaml`.
    ///
    /// # Errors
    /// Fails when the config file is unreadable.
    pub fn open(repo_path: &Path) -> Result<Self, FeatureStoreError> {
        let config = RepoConfig::load(repo_path)?;
        Ok(Self::new(repo_path, config))
    }

    #[must_use]
    pub fn metric(&self) -> SimilarityMetric {
        self.config.vector_metric
    }

    async fn load_registry(&self) -> Result<Arc<Registry>, FeatureStoreError> {
        let registry = Arc::new(Registry::load(&self.repo_path, &self.config.registry)?);
        *self.registry.write().await = Some(Arc::clone(&registry));
        Ok(registry)
    }

    async fn registry(&self, allow_cache: bool) -> Result<Arc<Registry>, FeatureStoreError> {
        if allow_cache {
            if let Some(cached) = self.registry.read().await.as_ref() {
                return Ok(Arc::clone(cached));
            }
        }
        self.load_registry().await
    }

    /// Offline rows of `view`: its batch source followed by offline pushes.
    fn offline_rows(view: &FeatureView, state: &StoreState) -> Result<Frame, FeatureStoreError> {
        let mut frame = match &view.batch_source {
            Some(path) => columnar::read_parquet(path)?,
            None => empty_view_frame(view),
        };
        if let Some(pushed) = state.offline.get(&view.name) {
            frame = frame.concat(pushed.clone())?;
        }
        Ok(frame)
    }

    /// Reads the online values of `view` for the given entity keys.
    ///
    /// Unknown keys yield null feature values.
    ///
    /// # Errors
    /// Fails when the view is unknown.
    pub async fn online_features(
        &self,
        view: &str,
        keys: &[Vec<i64>],
    ) -> Result<Frame, FeatureStoreError> {
        let registry = self.registry(true).await?;
        let view = registry.view(view)?;
        let state = self.state.lock().await;
        let table = state.online.get(&view.name);

        let mut columns: Vec<Column> = view
            .join_keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                Column::new(
                    key.clone(),
                    ColumnData::Int64(keys.iter().map(|k| k.get(i).copied()).collect()),
                )
            })
            .collect();

        let rows: Vec<Option<&OnlineRow>> = keys
            .iter()
            .map(|key| table.and_then(|t| t.get(key)))
            .collect();
        columns.push(Column::new(
            EVENT_TIMESTAMP,
            ColumnData::Timestamp(rows.iter().map(|r| r.map(|r| r.event_timestamp)).collect()),
        ));
        for field in &view.features {
            let mut data = ColumnData::nulls(field.dtype, 0);
            for row in &rows {
                let value = row.map_or(Value::Null, |r| r.value(&field.name));
                data.push(value)?;
            }
            columns.push(Column::new(field.name.clone(), data));
        }
        Ok(Frame::new(columns)?)
    }
}

fn empty_view_frame(view: &FeatureView) -> Frame {
    let mut schema: Vec<(&str, DataType)> = view
        .join_keys
        .iter()
        .map(|key| (key.as_str(), DataType::Int64))
        .collect();
    schema.push((EVENT_TIMESTAMP, DataType::Timestamp));
    schema.extend(view.features.iter().map(|f| (f.name.as_str(), f.dtype)));
    Frame::with_schema(&schema)
}

fn compatible(expected: DataType, actual: DataType) -> bool {
    expected == actual || (expected == DataType::Float64 && actual == DataType::Int64)
}

/// Checks a pushed frame against the target view and projects it onto the
/// view's columns.
fn conform_push(view: &FeatureView, frame: &Frame) -> Result<Frame, FeatureStoreError> {
    let expected = view
        .join_keys
        .iter()
        .map(|key| (key.as_str(), DataType::Int64))
        .chain(std::iter::once((EVENT_TIMESTAMP, DataType::Timestamp)))
        .chain(view.features.iter().map(|f| (f.name.as_str(), f.dtype)));

    let mut names = Vec::new();
    for (name, dtype) in expected {
        let column = frame
            .column(name)
            .ok_or_else(|| SchemaError::MissingColumn {
                table: view.name.clone(),
                column: name.to_string(),
            })?;
        if !compatible(dtype, column.data_type()) {
            return Err(SchemaError::ColumnType {
                table: view.name.clone(),
                column: name.to_string(),
                expected: dtype,
                actual: column.data_type(),
            }
            .into());
        }
        names.push(name);
    }

    let nulls = frame.require_column(EVENT_TIMESTAMP)?.data.null_count();
    if nulls > 0 {
        return Err(SchemaError::NullTimestamp {
            table: view.name.clone(),
            rows: nulls,
        }
        .into());
    }
    Ok(frame.select(&names)?)
}

fn select_rows(frame: &Frame, keep: impl Fn(usize) -> bool) -> Frame {
    let indices: Vec<Option<usize>> = (0..frame.num_rows()).filter(|&i| keep(i)).map(Some).collect();
    frame.take(&indices)
}

/// Upserts `rows` into the online table; the newest event timestamp wins and
/// later rows win ties.
fn upsert_online(
    view: &FeatureView,
    rows: &Frame,
    table: &mut BTreeMap<Vec<i64>, OnlineRow>,
) -> Result<usize, FeatureStoreError> {
    if rows.num_rows() == 0 {
        return Ok(0);
    }
    let keys = key_columns(rows, &view.join_keys)?;
    let timestamps = rows.timestamp_column(EVENT_TIMESTAMP)?;
    let mut written = 0;
    for row in 0..rows.num_rows() {
        let (Some(key), Some(ts)) = (row_key(&keys, row), timestamps[row]) else {
            continue;
        };
        if table.get(&key).is_some_and(|existing| existing.event_timestamp > ts) {
            continue;
        }
        let values = view
            .features
            .iter()
            .map(|f| (f.name.clone(), rows.value(&f.name, row)))
            .collect();
        table.insert(
            key,
            OnlineRow {
                event_timestamp: ts,
                values,
            },
        );
        written += 1;
    }
    Ok(written)
}

#[async_trait]
impl FeatureStore for LocalFeatureStore {
    async fn refresh_registry(&self) -> Result<(), FeatureStoreError> {
        self.load_registry().await?;
        debug!(repo = %self.repo_path.display(), "feature registry refreshed");
        Ok(())
    }

    async fn resolve_service(&self, name: &str) -> Result<FeatureService, FeatureStoreError> {
        let registry = self.registry(true).await?;
        registry.service(name).cloned()
    }

    async fn resolve_push_source(
        &self,
        name: &str,
    ) -> Result<FeatureViewProjection, FeatureStoreError> {
        let registry = self.registry(true).await?;
        Ok(registry.push_target(name)?.projection())
    }

    async fn point_in_time_join(
        &self,
        entity_df: &Frame,
        service: &FeatureService,
    ) -> Result<Frame, FeatureStoreError> {
        let registry = self.registry(true).await?;
        let mut joined = entity_df.clone();
        for projection in &service.projections {
            let view = registry.view(&projection.view)?;
            let source = {
                let state = self.state.lock().await;
                Self::offline_rows(view, &state)?
            };
            let features: Vec<&str> = projection.features.iter().map(|f| f.name.as_str()).collect();
            joined = pit::join(joined, &source, &projection.join_keys, &features, view.ttl)?;
        }
        Ok(joined)
    }

    async fn push(
        &self,
        source: &str,
        frame: &Frame,
        mode: PushMode,
        allow_registry_cache: bool,
    ) -> Result<(), FeatureStoreError> {
        let registry = self.registry(allow_registry_cache).await?;
        let view = registry.push_target(source)?;
        let rows = conform_push(view, frame)?;

        let mut state = self.state.lock().await;
        if mode.writes_offline() {
            let merged = match state.offline.remove(&view.name) {
                Some(existing) => existing.concat(rows.clone())?,
                None => rows.clone(),
            };
            state.offline.insert(view.name.clone(), merged);
        }
        if mode.writes_online() {
            let merged = match state.pending.remove(&view.name) {
                Some(existing) => existing.concat(rows.clone())?,
                None => rows.clone(),
            };
            state.pending.insert(view.name.clone(), merged);
        }
        debug!(source, view = %view.name, rows = rows.num_rows(), ?mode, "pushed rows");
        Ok(())
    }

    async fn materialize_incremental(
        &self,
        end: DateTime<Utc>,
        views: &[&str],
    ) -> Result<(), FeatureStoreError> {
        let registry = self.registry(true).await?;
        let mut state = self.state.lock().await;

        for name in views {
            let view = registry.view(name)?;
            let watermark = state.watermarks.get(&view.name).copied();

            let pending = state.pending.remove(&view.name).unwrap_or_default();
            let (due, later) = if pending.num_rows() == 0 {
                (pending.clone(), pending)
            } else {
                let ts = pending.timestamp_column(EVENT_TIMESTAMP)?;
                let is_due = |i: usize| ts[i].is_some_and(|t| t <= end);
                (select_rows(&pending, &is_due), select_rows(&pending, |i| !is_due(i)))
            };
            if later.num_rows() > 0 {
                state.pending.insert(view.name.clone(), later);
            }

            let offline = Self::offline_rows(view, &state)?;
            let offline_due = if offline.num_rows() == 0 {
                offline
            } else {
                let ts = offline.timestamp_column(EVENT_TIMESTAMP)?;
                select_rows(&offline, |i| {
                    ts[i].is_some_and(|t| t <= end && watermark.is_none_or(|w| t > w))
                })
            };

            let table = state.online.entry(view.name.clone()).or_default();
            let written = upsert_online(view, &offline_due, table)? + upsert_online(view, &due, table)?;

            let next = watermark.map_or(end, |w| w.max(end));
            state.watermarks.insert(view.name.clone(), next);
            info!(view = %view.name, rows = written, end = %end, "materialized feature view");
        }
        Ok(())
    }

    async fn nearest_neighbors(
        &self,
        query: &[f32],
        top_k: usize,
        features: &[FeatureRef],
    ) -> Result<Frame, FeatureStoreError> {
        let first = features
            .first()
            .ok_or_else(|| FeatureStoreError::UnknownFeature(String::new()))?;
        if features.iter().any(|f| f.view != first.view) {
            return Err(FeatureStoreError::MixedViews(
                features.iter().map(|f| f.view.clone()).collect(),
            ));
        }

        let registry = self.registry(true).await?;
        let view = registry.view(&first.view)?;
        let vector_field = view
            .vector_field
            .as_deref()
            .ok_or_else(|| FeatureStoreError::NotVectorView(view.name.clone()))?;
        if !view.features.iter().any(|f| f.name == vector_field) {
            return Err(FeatureStoreError::NotVectorView(view.name.clone()));
        }

        enum Source {
            Key(usize),
            Feature(DataType),
        }
        let sources = features
            .iter()
            .map(|f| {
                if let Some(i) = view.join_keys.iter().position(|k| *k == f.feature) {
                    Ok(Source::Key(i))
                } else if let Some(field) = view.features.iter().find(|v| v.name == f.feature) {
                    Ok(Source::Feature(field.dtype))
                } else {
                    Err(FeatureStoreError::UnknownFeature(f.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let state = self.state.lock().await;
        let candidates: Vec<(&Vec<i64>, &[f32])> = state
            .online
            .get(&view.name)
            .into_iter()
            .flat_map(|table| table.iter())
            .filter_map(|(key, row)| match row.values.get(vector_field) {
                Some(Value::Float32List(vector)) => Some((key, vector.as_slice())),
                _ => None,
            })
            .collect();

        if let Some((_, vector)) = candidates.iter().find(|(_, v)| v.len() != query.len()) {
            return Err(FeatureStoreError::DimensionMismatch {
                expected: vector.len(),
                actual: query.len(),
            });
        }

        let hits = index::top_k(self.config.vector_metric, query, &candidates, top_k);
        let table = state.online.get(&view.name);

        let mut columns = Vec::with_capacity(features.len() + 1);
        for (feature, source) in features.iter().zip(&sources) {
            let data = match source {
                Source::Key(i) => ColumnData::Int64(
                    hits.iter()
                        .map(|hit| candidates[hit.position].0.get(*i).copied())
                        .collect(),
                ),
                Source::Feature(dtype) => {
                    let mut data = ColumnData::nulls(*dtype, 0);
                    for hit in &hits {
                        let key = candidates[hit.position].0;
                        let value = table
                            .and_then(|t| t.get(key))
                            .map_or(Value::Null, |row| row.value(&feature.feature));
                        data.push(value)?;
                    }
                    data
                }
            };
            columns.push(Column::new(feature.feature.clone(), data));
        }
        columns.push(Column::new(
            DISTANCE,
            ColumnData::Float64(hits.iter().map(|hit| Some(f64::from(hit.distance))).collect()),
        ));
        Ok(Frame::new(columns)?)
    }
}
