//! Shared fixture: a local feature repo with 10 users and 20 items, plus a
//! deterministic encoder whose embeddings depend only on the entity id.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use ndarray::Array2;
use tempfile::TempDir;

use recsys_worker::artifact::{ArtifactStore, columnar};
use recsys_worker::feature_store::{FeatureStore, LocalFeatureStore};
use recsys_worker::frame::{Column, ColumnData, EVENT_TIMESTAMP, Frame};
use recsys_worker::model::preprocess::input_dim;
use recsys_worker::model::{
    EncoderInput, EncoderMode, EncoderState, ModelError, SgdTwoTowerTrainer, TowerEncoder,
    TowerFactory, TowerKind, TrainerConfig,
};
use recsys_worker::observability::metrics::Metrics;
use recsys_worker::pipeline::{
    AcquisitionConfig, CandidateGenerationStage, EntityUniverse, FeatureAcquisitionStage,
    GenerationConfig, ModelTrainingStage, PipelineBuilder, PipelineOrchestrator,
};
use recsys_worker::streaming::CorrectionSource;

pub const NUM_USERS: usize = 10;
pub const NUM_ITEMS: usize = 20;
pub const EMBEDDING_DIM: usize = 64;
pub const TOP_K: usize = 64;

pub const REGISTRY: &str = r"
entities:
  - name: item
    join_key: item_id
  - name: user
    join_key: user_id
feature_views:
  - name: item_features
    entities: [item]
    source:
      path: data/item_features.parquet
    schema:
      - { name: category, dtype: utf8 }
      - { name: subcategory, dtype: utf8 }
      - { name: price, dtype: float64 }
      - { name: avg_rating, dtype: float64 }
      - { name: num_ratings, dtype: int64 }
  - name: user_features
    entities: [user]
    source:
      path: data/user_features.parquet
    schema:
      - { name: age, dtype: int64 }
      - { name: gender, dtype: utf8 }
      - { name: signup_days, dtype: int64 }
      - { name: preferences, dtype: utf8 }
  - name: interactions
    entities: [user, item]
    source:
      path: data/interactions.parquet
    schema:
      - { name: interaction_type, dtype: utf8 }
      - { name: rating, dtype: float64 }
      - { name: quantity, dtype: int64 }
  - name: neg_interactions
    entities: [user, item]
    source:
      path: data/neg_interactions.parquet
    schema:
      - { name: interaction_type, dtype: utf8 }
  - name: item_embedding
    entities: [item]
    source:
      push: item_embed_push_source
    schema:
      - { name: embedding, dtype: float32_list }
    vector_field: embedding
  - name: user_embedding
    entities: [user]
    source:
      push: user_embed_push_source
    schema:
      - { name: embedding, dtype: float32_list }
    vector_field: embedding
  - name: user_items
    entities: [user]
    source:
      push: user_items_push_source
    schema:
      - { name: top_k_item_ids, dtype: int64_list }
feature_services:
  - name: item_service
    features:
      - view: item_features
  - name: user_service
    features:
      - view: user_features
  - name: interaction_service
    features:
      - view: interactions
  - name: neg_interaction_service
    features:
      - view: neg_interactions
";

pub fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn observed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap()
}

fn ids(n: usize) -> Vec<i64> {
    (1..=i64::try_from(n).unwrap()).collect()
}

fn int64(values: impl IntoIterator<Item = i64>) -> ColumnData {
    ColumnData::Int64(values.into_iter().map(Some).collect())
}

fn utf8(values: impl IntoIterator<Item = String>) -> ColumnData {
    ColumnData::Utf8(values.into_iter().map(Some).collect())
}

fn float64(values: impl IntoIterator<Item = f64>) -> ColumnData {
    ColumnData::Float64(values.into_iter().map(Some).collect())
}

fn stamped(rows: usize) -> ColumnData {
    ColumnData::Timestamp(vec![Some(observed_at()); rows])
}

/// Positive pairs: every user bought one item.
pub fn positive_pairs() -> Vec<(i64, i64)> {
    ids(NUM_USERS).into_iter().map(|u| (u, (u * 3) % 20 + 1)).collect()
}

/// Negative pairs: every user skipped one item.
pub fn negative_pairs() -> Vec<(i64, i64)> {
    ids(NUM_USERS).into_iter().map(|u| (u, (u * 7) % 20 + 1)).collect()
}

fn pair_columns(pairs: &[(i64, i64)]) -> Vec<Column> {
    vec![
        Column::new("user_id", int64(pairs.iter().map(|p| p.0))),
        Column::new("item_id", int64(pairs.iter().map(|p| p.1))),
    ]
}

fn write(path: &Path, columns: Vec<Column>) {
    columnar::write_parquet(path, &Frame::new(columns).unwrap()).unwrap();
}

/// A feature repo on disk plus the curated interaction files.
pub struct FeatureRepo {
    pub dir: TempDir,
}

impl FeatureRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(
            root.join("feature_store.yaml"),
            "project: recsys\nprovider: local\nvector_metric: l2\n",
        )
        .unwrap();
        fs::write(root.join("registry.yaml"), REGISTRY).unwrap();
        fs::create_dir_all(root.join("data")).unwrap();

        let items = ids(NUM_ITEMS);
        let mut item_columns = vec![Column::new("item_id", int64(items.clone()))];
        item_columns.push(Column::new(EVENT_TIMESTAMP, stamped(items.len())));
        item_columns.push(Column::new("category", utf8(items.iter().map(|i| format!("cat{}", i % 3)))));
        item_columns.push(Column::new("subcategory", utf8(items.iter().map(|i| format!("sub{}", i % 5)))));
        item_columns.push(Column::new("price", float64(items.iter().map(|&i| i as f64 * 1.5))));
        item_columns.push(Column::new("avg_rating", float64(items.iter().map(|&i| (i % 5) as f64))));
        item_columns.push(Column::new("num_ratings", int64(items.iter().map(|i| i * 10))));
        write(&root.join("data/item_features.parquet"), item_columns);

        let users = ids(NUM_USERS);
        write(
            &root.join("data/user_features.parquet"),
            vec![
                Column::new("user_id", int64(users.clone())),
                Column::new(EVENT_TIMESTAMP, stamped(users.len())),
                Column::new("age", int64(users.iter().map(|u| 20 + u))),
                Column::new("gender", utf8(users.iter().map(|u| if u % 2 == 0 { "f" } else { "m" }.to_string()))),
                Column::new("signup_days", int64(users.iter().map(|u| u * 30))),
                Column::new("preferences", utf8(users.iter().map(|u| format!("cat{}", u % 3)))),
            ],
        );

        let positives = positive_pairs();
        let mut columns = pair_columns(&positives);
        columns.push(Column::new(EVENT_TIMESTAMP, stamped(positives.len())));
        columns.push(Column::new("interaction_type", utf8(positives.iter().map(|_| "purchase".to_string()))));
        columns.push(Column::new("rating", float64(positives.iter().map(|_| 4.0))));
        columns.push(Column::new("quantity", int64(positives.iter().map(|_| 1))));
        write(&root.join("data/interactions.parquet"), columns);
        write(&root.join("data/interactions_item_user_ids.parquet"), pair_columns(&positives));

        let negatives = negative_pairs();
        let mut columns = pair_columns(&negatives);
        columns.push(Column::new(EVENT_TIMESTAMP, stamped(negatives.len())));
        columns.push(Column::new("interaction_type", utf8(negatives.iter().map(|_| "skip".to_string()))));
        write(&root.join("data/neg_interactions.parquet"), columns);
        write(&root.join("data/neg_interactions_item_user_ids.parquet"), pair_columns(&negatives));

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(self.path().join("artifacts"))
    }

    pub fn store(&self) -> Arc<LocalFeatureStore> {
        Arc::new(LocalFeatureStore::open(self.path()).unwrap())
    }

    pub fn acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            universe: EntityUniverse {
                num_users: NUM_USERS,
                num_items: NUM_ITEMS,
                reference_time: reference_time(),
            },
            positive_interactions_path: self.path().join("data/interactions_item_user_ids.parquet"),
            negative_interactions_path: self.path().join("data/neg_interactions_item_user_ids.parquet"),
            stream_positive_table: "stream_interaction_positive".into(),
            stream_negative_table: "stream_interaction_negetive".into(),
        }
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.path().join("artifacts")
    }
}

/// Embeds entity `id` as `[id mod 7; dim]` and never learns.
pub struct ModuloEncoder {
    kind: TowerKind,
    embedding_dim: usize,
    mode: EncoderMode,
}

const MODULO_ARCHITECTURE: &str = "modulo";

impl TowerEncoder for ModuloEncoder {
    fn kind(&self) -> TowerKind {
        self.kind
    }

    fn input_dim(&self) -> usize {
        input_dim(self.kind)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn mode(&self) -> EncoderMode {
        self.mode
    }

    fn set_mode(&mut self, mode: EncoderMode) {
        self.mode = mode;
    }

    fn forward(&mut self, input: &EncoderInput) -> Result<Array2<f32>, ModelError> {
        Ok(Array2::from_shape_fn((input.len(), self.embedding_dim), |(row, _)| {
            input.ids[row].rem_euclid(7) as f32
        }))
    }

    fn backward(&mut self, _grad_output: &Array2<f32>, _learning_rate: f32) -> Result<(), ModelError> {
        Ok(())
    }

    fn state_dict(&self) -> EncoderState {
        EncoderState {
            architecture: MODULO_ARCHITECTURE.into(),
            kind: self.kind,
            input_dim: self.input_dim(),
            embedding_dim: self.embedding_dim,
            tensors: BTreeMap::new(),
        }
    }

    fn load_state_dict(&mut self, state: EncoderState) -> Result<(), ModelError> {
        if state.architecture != MODULO_ARCHITECTURE {
            return Err(ModelError::ArchitectureMismatch {
                expected: MODULO_ARCHITECTURE.into(),
                actual: state.architecture,
            });
        }
        if state.kind != self.kind {
            return Err(ModelError::KindMismatch {
                expected: self.kind,
                actual: state.kind,
            });
        }
        Ok(())
    }
}

/// Builds [`ModuloEncoder`]s, optionally with a fixed output width that
/// ignores the requested one.
#[derive(Default)]
pub struct ModuloFactory {
    pub forced_dim: Option<usize>,
}

impl TowerFactory for ModuloFactory {
    fn build(&self, kind: TowerKind, embedding_dim: usize) -> Box<dyn TowerEncoder> {
        Box::new(ModuloEncoder {
            kind,
            embedding_dim: self.forced_dim.unwrap_or(embedding_dim),
            mode: EncoderMode::Train,
        })
    }
}

/// Pipeline over the fixture repo with the modulo encoder.
pub fn pipeline(
    repo: &FeatureRepo,
    store: Arc<dyn FeatureStore>,
    corrections: Arc<dyn CorrectionSource>,
    metrics: Arc<Metrics>,
) -> PipelineOrchestrator {
    pipeline_with(repo, store, corrections, metrics, ModuloFactory::default(), TOP_K)
}

pub fn pipeline_with(
    repo: &FeatureRepo,
    store: Arc<dyn FeatureStore>,
    corrections: Arc<dyn CorrectionSource>,
    metrics: Arc<Metrics>,
    factory: ModuloFactory,
    top_k: usize,
) -> PipelineOrchestrator {
    let factory: Arc<dyn TowerFactory> = Arc::new(factory);
    let trainer = Arc::new(SgdTwoTowerTrainer::new(TrainerConfig {
        epochs: 1,
        ..TrainerConfig::default()
    }));
    let artifacts = repo.artifacts();

    PipelineBuilder::new(Arc::clone(&store), artifacts.clone())
        .with_acquisition_stage(Arc::new(FeatureAcquisitionStage::new(
            Arc::clone(&store),
            Some(corrections),
            artifacts.clone(),
            repo.acquisition_config(),
            Arc::clone(&metrics),
        )))
        .with_training_stage(Arc::new(ModelTrainingStage::new(
            artifacts,
            Arc::clone(&factory),
            trainer,
            EMBEDDING_DIM,
        )))
        .with_generation_stage(Arc::new(CandidateGenerationStage::new(
            store,
            factory,
            GenerationConfig {
                embedding_dim: EMBEDDING_DIM,
                top_k,
                concurrency: 4,
            },
            Arc::clone(&metrics),
        )))
        .with_metrics(metrics)
        .build()
        .unwrap()
}

/// Expected ranking for `user`: items ordered by `|user mod 7 - item mod 7|`,
/// then by item id.
pub fn expected_ranking(user: i64) -> Vec<i64> {
    let mut items = ids(NUM_ITEMS);
    items.sort_by_key(|&item| ((user % 7 - item % 7).abs(), item));
    items
}
