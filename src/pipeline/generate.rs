//! Candidate generation: embed every entity with the trained towers, publish
//! the embeddings, then retrieve and publish each user's nearest items.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, info};

use super::{FeatureTables, GenerationStage, GenerationSummary, RunContext, TrainedTowers};
use crate::artifact::ModelArtifact;
use crate::feature_store::{FeatureRef, FeatureStore, PushMode};
use crate::frame::{Column, ColumnData, EVENT_TIMESTAMP, Frame};
use crate::model::preprocess::data_preprocess;
use crate::model::{EncoderMode, FRAMEWORK, TowerFactory, TowerKind, load_state};
use crate::observability::metrics::Metrics;
use crate::registry::{EMBEDDING, FeatureViewName, ITEM_ID, PushSourceName, TOP_K_ITEM_IDS, USER_ID};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("{kind} embeddings have {actual} dimensions, expected {expected}")]
    Dimension {
        kind: TowerKind,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    pub embedding_dim: usize,
    pub top_k: usize,
    /// Retrieval queries kept in flight at once.
    pub concurrency: usize,
}

pub struct CandidateGenerationStage {
    store: Arc<dyn FeatureStore>,
    factory: Arc<dyn TowerFactory>,
    config: GenerationConfig,
    metrics: Arc<Metrics>,
}

/// Ids and embedding rows of one entity table, row-aligned.
struct Embeddings {
    ids: Vec<i64>,
    vectors: Array2<f32>,
}

impl Embeddings {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn to_frame(&self, id_column: &str, event_timestamp: DateTime<Utc>) -> Result<Frame> {
        let rows = self.len();
        Ok(Frame::new(vec![
            Column::new(id_column, ColumnData::Int64(self.ids.iter().copied().map(Some).collect())),
            Column::new(
                EMBEDDING,
                ColumnData::Float32List(self.vectors.rows().into_iter().map(|r| Some(r.to_vec())).collect()),
            ),
            Column::new(EVENT_TIMESTAMP, ColumnData::Timestamp(vec![Some(event_timestamp); rows])),
        ])?)
    }
}

/// Restores a tower from its artifact and embeds `frame` in eval mode.
fn embed(
    factory: &dyn TowerFactory,
    artifact: &ModelArtifact,
    kind: TowerKind,
    embedding_dim: usize,
    frame: &Frame,
) -> Result<Embeddings> {
    let state = load_state(&artifact.read_bytes(FRAMEWORK)?)?;
    let mut encoder = factory.build(kind, embedding_dim);
    encoder
        .load_state_dict(state)
        .with_context(|| format!("failed to restore {kind} tower"))?;
    encoder.set_mode(EncoderMode::Eval);

    let input = data_preprocess(frame, kind)?;
    let vectors = encoder.forward(&input)?;
    Ok(Embeddings {
        ids: input.ids,
        vectors,
    })
}

impl CandidateGenerationStage {
    pub fn new(
        store: Arc<dyn FeatureStore>,
        factory: Arc<dyn TowerFactory>,
        config: GenerationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            factory,
            config,
            metrics,
        }
    }

    async fn embed_table(&self, kind: TowerKind, towers: &TrainedTowers, tables: &FeatureTables) -> Result<Embeddings> {
        let factory = Arc::clone(&self.factory);
        let artifact = towers.get(kind).clone();
        let dataset = match kind {
            TowerKind::Item => tables.item.clone(),
            TowerKind::User => tables.user.clone(),
        };
        let embedding_dim = self.config.embedding_dim;

        let embeddings = tokio::task::spawn_blocking(move || {
            let frame = dataset.read_frame()?;
            embed(factory.as_ref(), &artifact, kind, embedding_dim, &frame)
        })
        .await
        .context("embedding task panicked")??;

        let actual = embeddings.vectors.ncols();
        if actual != embedding_dim {
            return Err(GenerationError::Dimension {
                kind,
                expected: embedding_dim,
                actual,
            }
            .into());
        }
        Ok(embeddings)
    }

    async fn push(&self, source: PushSourceName, frame: &Frame) -> Result<()> {
        self.store
            .push(source.as_str(), frame, PushMode::Online, false)
            .await
            .with_context(|| format!("push to {source} failed"))
    }

    /// Ranks items for every user, preserving user order.
    async fn retrieve(&self, users: &Embeddings) -> Result<Vec<Vec<i64>>> {
        let top_k = self.config.top_k;
        let store = Arc::clone(&self.store);
        let queries: Vec<(i64, Vec<f32>)> = users
            .ids
            .iter()
            .copied()
            .zip(users.vectors.rows().into_iter().map(|row| row.to_vec()))
            .collect();

        stream::iter(queries)
            .map(move |(user_id, query)| {
                let store = Arc::clone(&store);
                async move {
                    let refs = [FeatureRef::new(FeatureViewName::ItemEmbedding.as_str(), ITEM_ID)];
                    let hits = store
                        .nearest_neighbors(&query, top_k, &refs)
                        .await
                        .with_context(|| format!("retrieval for user {user_id} failed"))?;
                    let items: Vec<i64> = hits.int64_column(ITEM_ID)?.iter().flatten().copied().collect();
                    Ok::<_, anyhow::Error>(items)
                }
            })
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }
}

#[async_trait]
impl GenerationStage for CandidateGenerationStage {
    async fn generate(
        &self,
        run: &RunContext,
        towers: &TrainedTowers,
        tables: &FeatureTables,
    ) -> Result<GenerationSummary> {
        let items = self.embed_table(TowerKind::Item, towers, tables).await?;
        let users = self.embed_table(TowerKind::User, towers, tables).await?;
        let embedded_at = Utc::now();
        debug!(run_id = %run.run_id, items = items.len(), users = users.len(), "computed embeddings");

        self.push(PushSourceName::ItemEmbed, &items.to_frame(ITEM_ID, embedded_at)?)
            .await?;
        self.push(PushSourceName::UserEmbed, &users.to_frame(USER_ID, embedded_at)?)
            .await?;
        #[allow(clippy::cast_precision_loss)]
        self.metrics
            .embeddings_published
            .inc_by((items.len() + users.len()) as f64);

        let views = [
            FeatureViewName::ItemEmbedding.as_str(),
            FeatureViewName::UserItems.as_str(),
            FeatureViewName::ItemFeatures.as_str(),
        ];
        self.store
            .materialize_incremental(Utc::now(), &views)
            .await
            .context("incremental materialization failed")?;

        let ranked = self.retrieve(&users).await?;
        let recommended_at = Utc::now();
        let recommendations = Frame::new(vec![
            Column::new(USER_ID, ColumnData::Int64(users.ids.iter().copied().map(Some).collect())),
            Column::new(EVENT_TIMESTAMP, ColumnData::Timestamp(vec![Some(recommended_at); users.len()])),
            Column::new(TOP_K_ITEM_IDS, ColumnData::Int64List(ranked.into_iter().map(Some).collect())),
        ])?;
        self.push(PushSourceName::UserItems, &recommendations).await?;
        self.store
            .materialize_incremental(recommended_at, &[FeatureViewName::UserItems.as_str()])
            .await
            .context("materializing recommendations failed")?;
        #[allow(clippy::cast_precision_loss)]
        self.metrics
            .recommendations_published
            .inc_by(users.len() as f64);

        let summary = GenerationSummary {
            items_embedded: items.len(),
            users_embedded: users.len(),
            recommendations: users.len(),
            embedding_dim: self.config.embedding_dim,
            top_k: self.config.top_k,
        };
        info!(run_id = %run.run_id, ?summary, "candidates published");
        Ok(summary)
    }
}
