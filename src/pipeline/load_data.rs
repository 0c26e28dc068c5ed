//! Feature acquisition: point-in-time feature tables for a fixed entity
//! universe, augmented with streaming corrections.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{
    AcquisitionStage, FeatureTables, INTERACTION_DF, ITEM_DF, NEG_INTERACTION_DF, RunContext,
    StageName, USER_DF,
};
use crate::artifact::{ArtifactStore, columnar};
use crate::config::{ConfigError, STREAM_URI_VAR};
use crate::feature_store::{FeatureService, FeatureStore};
use crate::frame::{Column, ColumnData, EVENT_TIMESTAMP, Frame};
use crate::observability::metrics::Metrics;
use crate::registry::{ITEM_ID, ServiceName, USER_ID, validate_frame, validate_service};
use crate::streaming::{CorrectionSource, merge_corrections};

/// Entities the pipeline scores: ids `1..=n`, all observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityUniverse {
    pub num_users: usize,
    pub num_items: usize,
    pub reference_time: DateTime<Utc>,
}

impl EntityUniverse {
    fn entities(&self, key: &str, count: usize) -> Result<Frame> {
        let count_i64 = i64::try_from(count).context("entity universe is too large")?;
        Ok(Frame::new(vec![
            Column::new(key, ColumnData::Int64((1..=count_i64).map(Some).collect())),
            Column::new(
                EVENT_TIMESTAMP,
                ColumnData::Timestamp(vec![Some(self.reference_time); count]),
            ),
        ])?)
    }

    /// # Errors
    /// Fails only if the item count does not fit in an `i64`.
    pub fn item_entities(&self) -> Result<Frame> {
        self.entities(ITEM_ID, self.num_items)
    }

    /// # Errors
    /// Fails only if the user count does not fit in an `i64`.
    pub fn user_entities(&self) -> Result<Frame> {
        self.entities(USER_ID, self.num_users)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub universe: EntityUniverse,
    pub positive_interactions_path: PathBuf,
    pub negative_interactions_path: PathBuf,
    pub stream_positive_table: String,
    pub stream_negative_table: String,
}

pub struct FeatureAcquisitionStage {
    store: Arc<dyn FeatureStore>,
    corrections: Option<Arc<dyn CorrectionSource>>,
    artifacts: ArtifactStore,
    config: AcquisitionConfig,
    metrics: Arc<Metrics>,
}

impl FeatureAcquisitionStage {
    /// `corrections` is `None` when no streaming store is configured, which
    /// makes [`AcquisitionStage::acquire`] fail.
    pub fn new(
        store: Arc<dyn FeatureStore>,
        corrections: Option<Arc<dyn CorrectionSource>>,
        artifacts: ArtifactStore,
        config: AcquisitionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            corrections,
            artifacts,
            config,
            metrics,
        }
    }

    async fn resolve(&self, name: ServiceName) -> Result<FeatureService> {
        let service = self
            .store
            .resolve_service(name.as_str())
            .await
            .with_context(|| format!("failed to resolve feature service {name}"))?;
        validate_service(name, &service)?;
        Ok(service)
    }

    /// Reads a curated interaction file and stamps every row with the
    /// reference time. Columns besides the pair keys are carried through.
    async fn curated_pairs(&self, path: &Path) -> Result<Frame> {
        let owned = path.to_path_buf();
        let frame = tokio::task::spawn_blocking(move || columnar::read_parquet(&owned))
            .await
            .context("parquet reader panicked")?
            .with_context(|| format!("failed to read {}", path.display()))?;
        frame.require_column(USER_ID)?;
        frame.require_column(ITEM_ID)?;
        let rows = frame.num_rows();
        Ok(frame.with_column(
            EVENT_TIMESTAMP,
            ColumnData::Timestamp(vec![Some(self.config.universe.reference_time); rows]),
        )?)
    }

    async fn join(&self, entity_df: &Frame, service: &FeatureService) -> Result<Frame> {
        self.store
            .point_in_time_join(entity_df, service)
            .await
            .with_context(|| format!("point-in-time join for {} failed", service.name))
    }

    async fn merge(&self, source: &dyn CorrectionSource, table: &str, batch: Frame) -> Result<Frame> {
        let outcome = merge_corrections(source, table, batch).await?;
        if outcome.table_present {
            #[allow(clippy::cast_precision_loss)]
            self.metrics
                .streaming_rows_merged
                .inc_by(outcome.merged_rows as f64);
            info!(table, rows = outcome.merged_rows, "merged streaming corrections");
        }
        Ok(outcome.frame)
    }
}

#[async_trait]
impl AcquisitionStage for FeatureAcquisitionStage {
    async fn acquire(&self, run: &RunContext) -> Result<FeatureTables> {
        let corrections = self
            .corrections
            .as_deref()
            .ok_or(ConfigError::Missing(STREAM_URI_VAR))?;

        self.store
            .refresh_registry()
            .await
            .context("failed to refresh feature registry")?;
        let item_service = self.resolve(ServiceName::Item).await?;
        let user_service = self.resolve(ServiceName::User).await?;
        let interaction_service = self.resolve(ServiceName::Interaction).await?;
        let neg_interaction_service = self.resolve(ServiceName::NegInteraction).await?;

        let universe = &self.config.universe;
        let positives = self.curated_pairs(&self.config.positive_interactions_path).await?;
        let negatives = self.curated_pairs(&self.config.negative_interactions_path).await?;
        debug!(
            run_id = %run.run_id,
            users = universe.num_users,
            items = universe.num_items,
            positives = positives.num_rows(),
            negatives = negatives.num_rows(),
            "built entity frames"
        );

        let item_df = self.join(&universe.item_entities()?, &item_service).await?;
        let user_df = self.join(&universe.user_entities()?, &user_service).await?;
        let interaction_df = self.join(&positives, &interaction_service).await?;
        let neg_interaction_df = self.join(&negatives, &neg_interaction_service).await?;

        let neg_interaction_df = self
            .merge(corrections, &self.config.stream_negative_table, neg_interaction_df)
            .await?;
        let interaction_df = self
            .merge(corrections, &self.config.stream_positive_table, interaction_df)
            .await?;

        let outputs = [
            (ITEM_DF, ServiceName::Item, item_df),
            (USER_DF, ServiceName::User, user_df),
            (INTERACTION_DF, ServiceName::Interaction, interaction_df),
            (NEG_INTERACTION_DF, ServiceName::NegInteraction, neg_interaction_df),
        ];
        for (name, service, frame) in &outputs {
            validate_frame(name, frame, &service.output_schema())?;
        }

        let artifacts = self.artifacts.clone();
        let run_id = run.run_id;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let writer = artifacts.begin_stage(run_id, StageName::LoadData)?;
            for (name, _, frame) in &outputs {
                writer.write_dataset(name, frame)?;
            }
            writer.commit()?;
            Ok(())
        })
        .await
        .context("artifact writer panicked")??;

        let tables = FeatureTables::load(&self.artifacts, run.run_id)?;
        info!(run_id = %run.run_id, "feature tables committed");
        Ok(tables)
    }
}
