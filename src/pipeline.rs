//! The three-stage batch pipeline and the typed artifacts passed between
//! stages.
//!
//! Stages run strictly in order: feature acquisition, model training, then
//! candidate generation. Each stage reads only the committed outputs of its
//! predecessors, addressed by run id.

pub mod generate;
pub mod ledger;
pub mod load_data;
pub mod orchestrator;
pub mod train;
pub mod warmup;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::{ArtifactError, ArtifactStore, DatasetArtifact, ModelArtifact};
use crate::model::TowerKind;

pub use generate::{CandidateGenerationStage, GenerationConfig};
pub use ledger::{RunLedger, RunRecord, RunStatus};
pub use load_data::{AcquisitionConfig, EntityUniverse, FeatureAcquisitionStage};
pub use orchestrator::{PipelineBuilder, PipelineOrchestrator, RunReport};
pub use train::ModelTrainingStage;
pub use warmup::{EntryPointWarmup, NoopWarmup, StageWarmup};

pub const ITEM_DF: &str = "item_df_output";
pub const USER_DF: &str = "user_df_output";
pub const INTERACTION_DF: &str = "interaction_df_output";
pub const NEG_INTERACTION_DF: &str = "neg_interaction_df_output";

/// Artifact name of a trained tower.
#[must_use]
pub fn model_artifact_name(kind: TowerKind) -> &'static str {
    match kind {
        TowerKind::Item => "item_output_model",
        TowerKind::User => "user_output_model",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    LoadData,
    Train,
    Generate,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stage `{0}`")]
pub struct UnknownStage(pub String);

impl StageName {
    pub const ALL: [StageName; 3] = [StageName::LoadData, StageName::Train, StageName::Generate];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::LoadData => "load_data_from_feast",
            StageName::Train => "train_model",
            StageName::Generate => "generate_candidates",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Identity of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::now_v7())
    }

    /// Context for resuming or re-running an existing run.
    #[must_use]
    pub fn with_id(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outputs of feature acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTables {
    pub item: DatasetArtifact,
    pub user: DatasetArtifact,
    pub interaction: DatasetArtifact,
    pub neg_interaction: DatasetArtifact,
}

impl FeatureTables {
    /// Resolves the committed acquisition outputs of `run_id`.
    ///
    /// # Errors
    /// Fails when any of the four tables is missing.
    pub fn load(store: &ArtifactStore, run_id: Uuid) -> Result<Self, ArtifactError> {
        let dataset = |name: &str| store.dataset(run_id, StageName::LoadData, name);
        Ok(Self {
            item: dataset(ITEM_DF)?,
            user: dataset(USER_DF)?,
            interaction: dataset(INTERACTION_DF)?,
            neg_interaction: dataset(NEG_INTERACTION_DF)?,
        })
    }
}

/// Outputs of model training.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainedTowers {
    pub item_model: ModelArtifact,
    pub user_model: ModelArtifact,
}

impl TrainedTowers {
    /// Resolves the committed training outputs of `run_id`.
    ///
    /// # Errors
    /// Fails when either model is missing.
    pub fn load(store: &ArtifactStore, run_id: Uuid) -> Result<Self, ArtifactError> {
        Ok(Self {
            item_model: store.model(run_id, StageName::Train, model_artifact_name(TowerKind::Item))?,
            user_model: store.model(run_id, StageName::Train, model_artifact_name(TowerKind::User))?,
        })
    }

    #[must_use]
    pub fn get(&self, kind: TowerKind) -> &ModelArtifact {
        match kind {
            TowerKind::Item => &self.item_model,
            TowerKind::User => &self.user_model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub items_embedded: usize,
    pub users_embedded: usize,
    pub recommendations: usize,
    pub embedding_dim: usize,
    pub top_k: usize,
}

#[async_trait]
pub trait AcquisitionStage: Send + Sync {
    async fn acquire(&self, run: &RunContext) -> Result<FeatureTables>;
}

#[async_trait]
pub trait TrainingStage: Send + Sync {
    async fn train(&self, run: &RunContext, tables: &FeatureTables) -> Result<TrainedTowers>;
}

#[async_trait]
pub trait GenerationStage: Send + Sync {
    async fn generate(
        &self,
        run: &RunContext,
        towers: &TrainedTowers,
        tables: &FeatureTables,
    ) -> Result<GenerationSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_parse_back() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
        }
        assert_eq!(
            "deploy".parse::<StageName>().unwrap_err(),
            UnknownStage("deploy".into())
        );
    }

    #[test]
    fn missing_predecessor_outputs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let err = FeatureTables::load(&store, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ArtifactError::Missing { ref name, .. } if name == ITEM_DF));
    }
}
