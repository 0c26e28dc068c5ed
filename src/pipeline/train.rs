use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{FeatureTables, RunContext, StageName, TrainedTowers, TrainingStage, model_artifact_name};
use crate::artifact::ArtifactStore;
use crate::model::{
    FRAMEWORK, TowerEncoder, TowerFactory, TowerKind, TrainReport, TrainingData, TwoTowerTrainer,
    save_state,
};

/// Fits the item and user towers on the acquired tables and stores both as
/// model artifacts.
pub struct ModelTrainingStage {
    artifacts: ArtifactStore,
    factory: Arc<dyn TowerFactory>,
    trainer: Arc<dyn TwoTowerTrainer>,
    embedding_dim: usize,
}

impl ModelTrainingStage {
    pub fn new(
        artifacts: ArtifactStore,
        factory: Arc<dyn TowerFactory>,
        trainer: Arc<dyn TwoTowerTrainer>,
        embedding_dim: usize,
    ) -> Self {
        Self {
            artifacts,
            factory,
            trainer,
            embedding_dim,
        }
    }
}

fn model_tags(encoder: &dyn TowerEncoder) -> BTreeMap<String, String> {
    let state = encoder.state_dict();
    BTreeMap::from([
        ("architecture".to_string(), state.architecture),
        ("embedding_dim".to_string(), encoder.embedding_dim().to_string()),
        ("kind".to_string(), encoder.kind().to_string()),
    ])
}

fn fit_and_store(
    artifacts: &ArtifactStore,
    factory: &dyn TowerFactory,
    trainer: &dyn TwoTowerTrainer,
    embedding_dim: usize,
    run: &RunContext,
    tables: &FeatureTables,
) -> Result<TrainReport> {
    let data = TrainingData::from_frames(
        &tables.item.read_frame()?,
        &tables.user.read_frame()?,
        &tables.interaction.read_frame()?,
        &tables.neg_interaction.read_frame()?,
    )
    .context("failed to assemble training data")?;

    let mut item_model = factory.build(TowerKind::Item, embedding_dim);
    let mut user_model = factory.build(TowerKind::User, embedding_dim);
    let report = trainer
        .train(item_model.as_mut(), user_model.as_mut(), &data)
        .context("two-tower training failed")?;

    let writer = artifacts.begin_stage(run.run_id, StageName::Train)?;
    for model in [&item_model, &user_model] {
        let bytes = save_state(&model.state_dict())?;
        writer.write_model(
            model_artifact_name(model.kind()),
            &bytes,
            FRAMEWORK,
            model_tags(&**model),
        )?;
    }
    writer.commit()?;
    Ok(report)
}

#[async_trait]
impl TrainingStage for ModelTrainingStage {
    async fn train(&self, run: &RunContext, tables: &FeatureTables) -> Result<TrainedTowers> {
        let artifacts = self.artifacts.clone();
        let factory = Arc::clone(&self.factory);
        let trainer = Arc::clone(&self.trainer);
        let embedding_dim = self.embedding_dim;
        let run_ctx = *run;
        let owned_tables = tables.clone();

        let report = tokio::task::spawn_blocking(move || {
            fit_and_store(
                &artifacts,
                factory.as_ref(),
                trainer.as_ref(),
                embedding_dim,
                &run_ctx,
                &owned_tables,
            )
        })
        .await
        .context("training task panicked")??;

        info!(
            run_id = %run.run_id,
            epochs = report.epochs,
            examples = report.examples,
            positives = report.positives,
            final_loss = ?report.final_loss(),
            "towers trained"
        );
        Ok(TrainedTowers::load(&self.artifacts, run.run_id)?)
    }
}
