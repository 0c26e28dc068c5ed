use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    api,
    artifact::ArtifactStore,
    clients::FeatureServerConfig,
    config::Config,
    feature_store::{self, FeatureStore},
    model::{LinearTowerFactory, SgdTwoTowerTrainer, TowerFactory, TrainerConfig, TwoTowerTrainer},
    observability::{Telemetry, metrics::Metrics},
    pipeline::{
        AcquisitionConfig, CandidateGenerationStage, EntityUniverse, EntryPointWarmup,
        FeatureAcquisitionStage, GenerationConfig, ModelTrainingStage, PipelineBuilder,
        PipelineOrchestrator, RunLedger,
    },
    streaming::{CorrectionSource, PgCorrectionSource, connect_options},
    util::retry::RetryConfig,
};

/// CA bundle looked up in the mounted secrets directory.
const CA_BUNDLE_FILE: &str = "ca.pem";

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    telemetry: Telemetry,
    orchestrator: Arc<PipelineOrchestrator>,
    ledger: Arc<RunLedger>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn orchestrator(&self) -> Arc<PipelineOrchestrator> {
        Arc::clone(&self.registry.orchestrator)
    }

    pub(crate) fn ledger(&self) -> Arc<RunLedger> {
        Arc::clone(&self.registry.ledger)
    }
}

fn ca_bundle(config: &Config) -> Option<PathBuf> {
    let path = config.feature_repo_secrets_dir().join(CA_BUNDLE_FILE);
    path.exists().then_some(path)
}

fn correction_source(config: &Config) -> Result<Option<Arc<dyn CorrectionSource>>> {
    let Some(uri) = config.stream_uri() else {
        return Ok(None);
    };
    let options = connect_options(uri, config.db_password(), ca_bundle(config).as_deref())?;
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections())
        .acquire_timeout(config.db_acquire_timeout())
        .connect_lazy_with(options);
    Ok(Some(Arc::new(PgCorrectionSource::new(pool))))
}

/// Wires the production stages from configuration.
///
/// # Errors
/// Fails when the feature repo cannot be opened or the streaming store URI is
/// invalid.
pub fn build_pipeline(config: &Config, metrics: Arc<Metrics>) -> Result<PipelineOrchestrator> {
    let remote = FeatureServerConfig {
        base_url: String::new(),
        connect_timeout: config.feature_server_connect_timeout(),
        total_timeout: config.feature_server_total_timeout(),
        ca_bundle: ca_bundle(config),
    };
    let store: Arc<dyn FeatureStore> = feature_store::open(config.feature_repo_path(), &remote)
        .context("failed to open feature store")?;
    let artifacts = ArtifactStore::new(config.artifact_root());
    let corrections = correction_source(config)?;

    let factory: Arc<dyn TowerFactory> = Arc::new(LinearTowerFactory {
        dropout: config.train_dropout(),
        seed: config.train_seed(),
    });
    let trainer: Arc<dyn TwoTowerTrainer> = Arc::new(SgdTwoTowerTrainer::new(TrainerConfig {
        epochs: config.train_epochs(),
        learning_rate: config.train_learning_rate(),
        seed: config.train_seed(),
        ..TrainerConfig::default()
    }));

    let acquisition = FeatureAcquisitionStage::new(
        Arc::clone(&store),
        corrections,
        artifacts.clone(),
        AcquisitionConfig {
            universe: EntityUniverse {
                num_users: config.num_users(),
                num_items: config.num_items(),
                reference_time: config.reference_time(),
            },
            positive_interactions_path: config.positive_interactions_path().to_path_buf(),
            negative_interactions_path: config.negative_interactions_path().to_path_buf(),
            stream_positive_table: config.stream_positive_table().to_string(),
            stream_negative_table: config.stream_negative_table().to_string(),
        },
        Arc::clone(&metrics),
    );
    let training = ModelTrainingStage::new(
        artifacts.clone(),
        Arc::clone(&factory),
        trainer,
        config.embedding_dim().get(),
    );
    let generation = CandidateGenerationStage::new(
        Arc::clone(&store),
        factory,
        GenerationConfig {
            embedding_dim: config.embedding_dim().get(),
            top_k: config.top_k().get(),
            concurrency: config.retrieval_concurrency().get(),
        },
        Arc::clone(&metrics),
    );
    let warmup = EntryPointWarmup::new(
        config.entry_point().map(std::path::Path::to_path_buf),
        config.warmup_config_file().to_path_buf(),
    );

    Ok(PipelineBuilder::new(store, artifacts)
        .with_acquisition_stage(Arc::new(acquisition))
        .with_training_stage(Arc::new(training))
        .with_generation_stage(Arc::new(generation))
        .with_warmup(Arc::new(warmup))
        .with_retry(RetryConfig::new(
            config.stage_max_attempts(),
            config.stage_backoff_base_ms(),
            config.stage_backoff_cap_ms(),
        ))
        .with_metrics(metrics)
        .build()?)
}

impl ComponentRegistry {
    /// Initializes telemetry and the production pipeline.
    ///
    /// # Errors
    /// Fails when telemetry cannot be installed or the pipeline cannot be wired.
    pub fn build(config: &Config) -> Result<Self> {
        let telemetry = Telemetry::new(config)?;
        let orchestrator = build_pipeline(config, telemetry.metrics())?;
        info!(
            repo = %config.feature_repo_path().display(),
            artifacts = %config.artifact_root().display(),
            "component registry built"
        );
        Ok(Self::new(telemetry, orchestrator))
    }

    /// Assembles a registry around an already built orchestrator.
    #[must_use]
    pub fn new(telemetry: Telemetry, orchestrator: PipelineOrchestrator) -> Self {
        Self {
            telemetry,
            orchestrator: Arc::new(orchestrator),
            ledger: Arc::new(RunLedger::new()),
        }
    }

    #[must_use]
    pub fn orchestrator(&self) -> Arc<PipelineOrchestrator> {
        Arc::clone(&self.orchestrator)
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_MUTEX;

    #[tokio::test]
    async fn component_registry_builds_from_a_local_repo() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(
            repo.path().join("feature_store.yaml"),
            "project: recsys\nprovider: local\n",
        )
        .unwrap();

        let config = {
            let _lock = ENV_MUTEX.lock().expect("env mutex");
            // SAFETY: test code adjusts deterministic environment state sequentially.
            unsafe {
                std::env::set_var("FEATURE_REPO_PATH", repo.path());
                std::env::set_var("uri", "postgres://recsys@localhost:5432/stream");
            }
            let config = Config::from_env().expect("config loads");
            // SAFETY: see above.
            unsafe {
                std::env::remove_var("FEATURE_REPO_PATH");
                std::env::remove_var("uri");
            }
            config
        };

        let registry = ComponentRegistry::build(&config).expect("registry builds");
        let state = AppState::new(registry);
        state.telemetry().record_ready_probe();
        let _ = state.orchestrator();
        assert!(state.ledger().get(uuid::Uuid::new_v4()).await.is_none());
    }
}
