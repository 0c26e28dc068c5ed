use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prometheus::Registry;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    AcquisitionStage, FeatureTables, GenerationStage, GenerationSummary, NoopWarmup, RunContext,
    StageName, StageWarmup, TrainedTowers, TrainingStage,
};
use crate::artifact::ArtifactStore;
use crate::feature_store::FeatureStore;
use crate::observability::metrics::Metrics;
use crate::registry::{PushSourceName, ServiceName, validate_push_source, validate_service};
use crate::util::error::is_retryable;
use crate::util::retry::RetryConfig;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0} must be configured before build")]
    MissingComponent(&'static str),
    #[error("failed to register pipeline metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: GenerationSummary,
}

pub struct PipelineBuilder {
    store: Arc<dyn FeatureStore>,
    artifacts: ArtifactStore,
    acquisition: Option<Arc<dyn AcquisitionStage>>,
    training: Option<Arc<dyn TrainingStage>>,
    generation: Option<Arc<dyn GenerationStage>>,
    warmup: Arc<dyn StageWarmup>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineBuilder {
    pub fn new(store: Arc<dyn FeatureStore>, artifacts: ArtifactStore) -> Self {
        Self {
            store,
            artifacts,
            acquisition: None,
            training: None,
            generation: None,
            warmup: Arc::new(NoopWarmup),
            retry: RetryConfig::default(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_acquisition_stage(mut self, stage: Arc<dyn AcquisitionStage>) -> Self {
        self.acquisition = Some(stage);
        self
    }

    #[must_use]
    pub fn with_training_stage(mut self, stage: Arc<dyn TrainingStage>) -> Self {
        self.training = Some(stage);
        self
    }

    #[must_use]
    pub fn with_generation_stage(mut self, stage: Arc<dyn GenerationStage>) -> Self {
        self.generation = Some(stage);
        self
    }

    #[must_use]
    pub fn with_warmup(mut self, warmup: Arc<dyn StageWarmup>) -> Self {
        self.warmup = warmup;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// # Errors
    /// Fails when a stage is missing, or when no metrics were supplied and a
    /// private registry cannot be created.
    pub fn build(self) -> Result<PipelineOrchestrator, BuildError> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new(Arc::new(Registry::new()))?),
        };
        Ok(PipelineOrchestrator {
            store: self.store,
            artifacts: self.artifacts,
            acquisition: self
                .acquisition
                .ok_or(BuildError::MissingComponent("acquisition stage"))?,
            training: self
                .training
                .ok_or(BuildError::MissingComponent("training stage"))?,
            generation: self
                .generation
                .ok_or(BuildError::MissingComponent("generation stage"))?,
            warmup: self.warmup,
            retry: self.retry,
            metrics,
            run_permit: Semaphore::new(1),
        })
    }
}

/// Runs the three stages in order, retrying retryable stage failures.
///
/// Runs and single-stage executions never overlap: they share the online
/// store's keys, so a later one waits for the one in progress.
pub struct PipelineOrchestrator {
    store: Arc<dyn FeatureStore>,
    artifacts: ArtifactStore,
    acquisition: Arc<dyn AcquisitionStage>,
    training: Arc<dyn TrainingStage>,
    generation: Arc<dyn GenerationStage>,
    warmup: Arc<dyn StageWarmup>,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
    run_permit: Semaphore,
}

impl PipelineOrchestrator {
    /// Checks every registry object the pipeline touches against its static
    /// schema.
    ///
    /// # Errors
    /// Fails on the first unknown or mismatching service or push source.
    pub async fn preflight(&self) -> Result<()> {
        self.store
            .refresh_registry()
            .await
            .context("failed to refresh feature registry")?;
        for name in ServiceName::ALL {
            let service = self
                .store
                .resolve_service(name.as_str())
                .await
                .with_context(|| format!("failed to resolve feature service {name}"))?;
            validate_service(name, &service)?;
        }
        for name in PushSourceName::ALL {
            let projection = self
                .store
                .resolve_push_source(name.as_str())
                .await
                .with_context(|| format!("failed to resolve push source {name}"))?;
            validate_push_source(name, &projection)?;
        }
        info!("feature registry matches pipeline schemas");
        Ok(())
    }

    /// Runs all stages for `run`.
    ///
    /// # Errors
    /// Returns the first stage failure that exhausted its retries.
    pub async fn execute(&self, run: &RunContext) -> Result<RunReport> {
        let _permit = self.run_permit.acquire().await.context("run permit closed")?;
        self.metrics.active_runs.inc();
        let timer = self.metrics.run_duration.start_timer();
        info!(run_id = %run.run_id, "pipeline run started");

        let result = self.execute_stages(run).await;

        timer.observe_duration();
        self.metrics.active_runs.dec();
        match result {
            Ok(summary) => {
                self.metrics.runs_completed.inc();
                info!(run_id = %run.run_id, ?summary, "pipeline run completed");
                Ok(RunReport {
                    run_id: run.run_id,
                    started_at: run.started_at,
                    finished_at: Utc::now(),
                    summary,
                })
            }
            Err(err) => {
                self.metrics.runs_failed.inc();
                error!(run_id = %run.run_id, error = %format!("{err:#}"), "pipeline run failed");
                Err(err)
            }
        }
    }

    async fn execute_stages(&self, run: &RunContext) -> Result<GenerationSummary> {
        let tables = self
            .with_retries(StageName::LoadData, run, || self.acquisition.acquire(run))
            .await?;
        let towers = self
            .with_retries(StageName::Train, run, || self.training.train(run, &tables))
            .await?;
        self.with_retries(StageName::Generate, run, || {
            self.generation.generate(run, &towers, &tables)
        })
        .await
    }

    /// Runs one stage of an existing run against the committed outputs of its
    /// predecessors.
    ///
    /// # Errors
    /// Fails when a predecessor output is missing or the stage fails.
    pub async fn execute_stage(&self, stage: StageName, run: &RunContext) -> Result<()> {
        let _permit = self.run_permit.acquire().await.context("run permit closed")?;
        match stage {
            StageName::LoadData => {
                self.with_retries(stage, run, || self.acquisition.acquire(run))
                    .await?;
            }
            StageName::Train => {
                let tables = FeatureTables::load(&self.artifacts, run.run_id)?;
                self.with_retries(stage, run, || self.training.train(run, &tables))
                    .await?;
            }
            StageName::Generate => {
                let tables = FeatureTables::load(&self.artifacts, run.run_id)?;
                let towers = TrainedTowers::load(&self.artifacts, run.run_id)?;
                let summary = self
                    .with_retries(stage, run, || {
                        self.generation.generate(run, &towers, &tables)
                    })
                    .await?;
                info!(run_id = %run.run_id, ?summary, "generation finished");
            }
        }
        Ok(())
    }

    async fn with_retries<T, F, Fut>(&self, stage: StageName, run: &RunContext, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            self.warmup
                .before_stage(stage, run)
                .await
                .with_context(|| format!("warmup before {stage} failed"))?;

            let timer = self
                .metrics
                .stage_duration
                .with_label_values(&[stage.as_str()])
                .start_timer();
            let result = op().await;
            timer.observe_duration();

            match result {
                Ok(output) => {
                    if attempt > 0 {
                        info!(%stage, attempt, "stage succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(err) => {
                    attempt += 1;
                    if !self.retry.can_retry(attempt) || !is_retryable(&err) {
                        return Err(err.context(format!("stage {stage} failed")));
                    }
                    self.metrics.stage_retries.inc();
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        %stage,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %format!("{err:#}"),
                        "stage failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::feature_store::{FeatureStoreError, LocalFeatureStore, Provider, RepoConfig};

    fn empty_store(dir: &std::path::Path) -> Arc<LocalFeatureStore> {
        let config = RepoConfig {
            project: "orchestrator_test".into(),
            provider: Provider::Local,
            registry: "registry.yaml".into(),
            vector_metric: Default::default(),
            feature_server: None,
        };
        Arc::new(LocalFeatureStore::new(dir, config))
    }

    struct FlakyAcquisition {
        calls: AtomicUsize,
        error_status: u16,
    }

    #[async_trait]
    impl AcquisitionStage for FlakyAcquisition {
        async fn acquire(&self, _run: &RunContext) -> Result<FeatureTables> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FeatureStoreError::Remote {
                status: self.error_status,
                body: String::new(),
            }
            .into())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl TrainingStage for Unreachable {
        async fn train(&self, _run: &RunContext, _tables: &FeatureTables) -> Result<TrainedTowers> {
            unreachable!("training must not run after a failed acquisition")
        }
    }

    #[async_trait]
    impl GenerationStage for Unreachable {
        async fn generate(
            &self,
            _run: &RunContext,
            _towers: &TrainedTowers,
            _tables: &FeatureTables,
        ) -> Result<GenerationSummary> {
            unreachable!("generation must not run after a failed acquisition")
        }
    }

    fn orchestrator(acquisition: Arc<FlakyAcquisition>, retry: RetryConfig) -> (PipelineOrchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());
        let orchestrator = PipelineBuilder::new(store, ArtifactStore::new(dir.path().join("artifacts")))
            .with_acquisition_stage(acquisition)
            .with_training_stage(Arc::new(Unreachable))
            .with_generation_stage(Arc::new(Unreachable))
            .with_retry(retry)
            .build()
            .unwrap();
        (orchestrator, dir)
    }

    #[tokio::test]
    async fn retryable_failures_use_every_attempt() {
        let acquisition = Arc::new(FlakyAcquisition {
            calls: AtomicUsize::new(0),
            error_status: 503,
        });
        let (orchestrator, _dir) = orchestrator(Arc::clone(&acquisition), RetryConfig::new(3, 1, 2));

        let err = orchestrator.execute(&RunContext::new()).await.unwrap_err();
        assert_eq!(acquisition.calls.load(Ordering::SeqCst), 3);
        assert!(format!("{err:#}").contains("stage load_data_from_feast failed"));
        assert_eq!(orchestrator.metrics.stage_retries.get(), 2.0);
        assert_eq!(orchestrator.metrics.runs_failed.get(), 1.0);
    }

    #[tokio::test]
    async fn non_retryable_failures_stop_immediately() {
        let acquisition = Arc::new(FlakyAcquisition {
            calls: AtomicUsize::new(0),
            error_status: 422,
        });
        let (orchestrator, _dir) = orchestrator(Arc::clone(&acquisition), RetryConfig::new(3, 1, 2));

        orchestrator.execute(&RunContext::new()).await.unwrap_err();
        assert_eq!(acquisition.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn later_stages_require_committed_predecessors() {
        let acquisition = Arc::new(FlakyAcquisition {
            calls: AtomicUsize::new(0),
            error_status: 503,
        });
        let (orchestrator, _dir) = orchestrator(acquisition, RetryConfig::default());

        let err = orchestrator
            .execute_stage(StageName::Generate, &RunContext::new())
            .await
            .unwrap_err();
        assert!(crate::util::error::is_fatal(&err));
    }

    struct SlowAcquisition {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl AcquisitionStage for SlowAcquisition {
        async fn acquire(&self, _run: &RunContext) -> Result<FeatureTables> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("no tables"))
        }
    }

    #[tokio::test]
    async fn concurrent_runs_execute_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let acquisition = Arc::new(SlowAcquisition {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let orchestrator = PipelineBuilder::new(
            empty_store(dir.path()),
            ArtifactStore::new(dir.path().join("artifacts")),
        )
        .with_acquisition_stage(Arc::clone(&acquisition) as Arc<dyn AcquisitionStage>)
        .with_training_stage(Arc::new(Unreachable))
        .with_generation_stage(Arc::new(Unreachable))
        .build()
        .unwrap();

        let (ctx1, ctx2, ctx3) = (RunContext::new(), RunContext::new(), RunContext::new());
        let (first, second, third) = tokio::join!(
            orchestrator.execute(&ctx1),
            orchestrator.execute(&ctx2),
            orchestrator.execute_stage(StageName::LoadData, &ctx3),
        );
        assert!(first.is_err() && second.is_err() && third.is_err());
        assert_eq!(acquisition.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_stage_is_a_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(dir.path());
        let err = PipelineBuilder::new(store, ArtifactStore::new(dir.path()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::MissingComponent("acquisition stage")));
    }
}
