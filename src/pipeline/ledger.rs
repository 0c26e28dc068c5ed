use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{GenerationSummary, RunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<GenerationSummary>,
}

/// Finished records kept by default; the oldest are evicted first.
pub const DEFAULT_RETAINED_RUNS: usize = 256;

/// In-memory status of runs triggered through the API.
#[derive(Debug)]
pub struct RunLedger {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
    retained: usize,
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RUNS)
    }
}

fn running_record(run: &RunContext) -> RunRecord {
    RunRecord {
        run_id: run.run_id,
        status: RunStatus::Running,
        started_at: run.started_at,
        finished_at: None,
        error: None,
        summary: None,
    }
}

impl RunLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `retained` finished records.
    #[must_use]
    pub fn with_retention(retained: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            retained,
        }
    }

    /// Records `run` as running unless another run still is.
    ///
    /// # Errors
    /// Returns the id of the run in progress.
    pub async fn try_start(&self, run: &RunContext) -> Result<(), Uuid> {
        let mut runs = self.runs.write().await;
        if let Some(active) = runs.values().find(|r| r.status == RunStatus::Running) {
            return Err(active.run_id);
        }
        runs.insert(run.run_id, running_record(run));
        Ok(())
    }

    fn evict_finished(&self, runs: &mut HashMap<Uuid, RunRecord>) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = runs
            .values()
            .filter_map(|r| r.finished_at.map(|at| (at, r.run_id)))
            .collect();
        if finished.len() <= self.retained {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - self.retained;
        for (_, run_id) in finished.into_iter().take(excess) {
            runs.remove(&run_id);
        }
    }

    pub async fn succeed(&self, run_id: Uuid, summary: GenerationSummary) {
        let mut runs = self.runs.write().await;
        if let Some(record) = runs.get_mut(&run_id) {
            record.status = RunStatus::Succeeded;
            record.finished_at = Some(Utc::now());
            record.summary = Some(summary);
        }
        self.evict_finished(&mut runs);
    }

    pub async fn fail(&self, run_id: Uuid, error: &anyhow::Error) {
        let mut runs = self.runs.write().await;
        if let Some(record) = runs.get_mut(&run_id) {
            record.status = RunStatus::Failed;
            record.finished_at = Some(Utc::now());
            record.error = Some(format!("{error:#}"));
        }
        self.evict_finished(&mut runs);
    }

    pub async fn get(&self, run_id: Uuid) -> Option<RunRecord> {
        self.runs.read().await.get(&run_id).cloned()
    }

    /// Number of runs currently marked running.
    pub async fn running(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .filter(|record| record.status == RunStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_follow_the_run_lifecycle() {
        let ledger = RunLedger::new();
        let run = RunContext::new();
        ledger.try_start(&run).await.unwrap();
        assert_eq!(ledger.running().await, 1);

        ledger
            .fail(run.run_id, &anyhow::anyhow!("push failed").context("generate_candidates"))
            .await;
        let record = ledger.get(run.run_id).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("generate_candidates: push failed"));
        assert!(record.finished_at.is_some());
        assert_eq!(ledger.running().await, 0);
    }

    #[tokio::test]
    async fn second_run_is_refused_while_one_is_running() {
        let ledger = RunLedger::new();
        let first = RunContext::new();
        ledger.try_start(&first).await.unwrap();
        assert_eq!(ledger.try_start(&RunContext::new()).await, Err(first.run_id));

        ledger.fail(first.run_id, &anyhow::anyhow!("boom")).await;
        ledger.try_start(&RunContext::new()).await.unwrap();
    }

    #[tokio::test]
    async fn oldest_finished_runs_are_evicted() {
        let ledger = RunLedger::with_retention(2);
        let runs: Vec<RunContext> = (0..3).map(|_| RunContext::new()).collect();
        for run in &runs {
            ledger.try_start(run).await.unwrap();
            ledger.fail(run.run_id, &anyhow::anyhow!("boom")).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let running = RunContext::new();
        ledger.try_start(&running).await.unwrap();

        assert!(ledger.get(runs[0].run_id).await.is_none());
        assert!(ledger.get(runs[1].run_id).await.is_some());
        assert!(ledger.get(runs[2].run_id).await.is_some());
        assert_eq!(ledger.running().await, 1);
    }

    #[tokio::test]
    async fn unknown_runs_are_absent() {
        assert!(RunLedger::new().get(Uuid::new_v4()).await.is_none());
    }
}
