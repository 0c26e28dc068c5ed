use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::{RunContext, StageName};

/// Hook run before every stage attempt.
#[async_trait]
pub trait StageWarmup: Send + Sync {
    async fn before_stage(&self, stage: StageName, run: &RunContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWarmup;

#[async_trait]
impl StageWarmup for NoopWarmup {
    async fn before_stage(&self, _stage: StageName, _run: &RunContext) -> Result<()> {
        Ok(())
    }
}

/// Runs the optional entry-point script, then logs the feature store config
/// so every stage's logs record the configuration it ran with.
#[derive(Debug, Clone)]
pub struct EntryPointWarmup {
    script: Option<PathBuf>,
    config_file: PathBuf,
}

impl EntryPointWarmup {
    pub fn new(script: Option<PathBuf>, config_file: PathBuf) -> Self {
        Self { script, config_file }
    }

    async fn run_script(&self, stage: StageName) -> Result<()> {
        let Some(script) = &self.script else {
            return Ok(());
        };
        let output = Command::new("/bin/bash")
            .arg("-c")
            .arg(script.as_os_str())
            .output()
            .await
            .with_context(|| format!("failed to spawn entry point {}", script.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            info!(%stage, stdout = %stdout.trim_end(), "entry point output");
        }
        if !stderr.trim().is_empty() {
            error!(%stage, stderr = %stderr.trim_end(), "entry point error output");
        }
        if !output.status.success() {
            warn!(%stage, status = %output.status, "entry point exited unsuccessfully");
        }
        Ok(())
    }
}

#[async_trait]
impl StageWarmup for EntryPointWarmup {
    async fn before_stage(&self, stage: StageName, run: &RunContext) -> Result<()> {
        self.run_script(stage).await?;
        let contents = tokio::fs::read_to_string(&self.config_file)
            .await
            .with_context(|| format!("failed to read {}", self.config_file.display()))?;
        info!(%stage, run_id = %run.run_id, config = %contents, "feature store configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[tokio::test]
    async fn missing_config_file_fails_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let warmup = EntryPointWarmup::new(None, dir.path().join("feature_store.yaml"));
        let result = warmup
            .before_stage(StageName::LoadData, &RunContext::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failing_script_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("feature_store.yaml");
        std::fs::write(&config, "provider: local\n").unwrap();
        let script = dir.path().join("entry_point.sh");
        std::fs::write(&script, "#!/bin/bash\necho starting\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let warmup = EntryPointWarmup::new(Some(script), config);
        warmup
            .before_stage(StageName::Train, &RunContext::new())
            .await
            .unwrap();
    }
}
