//! Typed artifacts exchanged between pipeline stages.
//!
//! Every stage writes its outputs under `<root>/<run_id>/<stage>/`. Outputs
//! are first written into a private staging directory and only become
//! visible when [`StageWriter::commit`] renames it into place, so a failed
//! stage publishes nothing and a re-run replaces the previous outputs
//! wholesale.

pub mod columnar;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use arrow_schema::ArrowError;
use chrono::{DateTime, Utc};
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::{Frame, FrameError};
use crate::pipeline::StageName;

pub const FORMAT_KEY: &str = "format";
pub const PARQUET_FORMAT: &str = "parquet";
pub const FRAMEWORK_KEY: &str = "framework";
pub const ROWS_KEY: &str = "rows";

const METADATA_SUFFIX: &str = ".meta.json";
const DATASET_EXTENSION: &str = "parquet";
const MODEL_EXTENSION: &str = "model";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("arrow conversion failed: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet encoding failed: {0}")]
    Parquet(#[from] ParquetError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("artifact metadata is not valid json: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("unsupported column type: {0}")]
    UnsupportedType(String),
    #[error("cannot write a dataset without columns")]
    EmptySchema,
    #[error("artifact `{name}` is tagged {key}={actual:?}, expected {expected:?}")]
    TagMismatch {
        name: String,
        key: &'static str,
        expected: String,
        actual: Option<String>,
    },
    #[error("artifact `{name}` not found under {dir}")]
    Missing { name: String, dir: PathBuf },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Dataset,
    Model,
}

/// Sidecar metadata written next to every artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ArtifactMetadata {
    fn new(name: &str, kind: ArtifactKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            created_at: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn expect_tag(&self, key: &'static str, expected: &str) -> Result<(), ArtifactError> {
        match self.tag(key) {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(ArtifactError::TagMismatch {
                name: self.name.clone(),
                key,
                expected: expected.to_string(),
                actual: actual.map(ToString::to_string),
            }),
        }
    }
}

/// A tabular artifact stored as parquet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetArtifact {
    path: PathBuf,
    metadata: ArtifactMetadata,
}

impl DatasetArtifact {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    /// Loads the table after checking the `format=parquet` tag.
    ///
    /// # Errors
    /// Fails on a tag mismatch or a decoding error.
    pub fn read_frame(&self) -> Result<Frame, ArtifactError> {
        self.metadata.expect_tag(FORMAT_KEY, PARQUET_FORMAT)?;
        columnar::read_parquet(&self.path)
    }
}

/// An opaque serialized model plus its framework tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    path: PathBuf,
    metadata: ArtifactMetadata,
}

impl ModelArtifact {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn framework(&self) -> Option<&str> {
        self.metadata.tag(FRAMEWORK_KEY)
    }

    /// Reads the serialized bytes, refusing artifacts produced by another framework.
    ///
    /// # Errors
    /// Fails on a framework mismatch or an I/O error.
    pub fn read_bytes(&self, expected_framework: &str) -> Result<Vec<u8>, ArtifactError> {
        self.metadata.expect_tag(FRAMEWORK_KEY, expected_framework)?;
        fs::read(&self.path).map_err(io_error(&self.path))
    }
}

/// Filesystem layout for all runs.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn stage_dir(&self, run_id: Uuid, stage: StageName) -> PathBuf {
        self.root.join(run_id.to_string()).join(stage.as_str())
    }

    /// Opens a staging area for the outputs of one stage.
    ///
    /// # Errors
    /// Fails when the staging directory cannot be created.
    pub fn begin_stage(&self, run_id: Uuid, stage: StageName) -> Result<StageWriter, ArtifactError> {
        let run_dir = self.root.join(run_id.to_string());
        let staging = run_dir.join(format!(".staging-{}-{}", stage.as_str(), Uuid::new_v4()));
        fs::create_dir_all(&staging).map_err(io_error(&staging))?;
        Ok(StageWriter {
            staging,
            target: self.stage_dir(run_id, stage),
            committed: false,
        })
    }

    /// Resolves a committed dataset artifact.
    ///
    /// # Errors
    /// Fails when the artifact or its metadata is missing.
    pub fn dataset(
        &self,
        run_id: Uuid,
        stage: StageName,
        name: &str,
    ) -> Result<DatasetArtifact, ArtifactError> {
        let dir = self.stage_dir(run_id, stage);
        let metadata = read_metadata(&dir, name)?;
        Ok(DatasetArtifact {
            path: dir.join(format!("{name}.{DATASET_EXTENSION}")),
            metadata,
        })
    }

    /// Resolves a committed model artifact.
    ///
    /// # Errors
    /// Fails when the artifact or its metadata is missing.
    pub fn model(
        &self,
        run_id: Uuid,
        stage: StageName,
        name: &str,
    ) -> Result<ModelArtifact, ArtifactError> {
        let dir = self.stage_dir(run_id, stage);
        let metadata = read_metadata(&dir, name)?;
        Ok(ModelArtifact {
            path: dir.join(format!("{name}.{MODEL_EXTENSION}")),
            metadata,
        })
    }
}

fn read_metadata(dir: &Path, name: &str) -> Result<ArtifactMetadata, ArtifactError> {
    let path = dir.join(format!("{name}{METADATA_SUFFIX}"));
    if !path.exists() {
        return Err(ArtifactError::Missing {
            name: name.to_string(),
            dir: dir.to_path_buf(),
        });
    }
    let raw = fs::read(&path).map_err(io_error(&path))?;
    Ok(serde_json::from_slice(&raw)?)
}

fn write_metadata(dir: &Path, metadata: &ArtifactMetadata) -> Result<(), ArtifactError> {
    let path = dir.join(format!("{}{METADATA_SUFFIX}", metadata.name));
    let raw = serde_json::to_vec_pretty(metadata)?;
    fs::write(&path, raw).map_err(io_error(&path))
}

/// Collects the outputs of a single stage run.
///
/// Dropping an uncommitted writer removes its staging directory.
#[derive(Debug)]
pub struct StageWriter {
    staging: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StageWriter {
    /// Writes a frame as parquet, tagged `format=parquet`.
    ///
    /// # Errors
    /// Fails on encoding or I/O errors.
    pub fn write_dataset(&self, name: &str, frame: &Frame) -> Result<DatasetArtifact, ArtifactError> {
        let file_name = format!("{name}.{DATASET_EXTENSION}");
        columnar::write_parquet(&self.staging.join(&file_name), frame)?;

        let mut metadata = ArtifactMetadata::new(name, ArtifactKind::Dataset);
        metadata
            .tags
            .insert(FORMAT_KEY.to_string(), PARQUET_FORMAT.to_string());
        metadata
            .tags
            .insert(ROWS_KEY.to_string(), frame.num_rows().to_string());
        write_metadata(&self.staging, &metadata)?;

        Ok(DatasetArtifact {
            path: self.target.join(file_name),
            metadata,
        })
    }

    /// Writes serialized model bytes, tagged with their framework.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn write_model(
        &self,
        name: &str,
        bytes: &[u8],
        framework: &str,
        extra_tags: BTreeMap<String, String>,
    ) -> Result<ModelArtifact, ArtifactError> {
        let file_name = format!("{name}.{MODEL_EXTENSION}");
        let path = self.staging.join(&file_name);
        fs::write(&path, bytes).map_err(io_error(&path))?;

        let mut metadata = ArtifactMetadata::new(name, ArtifactKind::Model);
        metadata.tags = extra_tags;
        metadata
            .tags
            .insert(FRAMEWORK_KEY.to_string(), framework.to_string());
        write_metadata(&self.staging, &metadata)?;

        Ok(ModelArtifact {
            path: self.target.join(file_name),
            metadata,
        })
    }

    /// Publishes the staged outputs, replacing any previous outputs of the same stage.
    ///
    /// # Errors
    /// Fails when the previous outputs cannot be removed or the rename fails.
    pub fn commit(mut self) -> Result<PathBuf, ArtifactError> {
        if self.target.exists() {
            fs::remove_dir_all(&self.target).map_err(io_error(&self.target))?;
            debug!(target_dir = %self.target.display(), "replaced outputs of a previous attempt");
        }
        fs::rename(&self.staging, &self.target).map_err(io_error(&self.target))?;
        self.committed = true;
        Ok(self.target.clone())
    }
}

impl Drop for StageWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(error) = fs::remove_dir_all(&self.staging) {
            warn!(
                staging = %self.staging.display(),
                %error,
                "failed to clean up uncommitted stage outputs"
            );
        }
    }
}
