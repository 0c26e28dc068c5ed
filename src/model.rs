//! Two-tower encoders, their serialized parameter form, and training.

pub mod preprocess;
pub mod tower;
pub mod train;

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::FrameError;
use crate::registry::{FeatureViewName, ITEM_ID, USER_ID};

pub use tower::{LinearTower, LinearTowerFactory};
pub use train::{SgdTwoTowerTrainer, TrainReport, TrainerConfig, TrainingData, TwoTowerTrainer};

/// Framework tag written next to serialized encoders.
pub const FRAMEWORK: &str = "ndarray";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("tensor `{tensor}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("state is for architecture `{actual}`, expected `{expected}`")]
    ArchitectureMismatch { expected: String, actual: String },
    #[error("state is for the {actual} tower, expected the {expected} tower")]
    KindMismatch { expected: TowerKind, actual: TowerKind },
    #[error("state is missing tensor `{0}`")]
    MissingTensor(String),
    #[error("encoder input has {actual} features, expected {expected}")]
    InputWidth { expected: usize, actual: usize },
    #[error("item and user embeddings differ in width: {item} vs {user}")]
    TowerWidth { item: usize, user: usize },
    #[error("row {row} has no `{column}` id")]
    MissingId { column: &'static str, row: usize },
    #[error("feature `{column}` has type {dtype}, which cannot be encoded")]
    UnsupportedFeature { column: String, dtype: String },
    #[error("training loss became non-finite in epoch {epoch}")]
    NonFiniteLoss { epoch: usize },
    #[error("no positive interaction refers to a known user and item")]
    EmptyInteractions,
    #[error("backward pass requires a preceding train-mode forward pass")]
    NoForwardCache,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("encoder state is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TowerKind {
    Item,
    User,
}

impl TowerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TowerKind::Item => "item",
            TowerKind::User => "user",
        }
    }

    #[must_use]
    pub fn id_column(self) -> &'static str {
        match self {
            TowerKind::Item => ITEM_ID,
            TowerKind::User => USER_ID,
        }
    }

    /// View whose features feed this tower.
    #[must_use]
    pub fn feature_view(self) -> FeatureViewName {
        match self {
            TowerKind::Item => FeatureViewName::ItemFeatures,
            TowerKind::User => FeatureViewName::UserFeatures,
        }
    }
}

impl std::fmt::Display for TowerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMode {
    /// Stochastic regularization active; forward passes are cached for `backward`.
    Train,
    /// Deterministic inference.
    Eval,
}

/// Preprocessed rows fed to a tower.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderInput {
    pub ids: Vec<i64>,
    pub features: Array2<f32>,
}

impl EncoderInput {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Gathers the given rows.
    #[must_use]
    pub fn select(&self, rows: &[usize]) -> EncoderInput {
        EncoderInput {
            ids: rows.iter().map(|&row| self.ids[row]).collect(),
            features: self.features.select(Axis(0), rows),
        }
    }
}

/// Serializable parameters of one encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderState {
    pub architecture: String,
    pub kind: TowerKind,
    pub input_dim: usize,
    pub embedding_dim: usize,
    pub tensors: BTreeMap<String, ArrayD<f32>>,
}

impl EncoderState {
    /// Borrows a tensor, checking its shape.
    ///
    /// # Errors
    /// Fails when the tensor is absent or shaped differently.
    pub fn tensor(&self, name: &str, shape: &[usize]) -> Result<&ArrayD<f32>, ModelError> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))?;
        if tensor.shape() != shape {
            return Err(ModelError::ShapeMismatch {
                tensor: name.to_string(),
                expected: shape.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }
}

/// # Errors
/// Fails only if serialization fails.
pub fn save_state(state: &EncoderState) -> Result<Vec<u8>, ModelError> {
    Ok(serde_json::to_vec(state)?)
}

/// # Errors
/// Fails when `bytes` is not a serialized [`EncoderState`].
pub fn load_state(bytes: &[u8]) -> Result<EncoderState, ModelError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A tower mapping preprocessed rows to embeddings.
pub trait TowerEncoder: Send {
    fn kind(&self) -> TowerKind;

    fn input_dim(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    fn mode(&self) -> EncoderMode;

    fn set_mode(&mut self, mode: EncoderMode);

    /// Returns one embedding row per input row.
    ///
    /// # Errors
    /// Fails when the input width does not match the encoder.
    fn forward(&mut self, input: &EncoderInput) -> Result<Array2<f32>, ModelError>;

    /// Applies one gradient step given the loss gradient with respect to the
    /// output of the latest train-mode forward pass.
    ///
    /// # Errors
    /// Fails without a cached forward pass or on a gradient shape mismatch.
    fn backward(&mut self, grad_output: &Array2<f32>, learning_rate: f32) -> Result<(), ModelError>;

    fn state_dict(&self) -> EncoderState;

    /// Replaces all parameters.
    ///
    /// # Errors
    /// Fails when the state was produced by a differently shaped encoder.
    fn load_state_dict(&mut self, state: EncoderState) -> Result<(), ModelError>;
}

/// Builds freshly initialized encoders.
pub trait TowerFactory: Send + Sync {
    fn build(&self, kind: TowerKind, embedding_dim: usize) -> Box<dyn TowerEncoder>;
}
