//! Linear projection tower with a hashed id embedding.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xxhash_rust::xxh3::xxh3_64;

use super::preprocess::input_dim;
use super::{EncoderInput, EncoderMode, EncoderState, ModelError, TowerEncoder, TowerFactory, TowerKind};

pub const ARCHITECTURE: &str = "linear_tower_v1";
pub const ID_BUCKETS: usize = 1024;

const WEIGHT: &str = "projection.weight";
const BIAS: &str = "projection.bias";
const ID_EMBEDDING: &str = "id_embedding.weight";

#[allow(clippy::cast_possible_truncation)]
fn id_bucket(id: i64) -> usize {
    (xxh3_64(&id.to_le_bytes()) % ID_BUCKETS as u64) as usize
}

#[derive(Debug)]
struct ForwardCache {
    features: Array2<f32>,
    buckets: Vec<usize>,
    mask: Array2<f32>,
}

/// `embedding = dropout(W·x + b + E[hash(id)])`.
#[derive(Debug)]
pub struct LinearTower {
    kind: TowerKind,
    weight: Array2<f32>,
    bias: Array1<f32>,
    id_embedding: Array2<f32>,
    dropout: f32,
    mode: EncoderMode,
    rng: StdRng,
    cache: Option<ForwardCache>,
}

impl LinearTower {
    /// Creates a tower with Xavier-uniform projection weights.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(kind: TowerKind, input_dim: usize, embedding_dim: usize, dropout: f32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let limit = (6.0 / (input_dim + embedding_dim).max(1) as f32).sqrt();
        let weight = Array2::from_shape_simple_fn((embedding_dim, input_dim), || {
            rng.random_range(-limit..=limit)
        });
        let id_embedding = Array2::from_shape_simple_fn((ID_BUCKETS, embedding_dim), || {
            rng.random_range(-0.05..=0.05)
        });
        Self {
            kind,
            weight,
            bias: Array1::zeros(embedding_dim),
            id_embedding,
            dropout: dropout.clamp(0.0, 0.95),
            mode: EncoderMode::Train,
            rng,
            cache: None,
        }
    }

    fn dropout_mask(&mut self, rows: usize) -> Array2<f32> {
        let dim = self.embedding_dim();
        if self.dropout <= 0.0 {
            return Array2::ones((rows, dim));
        }
        let keep = 1.0 - self.dropout;
        let scale = 1.0 / keep;
        let rng = &mut self.rng;
        Array2::from_shape_simple_fn((rows, dim), || {
            if rng.random::<f32>() < keep { scale } else { 0.0 }
        })
    }
}

fn matrix(state: &EncoderState, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>, ModelError> {
    let shape = [rows, cols];
    state
        .tensor(name, &shape)?
        .clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| ModelError::ShapeMismatch {
            tensor: name.to_string(),
            expected: shape.to_vec(),
            actual: Vec::new(),
        })
}

fn vector(state: &EncoderState, name: &str, len: usize) -> Result<Array1<f32>, ModelError> {
    state
        .tensor(name, &[len])?
        .clone()
        .into_dimensionality::<Ix1>()
        .map_err(|_| ModelError::ShapeMismatch {
            tensor: name.to_string(),
            expected: vec![len],
            actual: Vec::new(),
        })
}

impl TowerEncoder for LinearTower {
    fn kind(&self) -> TowerKind {
        self.kind
    }

    fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    fn embedding_dim(&self) -> usize {
        self.weight.nrows()
    }

    fn mode(&self) -> EncoderMode {
        self.mode
    }

    fn set_mode(&mut self, mode: EncoderMode) {
        self.mode = mode;
        if mode == EncoderMode::Eval {
            self.cache = None;
        }
    }

    fn forward(&mut self, input: &EncoderInput) -> Result<Array2<f32>, ModelError> {
        if input.features.ncols() != self.input_dim() {
            return Err(ModelError::InputWidth {
                expected: self.input_dim(),
                actual: input.features.ncols(),
            });
        }

        let buckets: Vec<usize> = input.ids.iter().map(|&id| id_bucket(id)).collect();
        let mut output = input.features.dot(&self.weight.t());
        output += &self.bias;
        output += &self.id_embedding.select(Axis(0), &buckets);

        if self.mode == EncoderMode::Train {
            let mask = self.dropout_mask(input.len());
            output *= &mask;
            self.cache = Some(ForwardCache {
                features: input.features.clone(),
                buckets,
                mask,
            });
        }
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Array2<f32>, learning_rate: f32) -> Result<(), ModelError> {
        let cache = self.cache.take().ok_or(ModelError::NoForwardCache)?;
        if grad_output.dim() != cache.mask.dim() {
            return Err(ModelError::ShapeMismatch {
                tensor: "grad_output".to_string(),
                expected: cache.mask.shape().to_vec(),
                actual: grad_output.shape().to_vec(),
            });
        }

        let grad = grad_output * &cache.mask;
        let grad_weight = grad.t().dot(&cache.features);
        let grad_bias = grad.sum_axis(Axis(0));

        self.weight.scaled_add(-learning_rate, &grad_weight);
        self.bias.scaled_add(-learning_rate, &grad_bias);
        for (row, &bucket) in cache.buckets.iter().enumerate() {
            let mut embedding = self.id_embedding.row_mut(bucket);
            embedding.scaled_add(-learning_rate, &grad.row(row));
        }
        Ok(())
    }

    fn state_dict(&self) -> EncoderState {
        let mut tensors = BTreeMap::new();
        tensors.insert(WEIGHT.to_string(), self.weight.clone().into_dyn());
        tensors.insert(BIAS.to_string(), self.bias.clone().into_dyn());
        tensors.insert(ID_EMBEDDING.to_string(), self.id_embedding.clone().into_dyn());
        EncoderState {
            architecture: ARCHITECTURE.to_string(),
            kind: self.kind,
            input_dim: self.input_dim(),
            embedding_dim: self.embedding_dim(),
            tensors,
        }
    }

    fn load_state_dict(&mut self, state: EncoderState) -> Result<(), ModelError> {
        if state.architecture != ARCHITECTURE {
            return Err(ModelError::ArchitectureMismatch {
                expected: ARCHITECTURE.to_string(),
                actual: state.architecture,
            });
        }
        if state.kind != self.kind {
            return Err(ModelError::KindMismatch {
                expected: self.kind,
                actual: state.kind,
            });
        }
        let (dim, input) = (self.embedding_dim(), self.input_dim());
        let weight = matrix(&state, WEIGHT, dim, input)?;
        let bias = vector(&state, BIAS, dim)?;
        let id_embedding = matrix(&state, ID_EMBEDDING, ID_BUCKETS, dim)?;

        self.weight = weight;
        self.bias = bias;
        self.id_embedding = id_embedding;
        self.cache = None;
        Ok(())
    }
}

/// Builds [`LinearTower`]s sized for the registry's feature layout.
#[derive(Debug, Clone, Copy)]
pub struct LinearTowerFactory {
    pub dropout: f32,
    pub seed: u64,
}

impl Default for LinearTowerFactory {
    fn default() -> Self {
        Self {
            dropout: 0.1,
            seed: 42,
        }
    }
}

impl TowerFactory for LinearTowerFactory {
    fn build(&self, kind: TowerKind, embedding_dim: usize) -> Box<dyn TowerEncoder> {
        let seed = match kind {
            TowerKind::Item => self.seed,
            TowerKind::User => self.seed.wrapping_add(1),
        };
        Box::new(LinearTower::new(
            kind,
            input_dim(kind),
            embedding_dim,
            self.dropout,
            seed,
        ))
    }
}
