//! Feature encoding shared by training and inference.
//!
//! Numeric features map to `sign(x) * ln(1 + |x|)`, strings to a one-hot
//! vector over a fixed number of hash buckets, and nulls to zeros. The
//! column layout is fixed per tower so the same model reads the same
//! positions at training and inference time.

use ndarray::Array2;
use xxhash_rust::xxh3::xxh3_64;

use super::{EncoderInput, ModelError, TowerKind};
use crate::frame::{ColumnData, DataType, Frame};
use crate::registry::ColumnSpec;

pub const STRING_BUCKETS: usize = 16;

fn width(spec: &ColumnSpec) -> usize {
    match spec.dtype {
        DataType::Utf8 => STRING_BUCKETS,
        _ => 1,
    }
}

/// Number of input features of the given tower.
#[must_use]
pub fn input_dim(kind: TowerKind) -> usize {
    kind.feature_view().features().iter().map(width).sum()
}

#[allow(clippy::cast_possible_truncation)]
fn signed_log1p(x: f64) -> f32 {
    (x.signum() * x.abs().ln_1p()) as f32
}

#[allow(clippy::cast_possible_truncation)]
fn bucket(value: &str) -> usize {
    (xxh3_64(value.as_bytes()) % STRING_BUCKETS as u64) as usize
}

/// Encodes the rows of `frame` for `kind`'s tower.
///
/// # Errors
/// Fails when the id column or a feature column is missing, an id is null,
/// or a feature has a type that cannot be encoded.
#[allow(clippy::cast_precision_loss)]
pub fn data_preprocess(frame: &Frame, kind: TowerKind) -> Result<EncoderInput, ModelError> {
    let id_column = kind.id_column();
    let ids = frame
        .int64_column(id_column)?
        .iter()
        .enumerate()
        .map(|(row, id)| id.ok_or(ModelError::MissingId { column: id_column, row }))
        .collect::<Result<Vec<_>, _>>()?;

    let specs = kind.feature_view().features();
    let mut features = Array2::<f32>::zeros((ids.len(), input_dim(kind)));
    let mut offset = 0;
    for spec in specs {
        let column = frame.require_column(spec.name)?;
        match &column.data {
            ColumnData::Float64(values) => {
                for (row, value) in values.iter().enumerate() {
                    if let Some(x) = value {
                        features[[row, offset]] = signed_log1p(*x);
                    }
                }
            }
            ColumnData::Int64(values) => {
                for (row, value) in values.iter().enumerate() {
                    if let Some(x) = value {
                        features[[row, offset]] = signed_log1p(*x as f64);
                    }
                }
            }
            ColumnData::Utf8(values) if spec.dtype == DataType::Utf8 => {
                for (row, value) in values.iter().enumerate() {
                    if let Some(s) = value {
                        features[[row, offset + bucket(s)]] = 1.0;
                    }
                }
            }
            other => {
                return Err(ModelError::UnsupportedFeature {
                    column: spec.name.to_string(),
                    dtype: other.data_type().to_string(),
                });
            }
        }
        offset += width(spec);
    }

    Ok(EncoderInput { ids, features })
}
