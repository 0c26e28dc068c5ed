//! Columnar in-memory table passed between pipeline stages.
//!
//! A [`Frame`] is an ordered set of equally long, uniquely named, typed
//! columns. It is the in-memory form of every tabular artifact (feature
//! tables, embedding tables, recommendation tables) and the payload of
//! feature-store pushes and queries.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical event-time column used for point-in-time joins.
pub const EVENT_TIMESTAMP: &str = "event_timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int64,
    Float64,
    Utf8,
    Timestamp,
    Float32List,
    Int64List,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Utf8 => "string",
            DataType::Timestamp => "timestamp",
            DataType::Float32List => "float32_list",
            DataType::Int64List => "int64_list",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Timestamp(DateTime<Utc>),
    Float32List(Vec<f32>),
    Int64List(Vec<i64>),
}

impl Value {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::Utf8(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Float32List(_) => "float32_list",
            Value::Int64List(_) => "int64_list",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("column `{0}` is missing")]
    MissingColumn(String),
    #[error("column `{0}` appears more than once")]
    DuplicateColumn(String),
    #[error("column `{column}` has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("column `{column}` has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
    #[error("cannot store a {actual} value in a {expected} column")]
    InvalidValue {
        expected: DataType,
        actual: &'static str,
    },
}

/// Typed column storage. Every variant stores nullable cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
    Float32List(Vec<Option<Vec<f32>>>),
    Int64List(Vec<Option<Vec<i64>>>),
}

impl ColumnData {
    #[must_use]
    pub fn nulls(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Int64 => ColumnData::Int64(vec![None; len]),
            DataType::Float64 => ColumnData::Float64(vec![None; len]),
            DataType::Utf8 => ColumnData::Utf8(vec![None; len]),
            DataType::Timestamp => ColumnData::Timestamp(vec![None; len]),
            DataType::Float32List => ColumnData::Float32List(vec![None; len]),
            DataType::Int64List => ColumnData::Int64List(vec![None; len]),
        }
    }

    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnData::Int64(_) => DataType::Int64,
            ColumnData::Float64(_) => DataType::Float64,
            ColumnData::Utf8(_) => DataType::Utf8,
            ColumnData::Timestamp(_) => DataType::Timestamp,
            ColumnData::Float32List(_) => DataType::Float32List,
            ColumnData::Int64List(_) => DataType::Int64List,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
            ColumnData::Float32List(v) => v.len(),
            ColumnData::Int64List(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        match self {
            ColumnData::Int64(v) => v.iter().filter(|c| c.is_none()).count(),
            ColumnData::Float64(v) => v.iter().filter(|c| c.is_none()).count(),
            ColumnData::Utf8(v) => v.iter().filter(|c| c.is_none()).count(),
            ColumnData::Timestamp(v) => v.iter().filter(|c| c.is_none()).count(),
            ColumnData::Float32List(v) => v.iter().filter(|c| c.is_none()).count(),
            ColumnData::Int64List(v) => v.iter().filter(|c| c.is_none()).count(),
        }
    }

    /// Returns the cell at `index`, or [`Value::Null`] when out of range.
    #[must_use]
    pub fn get(&self, index: usize) -> Value {
        match self {
            ColumnData::Int64(v) => v.get(index).copied().flatten().map_or(Value::Null, Value::Int64),
            ColumnData::Float64(v) => v
                .get(index)
                .copied()
                .flatten()
                .map_or(Value::Null, Value::Float64),
            ColumnData::Utf8(v) => v
                .get(index)
                .cloned()
                .flatten()
                .map_or(Value::Null, Value::Utf8),
            ColumnData::Timestamp(v) => v
                .get(index)
                .copied()
                .flatten()
                .map_or(Value::Null, Value::Timestamp),
            ColumnData::Float32List(v) => v
                .get(index)
                .cloned()
                .flatten()
                .map_or(Value::Null, Value::Float32List),
            ColumnData::Int64List(v) => v
                .get(index)
                .cloned()
                .flatten()
                .map_or(Value::Null, Value::Int64List),
        }
    }

    /// Appends one cell. Integers are accepted by float columns.
    ///
    /// # Errors
    /// Returns [`FrameError::InvalidValue`] when the value does not fit the column type.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, value: Value) -> Result<(), FrameError> {
        let expected = self.data_type();
        match (self, value) {
            (ColumnData::Int64(v), Value::Null) => v.push(None),
            (ColumnData::Float64(v), Value::Null) => v.push(None),
            (ColumnData::Utf8(v), Value::Null) => v.push(None),
            (ColumnData::Timestamp(v), Value::Null) => v.push(None),
            (ColumnData::Float32List(v), Value::Null) => v.push(None),
            (ColumnData::Int64List(v), Value::Null) => v.push(None),
            (ColumnData::Int64(v), Value::Int64(x)) => v.push(Some(x)),
            (ColumnData::Float64(v), Value::Float64(x)) => v.push(Some(x)),
            (ColumnData::Float64(v), Value::Int64(x)) => v.push(Some(x as f64)),
            (ColumnData::Utf8(v), Value::Utf8(x)) => v.push(Some(x)),
            (ColumnData::Timestamp(v), Value::Timestamp(x)) => v.push(Some(x)),
            (ColumnData::Float32List(v), Value::Float32List(x)) => v.push(Some(x)),
            (ColumnData::Int64List(v), Value::Int64List(x)) => v.push(Some(x)),
            (_, other) => {
                return Err(FrameError::InvalidValue {
                    expected,
                    actual: other.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Gathers rows by index; `None` produces a null cell.
    #[must_use]
    pub fn take(&self, indices: &[Option<usize>]) -> Self {
        fn gather<T: Clone>(values: &[Option<T>], indices: &[Option<usize>]) -> Vec<Option<T>> {
            indices
                .iter()
                .map(|idx| idx.and_then(|i| values.get(i).cloned().flatten()))
                .collect()
        }

        match self {
            ColumnData::Int64(v) => ColumnData::Int64(gather(v, indices)),
            ColumnData::Float64(v) => ColumnData::Float64(gather(v, indices)),
            ColumnData::Utf8(v) => ColumnData::Utf8(gather(v, indices)),
            ColumnData::Timestamp(v) => ColumnData::Timestamp(gather(v, indices)),
            ColumnData::Float32List(v) => ColumnData::Float32List(gather(v, indices)),
            ColumnData::Int64List(v) => ColumnData::Int64List(gather(v, indices)),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn promote_to_float(self) -> Self {
        match self {
            ColumnData::Int64(v) => {
                ColumnData::Float64(v.into_iter().map(|x| x.map(|x| x as f64)).collect())
            }
            other => other,
        }
    }

    /// Appends `other` below `self`, promoting `int64` to `float64` when the two differ.
    fn append(self, other: ColumnData, column: &str) -> Result<Self, FrameError> {
        let (left, right) = match (self.data_type(), other.data_type()) {
            (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
                (self.promote_to_float(), other.promote_to_float())
            }
            _ => (self, other),
        };

        match (left, right) {
            (ColumnData::Int64(mut a), ColumnData::Int64(b)) => {
                a.extend(b);
                Ok(ColumnData::Int64(a))
            }
            (ColumnData::Float64(mut a), ColumnData::Float64(b)) => {
                a.extend(b);
                Ok(ColumnData::Float64(a))
            }
            (ColumnData::Utf8(mut a), ColumnData::Utf8(b)) => {
                a.extend(b);
                Ok(ColumnData::Utf8(a))
            }
            (ColumnData::Timestamp(mut a), ColumnData::Timestamp(b)) => {
                a.extend(b);
                Ok(ColumnData::Timestamp(a))
            }
            (ColumnData::Float32List(mut a), ColumnData::Float32List(b)) => {
                a.extend(b);
                Ok(ColumnData::Float32List(a))
            }
            (ColumnData::Int64List(mut a), ColumnData::Int64List(b)) => {
                a.extend(b);
                Ok(ColumnData::Int64List(a))
            }
            (a, b) => Err(FrameError::TypeMismatch {
                column: column.to_string(),
                expected: a.data_type(),
                actual: b.data_type(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameRepr {
    columns: Vec<Column>,
}

/// Ordered collection of equally long, uniquely named columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "FrameRepr", into = "FrameRepr")]
pub struct Frame {
    columns: Vec<Column>,
}

impl TryFrom<FrameRepr> for Frame {
    type Error = FrameError;

    fn try_from(repr: FrameRepr) -> Result<Self, Self::Error> {
        Frame::new(repr.columns)
    }
}

impl From<Frame> for FrameRepr {
    fn from(frame: Frame) -> Self {
        Self {
            columns: frame.columns,
        }
    }
}

macro_rules! typed_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        /// Borrows a column, checking its type.
        ///
        /// # Errors
        /// Fails when the column is missing or has a different type.
        pub fn $name(&self, column: &str) -> Result<&[Option<$ty>], FrameError> {
            let col = self.require_column(column)?;
            match &col.data {
                ColumnData::$variant(values) => Ok(values),
                other => Err(FrameError::TypeMismatch {
                    column: column.to_string(),
                    expected: DataType::$variant,
                    actual: other.data_type(),
                }),
            }
        }
    };
}

impl Frame {
    /// Builds a frame, validating column lengths and name uniqueness.
    ///
    /// # Errors
    /// Returns [`FrameError`] on duplicate names or ragged columns.
    pub fn new(columns: Vec<Column>) -> Result<Self, FrameError> {
        let mut seen = HashSet::new();
        let expected = columns.first().map_or(0, |c| c.data.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(FrameError::DuplicateColumn(column.name.clone()));
            }
            if column.data.len() != expected {
                return Err(FrameError::LengthMismatch {
                    column: column.name.clone(),
                    expected,
                    actual: column.data.len(),
                });
            }
        }
        Ok(Self { columns })
    }

    /// Builds an empty frame with the given schema.
    #[must_use]
    pub fn with_schema(schema: &[(&str, DataType)]) -> Self {
        Self {
            columns: schema
                .iter()
                .map(|(name, dtype)| Column::new(*name, ColumnData::nulls(*dtype, 0)))
                .collect(),
        }
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn schema(&self) -> Vec<(String, DataType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type()))
            .collect()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// # Errors
    /// Returns [`FrameError::MissingColumn`] when no column has this name.
    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.column(name)
            .ok_or_else(|| FrameError::MissingColumn(name.to_string()))
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    typed_accessor!(int64_column, Int64, i64);
    typed_accessor!(float64_column, Float64, f64);
    typed_accessor!(utf8_column, Utf8, String);
    typed_accessor!(timestamp_column, Timestamp, DateTime<Utc>);
    typed_accessor!(float32_list_column, Float32List, Vec<f32>);
    typed_accessor!(int64_list_column, Int64List, Vec<i64>);

    /// Adds a column, or replaces the column with the same name.
    ///
    /// # Errors
    /// Fails when the new column length differs from the frame's row count.
    pub fn with_column(mut self, name: impl Into<String>, data: ColumnData) -> Result<Self, FrameError> {
        let name = name.into();
        if !self.columns.is_empty() && data.len() != self.num_rows() {
            return Err(FrameError::LengthMismatch {
                column: name,
                expected: self.num_rows(),
                actual: data.len(),
            });
        }
        if let Some(existing) = self.columns.iter_mut().find(|c| c.name == name) {
            existing.data = data;
        } else {
            self.columns.push(Column::new(name, data));
        }
        Ok(self)
    }

    /// # Errors
    /// Fails when `from` is missing or `to` is already taken.
    pub fn rename(mut self, from: &str, to: &str) -> Result<Self, FrameError> {
        if from == to {
            self.require_column(from)?;
            return Ok(self);
        }
        if self.has_column(to) {
            return Err(FrameError::DuplicateColumn(to.to_string()));
        }
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.name == from)
            .ok_or_else(|| FrameError::MissingColumn(from.to_string()))?;
        column.name = to.to_string();
        Ok(self)
    }

    /// Projects the named columns in the given order.
    ///
    /// # Errors
    /// Fails when a requested column is missing.
    pub fn select(&self, names: &[&str]) -> Result<Frame, FrameError> {
        let columns = names
            .iter()
            .map(|name| self.require_column(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Frame::new(columns)
    }

    /// Gathers rows by index (`None` yields a null row).
    #[must_use]
    pub fn take(&self, indices: &[Option<usize>]) -> Frame {
        Frame {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data.take(indices)))
                .collect(),
        }
    }

    /// Vertically stacks `other` below `self`.
    ///
    /// Columns are unioned by name: columns only present on one side are
    /// filled with nulls on the other. Row order is preserved and no rows
    /// are removed.
    ///
    /// # Errors
    /// Fails when a shared column has incompatible types.
    pub fn concat(self, other: Frame) -> Result<Frame, FrameError> {
        if other.columns.is_empty() {
            return Ok(self);
        }
        if self.columns.is_empty() {
            return Ok(other);
        }

        let left_rows = self.num_rows();
        let right_rows = other.num_rows();
        let mut right: Vec<Option<Column>> = other.columns.into_iter().map(Some).collect();
        let mut merged = Vec::with_capacity(self.columns.len() + right.len());

        for column in self.columns {
            let counterpart = right
                .iter_mut()
                .find(|c| c.as_ref().is_some_and(|c| c.name == column.name))
                .and_then(Option::take);
            let lower = counterpart.map_or_else(
                || ColumnData::nulls(column.data_type(), right_rows),
                |c| c.data,
            );
            let data = column.data.append(lower, &column.name)?;
            merged.push(Column::new(column.name, data));
        }

        for column in right.into_iter().flatten() {
            let upper = ColumnData::nulls(column.data_type(), left_rows);
            let data = upper.append(column.data, &column.name)?;
            merged.push(Column::new(column.name, data));
        }

        Frame::new(merged)
    }

    /// Returns the value at (`column`, `row`).
    #[must_use]
    pub fn value(&self, column: &str, row: usize) -> Value {
        self.column(column).map_or(Value::Null, |c| c.data.get(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Frame {
        Frame::new(vec![
            Column::new("user_id", ColumnData::Int64(vec![Some(1), Some(2)])),
            Column::new("rating", ColumnData::Float64(vec![Some(4.5), None])),
        ])
        .expect("valid frame")
    }

    #[test]
    fn new_rejects_ragged_columns() {
        let err = Frame::new(vec![
            Column::new("a", ColumnData::Int64(vec![Some(1)])),
            Column::new("b", ColumnData::Int64(vec![Some(1), Some(2)])),
        ])
        .expect_err("ragged");
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn new_rejects_duplicate_names() {
        let err = Frame::new(vec![
            Column::new("a", ColumnData::Int64(vec![])),
            Column::new("a", ColumnData::Int64(vec![])),
        ])
        .expect_err("duplicate");
        assert_eq!(err, FrameError::DuplicateColumn("a".into()));
    }

    #[test]
    fn concat_unions_columns_and_promotes_ints() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let lower = Frame::new(vec![
            Column::new("user_id", ColumnData::Int64(vec![Some(3)])),
            Column::new("rating", ColumnData::Int64(vec![Some(2)])),
            Column::new("timestamp", ColumnData::Timestamp(vec![Some(ts)])),
        ])
        .unwrap();

        let merged = sample().concat(lower).expect("concat");

        assert_eq!(merged.num_rows(), 3);
        assert_eq!(merged.column_names(), vec!["user_id", "rating", "timestamp"]);
        assert_eq!(
            merged.float64_column("rating").unwrap(),
            &[Some(4.5), None, Some(2.0)]
        );
        assert_eq!(
            merged.timestamp_column("timestamp").unwrap(),
            &[None, None, Some(ts)]
        );
    }

    #[test]
    fn concat_with_columnless_frame_is_identity() {
        let merged = sample().concat(Frame::default()).unwrap();
        assert_eq!(merged, sample());
    }

    #[test]
    fn concat_rejects_incompatible_types() {
        let lower = Frame::new(vec![Column::new(
            "user_id",
            ColumnData::Utf8(vec![Some("x".into())]),
        )])
        .unwrap();
        let err = sample().concat(lower).expect_err("type clash");
        assert!(matches!(err, FrameError::TypeMismatch { .. }));
    }

    #[test]
    fn rename_moves_column_name() {
        let renamed = sample().rename("rating", "score").unwrap();
        assert!(renamed.has_column("score"));
        assert!(!renamed.has_column("rating"));
        assert!(matches!(
            renamed.rename("missing", "x"),
            Err(FrameError::MissingColumn(_))
        ));
    }

    #[test]
    fn with_column_checks_length() {
        let err = sample()
            .with_column("extra", ColumnData::Int64(vec![Some(1)]))
            .expect_err("length");
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn take_gathers_and_fills_nulls() {
        let taken = sample().take(&[Some(1), None, Some(0)]);
        assert_eq!(
            taken.int64_column("user_id").unwrap(),
            &[Some(2), None, Some(1)]
        );
    }

    #[test]
    fn json_round_trip_keeps_columns() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"dtype\":\"int64\""));
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn push_rejects_wrong_type() {
        let mut data = ColumnData::Int64(vec![]);
        assert!(data.push(Value::Utf8("x".into())).is_err());
        data.push(Value::Int64(4)).unwrap();
        data.push(Value::Null).unwrap();
        assert_eq!(data, ColumnData::Int64(vec![Some(4), None]));
    }
}
