//! Frame <-> Arrow `RecordBatch` <-> parquet conversion.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow_array::types::{Float32Type, Int64Type};
use arrow_array::{
    Array, ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array, LargeStringArray,
    ListArray, RecordBatch, RecordBatchOptions, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray,
};
use arrow_schema::{DataType as ArrowType, Field, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::ArtifactError;
use crate::frame::{Column, ColumnData, DataType, Frame};

/// Writes a frame as a single-row-group parquet file.
///
/// # Errors
/// Fails on I/O or encoding errors.
pub fn write_parquet(path: &Path, frame: &Frame) -> Result<(), ArtifactError> {
    let batch = frame_to_record_batch(frame)?;
    let file = File::create(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Reads a parquet file into a frame. The schema is taken from the file
/// footer, so an empty file still yields typed (zero-row) columns.
///
/// # Errors
/// Fails on I/O, decoding, or unsupported column types.
pub fn read_parquet(path: &Path) -> Result<Frame, ArtifactError> {
    let file = File::open(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = Arc::clone(builder.schema());
    let reader = builder.build()?;

    let empty_schema = schema
        .fields()
        .iter()
        .map(|field| Ok((field.name().as_str(), frame_type(field.name(), field.data_type())?)))
        .collect::<Result<Vec<_>, ArtifactError>>()?;
    let mut frame = Frame::with_schema(&empty_schema);

    for batch in reader {
        let batch = batch?;
        frame = frame.concat(record_batch_to_frame(&batch)?)?;
    }
    Ok(frame)
}

/// # Errors
/// Fails when the frame has no columns.
pub fn frame_to_record_batch(frame: &Frame) -> Result<RecordBatch, ArtifactError> {
    if frame.num_columns() == 0 {
        return Err(ArtifactError::EmptySchema);
    }

    let mut fields = Vec::with_capacity(frame.num_columns());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(frame.num_columns());

    for column in frame.columns() {
        let array: ArrayRef = match &column.data {
            ColumnData::Int64(values) => Arc::new(Int64Array::from(values.clone())),
            ColumnData::Float64(values) => Arc::new(Float64Array::from(values.clone())),
            ColumnData::Utf8(values) => Arc::new(StringArray::from(values.clone())),
            ColumnData::Timestamp(values) => Arc::new(
                TimestampMicrosecondArray::from(
                    values
                        .iter()
                        .map(|ts| ts.map(|ts| ts.timestamp_micros()))
                        .collect::<Vec<_>>(),
                )
                .with_timezone("UTC"),
            ),
            ColumnData::Float32List(values) => {
                Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(
                    values
                        .iter()
                        .map(|row| row.as_ref().map(|xs| xs.iter().copied().map(Some).collect::<Vec<_>>())),
                ))
            }
            ColumnData::Int64List(values) => {
                Arc::new(ListArray::from_iter_primitive::<Int64Type, _, _>(
                    values
                        .iter()
                        .map(|row| row.as_ref().map(|xs| xs.iter().copied().map(Some).collect::<Vec<_>>())),
                ))
            }
        };
        fields.push(Field::new(
            column.name.clone(),
            array.data_type().clone(),
            true,
        ));
        arrays.push(array);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(frame.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

/// # Errors
/// Fails on column types that have no frame counterpart.
pub fn record_batch_to_frame(batch: &RecordBatch) -> Result<Frame, ArtifactError> {
    let schema = batch.schema();
    let mut columns = Vec::with_capacity(batch.num_columns());

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let name = field.name();
        let data = match field.data_type() {
            ArrowType::Int64 => ColumnData::Int64(downcast::<Int64Array>(array, name)?.iter().collect()),
            ArrowType::Int32 => ColumnData::Int64(
                downcast::<Int32Array>(array, name)?
                    .iter()
                    .map(|v| v.map(i64::from))
                    .collect(),
            ),
            ArrowType::Float64 => {
                ColumnData::Float64(downcast::<Float64Array>(array, name)?.iter().collect())
            }
            ArrowType::Float32 => ColumnData::Float64(
                downcast::<Float32Array>(array, name)?
                    .iter()
                    .map(|v| v.map(f64::from))
                    .collect(),
            ),
            ArrowType::Utf8 => ColumnData::Utf8(
                downcast::<StringArray>(array, name)?
                    .iter()
                    .map(|v| v.map(str::to_string))
                    .collect(),
            ),
            ArrowType::LargeUtf8 => ColumnData::Utf8(
                downcast::<LargeStringArray>(array, name)?
                    .iter()
                    .map(|v| v.map(str::to_string))
                    .collect(),
            ),
            ArrowType::Timestamp(unit, _) => ColumnData::Timestamp(timestamps(array, *unit, name)?),
            ArrowType::List(child) => {
                let list = downcast::<ListArray>(array, name)?;
                match child.data_type() {
                    ArrowType::Float32 | ArrowType::Float64 => {
                        ColumnData::Float32List(float_lists(list, name)?)
                    }
                    ArrowType::Int64 | ArrowType::Int32 => ColumnData::Int64List(int_lists(list, name)?),
                    other => {
                        return Err(ArtifactError::UnsupportedType(format!(
                            "column `{name}` is a list of {other}"
                        )));
                    }
                }
            }
            other => {
                return Err(ArtifactError::UnsupportedType(format!(
                    "column `{name}` has arrow type {other}"
                )));
            }
        };
        columns.push(Column::new(name.clone(), data));
    }

    Ok(Frame::new(columns)?)
}

fn frame_type(name: &str, arrow_type: &ArrowType) -> Result<DataType, ArtifactError> {
    Ok(match arrow_type {
        ArrowType::Int64 | ArrowType::Int32 => DataType::Int64,
        ArrowType::Float64 | ArrowType::Float32 => DataType::Float64,
        ArrowType::Utf8 | ArrowType::LargeUtf8 => DataType::Utf8,
        ArrowType::Timestamp(_, _) => DataType::Timestamp,
        ArrowType::List(child) => match child.data_type() {
            ArrowType::Float32 | ArrowType::Float64 => DataType::Float32List,
            ArrowType::Int64 | ArrowType::Int32 => DataType::Int64List,
            other => {
                return Err(ArtifactError::UnsupportedType(format!(
                    "column `{name}` is a list of {other}"
                )));
            }
        },
        other => {
            return Err(ArtifactError::UnsupportedType(format!(
                "column `{name}` has arrow type {other}"
            )));
        }
    })
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> Result<&'a T, ArtifactError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ArtifactError::UnsupportedType(format!("column `{column}` could not be decoded")))
}

fn timestamps(
    array: &ArrayRef,
    unit: TimeUnit,
    column: &str,
) -> Result<Vec<Option<DateTime<Utc>>>, ArtifactError> {
    Ok(match unit {
        TimeUnit::Second => downcast::<TimestampSecondArray>(array, column)?
            .iter()
            .map(|v| v.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)))
            .collect(),
        TimeUnit::Millisecond => downcast::<TimestampMillisecondArray>(array, column)?
            .iter()
            .map(|v| v.and_then(DateTime::<Utc>::from_timestamp_millis))
            .collect(),
        TimeUnit::Microsecond => downcast::<TimestampMicrosecondArray>(array, column)?
            .iter()
            .map(|v| v.and_then(DateTime::<Utc>::from_timestamp_micros))
            .collect(),
        TimeUnit::Nanosecond => downcast::<TimestampNanosecondArray>(array, column)?
            .iter()
            .map(|v| v.map(DateTime::<Utc>::from_timestamp_nanos))
            .collect(),
    })
}

// Null elements inside a list are read back as zero.
#[allow(clippy::cast_possible_truncation)]
fn float_lists(list: &ListArray, column: &str) -> Result<Vec<Option<Vec<f32>>>, ArtifactError> {
    let mut out = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        if list.is_null(i) {
            out.push(None);
            continue;
        }
        let values = list.value(i);
        let row = if let Some(f32s) = values.as_any().downcast_ref::<Float32Array>() {
            f32s.iter().map(|x| x.unwrap_or(0.0)).collect()
        } else {
            downcast::<Float64Array>(&values, column)?
                .iter()
                .map(|x| x.unwrap_or(0.0) as f32)
                .collect()
        };
        out.push(Some(row));
    }
    Ok(out)
}

fn int_lists(list: &ListArray, column: &str) -> Result<Vec<Option<Vec<i64>>>, ArtifactError> {
    let mut out = Vec::with_capacity(list.len());
    for i in 0..list.len() {
        if list.is_null(i) {
            out.push(None);
            continue;
        }
        let values = list.value(i);
        let row = if let Some(i64s) = values.as_any().downcast_ref::<Int64Array>() {
            i64s.iter().map(|x| x.unwrap_or(0)).collect()
        } else {
            downcast::<Int32Array>(&values, column)?
                .iter()
                .map(|x| i64::from(x.unwrap_or(0)))
                .collect()
        };
        out.push(Some(row));
    }
    Ok(out)
}
