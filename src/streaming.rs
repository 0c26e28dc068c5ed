//! Streaming corrections: interaction rows collected by the streaming side
//! path into a relational store, merged into the batch training tables.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::frame::{Column, ColumnData, EVENT_TIMESTAMP, Frame};

/// Event-time column name used by the streaming tables.
pub const STREAM_TIMESTAMP: &str = "timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamingError {
    #[error("`{0}` is not a valid table name")]
    InvalidTableName(String),
    #[error("correction table `{table}` has neither `timestamp` nor `event_timestamp`")]
    MissingTimestamp { table: String },
    #[error("correction table `{table}` has {rows} rows without a timestamp")]
    NullTimestamp { table: String, rows: usize },
    #[error("column `{table}.{column}` has unsupported type `{type_name}`")]
    UnsupportedColumn {
        table: String,
        column: String,
        type_name: String,
    },
    #[error("correction table `{0}` has no visible columns")]
    NoColumns(String),
}

#[async_trait]
pub trait CorrectionSource: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Reads every row of `table`.
    async fn fetch_all(&self, table: &str) -> Result<Frame>;
}

/// Result of merging one correction table into a batch table.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub frame: Frame,
    pub table_present: bool,
    pub merged_rows: usize,
}

/// Appends the rows of correction table `table` to `batch`.
///
/// An absent table leaves `batch` untouched. Otherwise the table's
/// `timestamp` column is renamed to `event_timestamp` and all its rows are
/// appended; rows are never deduplicated.
///
/// # Errors
/// Fails when probing or reading the table fails, when the table has no
/// timestamp column, when any row lacks a timestamp, or when shared columns
/// have incompatible types.
pub async fn merge_corrections(
    source: &dyn CorrectionSource,
    table: &str,
    batch: Frame,
) -> Result<MergeOutcome> {
    let exists = source
        .table_exists(table)
        .await
        .with_context(|| format!("failed to probe correction table {table}"))?;
    if !exists {
        debug!(table, "correction table absent, skipping merge");
        return Ok(MergeOutcome {
            frame: batch,
            table_present: false,
            merged_rows: 0,
        });
    }

    let mut corrections = source
        .fetch_all(table)
        .await
        .with_context(|| format!("failed to read correction table {table}"))?;

    if corrections.has_column(STREAM_TIMESTAMP) {
        corrections = corrections.rename(STREAM_TIMESTAMP, EVENT_TIMESTAMP)?;
    } else if !corrections.has_column(EVENT_TIMESTAMP) {
        return Err(StreamingError::MissingTimestamp {
            table: table.to_string(),
        }
        .into());
    }

    let merged_rows = corrections.num_rows();
    if merged_rows == 0 {
        debug!(table, "correction table empty");
        return Ok(MergeOutcome {
            frame: batch,
            table_present: true,
            merged_rows: 0,
        });
    }

    let nulls = corrections.timestamp_column(EVENT_TIMESTAMP)?.iter().filter(|ts| ts.is_none()).count();
    if nulls > 0 {
        return Err(StreamingError::NullTimestamp {
            table: table.to_string(),
            rows: nulls,
        }
        .into());
    }

    let frame = batch
        .concat(corrections)
        .with_context(|| format!("failed to append correction table {table}"))?;
    debug!(table, merged_rows, total_rows = frame.num_rows(), "merged correction rows");
    Ok(MergeOutcome {
        frame,
        table_present: true,
        merged_rows,
    })
}

fn validate_identifier(table: &str) -> Result<(), StreamingError> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StreamingError::InvalidTableName(table.to_string()))
    }
}

/// Builds connection options from a URI, an optional password override and
/// an optional CA certificate.
///
/// # Errors
/// Fails when the URI cannot be parsed.
pub fn connect_options(
    uri: &str,
    password: Option<&str>,
    ca_certificate: Option<&Path>,
) -> Result<PgConnectOptions> {
    let mut options = PgConnectOptions::from_str(uri).context("invalid streaming store URI")?;
    if let Some(password) = password {
        options = options.password(password);
    }
    if let Some(path) = ca_certificate {
        options = options.ssl_root_cert(path);
    }
    Ok(options)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgColumnKind {
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Bool,
    Text,
    TimestampTz,
    Timestamp,
    Float4Array,
    Float8Array,
    Int4Array,
    Int8Array,
}

impl PgColumnKind {
    fn from_udt(udt: &str) -> Option<Self> {
        Some(match udt {
            "int2" => Self::Int2,
            "int4" => Self::Int4,
            "int8" => Self::Int8,
            "float4" => Self::Float4,
            "float8" => Self::Float8,
            "bool" => Self::Bool,
            "text" | "varchar" | "bpchar" | "name" => Self::Text,
            "timestamptz" => Self::TimestampTz,
            "timestamp" => Self::Timestamp,
            "_float4" => Self::Float4Array,
            "_float8" => Self::Float8Array,
            "_int4" => Self::Int4Array,
            "_int8" => Self::Int8Array,
            _ => return None,
        })
    }

    fn decode(self, rows: &[PgRow], column: &str) -> Result<ColumnData, sqlx::Error> {
        macro_rules! collect {
            ($ty:ty, $variant:ident, $map:expr) => {
                rows.iter()
                    .map(|row| row.try_get::<Option<$ty>, _>(column).map(|v| v.map($map)))
                    .collect::<Result<Vec<_>, _>>()
                    .map(ColumnData::$variant)
            };
        }

        match self {
            Self::Int2 => collect!(i16, Int64, i64::from),
            Self::Int4 => collect!(i32, Int64, i64::from),
            Self::Int8 => collect!(i64, Int64, |v| v),
            Self::Float4 => collect!(f32, Float64, f64::from),
            Self::Float8 => collect!(f64, Float64, |v| v),
            Self::Bool => collect!(bool, Int64, i64::from),
            Self::Text => collect!(String, Utf8, |v| v),
            Self::TimestampTz => collect!(DateTime<Utc>, Timestamp, |v| v),
            Self::Timestamp => collect!(NaiveDateTime, Timestamp, |v: NaiveDateTime| v.and_utc()),
            Self::Float4Array => collect!(Vec<f32>, Float32List, |v| v),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float8Array => collect!(Vec<f64>, Float32List, |v: Vec<f64>| {
                v.into_iter().map(|x| x as f32).collect()
            }),
            Self::Int4Array => collect!(Vec<i32>, Int64List, |v: Vec<i32>| {
                v.into_iter().map(i64::from).collect()
            }),
            Self::Int8Array => collect!(Vec<i64>, Int64List, |v| v),
        }
    }
}

/// Correction tables stored in Postgres.
#[derive(Debug, Clone)]
pub struct PgCorrectionSource {
    pool: PgPool,
}

impl PgCorrectionSource {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r"
            SELECT column_name::text AS column_name, udt_name::text AS udt_name
            FROM information_schema.columns
            WHERE table_name = $1 AND table_schema = current_schema()
            ORDER BY ordinal_position
            ",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .context("failed to describe correction table")?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("column_name")?,
                    row.try_get::<String, _>("udt_name")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("failed to decode column description")
    }
}

#[async_trait]
impl CorrectionSource for PgCorrectionSource {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .context("failed to query information_schema.tables")?;
        Ok(count > 0)
    }

    async fn fetch_all(&self, table: &str) -> Result<Frame> {
        validate_identifier(table)?;
        let described = self.columns(table).await?;
        if described.is_empty() {
            return Err(StreamingError::NoColumns(table.to_string()).into());
        }

        let kinds = described
            .iter()
            .map(|(name, udt)| {
                PgColumnKind::from_udt(udt).ok_or_else(|| StreamingError::UnsupportedColumn {
                    table: table.to_string(),
                    column: name.clone(),
                    type_name: udt.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rows = sqlx::query(&format!("SELECT * FROM \"{table}\""))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to select from {table}"))?;

        let columns = described
            .iter()
            .zip(kinds)
            .map(|((name, _), kind)| Ok(Column::new(name.clone(), kind.decode(&rows, name)?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .with_context(|| format!("failed to decode rows of {table}"))?;
        Ok(Frame::new(columns)?)
    }
}

/// Correction tables held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCorrectionSource {
    tables: RwLock<HashMap<String, Frame>>,
}

impl InMemoryCorrectionSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, table: impl Into<String>, frame: Frame) {
        self.tables.write().await.insert(table.into(), frame);
    }
}

#[async_trait]
impl CorrectionSource for InMemoryCorrectionSource {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.read().await.contains_key(table))
    }

    async fn fetch_all(&self, table: &str) -> Result<Frame> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .with_context(|| format!("correction table {table} does not exist"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    fn batch() -> Frame {
        Frame::new(vec![
            Column::new("user_id", ColumnData::Int64(vec![Some(1), Some(2)])),
            Column::new("item_id", ColumnData::Int64(vec![Some(10), Some(20)])),
            Column::new(
                EVENT_TIMESTAMP,
                ColumnData::Timestamp(vec![Some(at(1)), Some(at(1))]),
            ),
            Column::new("rating", ColumnData::Float64(vec![Some(4.0), None])),
        ])
        .unwrap()
    }

    fn corrections(timestamps: Vec<Option<DateTime<Utc>>>) -> Frame {
        let n = timestamps.len();
        Frame::new(vec![
            Column::new("user_id", ColumnData::Int64(vec![Some(1); n])),
            Column::new("item_id", ColumnData::Int64(vec![Some(10); n])),
            Column::new(STREAM_TIMESTAMP, ColumnData::Timestamp(timestamps)),
            Column::new("rating", ColumnData::Int64(vec![Some(5); n])),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn absent_table_leaves_batch_unchanged() {
        let source = InMemoryCorrectionSource::new();
        let outcome = merge_corrections(&source, "stream_interaction_positive", batch())
            .await
            .unwrap();
        assert!(!outcome.table_present);
        assert_eq!(outcome.frame, batch());
    }

    #[tokio::test]
    async fn present_table_is_appended_without_dedup() {
        let source = InMemoryCorrectionSource::new();
        source
            .insert(
                "stream_interaction_positive",
                corrections(vec![Some(at(2)), Some(at(2)), Some(at(3))]),
            )
            .await;

        let outcome = merge_corrections(&source, "stream_interaction_positive", batch())
            .await
            .unwrap();

        assert_eq!(outcome.merged_rows, 3);
        assert_eq!(outcome.frame.num_rows(), 5);
        assert!(!outcome.frame.has_column(STREAM_TIMESTAMP));
        let ts = outcome.frame.timestamp_column(EVENT_TIMESTAMP).unwrap();
        assert!(ts.iter().all(Option::is_some));
        assert_eq!(
            outcome.frame.float64_column("rating").unwrap(),
            &[Some(4.0), None, Some(5.0), Some(5.0), Some(5.0)]
        );
    }

    #[tokio::test]
    async fn null_stream_timestamp_is_fatal() {
        let source = InMemoryCorrectionSource::new();
        source
            .insert("t", corrections(vec![Some(at(2)), None]))
            .await;
        let err = merge_corrections(&source, "t", batch()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<StreamingError>(),
            Some(&StreamingError::NullTimestamp {
                table: "t".into(),
                rows: 1
            })
        );
    }

    #[tokio::test]
    async fn empty_table_changes_nothing() {
        let source = InMemoryCorrectionSource::new();
        source.insert("t", corrections(Vec::new())).await;
        let outcome = merge_corrections(&source, "t", batch()).await.unwrap();
        assert!(outcome.table_present);
        assert_eq!(outcome.frame, batch());
    }

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_identifier("stream_interaction_negetive").is_ok());
        assert!(validate_identifier("x; DROP TABLE y").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn connect_options_accept_password_override() {
        let options = connect_options(
            "postgres://app@db.example:5432/recsys",
            Some("secret"),
            None,
        )
        .unwrap();
        assert_eq!(options.get_host(), "db.example");
        assert_eq!(options.get_database(), Some("recsys"));
    }
}
