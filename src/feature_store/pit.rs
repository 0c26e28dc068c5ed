//! Point-in-time correct join of feature rows onto entity rows.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::FeatureStoreError;
use crate::frame::{EVENT_TIMESTAMP, Frame, FrameError};

/// Values of the join keys of one row; `None` when any key is null.
pub(crate) fn row_key(key_columns: &[&[Option<i64>]], row: usize) -> Option<Vec<i64>> {
    key_columns.iter().map(|column| column[row]).collect()
}

/// Borrows the given int64 key columns.
pub(crate) fn key_columns<'a>(
    frame: &'a Frame,
    join_keys: &[String],
) -> Result<Vec<&'a [Option<i64>]>, FrameError> {
    join_keys
        .iter()
        .map(|key| frame.int64_column(key))
        .collect()
}

/// Index of a feature source: per entity key, rows sorted by event time.
struct SourceIndex {
    rows: HashMap<Vec<i64>, Vec<(DateTime<Utc>, usize)>>,
}

impl SourceIndex {
    fn build(source: &Frame, join_keys: &[String]) -> Result<Self, FrameError> {
        let keys = key_columns(source, join_keys)?;
        let timestamps = source.timestamp_column(EVENT_TIMESTAMP)?;
        let mut rows: HashMap<Vec<i64>, Vec<(DateTime<Utc>, usize)>> = HashMap::new();
        for (row, ts) in timestamps.iter().enumerate() {
            let (Some(key), Some(ts)) = (row_key(&keys, row), ts) else {
                continue;
            };
            rows.entry(key).or_default().push((*ts, row));
        }
        // Stable sort keeps later rows after earlier ones on equal timestamps,
        // so the last write wins below.
        for entries in rows.values_mut() {
            entries.sort_by_key(|(ts, _)| *ts);
        }
        Ok(Self { rows })
    }

    fn lookup(&self, key: &[i64], as_of: DateTime<Utc>, ttl: Option<Duration>) -> Option<usize> {
        let entries = self.rows.get(key)?;
        let upper = entries.partition_point(|(ts, _)| *ts <= as_of);
        let (ts, row) = *entries.get(upper.checked_sub(1)?)?;
        match ttl {
            Some(ttl) if ts < as_of - ttl => None,
            _ => Some(row),
        }
    }
}

/// Joins `features` of `source` onto `entity_df`.
///
/// For each entity row the source row with equal join keys and the latest
/// event timestamp not after the entity's timestamp is taken, ignoring rows
/// older than `ttl`. Unmatched entity rows receive nulls. The output keeps the
/// entity columns and row order and appends one column per feature.
///
/// # Errors
/// Fails when key or timestamp columns are missing or mistyped, when an
/// entity row has a null timestamp, or when a feature column is absent from
/// the source.
pub fn join(
    entity_df: Frame,
    source: &Frame,
    join_keys: &[String],
    features: &[&str],
    ttl: Option<Duration>,
) -> Result<Frame, FeatureStoreError> {
    let entity_ts = entity_df.timestamp_column(EVENT_TIMESTAMP)?;
    if entity_ts.iter().any(Option::is_none) {
        return Err(FeatureStoreError::NullEntityTimestamp(
            EVENT_TIMESTAMP.to_string(),
        ));
    }
    let entity_keys = key_columns(&entity_df, join_keys)?;

    let index = SourceIndex::build(source, join_keys)?;
    let positions: Vec<Option<usize>> = (0..entity_df.num_rows())
        .map(|row| {
            let key = row_key(&entity_keys, row)?;
            let as_of = entity_ts[row]?;
            index.lookup(&key, as_of, ttl)
        })
        .collect();

    let mut joined = entity_df;
    for feature in features {
        let column = source.require_column(feature)?;
        joined = joined.with_column(*feature, column.data.take(&positions))?;
    }
    Ok(joined)
}
