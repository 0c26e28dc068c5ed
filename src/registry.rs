//! Typed names and static schemas of the feature repository objects the
//! pipeline depends on.
//!
//! The feature store resolves services dynamically from its registry; the
//! descriptors here are what the preprocessing and training code expects, so
//! every resolved service and every table crossing a stage boundary is checked
//! against them.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::feature_store::{FeatureService, FeatureViewProjection};
use crate::frame::{DataType, EVENT_TIMESTAMP, Frame};

pub const ITEM_ID: &str = "item_id";
pub const USER_ID: &str = "user_id";
pub const EMBEDDING: &str = "embedding";
pub const TOP_K_ITEM_IDS: &str = "top_k_item_ids";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub dtype: DataType,
}

const fn col(name: &'static str, dtype: DataType) -> ColumnSpec {
    ColumnSpec { name, dtype }
}

const ITEM_FEATURES: &[ColumnSpec] = &[
    col("category", DataType::Utf8),
    col("subcategory", DataType::Utf8),
    col("price", DataType::Float64),
    col("avg_rating", DataType::Float64),
    col("num_ratings", DataType::Int64),
];

const USER_FEATURES: &[ColumnSpec] = &[
    col("age", DataType::Int64),
    col("gender", DataType::Utf8),
    col("signup_days", DataType::Int64),
    col("preferences", DataType::Utf8),
];

const INTERACTION_FEATURES: &[ColumnSpec] = &[
    col("interaction_type", DataType::Utf8),
    col("rating", DataType::Float64),
    col("quantity", DataType::Int64),
];

const NEG_INTERACTION_FEATURES: &[ColumnSpec] = &[col("interaction_type", DataType::Utf8)];

const ITEM_EMBEDDING_FEATURES: &[ColumnSpec] = &[col(EMBEDDING, DataType::Float32List)];
const USER_EMBEDDING_FEATURES: &[ColumnSpec] = &[col(EMBEDDING, DataType::Float32List)];
const USER_ITEMS_FEATURES: &[ColumnSpec] = &[col(TOP_K_ITEM_IDS, DataType::Int64List)];

const ITEM_KEYS: &[&str] = &[ITEM_ID];
const USER_KEYS: &[&str] = &[USER_ID];
const PAIR_KEYS: &[&str] = &[USER_ID, ITEM_ID];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureViewName {
    ItemFeatures,
    UserFeatures,
    Interactions,
    NegInteractions,
    ItemEmbedding,
    UserEmbedding,
    UserItems,
}

impl FeatureViewName {
    pub const ALL: [FeatureViewName; 7] = [
        FeatureViewName::ItemFeatures,
        FeatureViewName::UserFeatures,
        FeatureViewName::Interactions,
        FeatureViewName::NegInteractions,
        FeatureViewName::ItemEmbedding,
        FeatureViewName::UserEmbedding,
        FeatureViewName::UserItems,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureViewName::ItemFeatures => "item_features",
            FeatureViewName::UserFeatures => "user_features",
            FeatureViewName::Interactions => "interactions",
            FeatureViewName::NegInteractions => "neg_interactions",
            FeatureViewName::ItemEmbedding => "item_embedding",
            FeatureViewName::UserEmbedding => "user_embedding",
            FeatureViewName::UserItems => "user_items",
        }
    }

    #[must_use]
    pub fn entity_keys(self) -> &'static [&'static str] {
        match self {
            FeatureViewName::ItemFeatures | FeatureViewName::ItemEmbedding => ITEM_KEYS,
            FeatureViewName::UserFeatures
            | FeatureViewName::UserEmbedding
            | FeatureViewName::UserItems => USER_KEYS,
            FeatureViewName::Interactions | FeatureViewName::NegInteractions => PAIR_KEYS,
        }
    }

    #[must_use]
    pub fn features(self) -> &'static [ColumnSpec] {
        match self {
            FeatureViewName::ItemFeatures => ITEM_FEATURES,
            FeatureViewName::UserFeatures => USER_FEATURES,
            FeatureViewName::Interactions => INTERACTION_FEATURES,
            FeatureViewName::NegInteractions => NEG_INTERACTION_FEATURES,
            FeatureViewName::ItemEmbedding => ITEM_EMBEDDING_FEATURES,
            FeatureViewName::UserEmbedding => USER_EMBEDDING_FEATURES,
            FeatureViewName::UserItems => USER_ITEMS_FEATURES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceName {
    Item,
    User,
    Interaction,
    NegInteraction,
}

impl ServiceName {
    pub const ALL: [ServiceName; 4] = [
        ServiceName::Item,
        ServiceName::User,
        ServiceName::Interaction,
        ServiceName::NegInteraction,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceName::Item => "item_service",
            ServiceName::User => "user_service",
            ServiceName::Interaction => "interaction_service",
            ServiceName::NegInteraction => "neg_interaction_service",
        }
    }

    #[must_use]
    pub fn view(self) -> FeatureViewName {
        match self {
            ServiceName::Item => FeatureViewName::ItemFeatures,
            ServiceName::User => FeatureViewName::UserFeatures,
            ServiceName::Interaction => FeatureViewName::Interactions,
            ServiceName::NegInteraction => FeatureViewName::NegInteractions,
        }
    }

    /// Columns of the table produced by joining this service onto its entity frame.
    #[must_use]
    pub fn output_schema(self) -> Vec<ColumnSpec> {
        let view = self.view();
        let mut columns: Vec<ColumnSpec> = view
            .entity_keys()
            .iter()
            .map(|key| col(key, DataType::Int64))
            .collect();
        columns.push(col(EVENT_TIMESTAMP, DataType::Timestamp));
        columns.extend_from_slice(view.features());
        columns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushSourceName {
    ItemEmbed,
    UserEmbed,
    UserItems,
}

impl PushSourceName {
    pub const ALL: [PushSourceName; 3] = [
        PushSourceName::ItemEmbed,
        PushSourceName::UserEmbed,
        PushSourceName::UserItems,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PushSourceName::ItemEmbed => "item_embed_push_source",
            PushSourceName::UserEmbed => "user_embed_push_source",
            PushSourceName::UserItems => "user_items_push_source",
        }
    }

    #[must_use]
    pub fn view(self) -> FeatureViewName {
        match self {
            PushSourceName::ItemEmbed => FeatureViewName::ItemEmbedding,
            PushSourceName::UserEmbed => FeatureViewName::UserEmbedding,
            PushSourceName::UserItems => FeatureViewName::UserItems,
        }
    }

    /// Columns a pushed frame must carry.
    #[must_use]
    pub fn schema(self) -> Vec<ColumnSpec> {
        let view = self.view();
        let mut columns: Vec<ColumnSpec> = view
            .entity_keys()
            .iter()
            .map(|key| col(key, DataType::Int64))
            .collect();
        columns.push(col(EVENT_TIMESTAMP, DataType::Timestamp));
        columns.extend_from_slice(view.features());
        columns
    }
}

macro_rules! impl_name {
    ($ty:ty, $kind:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = SchemaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .into_iter()
                    .find(|candidate| candidate.as_str() == s)
                    .ok_or_else(|| SchemaError::UnknownName {
                        kind: $kind,
                        name: s.to_string(),
                    })
            }
        }
    };
}

impl_name!(FeatureViewName, "feature view");
impl_name!(ServiceName, "feature service");
impl_name!(PushSourceName, "push source");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },
    #[error("feature service `{service}` does not project view `{view}`")]
    MissingView { service: String, view: String },
    #[error("feature service `{service}` is missing feature `{view}:{feature}`")]
    MissingFeature {
        service: String,
        view: String,
        feature: String,
    },
    #[error("feature `{view}:{feature}` is {actual}, expected {expected}")]
    FeatureType {
        view: String,
        feature: String,
        expected: DataType,
        actual: DataType,
    },
    #[error("feature view `{view}` joins on {actual:?}, expected {expected:?}")]
    JoinKeys {
        view: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("table `{table}` is missing column `{column}`")]
    MissingColumn { table: String, column: String },
    #[error("column `{table}.{column}` is {actual}, expected {expected}")]
    ColumnType {
        table: String,
        column: String,
        expected: DataType,
        actual: DataType,
    },
    #[error("table `{table}` has {rows} rows without an event timestamp")]
    NullTimestamp { table: String, rows: usize },
}

fn compatible(expected: DataType, actual: DataType) -> bool {
    expected == actual || (expected == DataType::Float64 && actual == DataType::Int64)
}

fn validate_projection(
    owner: &str,
    view: FeatureViewName,
    projection: &FeatureViewProjection,
) -> Result<(), SchemaError> {
    let expected_keys: Vec<String> = view.entity_keys().iter().map(ToString::to_string).collect();
    let mut actual_keys = projection.join_keys.clone();
    let mut sorted_expected = expected_keys.clone();
    actual_keys.sort();
    sorted_expected.sort();
    if actual_keys != sorted_expected {
        return Err(SchemaError::JoinKeys {
            view: view.as_str().to_string(),
            expected: expected_keys,
            actual: projection.join_keys.clone(),
        });
    }

    for spec in view.features() {
        let field = projection
            .features
            .iter()
            .find(|f| f.name == spec.name)
            .ok_or_else(|| SchemaError::MissingFeature {
                service: owner.to_string(),
                view: view.as_str().to_string(),
                feature: spec.name.to_string(),
            })?;
        if field.dtype != spec.dtype {
            return Err(SchemaError::FeatureType {
                view: view.as_str().to_string(),
                feature: spec.name.to_string(),
                expected: spec.dtype,
                actual: field.dtype,
            });
        }
    }
    Ok(())
}

/// Checks a resolved service against the static descriptor of `name`.
///
/// Extra views or features on the resolved side are allowed.
///
/// # Errors
/// Returns the first missing view, missing feature or type mismatch.
pub fn validate_service(name: ServiceName, resolved: &FeatureService) -> Result<(), SchemaError> {
    let view = name.view();
    let projection = resolved
        .projections
        .iter()
        .find(|p| p.view == view.as_str())
        .ok_or_else(|| SchemaError::MissingView {
            service: name.as_str().to_string(),
            view: view.as_str().to_string(),
        })?;
    validate_projection(name.as_str(), view, projection)
}

/// Checks that a push source feeds the expected view with the expected
/// features.
///
/// # Errors
/// Returns the first mismatch.
pub fn validate_push_source(
    name: PushSourceName,
    resolved: &FeatureViewProjection,
) -> Result<(), SchemaError> {
    let view = name.view();
    if resolved.view != view.as_str() {
        return Err(SchemaError::MissingView {
            service: name.as_str().to_string(),
            view: view.as_str().to_string(),
        });
    }
    validate_projection(name.as_str(), view, resolved)
}

/// Checks that `frame` carries every expected column with a compatible type
/// and that no row lacks an event timestamp.
///
/// Integer columns are accepted where floats are expected.
///
/// # Errors
/// Returns the first violation found.
pub fn validate_frame(table: &str, frame: &Frame, expected: &[ColumnSpec]) -> Result<(), SchemaError> {
    for spec in expected {
        let column = frame
            .column(spec.name)
            .ok_or_else(|| SchemaError::MissingColumn {
                table: table.to_string(),
                column: spec.name.to_string(),
            })?;
        if !compatible(spec.dtype, column.data_type()) {
            return Err(SchemaError::ColumnType {
                table: table.to_string(),
                column: spec.name.to_string(),
                expected: spec.dtype,
                actual: column.data_type(),
            });
        }
    }

    if let Some(ts) = frame.column(EVENT_TIMESTAMP) {
        let rows = ts.data.null_count();
        if rows > 0 {
            return Err(SchemaError::NullTimestamp {
                table: table.to_string(),
                rows,
            });
        }
    }
    Ok(())
}
