//! Classification of stage failures for the orchestrator's retry policy.

use std::error::Error as StdError;

use anyhow::Error;
use reqwest::StatusCode;
use sqlx::Error as SqlxError;

use crate::artifact::ArtifactError;
use crate::config::ConfigError;
use crate::feature_store::FeatureStoreError;
use crate::model::ModelError;
use crate::pipeline::generate::GenerationError;
use crate::registry::SchemaError;
use crate::streaming::StreamingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient: timeouts, connection failures, 5xx.
    Retryable,
    /// Will fail the same way again, but not a misconfiguration.
    NonRetryable,
    /// Configuration, schema or data corruption.
    Fatal,
}

fn classify_status(status: u16) -> Option<ErrorKind> {
    let status = StatusCode::from_u16(status).ok()?;
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Some(ErrorKind::Retryable);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(ErrorKind::Fatal),
        _ if status.is_client_error() => Some(ErrorKind::NonRetryable),
        _ => None,
    }
}

fn classify_reqwest(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() || error.is_connect() {
        return ErrorKind::Retryable;
    }
    error
        .status()
        .and_then(|status| classify_status(status.as_u16()))
        .unwrap_or(ErrorKind::NonRetryable)
}

fn classify_sqlx(error: &SqlxError) -> ErrorKind {
    match error {
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) | SqlxError::Database(_) => {
            ErrorKind::Retryable
        }
        SqlxError::Configuration(_) | SqlxError::Tls(_) => ErrorKind::Fatal,
        _ => ErrorKind::NonRetryable,
    }
}

fn classify_feature_store(error: &FeatureStoreError) -> Option<ErrorKind> {
    match error {
        FeatureStoreError::Http(inner) => Some(classify_reqwest(inner)),
        FeatureStoreError::Remote { status, .. } => classify_status(*status),
        FeatureStoreError::UnknownService(_)
        | FeatureStoreError::UnknownView(_)
        | FeatureStoreError::UnknownPushSource(_)
        | FeatureStoreError::UnknownFeature(_)
        | FeatureStoreError::InvalidFeatureRef(_)
        | FeatureStoreError::InvalidRegistry(_)
        | FeatureStoreError::NotVectorView(_)
        | FeatureStoreError::MixedViews(_)
        | FeatureStoreError::DimensionMismatch { .. }
        | FeatureStoreError::Yaml(_)
        | FeatureStoreError::Schema(_)
        | FeatureStoreError::RemoteConfig(_) => Some(ErrorKind::Fatal),
        // Wrapped causes are classified further down the chain.
        FeatureStoreError::NullEntityTimestamp(_)
        | FeatureStoreError::Io { .. }
        | FeatureStoreError::Frame(_)
        | FeatureStoreError::Artifact(_) => None,
    }
}

fn classify_cause(cause: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    if let Some(error) = cause.downcast_ref::<FeatureStoreError>() {
        return classify_feature_store(error);
    }
    if let Some(error) = cause.downcast_ref::<reqwest::Error>() {
        return Some(classify_reqwest(error));
    }
    if let Some(error) = cause.downcast_ref::<SqlxError>() {
        return Some(classify_sqlx(error));
    }
    if let Some(error) = cause.downcast_ref::<ArtifactError>() {
        return match error {
            ArtifactError::TagMismatch { .. } | ArtifactError::Missing { .. } => Some(ErrorKind::Fatal),
            _ => None,
        };
    }
    if cause.is::<ConfigError>()
        || cause.is::<SchemaError>()
        || cause.is::<ModelError>()
        || cause.is::<StreamingError>()
        || cause.is::<GenerationError>()
    {
        return Some(ErrorKind::Fatal);
    }
    None
}

/// Classifies an error by the first recognized cause in its chain,
/// outermost first. Unrecognized errors are non-retryable.
#[must_use]
pub fn classify_error(error: &Error) -> ErrorKind {
    error
        .chain()
        .find_map(classify_cause)
        .unwrap_or(ErrorKind::NonRetryable)
}

#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    matches!(classify_error(error), ErrorKind::Retryable)
}

#[must_use]
pub fn is_fatal(error: &Error) -> bool {
    matches!(classify_error(error), ErrorKind::Fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn plain_error_is_non_retryable() {
        let error = anyhow!("validation failed");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn server_errors_are_retryable_through_context() {
        let error = Error::new(FeatureStoreError::Remote {
            status: 503,
            body: "busy".into(),
        })
        .context("materialization failed");
        assert!(is_retryable(&error));
    }

    #[test]
    fn client_errors_are_not_retried() {
        let error = Error::new(FeatureStoreError::Remote {
            status: 422,
            body: String::new(),
        });
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn schema_and_config_errors_are_fatal() {
        let schema = Error::new(SchemaError::NullTimestamp {
            table: "t".into(),
            rows: 1,
        });
        assert!(is_fatal(&schema));
        let config = Error::new(ConfigError::Missing("uri")).context("stage setup");
        assert!(is_fatal(&config));
    }

    #[test]
    fn nested_schema_error_is_found() {
        let error = Error::new(FeatureStoreError::Schema(SchemaError::MissingColumn {
            table: "item_embedding".into(),
            column: "embedding".into(),
        }));
        assert!(is_fatal(&error));
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let error = Error::new(SqlxError::PoolTimedOut).context("probe failed");
        assert!(is_retryable(&error));
    }

    #[test]
    fn training_failure_is_fatal() {
        let error = Err::<(), _>(ModelError::NonFiniteLoss { epoch: 2 })
            .context("training failed")
            .unwrap_err();
        assert!(is_fatal(&error));
    }
}
