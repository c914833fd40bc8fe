//! Error types for the metric engine.
//!
//! Every failure surfaced by the engine is a [`MetricError`]. Backend errors
//! (DataFusion, Arrow) convert automatically and are re-wrapped at the
//! provider boundary so callers always learn which metric and which domain
//! failed.

use std::time::Duration;

use thiserror::Error;

use crate::registry::BackendKind;

/// The main error type for metric resolution.
#[derive(Error, Debug)]
pub enum MetricError {
    /// A metric could not be computed. Carries the metric and its domain.
    #[error("Error: {message}")]
    MetricResolution {
        /// Human-readable error message
        message: String,
        /// Name of the metric that failed
        metric_name: String,
        /// Canonical JSON of the domain kwargs the metric was evaluated on
        domain_kwargs: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A column named by the domain kwargs is not part of the batch.
    #[error("Error: The column \"{column}\" in BatchData does not exist.")]
    ColumnNotFound {
        column: String,
        metric_name: String,
        domain_kwargs: String,
    },

    /// A declared dependency is neither resolved nor computable on this backend.
    #[error("Metric '{metric}' depends on '{dependency}', which is not resolved and has no provider on the {backend} engine")]
    MissingDependency {
        metric: String,
        dependency: String,
        backend: BackendKind,
    },

    /// No provider is registered for the metric on the active backend.
    #[error("Metric '{metric}' is not registered for the {backend} engine")]
    ProviderNotRegistered {
        metric: String,
        backend: BackendKind,
    },

    /// A domain or value kwarg has a shape the provider cannot accept.
    #[error("Invalid configuration for metric '{metric}' ({kwarg}): {message}")]
    Configuration {
        metric: String,
        kwarg: String,
        message: String,
    },

    /// The metric graph refers back to itself.
    #[error("Dependency cycle detected: {path}")]
    DependencyCycle { path: String },

    /// The domain kwargs name a batch that is not loaded.
    #[error("Batch '{batch_id}' is not loaded")]
    BatchNotFound { batch_id: String },

    /// A backend round trip exceeded the configured timeout.
    #[error("Round trip on the {backend} engine exceeded {timeout:?}")]
    Timeout {
        backend: BackendKind,
        timeout: Duration,
    },

    /// Error from DataFusion operations.
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    /// Error from Arrow operations.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error from serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Security-related error.
    #[error("Security error: {0}")]
    Security(String),

    /// Generic internal error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, MetricError>`.
pub type Result<T> = std::result::Result<T, MetricError>;

impl MetricError {
    /// Creates a configuration error for a metric kwarg.
    pub fn configuration(
        metric: impl Into<String>,
        kwarg: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            metric: metric.into(),
            kwarg: kwarg.into(),
            message: message.into(),
        }
    }

    /// Creates a metric resolution error without an underlying source.
    pub fn resolution(
        message: impl Into<String>,
        metric_name: impl Into<String>,
        domain_kwargs: impl Into<String>,
    ) -> Self {
        Self::MetricResolution {
            message: message.into(),
            metric_name: metric_name.into(),
            domain_kwargs: domain_kwargs.into(),
            source: None,
        }
    }

    /// Creates a metric resolution error wrapping a source error.
    pub fn resolution_with_source(
        message: impl Into<String>,
        metric_name: impl Into<String>,
        domain_kwargs: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::MetricResolution {
            message: message.into(),
            metric_name: metric_name.into(),
            domain_kwargs: domain_kwargs.into(),
            source: Some(source),
        }
    }

    /// Returns true for errors already attributed to a specific metric.
    pub fn is_attributed(&self) -> bool {
        matches!(
            self,
            Self::MetricResolution { .. }
                | Self::ColumnNotFound { .. }
                | Self::MissingDependency { .. }
                | Self::ProviderNotRegistered { .. }
                | Self::Configuration { .. }
        )
    }

    /// Name of the metric this error is attributed to, if any.
    pub fn metric_name(&self) -> Option<&str> {
        match self {
            Self::MetricResolution { metric_name, .. } | Self::ColumnNotFound { metric_name, .. } => {
                Some(metric_name)
            }
            Self::MissingDependency { metric, .. }
            | Self::ProviderNotRegistered { metric, .. }
            | Self::Configuration { metric, .. } => Some(metric),
            _ => None,
        }
    }

    /// Wraps an unattributed error into a [`MetricError::MetricResolution`].
    ///
    /// Errors that already name a metric pass through untouched.
    pub fn attribute(self, metric_name: &str, domain_kwargs: &str) -> Self {
        if self.is_attributed() {
            return self;
        }
        let message = self.to_string();
        Self::resolution_with_source(message, metric_name, domain_kwargs, Box::new(self))
    }
}

impl From<serde_json::Error> for MetricError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, msg: &str) -> Result<T>;

    /// Adds context with a lazy message.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<MetricError>,
{
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| match e.into() {
            MetricError::Internal(inner) => MetricError::Internal(format!("{msg}: {inner}")),
            other => MetricError::Internal(format!("{msg}: {other}")),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let msg = f();
            match e.into() {
                MetricError::Internal(inner) => MetricError::Internal(format!("{msg}: {inner}")),
                other => MetricError::Internal(format!("{msg}: {other}")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_column_not_found_message() {
        let err = MetricError::ColumnNotFound {
            column: "non_existent_column".to_string(),
            metric_name: "column.max".to_string(),
            domain_kwargs: r#"{"column":"non_existent_column"}"#.to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Error: The column \"non_existent_column\" in BatchData does not exist."
        );
        assert_eq!(err.metric_name(), Some("column.max"));
    }

    #[test]
    fn test_provider_not_registered_names_backend() {
        let err = MetricError::ProviderNotRegistered {
            metric: "column.kurtosis".to_string(),
            backend: BackendKind::Sql,
        };
        let message = err.to_string();
        assert!(message.contains("column.kurtosis"));
        assert!(message.contains("sql"));
    }

    #[test]
    fn test_attribute_wraps_backend_errors() {
        let err = MetricError::Internal("boom".to_string()).attribute("column.sum", "{}");
        match &err {
            MetricError::MetricResolution {
                metric_name,
                message,
                ..
            } => {
                assert_eq!(metric_name, "column.sum");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.source().is_some());
    }

    #[test]
    fn test_attribute_keeps_attributed_errors() {
        let err = MetricError::configuration("column.max", "column", "must be a string")
            .attribute("other.metric", "{}");
        assert_eq!(err.metric_name(), Some("column.max"));
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), MetricError> =
            Err(MetricError::Internal("inner".to_string()));
        let err = result.context("while bundling").unwrap_err();
        assert_eq!(err.to_string(), "Internal error: while bundling: inner");
    }
}
