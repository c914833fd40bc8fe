//! Prelude for commonly used types and traits in term-metrics.

pub use crate::core::{
    DomainType, Kwargs, MetricConfiguration, MetricId, MetricValue, MetricsMap, ResultFormat,
    ValueCount,
};
pub use crate::engine::{
    DataFrameEngine, EngineConfig, ExecutionEngine, InProcessEngine, PendingReason, Resolution,
    SessionSettings, SqlEngine,
};
pub use crate::error::{MetricError, Result};
pub use crate::graph::{resolve_validation_graph, GraphResolution, ResolveOptions, ValidationGraph};
pub use crate::logging::LogConfig;
pub use crate::registry::{BackendKind, MetricRegistry};
pub use crate::retriever::{ColumnDescriptiveMetricsRetriever, DescriptiveMetric};
