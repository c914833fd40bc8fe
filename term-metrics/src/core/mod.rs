//! Core data model: metric identity, domains, values and batches.

pub mod batch;
pub mod configuration;
pub mod domain;
pub mod kwargs;
pub mod result_format;
pub mod value;

pub use batch::{Batch, BatchData, BatchManager, BatchSnapshot};
pub use configuration::{MetricConfiguration, MetricId, MetricsMap};
pub use domain::{ComputeDomain, DomainType, IgnoreRowIf, MetricDomain, ParsedDomain, RowFilter};
pub use kwargs::Kwargs;
pub use result_format::{ResultFormat, ResultFormatLevel};
pub use value::{
    AggregateSource, DeferredAggregate, Finalize, MetricValue, UnexpectedCondition, ValueCount,
};
