//! # term-metrics - Dependency-graph metric resolution
//!
//! term-metrics computes data quality metrics over a batch of tabular data.
//! A metric is named (`column.max`, `column_values.in_set.unexpected_count`)
//! and parameterized by domain kwargs (which rows and columns) and value
//! kwargs (everything else). Metrics depend on other metrics; the engine
//! works out the dependency graph, computes what is missing and bundles
//! compatible aggregates into as few backend round trips as it can.
//!
//! ## Backends
//!
//! The same metric names resolve on three engines:
//!
//! - [`engine::InProcessEngine`] computes on materialized Arrow batches
//! - [`engine::SqlEngine`] pushes SQL text down to a DataFusion session
//! - [`engine::DataFrameEngine`] builds lazy DataFusion dataframes
//!
//! Results agree across backends up to floating point tolerance.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use term_metrics::prelude::*;
//!
//! # async fn example(batch: arrow::record_batch::RecordBatch) -> Result<()> {
//! let registry = Arc::new(MetricRegistry::with_defaults()?);
//! let engine = SqlEngine::new(registry)?;
//! engine.register_record_batches("b1", "data", batch.schema(), vec![batch])?;
//!
//! let unexpected = MetricConfiguration::new(
//!     "column_values.in_set.unexpected_count",
//!     Kwargs::new().with("column", "status"),
//!     Kwargs::new().with("value_set", serde_json::json!(["active", "closed"])),
//! );
//! let mut graph = ValidationGraph::new();
//! graph.build_metric_dependency_graph(engine.registry(), engine.backend_kind(), &unexpected)?;
//! let outcome =
//!     resolve_validation_graph(&engine, &graph, &MetricsMap::new(), &ResolveOptions::default())
//!         .await?;
//! println!("{}", outcome.resolved[&unexpected.id()]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Metric families
//!
//! - **Table**: row and column counts, column names and types, head
//! - **Column aggregates**: min, max, sum, mean, standard deviation, null counts
//! - **Distributions**: value counts, distinct values, histograms, partitions
//! - **Map rules**: not null, in set, between, regex, unique, column pairs,
//!   multicolumn sums; each with unexpected counts, values, rows and indices
//!
//! ## Logging
//!
//! The engine logs through `tracing`. Install a subscriber with
//! [`logging::setup::init_logging`] or bring your own; per-engine verbosity
//! is controlled with [`logging::LogConfig`].

pub mod core;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod prelude;
pub mod profiler;
pub mod registry;
pub mod retriever;
pub mod security;

#[cfg(test)]
pub mod test_helpers;
