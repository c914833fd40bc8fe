//! Descriptive metrics of a batch: table shape plus numeric column summaries.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use crate::core::{Kwargs, MetricConfiguration, MetricValue, MetricsMap};
use crate::engine::ExecutionEngine;
use crate::error::{MetricError, Result};
use crate::graph::{
    resolve_validation_graph, ExceptionInfo, GraphResolution, ResolveOptions, ValidationGraph,
};
use crate::registry::column_kwargs;

const TABLE_METRICS: [&str; 2] = ["table.row_count", "table.columns"];
const NUMERIC_COLUMN_METRICS: [&str; 4] = [
    "column.min",
    "column.max",
    "column.mean",
    "column.null_count",
];

/// One retrieved metric, or the reason it could not be computed.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptiveMetric {
    pub batch_id: String,
    pub metric_name: String,
    /// `None` for table metrics.
    pub column: Option<String>,
    pub value: Option<MetricValue>,
    pub exception: Option<ExceptionInfo>,
}

/// Computes descriptive metrics on any engine, isolating per-metric failures.
pub struct ColumnDescriptiveMetricsRetriever {
    engine: Arc<dyn ExecutionEngine>,
    options: ResolveOptions,
}

impl ColumnDescriptiveMetricsRetriever {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            options: ResolveOptions::default().with_catch_exceptions(true),
        }
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.options = self.options.with_max_passes(max_passes);
        self
    }

    /// Retrieves metrics for `batch_id`, or the active batch when `None`.
    #[instrument(skip(self))]
    pub async fn get_metrics(&self, batch_id: Option<&str>) -> Result<Vec<DescriptiveMetric>> {
        let batch_id = match batch_id {
            Some(id) => id.to_string(),
            None => self
                .engine
                .batch_manager()
                .active_batch_id()?
                .ok_or_else(|| MetricError::BatchNotFound {
                    batch_id: "<active>".to_string(),
                })?,
        };
        let table_kwargs = Kwargs::new().with("batch_id", batch_id.clone());

        let mut table_configs: Vec<MetricConfiguration> = TABLE_METRICS
            .iter()
            .map(|name| MetricConfiguration::new(*name, table_kwargs.clone(), Kwargs::new()))
            .collect();
        let column_types =
            MetricConfiguration::new("table.column_types", table_kwargs.clone(), Kwargs::new());
        table_configs.push(column_types.clone());
        let table = self.resolve(&table_configs).await?;

        let mut metrics: Vec<DescriptiveMetric> = TABLE_METRICS
            .iter()
            .zip(&table_configs)
            .map(|(name, config)| describe(&batch_id, name, None, config, &table))
            .collect();

        let numeric = table
            .resolved
            .get(&column_types.id())
            .map(numeric_columns)
            .unwrap_or_default();

        let mut column_configs = Vec::new();
        for column in &numeric {
            let domain = column_kwargs(column).with("batch_id", batch_id.clone());
            for name in NUMERIC_COLUMN_METRICS {
                column_configs.push((
                    column.clone(),
                    name,
                    MetricConfiguration::new(name, domain.clone(), Kwargs::new()),
                ));
            }
        }
        let configs: Vec<MetricConfiguration> =
            column_configs.iter().map(|(_, _, c)| c.clone()).collect();
        let columns = self.resolve(&configs).await?;
        for (column, name, config) in &column_configs {
            metrics.push(describe(&batch_id, name, Some(column), config, &columns));
        }

        info!(
            batch_id = %batch_id,
            metrics = metrics.len(),
            numeric_columns = numeric.len(),
            "retrieved descriptive metrics"
        );
        Ok(metrics)
    }

    async fn resolve(&self, configs: &[MetricConfiguration]) -> Result<GraphResolution> {
        let mut graph = ValidationGraph::new();
        let registry = self.engine.registry();
        let backend = self.engine.backend_kind();
        for config in configs {
            graph.build_metric_dependency_graph(registry, backend, config)?;
        }
        resolve_validation_graph(self.engine.as_ref(), &graph, &MetricsMap::new(), &self.options)
            .await
    }
}

fn describe(
    batch_id: &str,
    metric_name: &str,
    column: Option<&str>,
    config: &MetricConfiguration,
    outcome: &GraphResolution,
) -> DescriptiveMetric {
    let id = config.id();
    DescriptiveMetric {
        batch_id: batch_id.to_string(),
        metric_name: metric_name.to_string(),
        column: column.map(str::to_string),
        value: outcome.resolved.get(&id).cloned(),
        exception: outcome.aborted.get(&id).map(|a| a.exception.clone()),
    }
}

/// Names of numeric columns listed by `table.column_types`.
fn numeric_columns(column_types: &MetricValue) -> Vec<String> {
    column_types
        .as_list()
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| match entry {
            MetricValue::Map(fields) => {
                let name = fields.get("name")?.as_str()?;
                let data_type = fields.get("type")?.as_str()?;
                is_numeric_type(data_type).then(|| name.to_string())
            }
            _ => None,
        })
        .collect()
}

fn is_numeric_type(data_type: &str) -> bool {
    ["Int", "UInt", "Float", "Decimal"]
        .iter()
        .any(|prefix| data_type.starts_with(prefix))
}
