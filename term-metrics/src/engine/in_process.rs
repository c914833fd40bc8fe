//! In-process backend over materialized Arrow record batches.
//!
//! Every provider computes its value directly from the loaded rows, so this
//! engine never executes round trips or deferred aggregates.

use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::{and, concat_batches, filter_record_batch, is_not_null, or};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use tracing::instrument;

use super::{
    resolver, Backend, EngineConfig, EngineCore, ExecutionEngine, InProcessCall, ProviderCall,
    Resolution,
};
use crate::core::{
    Batch, BatchData, BatchManager, DeferredAggregate, IgnoreRowIf, Kwargs, MetricConfiguration,
    MetricDomain, MetricValue, MetricsMap, RowFilter,
};
use crate::error::{MetricError, Result};
use crate::registry::{BackendKind, MetricRegistry, Provider};

/// Engine computing metrics over in-memory Arrow data.
#[derive(Debug)]
pub struct InProcessEngine {
    core: EngineCore,
}

impl InProcessEngine {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<MetricRegistry>, config: EngineConfig) -> Self {
        Self {
            core: EngineCore::new(registry, config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Loads record batches as one batch and makes it the active one.
    #[instrument(skip(self, schema, batches))]
    pub fn load_batch_data(
        &self,
        batch_id: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let combined = concat_batches(&schema, &batches)?;
        self.core.batches.load_batch(Batch::new(
            batch_id,
            BatchData::InMemory {
                schema,
                batches: vec![combined],
            },
        ))
    }

    fn records(batch: &Batch) -> Result<RecordBatch> {
        match &batch.data {
            BatchData::InMemory { schema, batches } => match batches.as_slice() {
                [single] => Ok(single.clone()),
                _ => Ok(concat_batches(schema, batches)?),
            },
            other => Err(MetricError::Internal(format!(
                "batch '{}' holds {} data, which the in-process engine cannot read",
                batch.id,
                other.kind()
            ))),
        }
    }
}

/// Drops the rows excluded by a domain's `ignore_row_if`.
pub(crate) fn apply_row_filter(records: RecordBatch, domain: &MetricDomain) -> Result<RecordBatch> {
    match domain.row_filter() {
        None => Ok(records),
        Some(filter) => {
            let keep = keep_mask(&records, &filter)?;
            Ok(filter_record_batch(&records, &keep)?)
        }
    }
}

fn keep_mask(records: &RecordBatch, filter: &RowFilter) -> Result<BooleanArray> {
    let mut keep: Option<BooleanArray> = None;
    for column in &filter.columns {
        let index = records.schema().index_of(column)?;
        let present = is_not_null(records.column(index).as_ref())?;
        keep = Some(match keep {
            None => present,
            Some(acc) => match filter.ignore {
                IgnoreRowIf::AllMissing => or(&acc, &present)?,
                IgnoreRowIf::AnyMissing | IgnoreRowIf::Never => and(&acc, &present)?,
            },
        });
    }
    Ok(keep.unwrap_or_else(|| BooleanArray::from(vec![true; records.num_rows()])))
}

#[async_trait]
impl Backend for InProcessEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn core(&self) -> &EngineCore {
        &self.core
    }

    async fn schema(&self, batch: &Batch) -> Result<SchemaRef> {
        match &batch.data {
            BatchData::InMemory { schema, .. } => Ok(schema.clone()),
            other => Err(MetricError::Internal(format!(
                "batch '{}' holds {} data, which the in-process engine cannot read",
                batch.id,
                other.kind()
            ))),
        }
    }

    async fn invoke(
        &self,
        provider: Provider,
        call: ProviderCall<'_>,
        batch: &Batch,
    ) -> Result<MetricValue> {
        match provider {
            Provider::InProcess(compute) => {
                let records = apply_row_filter(Self::records(batch)?, call.domain)?;
                compute(&InProcessCall { call, records })
            }
            other => Err(MetricError::Internal(format!(
                "{other:?} provider cannot run on the in-process engine"
            ))),
        }
    }

    async fn execute_bundle(&self, _members: &[&DeferredAggregate]) -> Result<Vec<MetricValue>> {
        Err(MetricError::Internal(
            "the in-process engine does not execute deferred aggregates".to_string(),
        ))
    }

    async fn domain_records(&self, batch: &Batch, domain: &MetricDomain) -> Result<Vec<RecordBatch>> {
        Ok(vec![apply_row_filter(Self::records(batch)?, domain)?])
    }
}

#[async_trait]
impl ExecutionEngine for InProcessEngine {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    fn registry(&self) -> &Arc<MetricRegistry> {
        &self.core.registry
    }

    fn batch_manager(&self) -> &BatchManager {
        &self.core.batches
    }

    fn round_trips(&self) -> usize {
        self.core.round_trips()
    }

    async fn resolve_metrics(
        &self,
        metrics_to_resolve: &[MetricConfiguration],
        known: &MetricsMap,
    ) -> Result<Resolution> {
        resolver::resolve(self, metrics_to_resolve, known).await
    }

    async fn get_domain_records(&self, domain_kwargs: &Kwargs) -> Result<Vec<RecordBatch>> {
        resolver::domain_records(self, domain_kwargs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{int_batch, kwargs, registry};
    use serde_json::json;

    fn engine() -> InProcessEngine {
        let engine = InProcessEngine::new(registry());
        let batch = int_batch(&[
            ("a", vec![Some(1), None, None, Some(4)]),
            ("b", vec![Some(1), Some(2), None, None]),
        ]);
        engine
            .load_batch_data("b1", batch.schema(), vec![batch])
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_domain_records_apply_ignore_row_if() {
        let engine = engine();
        let all = engine
            .get_domain_records(&kwargs(json!({"column_A": "a", "column_B": "b"})))
            .await
            .unwrap();
        assert_eq!(all[0].num_rows(), 3);

        let either = engine
            .get_domain_records(&kwargs(json!({
                "column_A": "a",
                "column_B": "b",
                "ignore_row_if": "either_value_is_missing"
            })))
            .await
            .unwrap();
        assert_eq!(either[0].num_rows(), 1);

        let neither = engine
            .get_domain_records(&kwargs(json!({"column_A": "a", "column_B": "b", "ignore_row_if": "neither"})))
            .await
            .unwrap();
        assert_eq!(neither[0].num_rows(), 4);
    }

    #[tokio::test]
    async fn test_domain_records_reject_unknown_column() {
        let engine = engine();
        let err = engine
            .get_domain_records(&kwargs(json!({"column": "missing"})))
            .await
            .unwrap_err();
        assert!(matches!(err, MetricError::ColumnNotFound { ref column, .. } if column == "missing"));
    }

    #[tokio::test]
    async fn test_no_round_trips() {
        let engine = engine();
        let max = MetricConfiguration::new(
            "column.max",
            kwargs(json!({"column": "a"})),
            Kwargs::new(),
        );
        let min = MetricConfiguration::new(
            "column.min",
            kwargs(json!({"column": "a"})),
            Kwargs::new(),
        );
        let resolution = engine
            .resolve_metrics(&[max.clone(), min.clone()], &MetricsMap::new())
            .await
            .unwrap();
        assert_eq!(resolution.value(&max).unwrap(), &MetricValue::Integer(4));
        assert_eq!(resolution.value(&min).unwrap(), &MetricValue::Integer(1));
        assert_eq!(engine.round_trips(), 0);
        assert_eq!(resolution.metadata.bundles, 0);
    }
}
