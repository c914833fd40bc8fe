//! Fixtures shared by unit tests.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde_json::Value;

use crate::core::{Kwargs, MetricConfiguration, MetricsMap};
use crate::engine::{DataFrameEngine, ExecutionEngine, InProcessEngine, SqlEngine};
use crate::registry::MetricRegistry;

/// Registry with every built-in provider.
pub fn registry() -> Arc<MetricRegistry> {
    Arc::new(MetricRegistry::with_defaults().unwrap())
}

pub fn kwargs(value: Value) -> Kwargs {
    Kwargs::try_from_json(value).unwrap()
}

pub fn metric(name: &str, domain: Value, value: Value) -> MetricConfiguration {
    MetricConfiguration::new(name, kwargs(domain), kwargs(value))
}

/// Batch of nullable Int64 columns.
pub fn int_batch(columns: &[(&str, Vec<Option<i64>>)]) -> RecordBatch {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, _)| Field::new(*name, DataType::Int64, true))
        .collect();
    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|(_, values)| Arc::new(Int64Array::from(values.clone())) as ArrayRef)
        .collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
}

/// Batch with an Int64 `id`, a Utf8 `name` and a Float64 `score` column.
pub fn mixed_batch() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("score", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
            Arc::new(StringArray::from(vec![
                Some("alice"),
                Some("bob"),
                None,
                Some("bob"),
            ])),
            Arc::new(Float64Array::from(vec![Some(1.5), None, Some(3.0), Some(4.5)])),
        ],
    )
    .unwrap()
}

pub fn in_process_engine(batch: RecordBatch) -> InProcessEngine {
    let engine = InProcessEngine::new(registry());
    engine
        .load_batch_data("b1", batch.schema(), vec![batch])
        .unwrap();
    engine
}

pub fn sql_engine(batch: RecordBatch) -> SqlEngine {
    let engine = SqlEngine::new(registry()).unwrap();
    engine
        .register_record_batches("b1", "data", batch.schema(), vec![batch])
        .unwrap();
    engine
}

pub fn dataframe_engine(batch: RecordBatch) -> DataFrameEngine {
    let engine = DataFrameEngine::new(registry()).unwrap();
    engine
        .load_record_batches("b1", batch.schema(), vec![batch])
        .unwrap();
    engine
}

/// Resolves `metrics` to completion, re-issuing pending metrics together with
/// what they need.
pub async fn resolve_fully<E: ExecutionEngine + ?Sized>(
    engine: &E,
    metrics: &[MetricConfiguration],
) -> MetricsMap {
    let mut known = MetricsMap::new();
    let mut todo = metrics.to_vec();
    for _ in 0..5 {
        if todo.is_empty() {
            break;
        }
        let resolution = engine.resolve_metrics(&todo, &known).await.unwrap();
        known.extend(resolution.resolved);
        todo = resolution
            .pending
            .into_iter()
            .flat_map(|p| p.needs.into_iter().chain(std::iter::once(p.metric)))
            .collect();
    }
    assert!(todo.is_empty(), "metrics still pending: {todo:?}");
    known
}

/// One in-process, one SQL and one dataframe engine over the same batch.
pub fn all_engines(batch: RecordBatch) -> Vec<Box<dyn ExecutionEngine>> {
    vec![
        Box::new(in_process_engine(batch.clone())),
        Box::new(sql_engine(batch.clone())),
        Box::new(dataframe_engine(batch)),
    ]
}
