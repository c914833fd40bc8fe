//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde_json::Value;
use term_metrics::prelude::*;

pub fn registry() -> Arc<MetricRegistry> {
    Arc::new(MetricRegistry::with_defaults().unwrap())
}

pub fn kwargs(value: Value) -> Kwargs {
    Kwargs::try_from_json(value).unwrap()
}

pub fn metric(name: &str, domain: Value, value: Value) -> MetricConfiguration {
    MetricConfiguration::try_from_json(name, domain, value).unwrap()
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

/// `a` (Int64) and `b` (Utf8) columns of `rows` rows.
pub fn wide_batch(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("a", DataType::Int64, true),
        Field::new("b", DataType::Utf8, true),
    ]));
    let a: Int64Array = (0..rows as i64)
        .map(|i| if i % 7 == 0 { None } else { Some(i % 100) })
        .collect();
    let b: StringArray = (0..rows)
        .map(|i| Some(format!("value_{}", i % 13)))
        .collect();
    RecordBatch::try_new(schema, vec![Arc::new(a), Arc::new(b)]).unwrap()
}

pub fn in_process_engine(registry: Arc<MetricRegistry>, batch: RecordBatch) -> InProcessEngine {
    let engine = InProcessEngine::new(registry);
    engine
        .load_batch_data("b1", batch.schema(), vec![batch])
        .unwrap();
    engine
}

pub fn sql_engine(registry: Arc<MetricRegistry>, batch: RecordBatch) -> SqlEngine {
    let engine = SqlEngine::new(registry).unwrap();
    engine
        .register_record_batches("b1", "data", batch.schema(), vec![batch])
        .unwrap();
    engine
}

pub fn dataframe_engine(registry: Arc<MetricRegistry>, batch: RecordBatch) -> DataFrameEngine {
    let engine = DataFrameEngine::new(registry).unwrap();
    engine
        .load_record_batches("b1", batch.schema(), vec![batch])
        .unwrap();
    engine
}

/// In-process, SQL and dataframe engines over the same batch.
pub fn all_engines(batch: RecordBatch) -> Vec<Box<dyn ExecutionEngine>> {
    let registry = registry();
    vec![
        Box::new(in_process_engine(registry.clone(), batch.clone())),
        Box::new(sql_engine(registry.clone(), batch.clone())),
        Box::new(dataframe_engine(registry, batch)),
    ]
}

/// Resolves `metrics` through the validation graph and returns the values.
pub async fn resolve_graph(
    engine: &dyn ExecutionEngine,
    metrics: &[MetricConfiguration],
) -> GraphResolution {
    let mut graph = ValidationGraph::new();
    for config in metrics {
        graph
            .build_metric_dependency_graph(engine.registry(), engine.backend_kind(), config)
            .unwrap();
    }
    resolve_validation_graph(engine, &graph, &MetricsMap::new(), &ResolveOptions::default())
        .await
        .unwrap()
}

pub fn assert_close(actual: &MetricValue, expected: f64) {
    let actual = actual
        .as_f64()
        .unwrap_or_else(|| panic!("expected a number, got {actual:?}"));
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}
