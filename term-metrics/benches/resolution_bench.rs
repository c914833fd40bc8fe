//! Benchmarks for metric resolution with and without aggregate bundling.

use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use term_metrics::prelude::*;
use tokio::runtime::Runtime;

/// Sample batch with numeric, text and nullable columns.
fn create_batch(rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("value", DataType::Float64, false),
        Field::new("category", DataType::Utf8, true),
        Field::new("quantity", DataType::Int64, true),
    ]));
    let id = Int64Array::from((0..rows as i64).collect::<Vec<_>>());
    let value = Float64Array::from((0..rows).map(|i| i as f64 * 10.5).collect::<Vec<_>>());
    let category = StringArray::from(
        (0..rows)
            .map(|i| (i % 10 != 0).then(|| format!("cat_{}", i % 5)))
            .collect::<Vec<_>>(),
    );
    let quantity = Int64Array::from(
        (0..rows)
            .map(|i| (i % 20 != 0).then_some((i % 100) as i64))
            .collect::<Vec<_>>(),
    );
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(id),
            Arc::new(value),
            Arc::new(category),
            Arc::new(quantity),
        ],
    )
    .unwrap()
}

/// Aggregates over every numeric column: the workload bundling targets.
fn aggregate_metrics() -> Vec<MetricConfiguration> {
    let mut metrics = Vec::new();
    for column in ["id", "value", "quantity"] {
        for name in ["column.min", "column.max", "column.mean", "column.null_count"] {
            metrics.push(
                MetricConfiguration::try_from_json(name, json!({ "column": column }), json!({}))
                    .unwrap(),
            );
        }
    }
    metrics
}

fn graph_for(engine: &dyn ExecutionEngine, metrics: &[MetricConfiguration]) -> ValidationGraph {
    let mut graph = ValidationGraph::new();
    for config in metrics {
        graph
            .build_metric_dependency_graph(engine.registry(), engine.backend_kind(), config)
            .unwrap();
    }
    graph
}

fn sql_engine(batch: &RecordBatch, max_bundle_size: usize) -> SqlEngine {
    let registry = Arc::new(MetricRegistry::with_defaults().unwrap());
    let engine = SqlEngine::with_config(
        registry,
        EngineConfig::default().with_max_bundle_size(max_bundle_size),
    )
    .unwrap();
    engine
        .register_record_batches("bench", "data", batch.schema(), vec![batch.clone()])
        .unwrap();
    engine
}

fn benchmark_bundling(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let metrics = aggregate_metrics();
    let options = ResolveOptions::default();

    let mut group = c.benchmark_group("sql_bundling");
    for rows in [1_000, 100_000] {
        let batch = create_batch(rows);
        for (label, bundle_size) in [("bundled", 20), ("unbundled", 1)] {
            let engine = sql_engine(&batch, bundle_size);
            let graph = graph_for(&engine, &metrics);
            group.bench_with_input(BenchmarkId::new(label, rows), &rows, |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        resolve_validation_graph(&engine, &graph, &MetricsMap::new(), &options)
                            .await
                            .unwrap()
                    })
                });
            });
        }
    }
    group.finish();
}

fn benchmark_backends(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let metrics = aggregate_metrics();
    let options = ResolveOptions::default();
    let batch = create_batch(100_000);
    let registry = Arc::new(MetricRegistry::with_defaults().unwrap());

    let in_process = InProcessEngine::new(registry.clone());
    in_process
        .load_batch_data("bench", batch.schema(), vec![batch.clone()])
        .unwrap();
    let dataframe = DataFrameEngine::new(registry).unwrap();
    dataframe
        .load_record_batches("bench", batch.schema(), vec![batch.clone()])
        .unwrap();
    let sql = sql_engine(&batch, 20);

    let engines: [(&str, &dyn ExecutionEngine); 3] = [
        ("in_process", &in_process),
        ("sql", &sql),
        ("dataframe", &dataframe),
    ];
    let mut group = c.benchmark_group("backends");
    for (label, engine) in engines {
        let graph = graph_for(engine, &metrics);
        group.bench_function(label, |b| {
            b.iter(|| {
                rt.block_on(async {
                    resolve_validation_graph(engine, &graph, &MetricsMap::new(), &options)
                        .await
                        .unwrap()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_bundling, benchmark_backends);
criterion_main!(benches);
