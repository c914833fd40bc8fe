//! End-to-end resolution behavior across the three backends.

mod common;

use serde_json::json;
use term_metrics::core::{AggregateSource, DeferredAggregate, Finalize};
use term_metrics::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use term_metrics::metrics::AggregateFamily;
use term_metrics::prelude::*;
use term_metrics::registry::{DependencySpec, ProviderSpec, CONDITION_KEY};

use common::{all_engines, assert_close, int_batch, metric, registry, resolve_graph, sql_engine};

fn column(name: &str) -> serde_json::Value {
    json!({ "column": name })
}

#[tokio::test]
async fn test_column_max_on_all_backends() {
    let batch = int_batch(&[("a", vec![Some(1), Some(2), Some(3), Some(3), None])]);
    for engine in all_engines(batch) {
        let max = metric("column.max", column("a"), json!({}));
        let outcome = resolve_graph(engine.as_ref(), &[max.clone()]).await;
        assert_eq!(
            outcome.resolved[&max.id()],
            MetricValue::Integer(3),
            "{}",
            engine.backend_kind()
        );
    }
}

#[tokio::test]
async fn test_standard_deviation_and_mean_ignore_nulls() {
    let batch = int_batch(&[("a", vec![Some(1), Some(2), Some(3), None])]);
    for engine in all_engines(batch) {
        let stddev = metric("column.standard_deviation", column("a"), json!({}));
        let mean = metric("column.mean", column("a"), json!({}));
        let outcome = resolve_graph(engine.as_ref(), &[stddev.clone(), mean.clone()]).await;
        assert_close(&outcome.resolved[&stddev.id()], 1.0);
        assert_close(&outcome.resolved[&mean.id()], 2.0);
    }
}

#[tokio::test]
async fn test_column_pair_equal() {
    let batch = int_batch(&[
        ("a", vec![Some(0), Some(1), Some(9), Some(2)]),
        ("b", vec![Some(5), Some(4), Some(3), Some(6)]),
        ("c", vec![Some(5), Some(4), Some(3), Some(6)]),
        ("d", vec![Some(7), Some(8), Some(9), Some(0)]),
    ]);
    for engine in all_engines(batch) {
        let same = metric(
            "column_pair_values.equal.unexpected_count",
            json!({"column_A": "b", "column_B": "c"}),
            json!({}),
        );
        let different = metric(
            "column_pair_values.equal.unexpected_count",
            json!({"column_A": "a", "column_B": "d"}),
            json!({}),
        );
        let outcome = resolve_graph(engine.as_ref(), &[same.clone(), different.clone()]).await;
        assert_eq!(outcome.resolved[&same.id()], MetricValue::Integer(0));
        assert_eq!(outcome.resolved[&different.id()], MetricValue::Integer(3));
    }
}

#[tokio::test]
async fn test_missing_column_is_reported_by_name() {
    let batch = int_batch(&[("a", vec![Some(1)])]);
    for engine in all_engines(batch) {
        let max = metric("column.max", column("missing"), json!({}));
        let mut graph = ValidationGraph::new();
        graph
            .build_metric_dependency_graph(engine.registry(), engine.backend_kind(), &max)
            .unwrap();
        let err = resolve_validation_graph(
            engine.as_ref(),
            &graph,
            &MetricsMap::new(),
            &ResolveOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MetricError::ColumnNotFound { .. }), "{err:?}");
        assert_eq!(
            err.to_string(),
            "Error: The column \"missing\" in BatchData does not exist."
        );
    }
}

#[tokio::test]
async fn test_unique_unexpected_values() {
    let batch = int_batch(&[(
        "a",
        vec![Some(1), Some(2), Some(3), Some(3), Some(4), None],
    )]);
    for engine in all_engines(batch) {
        let count = metric("column_values.unique.unexpected_count", column("a"), json!({}));
        let values = metric(
            "column_values.unique.unexpected_values",
            column("a"),
            json!({"result_format": {"result_format": "SUMMARY", "partial_unexpected_count": 20}}),
        );
        let outcome = resolve_graph(engine.as_ref(), &[count.clone(), values.clone()]).await;
        assert_eq!(outcome.resolved[&count.id()], MetricValue::Integer(2));
        assert_eq!(
            outcome.resolved[&values.id()],
            MetricValue::List(vec![MetricValue::Integer(3), MetricValue::Integer(3)])
        );
    }
}

#[tokio::test]
async fn test_unique_on_empty_table() {
    let batch = int_batch(&[("a", vec![])]);
    for engine in all_engines(batch) {
        let count = metric("column_values.unique.unexpected_count", column("a"), json!({}));
        let outcome = resolve_graph(engine.as_ref(), &[count.clone()]).await;
        assert_eq!(outcome.resolved[&count.id()], MetricValue::Integer(0));
    }
}

#[tokio::test]
async fn test_unexpected_values_respect_partial_count() {
    let batch = int_batch(&[(
        "a",
        (0..30).map(|i| Some(i % 10)).collect::<Vec<_>>(),
    )]);
    for engine in all_engines(batch) {
        for format in ["BASIC", "SUMMARY"] {
            let value_kwargs = json!({
                "value_set": [0, 1],
                "result_format": {"result_format": format, "partial_unexpected_count": 5},
            });
            let count = metric(
                "column_values.in_set.unexpected_count",
                column("a"),
                value_kwargs.clone(),
            );
            let values = metric(
                "column_values.in_set.unexpected_values",
                column("a"),
                value_kwargs,
            );
            let outcome = resolve_graph(engine.as_ref(), &[count.clone(), values.clone()]).await;
            let unexpected = outcome.resolved[&count.id()].as_i64().unwrap();
            assert_eq!(unexpected, 24);
            let listed = outcome.resolved[&values.id()].as_list().unwrap().len() as i64;
            assert_eq!(listed, unexpected.min(5), "{format} on {}", engine.backend_kind());
        }
    }
}

#[tokio::test]
async fn test_aggregates_on_one_column_share_a_round_trip() {
    let batch = int_batch(&[("a", vec![Some(1), Some(5), None])]);
    let engine = sql_engine(registry(), batch.clone());
    let metrics = [
        metric("column.max.aggregate_fn", column("a"), json!({})),
        metric("column.min.aggregate_fn", column("a"), json!({})),
        metric("column.max", column("a"), json!({})),
        metric("column.min", column("a"), json!({})),
    ];
    let before = engine.round_trips();
    let resolution = engine.resolve_metrics(&metrics, &MetricsMap::new()).await.unwrap();
    assert!(resolution.is_complete());
    assert_eq!(resolution.metadata.round_trips, 1);
    assert_eq!(resolution.metadata.bundles, 1);
    assert_eq!(engine.round_trips() - before, 1);
    assert_eq!(resolution.value(&metrics[2]).unwrap(), &MetricValue::Integer(5));
    assert_eq!(resolution.value(&metrics[3]).unwrap(), &MetricValue::Integer(1));

    let local = common::in_process_engine(registry(), batch);
    let resolution = local
        .resolve_metrics(&metrics[2..], &MetricsMap::new())
        .await
        .unwrap();
    assert_eq!(resolution.metadata.round_trips, 0);
    assert_eq!(resolution.value(&metrics[2]).unwrap(), &MetricValue::Integer(5));
}

#[tokio::test]
async fn test_bundles_split_at_max_bundle_size() {
    let batch = int_batch(&[("a", vec![Some(1), Some(5)]), ("b", vec![Some(2), None])]);
    let engine = SqlEngine::with_config(registry(), EngineConfig::default().with_max_bundle_size(2))
        .unwrap();
    engine
        .register_record_batches("b1", "data", batch.schema(), vec![batch])
        .unwrap();

    let mut metrics = Vec::new();
    for name in ["column.max", "column.min"] {
        for col in ["a", "b"] {
            metrics.push(metric(&format!("{name}.aggregate_fn"), column(col), json!({})));
            metrics.push(metric(name, column(col), json!({})));
        }
    }
    let resolution = engine.resolve_metrics(&metrics, &MetricsMap::new()).await.unwrap();
    assert!(resolution.is_complete());
    assert_eq!(resolution.metadata.bundles, 2);
    assert_eq!(resolution.metadata.round_trips, 2);
}

#[tokio::test]
async fn test_finalizer_waits_for_its_partial() {
    let batch = int_batch(&[("a", vec![Some(4), Some(2)])]);
    let engine = sql_engine(registry(), batch);
    let max = metric("column.max", column("a"), json!({}));

    let first = engine.resolve_metrics(&[max.clone()], &MetricsMap::new()).await.unwrap();
    assert!(first.resolved.is_empty());
    assert_eq!(first.metadata.round_trips, 0);
    let pending = &first.pending[0];
    assert_eq!(pending.reason, PendingReason::PartialNotBuilt);
    assert_eq!(pending.needs[0].metric_name(), "column.max.aggregate_fn");

    let mut request = pending.needs.clone();
    request.push(max.clone());
    let second = engine.resolve_metrics(&request, &MetricsMap::new()).await.unwrap();
    assert!(second.is_complete());
    assert_eq!(second.value(&max).unwrap(), &MetricValue::Integer(4));
}

#[tokio::test]
async fn test_dependent_of_round_trip_is_pending() {
    let batch = int_batch(&[("a", vec![Some(1), Some(5)])]);
    let engine = sql_engine(registry(), batch);
    let partition = metric("column.partition", column("a"), json!({"n_bins": 2}));
    let request = [
        metric("column.min.aggregate_fn", column("a"), json!({})),
        metric("column.max.aggregate_fn", column("a"), json!({})),
        partition.clone(),
    ];
    let first = engine.resolve_metrics(&request, &MetricsMap::new()).await.unwrap();
    assert!(first.is_pending(&partition));
    assert_eq!(first.pending[0].reason, PendingReason::AwaitingRoundTrip);
    assert_eq!(first.metadata.round_trips, 1);

    let second = engine
        .resolve_metrics(&[partition.clone()], &first.resolved)
        .await
        .unwrap();
    assert_eq!(
        second.value(&partition).unwrap(),
        &MetricValue::List(vec![
            MetricValue::Float(1.0),
            MetricValue::Float(3.0),
            MetricValue::Float(5.0),
        ])
    );
}

#[tokio::test]
async fn test_known_metrics_are_not_recomputed() {
    let batch = int_batch(&[("a", vec![Some(1), Some(5)])]);
    let engine = common::in_process_engine(registry(), batch);
    let max = metric("column.max", column("a"), json!({}));
    let mut known = MetricsMap::new();
    known.insert(max.id(), MetricValue::Integer(42));

    let resolution = engine.resolve_metrics(&[max.clone()], &known).await.unwrap();
    assert!(resolution.resolved.is_empty());
    assert!(resolution.is_complete());
}

fn doubled_external(call: &ProviderCall<'_>) -> Result<MetricValue> {
    let external = call
        .dependency("custom.external")?
        .as_i64()
        .ok_or_else(|| call.error("custom.external is not an integer"))?;
    Ok(MetricValue::Integer(external * 2))
}

#[tokio::test]
async fn test_dependency_must_be_known_or_computable() {
    let registry = registry();
    registry
        .register_derived(
            ProviderSpec::direct("custom.doubled", DomainType::Column)
                .with_dependency(DependencySpec::implicit("custom.external")),
            doubled_external,
        )
        .unwrap();
    let engine = common::in_process_engine(registry, int_batch(&[("a", vec![Some(1)])]));
    let doubled = metric("custom.doubled", column("a"), json!({}));

    let err = engine
        .resolve_metrics(&[doubled.clone()], &MetricsMap::new())
        .await
        .unwrap_err();
    match &err {
        MetricError::MissingDependency {
            metric, dependency, ..
        } => {
            assert_eq!(metric, "custom.doubled");
            assert_eq!(dependency, "custom.external");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let mut known = MetricsMap::new();
    known.insert(
        metric("custom.external", column("a"), json!({})).id(),
        MetricValue::Integer(21),
    );
    let resolution = engine.resolve_metrics(&[doubled.clone()], &known).await.unwrap();
    assert_eq!(resolution.value(&doubled).unwrap(), &MetricValue::Integer(42));
}

fn forward(call: &ProviderCall<'_>) -> Result<MetricValue> {
    Ok(call
        .dependencies
        .values()
        .next()
        .cloned()
        .unwrap_or(MetricValue::Null))
}

#[tokio::test]
async fn test_dependency_cycle_is_reported() {
    let registry = registry();
    for (name, dependency) in [("custom.a", "custom.b"), ("custom.b", "custom.a")] {
        registry
            .register_derived(
                ProviderSpec::direct(name, DomainType::Column)
                    .with_dependency(DependencySpec::implicit(dependency)),
                forward,
            )
            .unwrap();
    }
    let engine = common::in_process_engine(registry, int_batch(&[("a", vec![Some(1)])]));
    let err = engine
        .resolve_metrics(
            &[metric("custom.a", column("a"), json!({}))],
            &MetricsMap::new(),
        )
        .await
        .unwrap_err();
    match err {
        MetricError::DependencyCycle { path } => {
            assert!(path.starts_with("custom.a("), "{path}");
            assert!(path.contains(" -> custom.b("), "{path}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_unregistered_metric_names_backend() {
    for engine in all_engines(int_batch(&[("a", vec![Some(1)])])) {
        let err = engine
            .resolve_metrics(
                &[metric("column.no_such_metric", column("a"), json!({}))],
                &MetricsMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetricError::ProviderNotRegistered { .. }));
        assert!(err.to_string().contains("column.no_such_metric"));
        assert!(err.to_string().contains(&engine.backend_kind().to_string()));
    }
}

fn broken_in_process(_call: &InProcessCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::Null)
}

fn broken_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::Deferred(DeferredAggregate {
        domain_key: call.domain_key.clone(),
        source: AggregateSource::Sql {
            relation: call.relation.clone(),
            expression: "MAX(\"__no_such_column\")".to_string(),
        },
        finalize: Finalize::Raw,
    }))
}

fn broken_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::Deferred(DeferredAggregate {
        domain_key: call.domain_key.clone(),
        source: AggregateSource::DataFrame {
            frame: call.frame.clone(),
            expression: datafusion::functions_aggregate::expr_fn::max(datafusion::prelude::ident(
                "__no_such_column",
            )),
        },
        finalize: Finalize::Raw,
    }))
}

#[tokio::test]
async fn test_failed_bundle_names_the_culprit() {
    let registry = registry();
    AggregateFamily::direct(
        "custom.broken",
        DomainType::Column,
        broken_in_process,
        broken_sql,
        broken_dataframe,
    )
    .register(&registry)
    .unwrap();

    let batch = int_batch(&[("a", vec![Some(1), Some(2)])]);
    let engines: Vec<Box<dyn ExecutionEngine>> = vec![
        Box::new(sql_engine(registry.clone(), batch.clone())),
        Box::new(common::dataframe_engine(registry, batch)),
    ];
    for engine in engines {
        let request = [
            metric("column.max.aggregate_fn", column("a"), json!({})),
            metric("custom.broken.aggregate_fn", column("a"), json!({})),
            metric("column.max", column("a"), json!({})),
            metric("custom.broken", column("a"), json!({})),
        ];
        let err = engine
            .resolve_metrics(&request, &MetricsMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricError::MetricResolution { .. }), "{err:?}");
        assert_eq!(err.metric_name(), Some("custom.broken"), "{err}");
    }
}

#[tokio::test]
async fn test_later_request_with_same_id_wins() {
    let batch = int_batch(&[("a", vec![Some(1), Some(2), None, Some(9)])]);
    let engine = common::in_process_engine(registry(), batch);
    let value_kwargs = json!({"value_set": [1]});
    let plain = metric(
        "column_values.in_set.unexpected_count",
        column("a"),
        value_kwargs.clone(),
    );
    let mut rewired = plain.clone();
    rewired.set_dependencies(
        [(
            CONDITION_KEY.to_string(),
            metric("column_values.nonnull.condition", column("a"), json!({})),
        )]
        .into_iter()
        .collect(),
    );
    assert_eq!(plain.id(), rewired.id());

    let resolution = engine
        .resolve_metrics(&[rewired.clone(), plain.clone()], &MetricsMap::new())
        .await
        .unwrap();
    assert_eq!(resolution.value(&plain).unwrap(), &MetricValue::Integer(2));

    let resolution = engine
        .resolve_metrics(&[plain, rewired.clone()], &MetricsMap::new())
        .await
        .unwrap();
    assert_eq!(resolution.value(&rewired).unwrap(), &MetricValue::Integer(1));
}

async fn domain_rows(engine: &dyn ExecutionEngine, domain: serde_json::Value) -> usize {
    engine
        .get_domain_records(&common::kwargs(domain))
        .await
        .unwrap()
        .iter()
        .map(|batch| batch.num_rows())
        .sum()
}

#[tokio::test]
async fn test_domain_records_agree_across_backends() {
    let batch = int_batch(&[
        ("a", vec![Some(1), None, None, Some(4)]),
        ("b", vec![Some(1), Some(2), None, None]),
    ]);
    for engine in all_engines(batch) {
        let engine = engine.as_ref();
        assert_eq!(domain_rows(engine, json!({})).await, 4);
        assert_eq!(
            domain_rows(engine, json!({"column_A": "a", "column_B": "b"})).await,
            3,
            "{}",
            engine.backend_kind()
        );
        let either = json!({"column_A": "a", "column_B": "b", "ignore_row_if": "either_value_is_missing"});
        assert_eq!(domain_rows(engine, either).await, 1);
    }
}

#[tokio::test]
async fn test_backends_agree_on_a_broad_request() {
    let batch = common::wide_batch(200);
    let metrics = vec![
        metric("table.row_count", json!({}), json!({})),
        metric("table.column_count", json!({}), json!({})),
        metric("column.sum", column("a"), json!({})),
        metric("column.null_count", column("a"), json!({})),
        metric("column.distinct_values.count", column("b"), json!({})),
        metric("column_values.length.max", column("b"), json!({})),
        metric(
            "column_values.between.unexpected_count",
            column("a"),
            json!({"min_value": 10, "max_value": 80}),
        ),
        metric(
            "column_values.match_regex.unexpected_count",
            column("b"),
            json!({"regex": "_1[0-2]$"}),
        ),
        metric("column.value_counts", column("b"), json!({"sort": "count"})),
    ];

    let mut outcomes = Vec::new();
    for engine in all_engines(batch) {
        outcomes.push(resolve_graph(engine.as_ref(), &metrics).await);
    }
    let reference = &outcomes[0];
    for outcome in &outcomes[1..] {
        for config in &metrics {
            assert_eq!(
                outcome.resolved[&config.id()],
                reference.resolved[&config.id()],
                "{}",
                config.id()
            );
        }
    }
}
