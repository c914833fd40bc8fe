//! Table-level metrics.

use datafusion::functions_aggregate::expr_fn::count;
use datafusion::prelude::lit;
use futures::future::BoxFuture;

use super::{concat_or_empty, dataframe_aggregate, sql_aggregate, AggregateFamily};
use crate::core::{DomainType, Finalize, MetricValue};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::{
    BackendKind, DependencySpec, DomainPolicy, MetricRegistry, Provider, ProviderSpec, ValuePolicy,
};

const DEFAULT_HEAD_ROWS: usize = 5;

pub(crate) fn register(registry: &MetricRegistry) -> Result<()> {
    AggregateFamily::direct(
        "table.row_count",
        DomainType::Table,
        row_count_in_process,
        row_count_sql,
        row_count_dataframe,
    )
    .register(registry)?;

    registry.register_derived(
        ProviderSpec::direct("table.columns", DomainType::Table),
        columns,
    )?;
    registry.register_derived(
        ProviderSpec::direct("table.column_types", DomainType::Table),
        column_types,
    )?;
    registry.register_derived(
        ProviderSpec::direct("table.column_count", DomainType::Table).with_dependency(
            DependencySpec::implicit("table.columns")
                .with_domain(DomainPolicy::Table)
                .with_values(ValuePolicy::Empty),
        ),
        column_count,
    )?;

    let head = ProviderSpec::direct("table.head", DomainType::Table);
    registry.register(BackendKind::InProcess, head.clone(), Provider::InProcess(head_in_process))?;
    registry.register(BackendKind::Sql, head.clone(), Provider::SqlQuery(head_sql))?;
    registry.register(BackendKind::DataFrame, head, Provider::DataFrameQuery(head_dataframe))?;
    Ok(())
}

fn row_count_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::Integer(call.records.num_rows() as i64))
}

fn row_count_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    Ok(sql_aggregate(call, "COUNT(*)".to_string(), Finalize::NullAsZero))
}

fn row_count_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, count(lit(1i64)), Finalize::NullAsZero))
}

fn columns(call: &ProviderCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::List(
        call.schema_columns()
            .into_iter()
            .map(MetricValue::String)
            .collect(),
    ))
}

fn column_types(call: &ProviderCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::List(
        call.schema
            .fields()
            .iter()
            .map(|field| {
                MetricValue::Map(
                    [
                        ("name".to_string(), MetricValue::from(field.name().as_str())),
                        ("type".to_string(), MetricValue::String(field.data_type().to_string())),
                        ("nullable".to_string(), MetricValue::Boolean(field.is_nullable())),
                    ]
                    .into_iter()
                    .collect(),
                )
            })
            .collect(),
    ))
}

fn column_count(call: &ProviderCall<'_>) -> Result<MetricValue> {
    let columns = call
        .dependency("table.columns")?
        .as_list()
        .ok_or_else(|| call.error("table.columns is not a list"))?;
    Ok(MetricValue::Integer(columns.len() as i64))
}

/// Rows to fetch for `table.head`; `None` when `fetch_all` is set.
fn head_rows(call: &ProviderCall<'_>) -> Result<Option<usize>> {
    if call.kwarg_bool("fetch_all", false)? {
        return Ok(None);
    }
    Ok(Some(call.kwarg_usize("n_rows", DEFAULT_HEAD_ROWS)?))
}

fn head_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let records = &call.records;
    let rows = match head_rows(call)? {
        Some(n) => records.slice(0, n.min(records.num_rows())),
        None => records.clone(),
    };
    Ok(MetricValue::Records(rows))
}

fn head_sql<'a>(call: &'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = head_rows(call)?
            .map(|n| format!(" LIMIT {n}"))
            .unwrap_or_default();
        let batches = call
            .query(&format!("SELECT * FROM {}{limit}", call.relation))
            .await?;
        Ok(MetricValue::Records(concat_or_empty(&batches, call.schema.clone())?))
    })
}

fn head_dataframe<'a>(call: &'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let frame = call.frame.clone().limit(0, head_rows(call)?)?;
        let batches = call.collect(frame).await?;
        Ok(MetricValue::Records(concat_or_empty(&batches, call.schema.clone())?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricsMap;
    use crate::engine::ExecutionEngine;
    use crate::test_helpers::{in_process_engine, metric, mixed_batch};
    use arrow::array::Array;
    use serde_json::json;

    #[tokio::test]
    async fn test_table_metrics_in_process() {
        let engine = in_process_engine(mixed_batch());
        let row_count = metric("table.row_count", json!({}), json!({}));
        let column_count = metric("table.column_count", json!({}), json!({}));
        let types = metric("table.column_types", json!({}), json!({}));
        let head = metric("table.head", json!({}), json!({"n_rows": 2}));

        let resolution = engine
            .resolve_metrics(
                &[row_count.clone(), column_count.clone(), types.clone(), head.clone()],
                &MetricsMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(resolution.value(&row_count).unwrap(), &MetricValue::Integer(4));
        assert_eq!(resolution.value(&column_count).unwrap(), &MetricValue::Integer(3));
        let types = resolution.value(&types).unwrap().to_json();
        assert_eq!(types[1]["name"], json!("name"));
        assert_eq!(types[1]["type"], json!("Utf8"));
        let head = resolution.value(&head).unwrap().as_records().unwrap().clone();
        assert_eq!(head.num_rows(), 2);
        assert_eq!(head.column(0).len(), 2);
    }

    #[tokio::test]
    async fn test_head_fetch_all() {
        let engine = in_process_engine(mixed_batch());
        let head = metric("table.head", json!({}), json!({"fetch_all": true}));
        let resolution = engine
            .resolve_metrics(&[head.clone()], &MetricsMap::new())
            .await
            .unwrap();
        assert_eq!(
            resolution.value(&head).unwrap().as_records().unwrap().num_rows(),
            4
        );
    }

    #[tokio::test]
    async fn test_table_metric_rejects_column_domain() {
        let engine = in_process_engine(mixed_batch());
        let row_count = metric("table.row_count", json!({"column": "id"}), json!({}));
        let err = engine
            .resolve_metrics(&[row_count], &MetricsMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected a table domain"));
    }
}
