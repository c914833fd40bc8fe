//! Unexpected-result derivatives of map metrics.
//!
//! Every map metric `<name>` gets:
//!
//! - `<name>.unexpected_count`: number of unexpected rows
//! - `<name>.unexpected_values`: domain values of unexpected rows
//! - `<name>.unexpected_rows`: full unexpected rows as records
//! - `<name>.unexpected_value_counts`: (column domains) value/count listing
//!
//! Examples are truncated according to `result_format`.

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use datafusion::functions_aggregate::expr_fn::{count, sum};
use datafusion::logical_expr::when;
use datafusion::prelude::{ident, lit, DataFrame, Expr};
use futures::future::BoxFuture;

use super::{
    concat_or_empty, count_values, quote_all, sort_value_counts, value_counts_from_batches,
    AggregateFamily,
};
use crate::core::value::records_to_rows;
use crate::core::{
    AggregateSource, DeferredAggregate, DomainType, Finalize, MetricDomain, MetricValue,
    UnexpectedCondition,
};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::{
    BackendKind, DataFrameQueryFn, DependencySpec, InProcessFn, MetricRegistry, MetricRole,
    Provider, ProviderSpec, SqlQueryFn,
};
use crate::security::SqlSecurity;

/// Registers the derivatives of the map metric `family`.
pub(crate) fn register(
    registry: &MetricRegistry,
    family: &str,
    condition_name: &str,
    domain_type: DomainType,
) -> Result<()> {
    let condition = DependencySpec::condition(condition_name);

    AggregateFamily {
        name: format!("{family}.unexpected_count"),
        domain_type,
        role: MetricRole::UnexpectedDerivative,
        dependencies: vec![condition.clone()],
        in_process: count_in_process,
        sql_partial: count_sql,
        dataframe_partial: count_dataframe,
    }
    .register(registry)?;

    let mut derivatives: Vec<(&str, InProcessFn, SqlQueryFn, DataFrameQueryFn)> = vec![
        (
            "unexpected_values",
            values_in_process as InProcessFn,
            values_sql as SqlQueryFn,
            values_dataframe as DataFrameQueryFn,
        ),
        (
            "unexpected_rows",
            rows_in_process as InProcessFn,
            rows_sql as SqlQueryFn,
            rows_dataframe as DataFrameQueryFn,
        ),
    ];
    if domain_type == DomainType::Column {
        derivatives.push((
            "unexpected_value_counts",
            value_counts_in_process as InProcessFn,
            value_counts_sql as SqlQueryFn,
            value_counts_dataframe as DataFrameQueryFn,
        ));
    }

    for (suffix, in_process, sql, dataframe) in derivatives {
        let spec = ProviderSpec::derivative(format!("{family}.{suffix}"), domain_type)
            .with_dependency(condition.clone());
        registry.register(BackendKind::InProcess, spec.clone(), Provider::InProcess(in_process))?;
        registry.register(BackendKind::Sql, spec.clone(), Provider::SqlQuery(sql))?;
        registry.register(BackendKind::DataFrame, spec, Provider::DataFrameQuery(dataframe))?;
    }
    Ok(())
}

fn mask<'c>(call: &'c ProviderCall<'_>) -> Result<(&'c RecordBatch, &'c BooleanArray)> {
    match call.condition()? {
        UnexpectedCondition::Mask {
            records,
            unexpected,
        } => Ok((records, unexpected)),
        _ => Err(call.error("expected an in-process condition mask")),
    }
}

struct SqlParts<'c> {
    relation: &'c str,
    predicate: &'c str,
    columns: &'c [String],
    domain_key: &'c str,
}

fn sql_parts<'c>(call: &'c ProviderCall<'_>) -> Result<SqlParts<'c>> {
    match call.condition()? {
        UnexpectedCondition::Sql {
            relation,
            predicate,
            columns,
            domain_key,
        } => Ok(SqlParts {
            relation,
            predicate,
            columns,
            domain_key,
        }),
        _ => Err(call.error("expected a SQL condition")),
    }
}

struct FrameParts<'c> {
    frame: &'c DataFrame,
    predicate: &'c Expr,
    columns: &'c [String],
    domain_key: &'c str,
}

fn frame_parts<'c>(call: &'c ProviderCall<'_>) -> Result<FrameParts<'c>> {
    match call.condition()? {
        UnexpectedCondition::DataFrame {
            frame,
            predicate,
            columns,
            domain_key,
        } => Ok(FrameParts {
            frame,
            predicate,
            columns,
            domain_key,
        }),
        _ => Err(call.error("expected a dataframe condition")),
    }
}

/// Values of the domain columns for each row: scalars for a column domain,
/// `[a, b]` lists for pairs and column-keyed maps for multicolumn domains.
fn domain_values(call: &ProviderCall<'_>, rows: &RecordBatch) -> Result<Vec<MetricValue>> {
    match call.domain {
        MetricDomain::Column { column } => {
            let index = rows.schema().index_of(column)?;
            MetricValue::from_column(rows.column(index).as_ref())
        }
        MetricDomain::ColumnPair {
            column_a, column_b, ..
        } => Ok(records_to_rows(rows)?
            .into_iter()
            .map(|mut row| {
                MetricValue::List(vec![
                    row.remove(column_a).unwrap_or(MetricValue::Null),
                    row.remove(column_b).unwrap_or(MetricValue::Null),
                ])
            })
            .collect()),
        MetricDomain::MultiColumn { columns, .. } => Ok(records_to_rows(rows)?
            .into_iter()
            .map(|row| {
                MetricValue::Map(
                    row.into_iter()
                        .filter(|(name, _)| columns.contains(name))
                        .collect(),
                )
            })
            .collect()),
        MetricDomain::Table => Err(call.error("unexpected values need a column domain")),
    }
}

fn truncate(rows: RecordBatch, limit: Option<usize>) -> RecordBatch {
    match limit {
        Some(n) if n < rows.num_rows() => rows.slice(0, n),
        _ => rows,
    }
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default()
}

fn count_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let (_, unexpected) = mask(call)?;
    Ok(MetricValue::Integer(unexpected.true_count() as i64))
}

fn count_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let parts = sql_parts(call)?;
    Ok(MetricValue::Deferred(DeferredAggregate {
        domain_key: parts.domain_key.to_string(),
        source: AggregateSource::Sql {
            relation: parts.relation.to_string(),
            expression: format!("SUM(CASE WHEN {} THEN 1 ELSE 0 END)", parts.predicate),
        },
        finalize: Finalize::NullAsZero,
    }))
}

fn count_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let parts = frame_parts(call)?;
    let flag = when(parts.predicate.clone(), lit(1i64)).otherwise(lit(0i64))?;
    Ok(MetricValue::Deferred(DeferredAggregate {
        domain_key: parts.domain_key.to_string(),
        source: AggregateSource::DataFrame {
            frame: parts.frame.clone(),
            expression: sum(flag),
        },
        finalize: Finalize::NullAsZero,
    }))
}

fn values_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let limit = call.result_format()?.limit();
    let (records, unexpected) = mask(call)?;
    let rows = truncate(filter_record_batch(records, unexpected)?, limit);
    Ok(MetricValue::List(domain_values(call, &rows)?))
}

fn values_sql<'a>(call: &'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = call.result_format()?.limit();
        if limit == Some(0) {
            return Ok(MetricValue::List(Vec::new()));
        }
        let parts = sql_parts(call)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}{}",
            quote_all(&call.domain.columns())?,
            parts.relation,
            parts.predicate,
            limit_clause(limit)
        );
        let mut values = Vec::new();
        for batch in call.query(&sql).await? {
            values.extend(domain_values(call, &batch)?);
        }
        Ok(MetricValue::List(values))
    })
}

fn values_dataframe<'a>(call: &'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = call.result_format()?.limit();
        if limit == Some(0) {
            return Ok(MetricValue::List(Vec::new()));
        }
        let parts = frame_parts(call)?;
        let columns: Vec<Expr> = call.domain.columns().into_iter().map(ident).collect();
        let frame = parts
            .frame
            .clone()
            .filter(parts.predicate.clone())?
            .select(columns)?
            .limit(0, limit)?;
        let mut values = Vec::new();
        for batch in call.collect(frame).await? {
            values.extend(domain_values(call, &batch)?);
        }
        Ok(MetricValue::List(values))
    })
}

fn rows_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let limit = call.result_format()?.limit();
    let (records, unexpected) = mask(call)?;
    Ok(MetricValue::Records(truncate(
        filter_record_batch(records, unexpected)?,
        limit,
    )))
}

fn rows_sql<'a>(call: &'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = call.result_format()?.limit();
        if limit == Some(0) {
            return Ok(MetricValue::Records(RecordBatch::new_empty(call.schema.clone())));
        }
        let parts = sql_parts(call)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}{}",
            quote_all(parts.columns)?,
            parts.relation,
            parts.predicate,
            limit_clause(limit)
        );
        let batches = call.query(&sql).await?;
        Ok(MetricValue::Records(concat_or_empty(&batches, call.schema.clone())?))
    })
}

fn rows_dataframe<'a>(call: &'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = call.result_format()?.limit();
        if limit == Some(0) {
            return Ok(MetricValue::Records(RecordBatch::new_empty(call.schema.clone())));
        }
        let parts = frame_parts(call)?;
        let columns: Vec<Expr> = parts.columns.iter().map(ident).collect();
        let frame = parts
            .frame
            .clone()
            .filter(parts.predicate.clone())?
            .select(columns)?
            .limit(0, limit)?;
        let batches = call.collect(frame).await?;
        Ok(MetricValue::Records(concat_or_empty(&batches, call.schema.clone())?))
    })
}

fn value_counts_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let limit = call.result_format()?.limit();
    let (records, unexpected) = mask(call)?;
    let column = call.column()?;
    let index = records.schema().index_of(column)?;
    let mut counts = count_values(records.column(index).as_ref(), Some(unexpected), true)?;
    sort_value_counts(&mut counts, true);
    if let Some(n) = limit {
        counts.truncate(n);
    }
    Ok(MetricValue::ValueCounts(counts))
}

fn value_counts_sql<'a>(call: &'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = call.result_format()?.limit();
        if limit == Some(0) {
            return Ok(MetricValue::ValueCounts(Vec::new()));
        }
        let parts = sql_parts(call)?;
        let column = SqlSecurity::escape_identifier(call.column()?)?;
        let sql = format!(
            "SELECT {column} AS \"value\", COUNT(*) AS \"count\" FROM {} WHERE {} \
             GROUP BY {column} ORDER BY \"count\" DESC, \"value\" ASC NULLS LAST{}",
            parts.relation,
            parts.predicate,
            limit_clause(limit)
        );
        let mut counts = value_counts_from_batches(&call.query(&sql).await?)?;
        sort_value_counts(&mut counts, true);
        Ok(MetricValue::ValueCounts(counts))
    })
}

fn value_counts_dataframe<'a>(call: &'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let limit = call.result_format()?.limit();
        if limit == Some(0) {
            return Ok(MetricValue::ValueCounts(Vec::new()));
        }
        let parts = frame_parts(call)?;
        let frame = parts
            .frame
            .clone()
            .filter(parts.predicate.clone())?
            .aggregate(
                vec![ident(call.column()?).alias("value")],
                vec![count(lit(1i64)).alias("count")],
            )?
            .sort(vec![
                ident("count").sort(false, false),
                ident("value").sort(true, false),
            ])?
            .limit(0, limit)?;
        let mut counts = value_counts_from_batches(&call.collect(frame).await?)?;
        sort_value_counts(&mut counts, true);
        Ok(MetricValue::ValueCounts(counts))
    })
}
