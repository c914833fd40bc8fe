//! Value listings and binned distributions of a single column.

use arrow::array::AsArray;
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use datafusion::functions_aggregate::expr_fn::{count, sum};
use datafusion::logical_expr::when;
use datafusion::prelude::{ident, lit, Expr};
use futures::future::BoxFuture;
use serde_json::Value;

use super::column_aggregate::numeric_column;
use super::{count_values, sort_value_counts, value_counts_from_batches};
use crate::core::value::single_row_values;
use crate::core::{DomainType, Finalize, MetricValue, ValueCount};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::{
    BackendKind, DependencySpec, MetricRegistry, Provider, ProviderSpec, ValuePolicy,
};

const DEFAULT_PARTITION_BINS: usize = 10;

pub(crate) fn register(registry: &MetricRegistry) -> Result<()> {
    let value_counts = ProviderSpec::direct("column.value_counts", DomainType::Column);
    registry.register(
        BackendKind::InProcess,
        value_counts.clone(),
        Provider::InProcess(value_counts_in_process),
    )?;
    registry.register(
        BackendKind::Sql,
        value_counts.clone(),
        Provider::SqlQuery(value_counts_sql),
    )?;
    registry.register(
        BackendKind::DataFrame,
        value_counts,
        Provider::DataFrameQuery(value_counts_dataframe),
    )?;

    registry.register_derived(
        ProviderSpec::direct("column.distinct_values", DomainType::Column).with_dependency(
            DependencySpec::implicit("column.value_counts").with_values(ValuePolicy::Empty),
        ),
        distinct_values,
    )?;

    let histogram = ProviderSpec::direct("column.histogram", DomainType::Column);
    registry.register(
        BackendKind::InProcess,
        histogram.clone(),
        Provider::InProcess(histogram_in_process),
    )?;
    registry.register(BackendKind::Sql, histogram.clone(), Provider::SqlQuery(histogram_sql))?;
    registry.register(
        BackendKind::DataFrame,
        histogram,
        Provider::DataFrameQuery(histogram_dataframe),
    )?;

    registry.register_derived(
        ProviderSpec::direct("column.partition", DomainType::Column)
            .with_dependency(DependencySpec::implicit("column.min").with_values(ValuePolicy::Empty))
            .with_dependency(DependencySpec::implicit("column.max").with_values(ValuePolicy::Empty)),
        partition,
    )
}

/// `sort` kwarg: `true` when ordering by count.
fn sort_by_count(call: &ProviderCall<'_>) -> Result<bool> {
    match call.kwarg_str("sort")? {
        None | Some("value") => Ok(false),
        Some("count") => Ok(true),
        Some(other) => Err(call.configuration_error(
            "sort",
            format!("expected \"value\" or \"count\", got \"{other}\""),
        )),
    }
}

fn sorted(call: &ProviderCall<'_>, mut counts: Vec<ValueCount>) -> Result<MetricValue> {
    sort_value_counts(&mut counts, sort_by_count(call)?);
    Ok(MetricValue::ValueCounts(counts))
}

fn value_counts_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let array = call.domain_column()?;
    sorted(call, count_values(array.as_ref(), None, false)?)
}

fn value_counts_sql<'a>(call: &'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        sort_by_count(call)?;
        let column = call.quoted(call.column()?)?;
        let sql = format!(
            "SELECT {column} AS \"value\", COUNT(*) AS \"count\" FROM {} \
             WHERE {column} IS NOT NULL GROUP BY {column}",
            call.relation
        );
        let counts = value_counts_from_batches(&call.query(&sql).await?)?;
        sorted(call, counts)
    })
}

fn value_counts_dataframe<'a>(call: &'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        sort_by_count(call)?;
        let column = call.column()?;
        let frame = call
            .frame
            .clone()
            .filter(ident(column).is_not_null())?
            .aggregate(
                vec![ident(column).alias("value")],
                vec![count(lit(1i64)).alias("count")],
            )?;
        let counts = value_counts_from_batches(&call.collect(frame).await?)?;
        sorted(call, counts)
    })
}

fn distinct_values(call: &ProviderCall<'_>) -> Result<MetricValue> {
    let counts = call
        .dependency("column.value_counts")?
        .as_value_counts()
        .ok_or_else(|| call.error("column.value_counts is not a value-count listing"))?;
    let mut counts = counts.to_vec();
    sort_value_counts(&mut counts, false);
    Ok(MetricValue::List(
        counts.into_iter().map(|vc| vc.value).collect(),
    ))
}

/// Ascending, finite bin edges from the `bins` kwarg.
fn bin_edges(call: &ProviderCall<'_>) -> Result<Vec<f64>> {
    let edges = call
        .kwarg_list("bins")?
        .iter()
        .map(|edge| match edge {
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
            _ => None,
        })
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| call.configuration_error("bins", "edges must be finite numbers"))?;
    if edges.len() < 2 {
        return Err(call.configuration_error("bins", "at least two edges are required"));
    }
    if edges.windows(2).any(|w| w[0] >= w[1]) {
        return Err(call.configuration_error("bins", "edges must be strictly increasing"));
    }
    Ok(edges)
}

/// Bin of `value`: half-open `[lo, hi)` except the last, which is closed.
pub(crate) fn bin_index(edges: &[f64], value: f64) -> Option<usize> {
    let last = *edges.last()?;
    if value < edges[0] || value > last {
        return None;
    }
    if value == last {
        return Some(edges.len() - 2);
    }
    Some(edges.partition_point(|edge| *edge <= value) - 1)
}

fn histogram_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let edges = bin_edges(call)?;
    numeric_column(call)?;
    let array = cast(&call.domain_column()?, &DataType::Float64)?;
    let mut counts = vec![0i64; edges.len() - 1];
    for value in array.as_primitive::<Float64Type>().iter().flatten() {
        if let Some(bin) = bin_index(&edges, value) {
            counts[bin] += 1;
        }
    }
    Ok(MetricValue::List(
        counts.into_iter().map(MetricValue::Integer).collect(),
    ))
}

fn histogram_counts(raw: Vec<MetricValue>) -> MetricValue {
    MetricValue::List(
        raw.into_iter()
            .map(|count| Finalize::NullAsZero.apply(count))
            .collect(),
    )
}

fn histogram_sql<'a>(call: &'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let edges = bin_edges(call)?;
        let column = call.quoted(numeric_column(call)?)?;
        let last = edges.len() - 2;
        let bins = edges
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let upper = if i == last { "<=" } else { "<" };
                format!(
                    "SUM(CASE WHEN {column} >= {:?} AND {column} {upper} {:?} THEN 1 ELSE 0 END) AS \"bin_{i}\"",
                    w[0], w[1]
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let batches = call
            .query(&format!("SELECT {bins} FROM {}", call.relation))
            .await?;
        Ok(histogram_counts(single_row_values(&batches)?))
    })
}

fn histogram_dataframe<'a>(call: &'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>> {
    Box::pin(async move {
        let edges = bin_edges(call)?;
        let column = numeric_column(call)?;
        let last = edges.len() - 2;
        let mut bins: Vec<Expr> = Vec::with_capacity(last + 1);
        for (i, w) in edges.windows(2).enumerate() {
            let value = ident(column);
            let upper = if i == last {
                value.clone().lt_eq(lit(w[1]))
            } else {
                value.clone().lt(lit(w[1]))
            };
            let flag = when(value.gt_eq(lit(w[0])).and(upper), lit(1i64)).otherwise(lit(0i64))?;
            bins.push(sum(flag).alias(format!("bin_{i}")));
        }
        let frame = call.frame.clone().aggregate(vec![], bins)?;
        let batches = call.collect(frame).await?;
        Ok(histogram_counts(single_row_values(&batches)?))
    })
}

/// Evenly spaced edges from `min` to `max`.
pub(crate) fn uniform_edges(min: f64, max: f64, n_bins: usize) -> Vec<f64> {
    let step = (max - min) / n_bins as f64;
    (0..=n_bins)
        .map(|i| if i == n_bins { max } else { min + step * i as f64 })
        .collect()
}

fn partition(call: &ProviderCall<'_>) -> Result<MetricValue> {
    match call.kwarg_str("bins")? {
        None | Some("uniform") => {}
        Some(other) => {
            return Err(call.configuration_error(
                "bins",
                format!("only \"uniform\" partitions are supported, got \"{other}\""),
            ))
        }
    }
    let n_bins = call.kwarg_usize("n_bins", DEFAULT_PARTITION_BINS)?;
    if n_bins == 0 {
        return Err(call.configuration_error("n_bins", "must be at least 1"));
    }

    let min = call.dependency("column.min")?;
    let max = call.dependency("column.max")?;
    if min.is_null() || max.is_null() {
        return Ok(MetricValue::List(Vec::new()));
    }
    let (Some(min), Some(max)) = (min.as_f64(), max.as_f64()) else {
        return Err(call.error("column.partition requires numeric column.min and column.max"));
    };
    Ok(MetricValue::List(
        uniform_edges(min, max, n_bins)
            .into_iter()
            .map(MetricValue::Float)
            .collect(),
    ))
}
