//! Single-column aggregates. Nulls are excluded everywhere.

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use datafusion::functions::expr_fn::character_length;
use datafusion::functions_aggregate::expr_fn::{avg, count, count_distinct, max, min, stddev, sum};
use datafusion::logical_expr::expr_fn::cast as cast_expr;
use datafusion::logical_expr::when;
use datafusion::prelude::{ident, lit, Expr};

use super::{compare_values, count_values, dataframe_aggregate, sql_aggregate, AggregateFamily};
use crate::core::{DomainType, Finalize, MetricValue};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::{DataFramePlanFn, InProcessFn, MetricRegistry, SqlPlanFn};

pub(crate) fn register(registry: &MetricRegistry) -> Result<()> {
    let family = |name: &str, in_process: InProcessFn, sql: SqlPlanFn, dataframe: DataFramePlanFn| {
        AggregateFamily::direct(name, DomainType::Column, in_process, sql, dataframe)
            .register(registry)
    };
    family("column.min", min_in_process, min_sql, min_dataframe)?;
    family("column.max", max_in_process, max_sql, max_dataframe)?;
    family("column.sum", sum_in_process, sum_sql, sum_dataframe)?;
    family("column.mean", mean_in_process, mean_sql, mean_dataframe)?;
    family(
        "column.standard_deviation",
        stddev_in_process,
        stddev_sql,
        stddev_dataframe,
    )?;
    family(
        "column.null_count",
        null_count_in_process,
        null_count_sql,
        null_count_dataframe,
    )?;
    family(
        "column.nonnull_count",
        nonnull_count_in_process,
        nonnull_count_sql,
        nonnull_count_dataframe,
    )?;
    family(
        "column.distinct_values.count",
        distinct_count_in_process,
        distinct_count_sql,
        distinct_count_dataframe,
    )?;
    family(
        "column_values.length.min",
        length_min_in_process,
        length_min_sql,
        length_min_dataframe,
    )?;
    family(
        "column_values.length.max",
        length_max_in_process,
        length_max_sql,
        length_max_dataframe,
    )
}

/// The domain column, rejected unless its type is numeric.
pub(crate) fn numeric_column<'a>(call: &ProviderCall<'a>) -> Result<&'a str> {
    let column = call.column()?;
    let data_type = call.schema.field(call.column_index(column)?).data_type().clone();
    if !data_type.is_numeric() {
        return Err(call.error(format!(
            "{} requires a numeric column, \"{column}\" is {data_type}",
            call.metric_name()
        )));
    }
    Ok(column)
}

fn quoted_column(call: &SqlCall<'_>) -> Result<String> {
    call.quoted(call.column()?)
}

fn quoted_numeric(call: &SqlCall<'_>) -> Result<String> {
    call.quoted(numeric_column(call)?)
}

fn column_expr(call: &DataFrameCall<'_>) -> Result<Expr> {
    Ok(ident(call.column()?))
}

fn numeric_expr(call: &DataFrameCall<'_>) -> Result<Expr> {
    Ok(ident(numeric_column(call)?))
}

/// Non-null values of the domain column as f64.
fn float_values(call: &InProcessCall<'_>) -> Result<Vec<f64>> {
    numeric_column(call)?;
    let array = cast(&call.domain_column()?, &DataType::Float64)?;
    Ok(array.as_primitive::<Float64Type>().iter().flatten().collect())
}

/// Character lengths of the non-null values, rendered as text.
fn lengths(call: &InProcessCall<'_>) -> Result<Vec<i64>> {
    let array: ArrayRef = cast(&call.domain_column()?, &DataType::Utf8)?;
    Ok(array
        .as_string::<i32>()
        .iter()
        .flatten()
        .map(|s| s.chars().count() as i64)
        .collect())
}

fn extreme(call: &InProcessCall<'_>, keep_max: bool) -> Result<MetricValue> {
    let array = call.domain_column()?;
    let mut best: Option<MetricValue> = None;
    for value in MetricValue::from_column(array.as_ref())? {
        if value.is_null() {
            continue;
        }
        best = match best {
            None => Some(value),
            Some(current) => {
                let replace = match compare_values(&value, &current) {
                    std::cmp::Ordering::Greater => keep_max,
                    std::cmp::Ordering::Less => !keep_max,
                    std::cmp::Ordering::Equal => false,
                };
                Some(if replace { value } else { current })
            }
        };
    }
    Ok(best.unwrap_or(MetricValue::Null))
}

fn min_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    extreme(call, false)
}

fn min_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_column(call)?;
    Ok(sql_aggregate(call, format!("MIN({column})"), Finalize::Raw))
}

fn min_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, min(column_expr(call)?), Finalize::Raw))
}

fn max_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    extreme(call, true)
}

fn max_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_column(call)?;
    Ok(sql_aggregate(call, format!("MAX({column})"), Finalize::Raw))
}

fn max_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, max(column_expr(call)?), Finalize::Raw))
}

fn sum_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let column = numeric_column(call)?;
    let array = call.column_array(column)?;
    if array.data_type().is_integer() {
        let ints = cast(&array, &DataType::Int64)?;
        let total = arrow::compute::sum(ints.as_primitive::<Int64Type>());
        return Ok(total.into());
    }
    let floats = cast(&array, &DataType::Float64)?;
    Ok(arrow::compute::sum(floats.as_primitive::<Float64Type>()).into())
}

fn sum_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_numeric(call)?;
    Ok(sql_aggregate(call, format!("SUM({column})"), Finalize::Raw))
}

fn sum_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, sum(numeric_expr(call)?), Finalize::Raw))
}

fn mean_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let values = float_values(call)?;
    if values.is_empty() {
        return Ok(MetricValue::Null);
    }
    Ok(MetricValue::Float(values.iter().sum::<f64>() / values.len() as f64))
}

fn mean_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_numeric(call)?;
    Ok(sql_aggregate(call, format!("AVG({column})"), Finalize::Float))
}

fn mean_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, avg(numeric_expr(call)?), Finalize::Float))
}

/// Sample standard deviation; fewer than two values yield null.
pub(crate) fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

fn stddev_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    Ok(sample_stddev(&float_values(call)?).into())
}

fn stddev_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_numeric(call)?;
    Ok(sql_aggregate(call, format!("STDDEV({column})"), Finalize::Float))
}

fn stddev_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, stddev(numeric_expr(call)?), Finalize::Float))
}

fn null_count_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    Ok(MetricValue::Integer(call.domain_column()?.null_count() as i64))
}

fn null_count_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_column(call)?;
    Ok(sql_aggregate(
        call,
        format!("SUM(CASE WHEN {column} IS NULL THEN 1 ELSE 0 END)"),
        Finalize::NullAsZero,
    ))
}

fn null_count_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let flag = when(column_expr(call)?.is_null(), lit(1i64)).otherwise(lit(0i64))?;
    Ok(dataframe_aggregate(call, sum(flag), Finalize::NullAsZero))
}

fn nonnull_count_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let array = call.domain_column()?;
    Ok(MetricValue::Integer((array.len() - array.null_count()) as i64))
}

fn nonnull_count_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_column(call)?;
    Ok(sql_aggregate(call, format!("COUNT({column})"), Finalize::NullAsZero))
}

fn nonnull_count_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, count(column_expr(call)?), Finalize::NullAsZero))
}

fn distinct_count_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let array = call.domain_column()?;
    Ok(MetricValue::Integer(
        count_values(array.as_ref(), None, false)?.len() as i64,
    ))
}

fn distinct_count_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = quoted_column(call)?;
    Ok(sql_aggregate(
        call,
        format!("COUNT(DISTINCT {column})"),
        Finalize::NullAsZero,
    ))
}

fn distinct_count_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(
        call,
        count_distinct(column_expr(call)?),
        Finalize::NullAsZero,
    ))
}

fn length_expr_sql(call: &SqlCall<'_>) -> Result<String> {
    Ok(format!("CHARACTER_LENGTH(CAST({} AS VARCHAR))", quoted_column(call)?))
}

fn length_expr(call: &DataFrameCall<'_>) -> Result<Expr> {
    Ok(character_length(cast_expr(column_expr(call)?, DataType::Utf8)))
}

fn length_min_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    Ok(lengths(call)?.into_iter().min().into())
}

fn length_min_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let length = length_expr_sql(call)?;
    Ok(sql_aggregate(call, format!("MIN({length})"), Finalize::Raw))
}

fn length_min_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, min(length_expr(call)?), Finalize::Raw))
}

fn length_max_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    Ok(lengths(call)?.into_iter().max().into())
}

fn length_max_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let length = length_expr_sql(call)?;
    Ok(sql_aggregate(call, format!("MAX({length})"), Finalize::Raw))
}

fn length_max_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_aggregate(call, max(length_expr(call)?), Finalize::Raw))
}
