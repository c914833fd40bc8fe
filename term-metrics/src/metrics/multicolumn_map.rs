//! Row-wise rules over a list of columns.

use arrow::array::AsArray;
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use datafusion::prelude::ident;

use super::{dataframe_condition, json_literal, mask_condition, sql_condition, MapFamily};
use crate::core::{DomainType, MetricValue};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::MetricRegistry;
use crate::security::SqlSecurity;

pub(crate) fn register(registry: &MetricRegistry) -> Result<()> {
    MapFamily {
        name: "multicolumn_sum.equal",
        domain_type: DomainType::MultiColumn,
        in_process: sum_equal_in_process,
        sql: sum_equal_sql,
        dataframe: sum_equal_dataframe,
    }
    .register(registry)
}

/// Domain columns, all of which must be numeric.
fn numeric_columns<'a>(call: &ProviderCall<'a>) -> Result<Vec<&'a str>> {
    let columns = call.domain.columns();
    for column in &columns {
        let data_type = call.schema.field(call.column_index(column)?).data_type();
        if !data_type.is_numeric() {
            return Err(call.error(format!(
                "multicolumn_sum.equal requires numeric columns, \"{column}\" is {data_type}"
            )));
        }
    }
    Ok(columns)
}

fn sum_total<'c>(call: &'c ProviderCall<'_>) -> Result<&'c serde_json::Value> {
    let total = call.required_kwarg("sum_total")?;
    if !total.is_number() {
        return Err(call.configuration_error("sum_total", "expected a number"));
    }
    Ok(total)
}

fn sum_equal_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let total = sum_total(call)?
        .as_f64()
        .ok_or_else(|| call.configuration_error("sum_total", "expected a number"))?;
    let mut sums: Vec<Option<f64>> = vec![Some(0.0); call.records.num_rows()];
    for column in numeric_columns(call)? {
        let values = cast(&call.column_array(column)?, &DataType::Float64)?;
        for (sum, value) in sums.iter_mut().zip(values.as_primitive::<Float64Type>().iter()) {
            *sum = match (*sum, value) {
                (Some(s), Some(v)) => Some(s + v),
                _ => None,
            };
        }
    }
    let mask = sums.into_iter().map(|sum| sum != Some(total)).collect();
    Ok(mask_condition(call, mask))
}

fn sum_equal_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let total = SqlSecurity::escape_literal(sum_total(call)?)?;
    let columns = numeric_columns(call)?
        .into_iter()
        .map(|c| call.quoted(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(sql_condition(
        call,
        format!("({} = {total}) IS NOT TRUE", columns.join(" + ")),
    ))
}

fn sum_equal_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let total = json_literal(call, "sum_total", sum_total(call)?)?;
    let sum = numeric_columns(call)?
        .into_iter()
        .map(ident)
        .reduce(|acc, column| acc + column)
        .ok_or_else(|| call.error("column_list is empty"))?;
    Ok(dataframe_condition(call, sum.eq(total).is_not_true()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{all_engines, int_batch, metric, resolve_fully};
    use serde_json::json;

    #[tokio::test]
    async fn test_sum_equal_unexpected_count() {
        let batch = int_batch(&[
            ("a", vec![Some(1), Some(2), None, None, Some(5)]),
            ("b", vec![Some(2), Some(2), Some(3), None, Some(5)]),
            ("c", vec![Some(3), Some(2), Some(3), None, None]),
        ]);
        for engine in all_engines(batch) {
            let count = metric(
                "multicolumn_sum.equal.unexpected_count",
                json!({"column_list": ["a", "b", "c"]}),
                json!({"sum_total": 6}),
            );
            let any_missing = metric(
                "multicolumn_sum.equal.unexpected_count",
                json!({"column_list": ["a", "b", "c"], "ignore_row_if": "any_value_is_missing"}),
                json!({"sum_total": 6}),
            );
            let values = resolve_fully(engine.as_ref(), &[count.clone(), any_missing.clone()]).await;
            // row 4 is all-null and dropped; rows 3 and 5 hold a null
            assert_eq!(values[&count.id()], MetricValue::Integer(2));
            assert_eq!(values[&any_missing.id()], MetricValue::Integer(0));
        }
    }

    #[tokio::test]
    async fn test_sum_equal_requires_total() {
        let engine = crate::test_helpers::in_process_engine(int_batch(&[("a", vec![Some(1)])]));
        let condition = metric(
            "multicolumn_sum.equal.condition",
            json!({"column_list": ["a"]}),
            json!({}),
        );
        let err = crate::engine::ExecutionEngine::resolve_metrics(
            &engine,
            &[condition],
            &Default::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("sum_total"), "{err}");
    }
}
