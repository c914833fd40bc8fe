//! Row-wise comparisons between two columns.
//!
//! Rows left after `ignore_row_if` that still hold a null compare as "not
//! true" and are unexpected.

use datafusion::prelude::{ident, Expr};

use super::{dataframe_condition, mask_condition, sql_condition, MapFamily};
use crate::core::{DomainType, MetricDomain, MetricValue};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::MetricRegistry;

pub(crate) fn register(registry: &MetricRegistry) -> Result<()> {
    MapFamily {
        name: "column_pair_values.equal",
        domain_type: DomainType::ColumnPair,
        in_process: equal_in_process,
        sql: equal_sql,
        dataframe: equal_dataframe,
    }
    .register(registry)?;
    MapFamily {
        name: "column_pair_values.a_greater_than_b",
        domain_type: DomainType::ColumnPair,
        in_process: greater_in_process,
        sql: greater_sql,
        dataframe: greater_dataframe,
    }
    .register(registry)
}

fn pair<'a>(call: &ProviderCall<'a>) -> Result<(&'a str, &'a str)> {
    match call.domain {
        MetricDomain::ColumnPair {
            column_a, column_b, ..
        } => Ok((column_a.as_str(), column_b.as_str())),
        other => Err(call.error(format!(
            "a column pair domain is required, got {}",
            other.domain_type()
        ))),
    }
}

/// Builds a mask from `expected(a, b)`; rows with a null are unexpected.
fn pair_mask<F>(call: &InProcessCall<'_>, mut expected: F) -> Result<MetricValue>
where
    F: FnMut(&MetricValue, &MetricValue) -> Result<bool>,
{
    let (a, b) = pair(call)?;
    let a = MetricValue::from_column(call.column_array(a)?.as_ref())?;
    let b = MetricValue::from_column(call.column_array(b)?.as_ref())?;
    let mut mask = Vec::with_capacity(a.len());
    for (a, b) in a.iter().zip(&b) {
        mask.push(a.is_null() || b.is_null() || !expected(a, b)?);
    }
    Ok(mask_condition(call, mask))
}

fn quoted_pair(call: &SqlCall<'_>) -> Result<(String, String)> {
    let (a, b) = pair(call)?;
    Ok((call.quoted(a)?, call.quoted(b)?))
}

fn pair_exprs(call: &DataFrameCall<'_>) -> Result<(Expr, Expr)> {
    let (a, b) = pair(call)?;
    Ok((ident(a), ident(b)))
}

fn equal_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    pair_mask(call, |a, b| Ok(a == b))
}

fn equal_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let (a, b) = quoted_pair(call)?;
    Ok(sql_condition(call, format!("({a} = {b}) IS NOT TRUE")))
}

fn equal_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let (a, b) = pair_exprs(call)?;
    Ok(dataframe_condition(call, a.eq(b).is_not_true()))
}

fn greater_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let or_equal = call.kwarg_bool("or_equal", false)?;
    pair_mask(call, |a, b| {
        let ordering = a.compare(b).ok_or_else(|| {
            call.error(format!(
                "cannot compare {} with {}",
                a.to_string_pretty(),
                b.to_string_pretty()
            ))
        })?;
        Ok(ordering.is_gt() || (or_equal && ordering.is_eq()))
    })
}

fn greater_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let (a, b) = quoted_pair(call)?;
    let op = if call.kwarg_bool("or_equal", false)? { ">=" } else { ">" };
    Ok(sql_condition(call, format!("({a} {op} {b}) IS NOT TRUE")))
}

fn greater_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let (a, b) = pair_exprs(call)?;
    let check = if call.kwarg_bool("or_equal", false)? {
        a.gt_eq(b)
    } else {
        a.gt(b)
    };
    Ok(dataframe_condition(call, check.is_not_true()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{all_engines, int_batch, metric, resolve_fully};
    use serde_json::json;

    fn batch() -> arrow::record_batch::RecordBatch {
        int_batch(&[
            ("a", vec![Some(1), Some(2), None, Some(4), None]),
            ("b", vec![Some(1), Some(1), Some(3), Some(5), None]),
        ])
    }

    #[tokio::test]
    async fn test_pair_unexpected_counts() {
        let cases = [
            ("column_pair_values.equal", json!({}), json!({}), 3),
            (
                "column_pair_values.equal",
                json!({"ignore_row_if": "either_value_is_missing"}),
                json!({}),
                2,
            ),
            ("column_pair_values.a_greater_than_b", json!({}), json!({}), 3),
            (
                "column_pair_values.a_greater_than_b",
                json!({}),
                json!({"or_equal": true}),
                2,
            ),
        ];
        for engine in all_engines(batch()) {
            for (rule, extra_domain, value, expected) in &cases {
                let mut domain = json!({"column_A": "a", "column_B": "b"});
                if let (Some(domain), Some(extra)) = (domain.as_object_mut(), extra_domain.as_object()) {
                    domain.extend(extra.clone());
                }
                let count = metric(&format!("{rule}.unexpected_count"), domain, value.clone());
                let values = resolve_fully(engine.as_ref(), &[count.clone()]).await;
                assert_eq!(
                    values[&count.id()],
                    MetricValue::Integer(*expected),
                    "{rule} {extra_domain} {value} on {}",
                    engine.backend_kind()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_pair_unexpected_values_are_pairs() {
        for engine in all_engines(batch()) {
            let values = metric(
                "column_pair_values.equal.unexpected_values",
                json!({"column_A": "a", "column_B": "b", "ignore_row_if": "either_value_is_missing"}),
                json!({"result_format": "COMPLETE"}),
            );
            let resolved = resolve_fully(engine.as_ref(), &[values.clone()]).await;
            let mut pairs: Vec<String> = resolved[&values.id()]
                .as_list()
                .unwrap()
                .iter()
                .map(|pair| pair.to_json().to_string())
                .collect();
            pairs.sort();
            assert_eq!(pairs, vec!["[2,1]", "[4,5]"]);
        }
    }
}
