//! Row-wise rules over a single column.
//!
//! Nulls are never unexpected, except for `column_values.nonnull` whose whole
//! point is to flag them.

use std::collections::HashMap;

use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use datafusion::functions_aggregate::expr_fn::count;
use datafusion::logical_expr::{binary_expr, Operator};
use datafusion::logical_expr::expr_fn::cast as cast_expr;
use datafusion::prelude::{ident, lit, Expr, JoinType};
use datafusion::scalar::ScalarValue;
use regex::Regex;
use serde_json::Value;

use super::{
    column_mask, dataframe_condition, json_literal, mask_condition, sql_condition, MapFamily,
};
use crate::core::{DomainType, MetricValue, UnexpectedCondition};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::Result;
use crate::registry::MetricRegistry;
use crate::security::SqlSecurity;

const DUP_COUNT: &str = "__term_dup_count";
const UNIQUE_ALIAS: &str = "__term_unique";
const UNIQUE_VALUE: &str = "__term_value";

pub(crate) fn register(registry: &MetricRegistry) -> Result<()> {
    let families = [
        MapFamily {
            name: "column_values.nonnull",
            domain_type: DomainType::Column,
            in_process: nonnull_in_process,
            sql: nonnull_sql,
            dataframe: nonnull_dataframe,
        },
        MapFamily {
            name: "column_values.in_set",
            domain_type: DomainType::Column,
            in_process: in_set_in_process,
            sql: in_set_sql,
            dataframe: in_set_dataframe,
        },
        MapFamily {
            name: "column_values.between",
            domain_type: DomainType::Column,
            in_process: between_in_process,
            sql: between_sql,
            dataframe: between_dataframe,
        },
        MapFamily {
            name: "column_values.match_regex",
            domain_type: DomainType::Column,
            in_process: regex_in_process,
            sql: regex_sql,
            dataframe: regex_dataframe,
        },
        MapFamily {
            name: "column_values.unique",
            domain_type: DomainType::Column,
            in_process: unique_in_process,
            sql: unique_sql,
            dataframe: unique_dataframe,
        },
    ];
    for family in families {
        family.register(registry)?;
    }
    Ok(())
}

fn nonnull_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let array = call.domain_column()?;
    let mask = (0..array.len()).map(|row| array.is_null(row)).collect();
    Ok(mask_condition(call, mask))
}

fn nonnull_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = call.quoted(call.column()?)?;
    Ok(sql_condition(call, format!("{column} IS NULL")))
}

fn nonnull_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    Ok(dataframe_condition(call, ident(call.column()?).is_null()))
}

/// Non-null entries of `value_set`.
fn value_set<'c>(call: &'c ProviderCall<'_>) -> Result<Vec<&'c Value>> {
    Ok(call
        .kwarg_list("value_set")?
        .iter()
        .filter(|v| !v.is_null())
        .collect())
}

fn in_set_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let allowed: Vec<MetricValue> = value_set(call)?
        .into_iter()
        .map(MetricValue::from_json)
        .collect();
    column_mask(call, |value| Ok(!allowed.contains(value)))
}

fn in_set_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = call.quoted(call.column()?)?;
    let set = value_set(call)?;
    if set.is_empty() {
        return Ok(sql_condition(call, format!("{column} IS NOT NULL")));
    }
    let literals = set
        .into_iter()
        .map(SqlSecurity::escape_literal)
        .collect::<Result<Vec<_>>>()?;
    Ok(sql_condition(
        call,
        format!("{column} NOT IN ({})", literals.join(", ")),
    ))
}

fn in_set_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let column = ident(call.column()?);
    let set = value_set(call)?;
    if set.is_empty() {
        return Ok(dataframe_condition(call, column.is_not_null()));
    }
    let literals = set
        .into_iter()
        .map(|v| json_literal(call, "value_set", v))
        .collect::<Result<Vec<_>>>()?;
    Ok(dataframe_condition(call, column.in_list(literals, true)))
}

struct Bound<'c> {
    value: &'c Value,
    strict: bool,
}

struct Bounds<'c> {
    min: Option<Bound<'c>>,
    max: Option<Bound<'c>>,
}

fn bounds<'c>(call: &'c ProviderCall<'_>) -> Result<Bounds<'c>> {
    let min = call.kwarg("min_value");
    let max = call.kwarg("max_value");
    if min.is_none() && max.is_none() {
        return Err(call.configuration_error(
            "min_value",
            "min_value and max_value cannot both be missing",
        ));
    }
    Ok(Bounds {
        min: min.map(|value| Bound {
            value,
            strict: false,
        }),
        max: max.map(|value| Bound {
            value,
            strict: false,
        }),
    }
    .with_strictness(
        call.kwarg_bool("strict_min", false)?,
        call.kwarg_bool("strict_max", false)?,
    ))
}

impl Bounds<'_> {
    fn with_strictness(mut self, strict_min: bool, strict_max: bool) -> Self {
        if let Some(min) = self.min.as_mut() {
            min.strict = strict_min;
        }
        if let Some(max) = self.max.as_mut() {
            max.strict = strict_max;
        }
        self
    }
}

fn between_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let bounds = bounds(call)?;
    let min = bounds
        .min
        .as_ref()
        .map(|b| (MetricValue::from_json(b.value), b.strict));
    let max = bounds
        .max
        .as_ref()
        .map(|b| (MetricValue::from_json(b.value), b.strict));
    column_mask(call, |value| {
        let compare = |bound: &MetricValue| {
            value.compare(bound).ok_or_else(|| {
                call.error(format!(
                    "cannot compare {} with bound {}",
                    value.to_string_pretty(),
                    bound.to_string_pretty()
                ))
            })
        };
        let mut inside = true;
        if let Some((min, strict)) = &min {
            let ordering = compare(min)?;
            inside &= ordering.is_gt() || (!strict && ordering.is_eq());
        }
        if let Some((max, strict)) = &max {
            let ordering = compare(max)?;
            inside &= ordering.is_lt() || (!strict && ordering.is_eq());
        }
        Ok(!inside)
    })
}

fn between_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let column = call.quoted(call.column()?)?;
    let bounds = bounds(call)?;
    let mut checks = Vec::new();
    if let Some(min) = &bounds.min {
        let op = if min.strict { ">" } else { ">=" };
        checks.push(format!("{column} {op} {}", SqlSecurity::escape_literal(min.value)?));
    }
    if let Some(max) = &bounds.max {
        let op = if max.strict { "<" } else { "<=" };
        checks.push(format!("{column} {op} {}", SqlSecurity::escape_literal(max.value)?));
    }
    Ok(sql_condition(call, format!("NOT ({})", checks.join(" AND "))))
}

fn between_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let column = ident(call.column()?);
    let bounds = bounds(call)?;
    let mut checks: Vec<Expr> = Vec::new();
    if let Some(min) = &bounds.min {
        let literal = json_literal(call, "min_value", min.value)?;
        checks.push(if min.strict {
            column.clone().gt(literal)
        } else {
            column.clone().gt_eq(literal)
        });
    }
    if let Some(max) = &bounds.max {
        let literal = json_literal(call, "max_value", max.value)?;
        checks.push(if max.strict {
            column.clone().lt(literal)
        } else {
            column.clone().lt_eq(literal)
        });
    }
    let inside = checks
        .into_iter()
        .reduce(Expr::and)
        .ok_or_else(|| call.error("no bounds to check"))?;
    Ok(dataframe_condition(call, Expr::Not(Box::new(inside))))
}

/// The `regex` kwarg, validated and compiled.
fn pattern<'c>(call: &'c ProviderCall<'_>) -> Result<(&'c str, Regex)> {
    let pattern = call
        .kwarg_str("regex")?
        .ok_or_else(|| call.configuration_error("regex", "is required"))?;
    SqlSecurity::validate_regex_pattern(pattern)?;
    let regex = Regex::new(pattern)
        .map_err(|e| call.configuration_error("regex", format!("invalid pattern: {e}")))?;
    Ok((pattern, regex))
}

fn regex_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let (_, regex) = pattern(call)?;
    let text = cast(&call.domain_column()?, &DataType::Utf8)?;
    let mask = text
        .as_string::<i32>()
        .iter()
        .map(|value| value.is_some_and(|s| !regex.is_match(s)))
        .collect();
    Ok(mask_condition(call, mask))
}

fn regex_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let (pattern, _) = pattern(call)?;
    let column = call.quoted(call.column()?)?;
    let literal = SqlSecurity::validate_regex_pattern(pattern)?;
    Ok(sql_condition(
        call,
        format!("NOT (CAST({column} AS VARCHAR) ~ {literal})"),
    ))
}

fn regex_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let (pattern, _) = pattern(call)?;
    let text = cast_expr(ident(call.column()?), DataType::Utf8);
    let matches = binary_expr(text, Operator::RegexMatch, lit(pattern));
    Ok(dataframe_condition(call, Expr::Not(Box::new(matches))))
}

fn unique_in_process(call: &InProcessCall<'_>) -> Result<MetricValue> {
    let array = call.domain_column()?;
    let mut seen: HashMap<ScalarValue, i64> = HashMap::new();
    let mut scalars = Vec::with_capacity(array.len());
    for row in 0..array.len() {
        if array.is_null(row) {
            scalars.push(None);
            continue;
        }
        let scalar = ScalarValue::try_from_array(array.as_ref(), row)?;
        *seen.entry(scalar.clone()).or_insert(0) += 1;
        scalars.push(Some(scalar));
    }
    let mask = scalars
        .iter()
        .map(|scalar| scalar.as_ref().is_some_and(|s| seen.get(s).is_some_and(|n| *n > 1)))
        .collect();
    Ok(mask_condition(call, mask))
}

/// Duplicates are found with a window count; the windowed relation is its own
/// compute domain.
fn unique_sql(call: &SqlCall<'_>) -> Result<MetricValue> {
    let name = call.column()?;
    let column = call.quoted(name)?;
    let dup_count = SqlSecurity::escape_identifier(DUP_COUNT)?;
    let relation = format!(
        "(SELECT *, COUNT(*) OVER (PARTITION BY {column}) AS {dup_count} FROM {}) AS {}",
        call.relation,
        SqlSecurity::escape_identifier(UNIQUE_ALIAS)?
    );
    Ok(MetricValue::Condition(UnexpectedCondition::Sql {
        relation,
        predicate: format!("{column} IS NOT NULL AND {dup_count} > 1"),
        columns: call.schema_columns(),
        domain_key: format!("{}|unique({name})", call.domain_key),
    }))
}

fn unique_dataframe(call: &DataFrameCall<'_>) -> Result<MetricValue> {
    let name = call.column()?;
    let counts = call.frame.clone().aggregate(
        vec![ident(name).alias(UNIQUE_VALUE)],
        vec![count(lit(1i64)).alias(DUP_COUNT)],
    )?;
    let frame = call.frame.clone().join_on(
        counts,
        JoinType::Left,
        [ident(name).eq(ident(UNIQUE_VALUE))],
    )?;
    Ok(MetricValue::Condition(UnexpectedCondition::DataFrame {
        frame,
        predicate: ident(DUP_COUNT).gt(lit(1i64)),
        columns: call.schema_columns(),
        domain_key: format!("{}|unique({name})", call.domain_key),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricsMap;
    use crate::engine::ExecutionEngine;
    use crate::test_helpers::{all_engines, in_process_engine, metric, mixed_batch, resolve_fully};
    use serde_json::json;

    async fn unexpected_count(
        engine: &dyn ExecutionEngine,
        rule: &str,
        column: &str,
        value: serde_json::Value,
    ) -> MetricValue {
        let count = metric(
            &format!("{rule}.unexpected_count"),
            json!({"column": column}),
            value,
        );
        let values = resolve_fully(engine, &[count.clone()]).await;
        values[&count.id()].clone()
    }

    #[tokio::test]
    async fn test_unexpected_counts_agree_across_backends() {
        let cases = [
            ("column_values.nonnull", "name", json!({}), 1),
            ("column_values.in_set", "name", json!({"value_set": ["alice"]}), 2),
            ("column_values.in_set", "name", json!({"value_set": []}), 3),
            ("column_values.between", "id", json!({"min_value": 2, "max_value": 3}), 2),
            (
                "column_values.between",
                "score",
                json!({"min_value": 1.5, "strict_min": true}),
                1,
            ),
            ("column_values.match_regex", "name", json!({"regex": "^a"}), 2),
            ("column_values.unique", "name", json!({}), 2),
            ("column_values.unique", "id", json!({}), 0),
        ];
        for engine in all_engines(mixed_batch()) {
            for (rule, column, value, expected) in &cases {
                assert_eq!(
                    unexpected_count(engine.as_ref(), rule, column, value.clone()).await,
                    MetricValue::Integer(*expected),
                    "{rule} {value} on {}",
                    engine.backend_kind()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_unique_unexpected_values() {
        for engine in all_engines(mixed_batch()) {
            let values = metric(
                "column_values.unique.unexpected_values",
                json!({"column": "name"}),
                json!({"result_format": "COMPLETE"}),
            );
            let resolution = engine
                .resolve_metrics(&[values.clone()], &MetricsMap::new())
                .await
                .unwrap();
            assert_eq!(
                resolution.value(&values).unwrap().to_json(),
                json!(["bob", "bob"])
            );
        }
    }

    #[tokio::test]
    async fn test_unexpected_value_counts() {
        for engine in all_engines(mixed_batch()) {
            let counts = metric(
                "column_values.in_set.unexpected_value_counts",
                json!({"column": "name"}),
                json!({"value_set": ["carol"], "result_format": "COMPLETE"}),
            );
            let resolution = engine
                .resolve_metrics(&[counts.clone()], &MetricsMap::new())
                .await
                .unwrap();
            assert_eq!(
                resolution.value(&counts).unwrap().to_json(),
                json!([{"value": "bob", "count": 2}, {"value": "alice", "count": 1}])
            );
        }
    }

    #[tokio::test]
    async fn test_between_requires_a_bound() {
        let engine = in_process_engine(mixed_batch());
        let condition = metric("column_values.between.condition", json!({"column": "id"}), json!({}));
        let err = engine
            .resolve_metrics(&[condition], &MetricsMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot both be missing"), "{err}");
    }

    #[tokio::test]
    async fn test_match_regex_rejects_redos_pattern() {
        let engine = in_process_engine(mixed_batch());
        let condition = metric(
            "column_values.match_regex.condition",
            json!({"column": "name"}),
            json!({"regex": "(a+)+"}),
        );
        assert!(engine
            .resolve_metrics(&[condition], &MetricsMap::new())
            .await
            .is_err());
    }
}
