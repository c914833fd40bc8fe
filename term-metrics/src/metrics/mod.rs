//! Built-in metric providers, grouped by family.
//!
//! Two registration shapes cover most metrics:
//!
//! - **aggregates** compute directly in process, and on the SQL and dataframe
//!   engines build a `<name>.aggregate_fn` deferred aggregate that a bundled
//!   `<name>` finalizer executes in a shared round trip;
//! - **map metrics** register a `<name>.condition` per backend plus the
//!   unexpected derivatives (`unexpected_count`, `unexpected_values`,
//!   `unexpected_rows`, and `unexpected_value_counts` for column domains).

use std::cmp::Ordering;
use std::collections::HashMap;

use arrow::array::{Array, BooleanArray};
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use datafusion::prelude::{lit, Expr};
use datafusion::scalar::ScalarValue;
use serde_json::Value;

use crate::core::value::records_to_rows;
use crate::core::{
    AggregateSource, DeferredAggregate, DomainType, Finalize, MetricValue, UnexpectedCondition,
    ValueCount,
};
use crate::engine::{DataFrameCall, InProcessCall, SqlCall};
use crate::error::Result;
use crate::security::SqlSecurity;
use crate::registry::{
    BackendKind, DataFramePlanFn, DependencySpec, InProcessFn, MetricRegistry, MetricRole, Provider,
    ProviderSpec, SqlPlanFn,
};

pub mod column_aggregate;
pub mod column_distribution;
pub mod column_map;
pub mod multicolumn_map;
pub mod pair_map;
pub mod table;
pub mod unexpected;

/// Installs every built-in provider.
pub(crate) fn register_defaults(registry: &MetricRegistry) -> Result<()> {
    table::register(registry)?;
    column_aggregate::register(registry)?;
    column_distribution::register(registry)?;
    column_map::register(registry)?;
    pair_map::register(registry)?;
    multicolumn_map::register(registry)?;
    Ok(())
}

/// A metric computed directly in process and as a bundled aggregate elsewhere.
pub struct AggregateFamily {
    pub name: String,
    pub domain_type: DomainType,
    pub role: MetricRole,
    /// Dependencies of the in-process provider and of the partials.
    pub dependencies: Vec<DependencySpec>,
    pub in_process: InProcessFn,
    pub sql_partial: SqlPlanFn,
    pub dataframe_partial: DataFramePlanFn,
}

impl AggregateFamily {
    pub fn direct(
        name: impl Into<String>,
        domain_type: DomainType,
        in_process: InProcessFn,
        sql_partial: SqlPlanFn,
        dataframe_partial: DataFramePlanFn,
    ) -> Self {
        Self {
            name: name.into(),
            domain_type,
            role: MetricRole::Direct,
            dependencies: Vec::new(),
            in_process,
            sql_partial,
            dataframe_partial,
        }
    }

    pub fn partial_name(&self) -> String {
        format!("{}.aggregate_fn", self.name)
    }

    pub fn register(self, registry: &MetricRegistry) -> Result<()> {
        let with_dependencies = |mut spec: ProviderSpec| {
            spec.dependencies.extend(self.dependencies.iter().cloned());
            spec
        };

        registry.register(
            BackendKind::InProcess,
            with_dependencies(ProviderSpec::new(&self.name, self.role, self.domain_type)),
            Provider::InProcess(self.in_process),
        )?;

        let partial_name = self.partial_name();
        for (backend, partial) in [
            (BackendKind::Sql, Provider::SqlPlan(self.sql_partial)),
            (BackendKind::DataFrame, Provider::DataFramePlan(self.dataframe_partial)),
        ] {
            registry.register(
                backend,
                with_dependencies(ProviderSpec::aggregate_partial(&partial_name, self.domain_type)),
                partial,
            )?;
            registry.register(
                backend,
                ProviderSpec::new(&self.name, self.role, self.domain_type)
                    .with_dependency(DependencySpec::partial_fn(&partial_name)),
                Provider::Bundled,
            )?;
        }
        Ok(())
    }
}

/// A row-wise rule with a condition per backend.
pub struct MapFamily {
    pub name: &'static str,
    pub domain_type: DomainType,
    pub in_process: InProcessFn,
    pub sql: SqlPlanFn,
    pub dataframe: DataFramePlanFn,
}

impl MapFamily {
    pub fn condition_name(&self) -> String {
        format!("{}.condition", self.name)
    }

    pub fn register(self, registry: &MetricRegistry) -> Result<()> {
        let condition_name = self.condition_name();
        for (backend, provider) in [
            (BackendKind::InProcess, Provider::InProcess(self.in_process)),
            (BackendKind::Sql, Provider::SqlPlan(self.sql)),
            (BackendKind::DataFrame, Provider::DataFramePlan(self.dataframe)),
        ] {
            registry.register(
                backend,
                ProviderSpec::condition(&condition_name, self.domain_type),
                provider,
            )?;
        }
        unexpected::register(registry, self.name, &condition_name, self.domain_type)
    }
}

/// Deferred aggregate over the call's relation.
pub(crate) fn sql_aggregate(call: &SqlCall<'_>, expression: String, finalize: Finalize) -> MetricValue {
    MetricValue::Deferred(DeferredAggregate {
        domain_key: call.domain_key.clone(),
        source: AggregateSource::Sql {
            relation: call.relation.clone(),
            expression,
        },
        finalize,
    })
}

/// Deferred aggregate over the call's frame.
pub(crate) fn dataframe_aggregate(
    call: &DataFrameCall<'_>,
    expression: Expr,
    finalize: Finalize,
) -> MetricValue {
    MetricValue::Deferred(DeferredAggregate {
        domain_key: call.domain_key.clone(),
        source: AggregateSource::DataFrame {
            frame: call.frame.clone(),
            expression,
        },
        finalize,
    })
}

/// Mask condition over the column of a column domain; nulls are never
/// unexpected.
pub(crate) fn column_mask<F>(call: &InProcessCall<'_>, mut unexpected: F) -> Result<MetricValue>
where
    F: FnMut(&MetricValue) -> Result<bool>,
{
    let array = call.domain_column()?;
    let mut mask = Vec::with_capacity(array.len());
    for row in 0..array.len() {
        if array.is_null(row) {
            mask.push(false);
            continue;
        }
        let value = MetricValue::from_array(array.as_ref(), row)?;
        mask.push(unexpected(&value)?);
    }
    Ok(mask_condition(call, mask))
}

pub(crate) fn mask_condition(call: &InProcessCall<'_>, mask: Vec<bool>) -> MetricValue {
    MetricValue::Condition(UnexpectedCondition::Mask {
        records: call.records.clone(),
        unexpected: BooleanArray::from(mask),
    })
}

pub(crate) fn sql_condition(call: &SqlCall<'_>, predicate: String) -> MetricValue {
    MetricValue::Condition(UnexpectedCondition::Sql {
        relation: call.relation.clone(),
        predicate,
        columns: call.schema_columns(),
        domain_key: call.domain_key.clone(),
    })
}

pub(crate) fn dataframe_condition(call: &DataFrameCall<'_>, predicate: Expr) -> MetricValue {
    MetricValue::Condition(UnexpectedCondition::DataFrame {
        frame: call.frame.clone(),
        predicate,
        columns: call.schema_columns(),
        domain_key: call.domain_key.clone(),
    })
}

/// Total order used for value listings: comparable values ascending, nulls last.
pub(crate) fn compare_values(a: &MetricValue, b: &MetricValue) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a
            .compare(b)
            .unwrap_or_else(|| a.to_string_pretty().cmp(&b.to_string_pretty())),
    }
}

/// Sorts by value, or by count descending with value as tie-break.
pub(crate) fn sort_value_counts(counts: &mut [ValueCount], by_count: bool) {
    counts.sort_by(|a, b| {
        if by_count {
            b.count
                .cmp(&a.count)
                .then_with(|| compare_values(&a.value, &b.value))
        } else {
            compare_values(&a.value, &b.value)
        }
    });
}

/// Counts occurrences of each value of `array`, restricted to rows where
/// `mask` is true when given. Nulls are counted only if `include_nulls`.
pub(crate) fn count_values(
    array: &dyn Array,
    mask: Option<&BooleanArray>,
    include_nulls: bool,
) -> Result<Vec<ValueCount>> {
    let mut counts: HashMap<ScalarValue, i64> = HashMap::new();
    for row in 0..array.len() {
        if let Some(mask) = mask {
            if mask.is_null(row) || !mask.value(row) {
                continue;
            }
        }
        if array.is_null(row) && !include_nulls {
            continue;
        }
        let scalar = ScalarValue::try_from_array(array, row)?;
        *counts.entry(scalar).or_insert(0) += 1;
    }
    Ok(counts
        .into_iter()
        .map(|(scalar, count)| ValueCount {
            value: MetricValue::from_scalar(&scalar),
            count,
        })
        .collect())
}

/// Reads `value`/`count` rows produced by a grouped count query.
pub(crate) fn value_counts_from_batches(batches: &[RecordBatch]) -> Result<Vec<ValueCount>> {
    let mut counts = Vec::new();
    for batch in batches {
        for row in records_to_rows(batch)? {
            let value = row.get("value").cloned().unwrap_or(MetricValue::Null);
            let count = row.get("count").and_then(MetricValue::as_i64).unwrap_or(0);
            counts.push(ValueCount { value, count });
        }
    }
    Ok(counts)
}

/// Concatenates query output, falling back to an empty batch of `schema`.
pub(crate) fn concat_or_empty(batches: &[RecordBatch], schema: SchemaRef) -> Result<RecordBatch> {
    match batches.first() {
        Some(first) => Ok(concat_batches(&first.schema(), batches)?),
        None => Ok(RecordBatch::new_empty(schema)),
    }
}

/// Comma-separated quoted identifiers.
pub(crate) fn quote_all<S: AsRef<str>>(columns: &[S]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| SqlSecurity::escape_identifier(c.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// DataFusion literal for a JSON scalar kwarg.
pub(crate) fn json_literal(call: &crate::engine::ProviderCall<'_>, kwarg: &str, value: &Value) -> Result<Expr> {
    match value {
        Value::Bool(b) => Ok(lit(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(lit(i)),
            (None, Some(f)) => Ok(lit(f)),
            _ => Err(call.configuration_error(kwarg, format!("unsupported number {n}"))),
        },
        Value::String(s) => Ok(lit(s.clone())),
        other => Err(call.configuration_error(
            kwarg,
            format!("expected a scalar, got {}", crate::core::kwargs::json_type_name(other)),
        )),
    }
}
