//! Typed view over metric domain kwargs.
//!
//! Domain kwargs arrive as free-form JSON. Before any provider runs they are
//! parsed into a [`MetricDomain`], which fixes the domain type, the accessor
//! columns and the row filter implied by `ignore_row_if`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::kwargs::{json_type_name, Kwargs};
use crate::error::{MetricError, Result};

pub const BATCH_ID: &str = "batch_id";
pub const COLUMN: &str = "column";
pub const COLUMN_A: &str = "column_A";
pub const COLUMN_B: &str = "column_B";
pub const COLUMN_LIST: &str = "column_list";
pub const IGNORE_ROW_IF: &str = "ignore_row_if";

const UNSUPPORTED_KEYS: &[&str] = &["row_condition", "condition_parser"];

/// The shape of data a metric applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainType {
    Table,
    Column,
    ColumnPair,
    MultiColumn,
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::ColumnPair => "column_pair",
            Self::MultiColumn => "multicolumn",
        };
        f.write_str(name)
    }
}

/// Missing-value exclusion for multi-column domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IgnoreRowIf {
    /// Drop rows where every domain column is null
    /// (`both_values_are_missing` / `all_values_are_missing`).
    AllMissing,
    /// Drop rows where any domain column is null
    /// (`either_value_is_missing` / `any_value_is_missing`).
    AnyMissing,
    /// Keep every row (`neither` / `never`).
    Never,
}

impl IgnoreRowIf {
    fn parse(raw: &str, domain_type: DomainType) -> Option<Self> {
        match (domain_type, raw) {
            (DomainType::ColumnPair, "both_values_are_missing")
            | (DomainType::MultiColumn, "all_values_are_missing") => Some(Self::AllMissing),
            (DomainType::ColumnPair, "either_value_is_missing")
            | (DomainType::MultiColumn, "any_value_is_missing") => Some(Self::AnyMissing),
            (DomainType::ColumnPair, "neither") | (DomainType::MultiColumn, "never") => {
                Some(Self::Never)
            }
            _ => None,
        }
    }
}

/// A parsed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricDomain {
    Table,
    Column {
        column: String,
    },
    ColumnPair {
        column_a: String,
        column_b: String,
        ignore_row_if: IgnoreRowIf,
    },
    MultiColumn {
        columns: Vec<String>,
        ignore_row_if: IgnoreRowIf,
    },
}

/// A parsed domain together with the batch it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDomain {
    pub batch_id: Option<String>,
    pub domain: MetricDomain,
}

impl ParsedDomain {
    /// Parses domain kwargs for `metric_name` (used in error messages).
    pub fn parse(metric_name: &str, kwargs: &Kwargs) -> Result<Self> {
        for key in UNSUPPORTED_KEYS {
            if kwargs.contains_key(key) {
                return Err(MetricError::configuration(
                    metric_name,
                    *key,
                    "row conditions are not supported by this engine",
                ));
            }
        }

        let batch_id = match kwargs.get(BATCH_ID) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(type_error(metric_name, BATCH_ID, "a string", other));
            }
        };

        let domain = if kwargs.contains_key(COLUMN_LIST) {
            let columns = string_list(metric_name, kwargs)?;
            let ignore_row_if = ignore_row_if(metric_name, kwargs, DomainType::MultiColumn)?;
            MetricDomain::MultiColumn {
                columns,
                ignore_row_if,
            }
        } else if kwargs.contains_key(COLUMN_A) || kwargs.contains_key(COLUMN_B) {
            let column_a = required_string(metric_name, kwargs, COLUMN_A)?;
            let column_b = required_string(metric_name, kwargs, COLUMN_B)?;
            let ignore_row_if = ignore_row_if(metric_name, kwargs, DomainType::ColumnPair)?;
            MetricDomain::ColumnPair {
                column_a,
                column_b,
                ignore_row_if,
            }
        } else if kwargs.contains_key(COLUMN) {
            MetricDomain::Column {
                column: required_string(metric_name, kwargs, COLUMN)?,
            }
        } else {
            MetricDomain::Table
        };

        if matches!(domain, MetricDomain::Table | MetricDomain::Column { .. })
            && kwargs.contains_key(IGNORE_ROW_IF)
        {
            return Err(MetricError::configuration(
                metric_name,
                IGNORE_ROW_IF,
                "only applies to column pair and multicolumn domains",
            ));
        }

        Ok(Self { batch_id, domain })
    }
}

impl MetricDomain {
    pub fn domain_type(&self) -> DomainType {
        match self {
            Self::Table => DomainType::Table,
            Self::Column { .. } => DomainType::Column,
            Self::ColumnPair { .. } => DomainType::ColumnPair,
            Self::MultiColumn { .. } => DomainType::MultiColumn,
        }
    }

    /// Accessor columns, in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Self::Table => vec![],
            Self::Column { column } => vec![column.as_str()],
            Self::ColumnPair {
                column_a, column_b, ..
            } => vec![column_a.as_str(), column_b.as_str()],
            Self::MultiColumn { columns, .. } => columns.iter().map(String::as_str).collect(),
        }
    }

    /// The single column of a column domain.
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Column { column } => Some(column),
            _ => None,
        }
    }

    /// Row exclusion implied by `ignore_row_if`, if any rows can be dropped.
    pub fn row_filter(&self) -> Option<RowFilter> {
        let (columns, ignore) = match self {
            Self::ColumnPair {
                column_a,
                column_b,
                ignore_row_if,
            } => (vec![column_a.clone(), column_b.clone()], *ignore_row_if),
            Self::MultiColumn {
                columns,
                ignore_row_if,
            } => (columns.clone(), *ignore_row_if),
            _ => return None,
        };
        match ignore {
            IgnoreRowIf::Never => None,
            ignore => Some(RowFilter { columns, ignore }),
        }
    }
}

/// Rows to drop before a condition is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub columns: Vec<String>,
    pub ignore: IgnoreRowIf,
}

impl RowFilter {
    /// Stable text form used in compute-domain keys.
    pub fn key(&self) -> String {
        let mode = match self.ignore {
            IgnoreRowIf::AllMissing => "all_missing",
            IgnoreRowIf::AnyMissing => "any_missing",
            IgnoreRowIf::Never => "never",
        };
        format!("{mode}({})", self.columns.join(","))
    }
}

/// The data a metric is computed over: a batch plus an optional row filter.
///
/// Metrics with equal compute domains but different accessor columns can
/// share a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputeDomain {
    pub batch_id: String,
    pub filter: Option<RowFilter>,
}

impl ComputeDomain {
    pub fn new(batch_id: impl Into<String>, domain: &MetricDomain) -> Self {
        Self {
            batch_id: batch_id.into(),
            filter: domain.row_filter(),
        }
    }

    pub fn key(&self) -> String {
        match &self.filter {
            Some(filter) => format!("{}|{}", self.batch_id, filter.key()),
            None => self.batch_id.clone(),
        }
    }
}

fn required_string(metric_name: &str, kwargs: &Kwargs, key: &str) -> Result<String> {
    match kwargs.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(type_error(metric_name, key, "a string", other)),
        None => Err(MetricError::configuration(metric_name, key, "is required")),
    }
}

fn string_list(metric_name: &str, kwargs: &Kwargs) -> Result<Vec<String>> {
    let items = match kwargs.get(COLUMN_LIST) {
        Some(Value::Array(items)) => items,
        Some(other) => return Err(type_error(metric_name, COLUMN_LIST, "a list", other)),
        None => return Err(MetricError::configuration(metric_name, COLUMN_LIST, "is required")),
    };
    if items.is_empty() {
        return Err(MetricError::configuration(
            metric_name,
            COLUMN_LIST,
            "must name at least one column",
        ));
    }
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            other => Err(type_error(metric_name, COLUMN_LIST, "a list of strings", other)),
        })
        .collect()
}

fn ignore_row_if(metric_name: &str, kwargs: &Kwargs, domain_type: DomainType) -> Result<IgnoreRowIf> {
    match kwargs.get(IGNORE_ROW_IF) {
        None | Some(Value::Null) => Ok(IgnoreRowIf::AllMissing),
        Some(Value::String(raw)) => IgnoreRowIf::parse(raw, domain_type).ok_or_else(|| {
            let allowed = match domain_type {
                DomainType::MultiColumn => "all_values_are_missing, any_value_is_missing, never",
                _ => "both_values_are_missing, either_value_is_missing, neither",
            };
            MetricError::configuration(
                metric_name,
                IGNORE_ROW_IF,
                format!("unknown value '{raw}' for a {domain_type} domain (expected one of: {allowed})"),
            )
        }),
        Some(other) => Err(type_error(metric_name, IGNORE_ROW_IF, "a string", other)),
    }
}

fn type_error(metric_name: &str, key: &str, expected: &str, got: &Value) -> MetricError {
    MetricError::configuration(
        metric_name,
        key,
        format!("expected {expected}, got {}", json_type_name(got)),
    )
}
