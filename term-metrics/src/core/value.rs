//! Values produced by metric providers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use arrow::array::{Array, BooleanArray};
use arrow::record_batch::RecordBatch;
use datafusion::prelude::{DataFrame, Expr};
use datafusion::scalar::ScalarValue;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{MetricError, Result};

/// A resolved metric value.
///
/// Besides plain values, two backend-native variants appear while a graph is
/// being resolved: [`MetricValue::Condition`] (an unexpected-row predicate)
/// and [`MetricValue::Deferred`] (an aggregate that has been built but not
/// executed yet).
#[derive(Debug, Clone)]
pub enum MetricValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<MetricValue>),
    Map(BTreeMap<String, MetricValue>),
    /// Distinct values with their occurrence counts.
    ValueCounts(Vec<ValueCount>),
    /// Materialized rows, e.g. `table.head` or `*.unexpected_rows`.
    Records(RecordBatch),
    Condition(UnexpectedCondition),
    Deferred(DeferredAggregate),
}

/// One entry of a value-count listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCount {
    pub value: MetricValue,
    pub count: i64,
}

/// Identifies the rows a map metric considers unexpected.
#[derive(Debug, Clone)]
pub enum UnexpectedCondition {
    /// In-process: the domain rows and a parallel mask, `true` = unexpected.
    Mask {
        records: RecordBatch,
        unexpected: BooleanArray,
    },
    /// SQL: a FROM-clause relation and a predicate selecting unexpected rows.
    Sql {
        relation: String,
        predicate: String,
        /// Columns of the underlying batch, in schema order.
        columns: Vec<String>,
        /// Compute-domain key of `relation`.
        domain_key: String,
    },
    /// Lazy dataframe plus a predicate selecting unexpected rows.
    DataFrame {
        frame: DataFrame,
        predicate: Expr,
        columns: Vec<String>,
        domain_key: String,
    },
}

impl UnexpectedCondition {
    /// Number of unexpected rows of an in-process mask.
    pub fn mask_count(&self) -> Option<i64> {
        match self {
            Self::Mask { unexpected, .. } => Some(unexpected.true_count() as i64),
            _ => None,
        }
    }
}

/// A built-but-not-executed aggregate, finalized in a shared round trip.
#[derive(Debug, Clone)]
pub struct DeferredAggregate {
    /// Aggregates with equal keys run against the same relation and are
    /// combined into a single query or job.
    pub domain_key: String,
    pub source: AggregateSource,
    pub finalize: Finalize,
}

/// Backend-native aggregate expression.
#[derive(Debug, Clone)]
pub enum AggregateSource {
    Sql { relation: String, expression: String },
    DataFrame { frame: DataFrame, expression: Expr },
}

/// Post-processing applied to the raw aggregate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// Use the value as returned.
    Raw,
    /// `SUM` over zero rows yields NULL; counts must read as zero.
    NullAsZero,
    /// Coerce numeric results to floating point.
    Float,
}

impl Finalize {
    pub fn apply(self, raw: MetricValue) -> MetricValue {
        match (self, raw) {
            (Self::NullAsZero, MetricValue::Null) => MetricValue::Integer(0),
            (Self::NullAsZero, MetricValue::Float(f)) if f.fract() == 0.0 => {
                MetricValue::Integer(f as i64)
            }
            (Self::Float, MetricValue::Integer(i)) => MetricValue::Float(i as f64),
            (_, other) => other,
        }
    }
}

impl MetricValue {
    /// Converts a DataFusion scalar.
    pub fn from_scalar(scalar: &ScalarValue) -> Self {
        if scalar.is_null() {
            return Self::Null;
        }
        match scalar {
            ScalarValue::Boolean(Some(b)) => Self::Boolean(*b),
            ScalarValue::Int8(Some(v)) => Self::Integer(i64::from(*v)),
            ScalarValue::Int16(Some(v)) => Self::Integer(i64::from(*v)),
            ScalarValue::Int32(Some(v)) => Self::Integer(i64::from(*v)),
            ScalarValue::Int64(Some(v)) => Self::Integer(*v),
            ScalarValue::UInt8(Some(v)) => Self::Integer(i64::from(*v)),
            ScalarValue::UInt16(Some(v)) => Self::Integer(i64::from(*v)),
            ScalarValue::UInt32(Some(v)) => Self::Integer(i64::from(*v)),
            ScalarValue::UInt64(Some(v)) => match i64::try_from(*v) {
                Ok(i) => Self::Integer(i),
                Err(_) => Self::Float(*v as f64),
            },
            ScalarValue::Float32(Some(v)) => Self::Float(f64::from(*v)),
            ScalarValue::Float64(Some(v)) => Self::Float(*v),
            ScalarValue::Decimal128(Some(v), _, scale) => {
                Self::Float(*v as f64 / 10f64.powi(i32::from(*scale)))
            }
            ScalarValue::Utf8(Some(s))
            | ScalarValue::LargeUtf8(Some(s))
            | ScalarValue::Utf8View(Some(s)) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }

    /// Reads one cell of an Arrow array.
    pub fn from_array(array: &dyn Array, row: usize) -> Result<Self> {
        let scalar = ScalarValue::try_from_array(array, row)?;
        Ok(Self::from_scalar(&scalar))
    }

    /// Reads every cell of an Arrow array.
    pub fn from_column(array: &dyn Array) -> Result<Vec<Self>> {
        (0..array.len()).map(|i| Self::from_array(array, i)).collect()
    }

    /// Converts a JSON value (e.g. an entry of `value_set`).
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering. Backend-native handles render as a descriptive string.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::ValueCounts(counts) => Value::Array(
                counts
                    .iter()
                    .map(|vc| serde_json::json!({"value": vc.value.to_json(), "count": vc.count}))
                    .collect(),
            ),
            Self::Records(batch) => match records_to_rows(batch) {
                Ok(rows) => Value::Array(
                    rows.into_iter()
                        .map(|row| Self::Map(row).to_json())
                        .collect(),
                ),
                Err(_) => Value::Null,
            },
            Self::Condition(_) => Value::String("<unexpected condition>".to_string()),
            Self::Deferred(_) => Value::String("<deferred aggregate>".to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer view; floats qualify only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MetricValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_records(&self) -> Option<&RecordBatch> {
        match self {
            Self::Records(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn as_value_counts(&self) -> Option<&[ValueCount]> {
        match self {
            Self::ValueCounts(counts) => Some(counts),
            _ => None,
        }
    }

    pub fn as_condition(&self) -> Option<&UnexpectedCondition> {
        match self {
            Self::Condition(condition) => Some(condition),
            _ => None,
        }
    }

    pub fn as_deferred(&self) -> Option<&DeferredAggregate> {
        match self {
            Self::Deferred(deferred) => Some(deferred),
            _ => None,
        }
    }

    /// True for values that only make sense inside one resolution pass.
    pub fn is_backend_native(&self) -> bool {
        matches!(self, Self::Condition(_) | Self::Deferred(_))
    }

    /// Ordering across comparable values: numbers (mixed integer/float),
    /// strings and booleans. `None` for anything else.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Human-readable rendering.
    pub fn to_string_pretty(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => {
                if f.fract() == 0.0 {
                    format!("{f:.1}")
                } else {
                    format!("{f:.4}")
                }
            }
            Self::String(s) => s.clone(),
            Self::List(items) => format!("List({} elements)", items.len()),
            Self::Map(map) => format!("Map({} entries)", map.len()),
            Self::ValueCounts(counts) => format!("ValueCounts({} values)", counts.len()),
            Self::Records(batch) => format!("Records({} rows)", batch.num_rows()),
            Self::Condition(_) => "UnexpectedCondition".to_string(),
            Self::Deferred(d) => format!("DeferredAggregate({})", d.domain_key),
        }
    }
}

impl PartialEq for MetricValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::ValueCounts(a), Self::ValueCounts(b)) => a == b,
            (Self::Records(a), Self::Records(b)) => a == b,
            (Self::Condition(_), _) | (Self::Deferred(_), _) => false,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_pretty())
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<MetricValue>> From<Option<T>> for MetricValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Converts a record batch into one column-name → value map per row.
pub fn records_to_rows(batch: &RecordBatch) -> Result<Vec<BTreeMap<String, MetricValue>>> {
    let schema = batch.schema();
    let columns = batch
        .columns()
        .iter()
        .map(|c| MetricValue::from_column(c.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok((0..batch.num_rows())
        .map(|row| {
            schema
                .fields()
                .iter()
                .zip(&columns)
                .map(|(field, values)| (field.name().clone(), values[row].clone()))
                .collect()
        })
        .collect())
}

/// Reads the single-row result of an aggregate query, one value per column.
pub fn single_row_values(batches: &[RecordBatch]) -> Result<Vec<MetricValue>> {
    let batch = batches
        .iter()
        .find(|b| b.num_rows() > 0)
        .ok_or_else(|| MetricError::Internal("aggregate query returned no rows".to_string()))?;
    batch
        .columns()
        .iter()
        .map(|c| MetricValue::from_array(c.as_ref(), 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_numeric_equality_across_types() {
        assert_eq!(MetricValue::Integer(3), MetricValue::Float(3.0));
        assert_ne!(MetricValue::Integer(3), MetricValue::Float(3.5));
        assert_ne!(MetricValue::Integer(1), MetricValue::Boolean(true));
        assert_eq!(MetricValue::Null, MetricValue::Null);
    }

    #[test]
    fn test_from_scalar() {
        assert_eq!(
            MetricValue::from_scalar(&ScalarValue::Int32(Some(7))),
            MetricValue::Integer(7)
        );
        assert_eq!(
            MetricValue::from_scalar(&ScalarValue::Float64(None)),
            MetricValue::Null
        );
        assert_eq!(
            MetricValue::from_scalar(&ScalarValue::Utf8(Some("x".into()))),
            MetricValue::from("x")
        );
        assert_eq!(
            MetricValue::from_scalar(&ScalarValue::Decimal128(Some(1234), 10, 2)),
            MetricValue::Float(12.34)
        );
    }

    #[test]
    fn test_finalize() {
        assert_eq!(
            Finalize::NullAsZero.apply(MetricValue::Null),
            MetricValue::Integer(0)
        );
        assert!(matches!(
            Finalize::Float.apply(MetricValue::Integer(2)),
            MetricValue::Float(f) if f == 2.0
        ));
        assert_eq!(Finalize::Raw.apply(MetricValue::Null), MetricValue::Null);
    }

    #[test]
    fn test_json_round_trip_of_plain_values() {
        let value = json!({"a": [1, 2.5, "x", null, true]});
        assert_eq!(MetricValue::from_json(&value).to_json(), value);
    }

    #[test]
    fn test_compare() {
        assert_eq!(
            MetricValue::Integer(1).compare(&MetricValue::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            MetricValue::from("b").compare(&MetricValue::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(MetricValue::from("b").compare(&MetricValue::Integer(1)), None);
    }

    #[test]
    fn test_records_to_rows() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(3), None])),
                Arc::new(StringArray::from(vec!["baz", "qux"])),
            ],
        )
        .unwrap();
        let rows = records_to_rows(&batch).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["a"], MetricValue::Integer(3));
        assert_eq!(rows[1]["a"], MetricValue::Null);
        assert_eq!(rows[1]["b"], MetricValue::from("qux"));
    }
}
