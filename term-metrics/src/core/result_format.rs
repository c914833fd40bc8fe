//! `result_format` handling for unexpected-result derivatives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::kwargs::{json_type_name, Kwargs};
use crate::error::{MetricError, Result};

pub const RESULT_FORMAT: &str = "result_format";
pub const PARTIAL_UNEXPECTED_COUNT: &str = "partial_unexpected_count";
pub const DEFAULT_PARTIAL_UNEXPECTED_COUNT: usize = 20;

/// Verbosity level of unexpected-example output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultFormatLevel {
    BooleanOnly,
    Basic,
    Summary,
    Complete,
}

/// Parsed `result_format` value kwarg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFormat {
    pub level: ResultFormatLevel,
    pub partial_unexpected_count: usize,
}

impl Default for ResultFormat {
    fn default() -> Self {
        Self {
            level: ResultFormatLevel::Basic,
            partial_unexpected_count: DEFAULT_PARTIAL_UNEXPECTED_COUNT,
        }
    }
}

impl ResultFormat {
    pub fn complete() -> Self {
        Self {
            level: ResultFormatLevel::Complete,
            ..Self::default()
        }
    }

    pub fn summary(partial_unexpected_count: usize) -> Self {
        Self {
            level: ResultFormatLevel::Summary,
            partial_unexpected_count,
        }
    }

    /// Reads `result_format` from value kwargs; absent means `BASIC`.
    ///
    /// Accepts either a bare level string or an object with `result_format`
    /// and `partial_unexpected_count` keys.
    pub fn from_value_kwargs(metric_name: &str, kwargs: &Kwargs) -> Result<Self> {
        match kwargs.get(RESULT_FORMAT) {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::String(level)) => Ok(Self {
                level: parse_level(metric_name, level)?,
                ..Self::default()
            }),
            Some(Value::Object(map)) => {
                let level = match map.get(RESULT_FORMAT) {
                    None => ResultFormatLevel::Basic,
                    Some(Value::String(level)) => parse_level(metric_name, level)?,
                    Some(other) => {
                        return Err(MetricError::configuration(
                            metric_name,
                            RESULT_FORMAT,
                            format!("level must be a string, got {}", json_type_name(other)),
                        ))
                    }
                };
                let partial_unexpected_count = match map.get(PARTIAL_UNEXPECTED_COUNT) {
                    None => DEFAULT_PARTIAL_UNEXPECTED_COUNT,
                    Some(value) => value
                        .as_u64()
                        .and_then(|n| usize::try_from(n).ok())
                        .ok_or_else(|| {
                            MetricError::configuration(
                                metric_name,
                                PARTIAL_UNEXPECTED_COUNT,
                                "must be a non-negative integer",
                            )
                        })?,
                };
                Ok(Self {
                    level,
                    partial_unexpected_count,
                })
            }
            Some(other) => Err(MetricError::configuration(
                metric_name,
                RESULT_FORMAT,
                format!("expected a string or mapping, got {}", json_type_name(other)),
            )),
        }
    }

    /// Maximum number of examples to surface; `None` means all of them.
    pub fn limit(&self) -> Option<usize> {
        match self.level {
            ResultFormatLevel::BooleanOnly => Some(0),
            ResultFormatLevel::Basic | ResultFormatLevel::Summary => {
                Some(self.partial_unexpected_count)
            }
            ResultFormatLevel::Complete => None,
        }
    }
}

fn parse_level(metric_name: &str, raw: &str) -> Result<ResultFormatLevel> {
    match raw {
        "BOOLEAN_ONLY" => Ok(ResultFormatLevel::BooleanOnly),
        "BASIC" => Ok(ResultFormatLevel::Basic),
        "SUMMARY" => Ok(ResultFormatLevel::Summary),
        "COMPLETE" => Ok(ResultFormatLevel::Complete),
        other => Err(MetricError::configuration(
            metric_name,
            RESULT_FORMAT,
            format!("unknown level '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<ResultFormat> {
        ResultFormat::from_value_kwargs("m", &Kwargs::new().with(RESULT_FORMAT, value))
    }

    #[test]
    fn test_limits() {
        assert_eq!(parse(json!("BOOLEAN_ONLY")).unwrap().limit(), Some(0));
        assert_eq!(parse(json!("BASIC")).unwrap().limit(), Some(20));
        assert_eq!(parse(json!("COMPLETE")).unwrap().limit(), None);
        assert_eq!(
            parse(json!({"result_format": "SUMMARY", "partial_unexpected_count": 3}))
                .unwrap()
                .limit(),
            Some(3)
        );
    }

    #[test]
    fn test_absent_is_basic() {
        let format = ResultFormat::from_value_kwargs("m", &Kwargs::new()).unwrap();
        assert_eq!(format, ResultFormat::default());
    }

    #[test]
    fn test_rejects_unknown() {
        assert!(parse(json!("VERBOSE")).is_err());
        assert!(parse(json!({"partial_unexpected_count": -1})).is_err());
        assert!(parse(json!(5)).is_err());
    }
}
