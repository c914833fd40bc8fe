//! SQL hardening for generated queries.
//!
//! The SQL backend builds query text from user-supplied domain and value
//! kwargs. Every identifier and literal passes through [`SqlSecurity`]
//! before it is spliced into a statement.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{MetricError, Result};

/// SQL identifier and literal validation and escaping utilities.
pub struct SqlSecurity;

impl SqlSecurity {
    /// Validates and quotes a SQL identifier (table or column name).
    ///
    /// Quoting makes the identifier case-sensitive and neutralizes embedded
    /// quotes, so any printable name is accepted.
    ///
    /// # Examples
    /// ```rust
    /// use term_metrics::security::SqlSecurity;
    ///
    /// assert_eq!(SqlSecurity::escape_identifier("column_A").unwrap(), "\"column_A\"");
    /// assert_eq!(SqlSecurity::escape_identifier("a\"b").unwrap(), "\"a\"\"b\"");
    /// assert!(SqlSecurity::escape_identifier("").is_err());
    /// assert!(SqlSecurity::escape_identifier(&"x".repeat(300)).is_err());
    /// ```
    pub fn escape_identifier(identifier: &str) -> Result<String> {
        Self::validate_identifier(identifier)?;
        let escaped = identifier.replace('"', "\"\"");
        Ok(format!("\"{escaped}\""))
    }

    /// Validates a SQL identifier without quoting it.
    pub fn validate_identifier(identifier: &str) -> Result<()> {
        if identifier.trim().is_empty() {
            return Err(MetricError::Security(
                "SQL identifier cannot be empty or whitespace-only".to_string(),
            ));
        }

        if identifier.len() > 255 {
            return Err(MetricError::Security(
                "SQL identifier too long (max 255 characters)".to_string(),
            ));
        }

        static CONTROL_CHARS: Lazy<Regex> = Lazy::new(|| {
            // Hard-coded pattern, known to be valid
            #[allow(clippy::expect_used)]
            Regex::new(r"[\x00-\x1f\x7f]").expect("Hard-coded regex pattern should be valid")
        });
        if CONTROL_CHARS.is_match(identifier) {
            return Err(MetricError::Security(format!(
                "SQL identifier contains control characters: {identifier:?}"
            )));
        }

        Ok(())
    }

    /// Quotes a string literal for SQL.
    pub fn escape_string(value: &str) -> Result<String> {
        if value.contains('\0') {
            return Err(MetricError::Security(
                "SQL literal cannot contain null bytes".to_string(),
            ));
        }
        Ok(format!("'{}'", value.replace('\'', "''")))
    }

    /// Renders a JSON scalar as a SQL literal.
    ///
    /// Arrays and objects have no SQL scalar form and are rejected.
    pub fn escape_literal(value: &Value) -> Result<String> {
        match value {
            Value::Null => Ok("NULL".to_string()),
            Value::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
            Value::Number(n) => {
                if n.as_f64().is_some_and(|f| !f.is_finite()) {
                    return Err(MetricError::Security(format!(
                        "Numeric literal must be finite, got {n}"
                    )));
                }
                Ok(n.to_string())
            }
            Value::String(s) => Self::escape_string(s),
            Value::Array(_) | Value::Object(_) => Err(MetricError::Security(format!(
                "Cannot render {value} as a SQL scalar literal"
            ))),
        }
    }

    /// Validates a regex pattern and returns it as a quoted SQL literal.
    pub fn validate_regex_pattern(pattern: &str) -> Result<String> {
        if pattern.len() > 1000 {
            return Err(MetricError::Security(
                "Regex pattern too long (max 1000 characters)".to_string(),
            ));
        }

        if let Err(e) = Regex::new(pattern) {
            return Err(MetricError::Security(format!("Invalid regex pattern: {e}")));
        }

        // obvious catastrophic backtracking only
        for dangerous in ["(.*)*", "(.*)+", "(.+)+", "(a+)+", "(a*)*"] {
            if pattern.contains(dangerous) {
                return Err(MetricError::Security(
                    "Regex pattern might cause ReDoS attack".to_string(),
                ));
            }
        }

        Self::escape_string(pattern)
    }
}
