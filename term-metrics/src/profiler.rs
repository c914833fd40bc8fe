//! Rule-layer domains.
//!
//! A profiling rule names the slices of a batch it inspects as [`Domain`]s.
//! Two rules that target the same columns with the same details share a
//! domain id, whatever the rules are called.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::core::{DomainType, Kwargs, MetricConfiguration, ParsedDomain};
use crate::error::Result;

/// A domain as seen by a profiling rule.
#[derive(Debug, Clone, Serialize)]
pub struct Domain {
    pub rule_name: Option<String>,
    pub domain_type: DomainType,
    pub domain_kwargs: Kwargs,
    /// Free-form annotations, e.g. inferred semantic types.
    pub details: Kwargs,
}

impl Domain {
    pub fn new(domain_type: DomainType, domain_kwargs: Kwargs) -> Self {
        Self {
            rule_name: None,
            domain_type,
            domain_kwargs,
            details: Kwargs::new(),
        }
    }

    /// Domain of a metric configuration, typed by parsing its domain kwargs.
    pub fn from_metric(config: &MetricConfiguration) -> Result<Self> {
        let parsed = ParsedDomain::parse(config.metric_name(), config.domain_kwargs())?;
        Ok(Self::new(
            parsed.domain.domain_type(),
            config.domain_kwargs().clone(),
        ))
    }

    pub fn with_rule_name(mut self, rule_name: impl Into<String>) -> Self {
        self.rule_name = Some(rule_name.into());
        self
    }

    pub fn with_details(mut self, details: Kwargs) -> Self {
        self.details = details;
        self
    }

    /// Hex SHA-256 of type, kwargs and details. The rule name is excluded.
    pub fn id(&self) -> String {
        let identity = json!({
            "domain_type": self.domain_type,
            "domain_kwargs": self.domain_kwargs,
            "details": self.details,
        });
        hex::encode(Sha256::digest(identity.to_string().as_bytes()))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "rule_name": self.rule_name,
            "domain_type": self.domain_type,
            "domain_kwargs": self.domain_kwargs,
            "details": self.details,
            "id": self.id(),
        })
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Domain {}

impl Hash for Domain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} domain {}",
            self.domain_type,
            self.domain_kwargs.to_canonical_json()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{kwargs, metric};

    #[test]
    fn test_id_ignores_rule_name() {
        let a = Domain::new(DomainType::Column, kwargs(json!({"column": "a"}))).with_rule_name("r1");
        let b = Domain::new(DomainType::Column, kwargs(json!({"column": "a"}))).with_rule_name("r2");
        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_depends_on_details_and_type() {
        let plain = Domain::new(DomainType::Column, kwargs(json!({"column": "a"})));
        let detailed = plain
            .clone()
            .with_details(kwargs(json!({"inferred_semantic_domain_type": "numeric"})));
        let table = Domain::new(DomainType::Table, kwargs(json!({"column": "a"})));
        assert_ne!(plain.id(), detailed.id());
        assert_ne!(plain.id(), table.id());
        assert_eq!(plain.id().len(), 64);
    }

    #[test]
    fn test_from_metric() {
        let config = metric(
            "column_pair_values.equal.condition",
            json!({"column_A": "a", "column_B": "b"}),
            json!({}),
        );
        let domain = Domain::from_metric(&config).unwrap();
        assert_eq!(domain.domain_type, DomainType::ColumnPair);
        assert_eq!(domain.to_json()["domain_type"], json!("column_pair"));
        assert_eq!(domain.to_json()["rule_name"], Value::Null);
    }
}
