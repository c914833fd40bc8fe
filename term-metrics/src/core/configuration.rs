//! Metric configurations and their identity.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::kwargs::Kwargs;
use super::value::MetricValue;
use crate::error::{MetricError, Result};

/// Identity of a metric: what is computed, independent of how.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricId {
    pub metric_name: String,
    pub domain_kwargs_id: String,
    pub value_kwargs_id: String,
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {})",
            self.metric_name, self.domain_kwargs_id, self.value_kwargs_id
        )
    }
}

/// Resolved values keyed by metric identity.
pub type MetricsMap = HashMap<MetricId, MetricValue>;

/// A request for one metric: name, domain, value parameters and the named
/// upstream metrics it is computed from.
///
/// Equality and hashing only look at [`MetricConfiguration::id`]; the
/// dependencies describe how a value is obtained, not what it is.
///
/// # Examples
///
/// ```rust
/// use term_metrics::core::{Kwargs, MetricConfiguration};
///
/// let max = MetricConfiguration::new(
///     "column.max",
///     Kwargs::new().with("column", "a"),
///     Kwargs::new(),
/// );
/// assert_eq!(max.id().domain_kwargs_id, "column=a");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfiguration {
    metric_name: String,
    metric_domain_kwargs: Kwargs,
    metric_value_kwargs: Kwargs,
    #[serde(default)]
    metric_dependencies: BTreeMap<String, MetricConfiguration>,
    #[serde(skip_serializing, default)]
    id: Option<MetricId>,
}

impl MetricConfiguration {
    /// Creates a configuration without dependencies.
    pub fn new(metric_name: impl Into<String>, domain_kwargs: Kwargs, value_kwargs: Kwargs) -> Self {
        let metric_name = metric_name.into();
        let id = MetricId {
            domain_kwargs_id: domain_kwargs.id(),
            value_kwargs_id: value_kwargs.id(),
            metric_name: metric_name.clone(),
        };
        Self {
            metric_name,
            metric_domain_kwargs: domain_kwargs,
            metric_value_kwargs: value_kwargs,
            metric_dependencies: BTreeMap::new(),
            id: Some(id),
        }
    }

    /// Creates a configuration from raw JSON kwargs.
    ///
    /// Domain kwargs must be an object; value kwargs may be an object or
    /// `null`. Any other shape fails here rather than at resolution time.
    pub fn try_from_json(
        metric_name: impl Into<String>,
        domain_kwargs: Value,
        value_kwargs: Value,
    ) -> Result<Self> {
        let metric_name = metric_name.into();
        let domain = Kwargs::try_from_json(domain_kwargs)
            .map_err(|e| relabel(e, &metric_name, "metric_domain_kwargs"))?;
        let value = Kwargs::try_from_json(value_kwargs)
            .map_err(|e| relabel(e, &metric_name, "metric_value_kwargs"))?;
        Ok(Self::new(metric_name, domain, value))
    }

    /// Builder-style dependency registration.
    pub fn with_dependency(mut self, key: impl Into<String>, dependency: MetricConfiguration) -> Self {
        self.metric_dependencies.insert(key.into(), dependency);
        self
    }

    /// Adds or replaces a named dependency.
    pub fn set_dependency(&mut self, key: impl Into<String>, dependency: MetricConfiguration) {
        self.metric_dependencies.insert(key.into(), dependency);
    }

    /// Replaces all dependencies.
    pub fn set_dependencies(&mut self, dependencies: BTreeMap<String, MetricConfiguration>) {
        self.metric_dependencies = dependencies;
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn domain_kwargs(&self) -> &Kwargs {
        &self.metric_domain_kwargs
    }

    pub fn value_kwargs(&self) -> &Kwargs {
        &self.metric_value_kwargs
    }

    pub fn dependencies(&self) -> &BTreeMap<String, MetricConfiguration> {
        &self.metric_dependencies
    }

    pub fn dependencies_mut(&mut self) -> &mut BTreeMap<String, MetricConfiguration> {
        &mut self.metric_dependencies
    }

    /// The identity tuple `(name, domain_kwargs_id, value_kwargs_id)`.
    pub fn id(&self) -> MetricId {
        match &self.id {
            Some(id) => id.clone(),
            None => self.compute_id(),
        }
    }

    fn compute_id(&self) -> MetricId {
        MetricId {
            metric_name: self.metric_name.clone(),
            domain_kwargs_id: self.metric_domain_kwargs.id(),
            value_kwargs_id: self.metric_value_kwargs.id(),
        }
    }

    /// JSON description of the configuration, dependencies included.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "metric_name": self.metric_name,
            "metric_domain_kwargs": self.metric_domain_kwargs,
            "metric_domain_kwargs_id": self.metric_domain_kwargs.id(),
            "metric_value_kwargs": self.metric_value_kwargs,
            "metric_value_kwargs_id": self.metric_value_kwargs.id(),
            "metric_dependencies": self
                .metric_dependencies
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<_, _>>(),
        })
    }
}

impl PartialEq for MetricConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for MetricConfiguration {}

impl Hash for MetricConfiguration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for MetricConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

fn relabel(err: MetricError, metric_name: &str, kwarg: &str) -> MetricError {
    match err {
        MetricError::Configuration { message, .. } => {
            MetricError::configuration(metric_name, kwarg, message)
        }
        other => other,
    }
}
