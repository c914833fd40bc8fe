//! Provider registry: which function computes which metric on which backend.
//!
//! The registry is an explicit object shared through an `Arc`. Built-in
//! providers are installed by [`MetricRegistry::with_defaults`]; applications
//! add their own with [`MetricRegistry::register`]. Registration upserts, so
//! installing the same provider twice is harmless.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::domain::{BATCH_ID, COLUMN};
use crate::core::result_format::RESULT_FORMAT;
use crate::core::{DomainType, Kwargs, MetricConfiguration, MetricValue};
use crate::engine::{DataFrameCall, InProcessCall, ProviderCall, SqlCall};
use crate::error::{MetricError, Result};

/// Dependency key naming the deferred aggregate a finalizing metric executes.
pub const PARTIAL_FN_KEY: &str = "metric_partial_fn";
/// Dependency key naming the condition an unexpected derivative reads.
pub const CONDITION_KEY: &str = "unexpected_condition";

/// Capability tag of an execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    InProcess,
    Sql,
    DataFrame,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::InProcess, Self::Sql, Self::DataFrame];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InProcess => "in-process",
            Self::Sql => "sql",
            Self::DataFrame => "dataframe",
        };
        f.write_str(name)
    }
}

/// What a provider contributes to resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricRole {
    /// Produces the metric value.
    Direct,
    /// Produces an [`crate::core::UnexpectedCondition`] for a map metric.
    Condition,
    /// Builds a [`crate::core::DeferredAggregate`] without executing it.
    AggregatePartial,
    /// Count/values/rows/value-counts derived from a condition.
    UnexpectedDerivative,
}

/// How a missing dependency is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Resolved in the same call when the caller does not declare it.
    Implicit,
    /// A separate build phase; undeclared and unknown makes the metric pending.
    Phase,
}

/// Domain kwargs given to a default dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainPolicy {
    /// The dependent's domain.
    Same,
    /// Table level: only `batch_id` is kept.
    Table,
}

/// Value kwargs given to a default dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValuePolicy {
    Same,
    WithoutResultFormat,
    Empty,
}

/// A dependency a provider declares on another metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub key: String,
    pub metric_name: String,
    pub kind: DependencyKind,
    pub domain: DomainPolicy,
    pub values: ValuePolicy,
}

impl DependencySpec {
    /// A same-call dependency keyed by its metric name.
    pub fn implicit(metric_name: impl Into<String>) -> Self {
        let metric_name = metric_name.into();
        Self {
            key: metric_name.clone(),
            metric_name,
            kind: DependencyKind::Implicit,
            domain: DomainPolicy::Same,
            values: ValuePolicy::Same,
        }
    }

    /// The `metric_partial_fn` dependency of a finalizing metric.
    pub fn partial_fn(metric_name: impl Into<String>) -> Self {
        Self {
            key: PARTIAL_FN_KEY.to_string(),
            metric_name: metric_name.into(),
            kind: DependencyKind::Phase,
            domain: DomainPolicy::Same,
            values: ValuePolicy::Same,
        }
    }

    /// The `unexpected_condition` dependency of a derivative.
    pub fn condition(metric_name: impl Into<String>) -> Self {
        Self {
            key: CONDITION_KEY.to_string(),
            metric_name: metric_name.into(),
            kind: DependencyKind::Implicit,
            domain: DomainPolicy::Same,
            values: ValuePolicy::WithoutResultFormat,
        }
    }

    pub fn with_domain(mut self, domain: DomainPolicy) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_values(mut self, values: ValuePolicy) -> Self {
        self.values = values;
        self
    }

    /// The configuration used when the dependent does not declare this one.
    pub fn default_configuration(&self, dependent: &MetricConfiguration) -> MetricConfiguration {
        let domain = match self.domain {
            DomainPolicy::Same => dependent.domain_kwargs().clone(),
            DomainPolicy::Table => dependent.domain_kwargs().only(&[BATCH_ID]),
        };
        let values = match self.values {
            ValuePolicy::Same => dependent.value_kwargs().clone(),
            ValuePolicy::WithoutResultFormat => dependent.value_kwargs().without(&[RESULT_FORMAT]),
            ValuePolicy::Empty => Kwargs::new(),
        };
        MetricConfiguration::new(self.metric_name.clone(), domain, values)
    }
}

/// Declared metadata of one provider registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub metric_name: String,
    pub role: MetricRole,
    pub domain_type: DomainType,
    pub dependencies: Vec<DependencySpec>,
}

impl ProviderSpec {
    pub fn new(metric_name: impl Into<String>, role: MetricRole, domain_type: DomainType) -> Self {
        Self {
            metric_name: metric_name.into(),
            role,
            domain_type,
            dependencies: Vec::new(),
        }
    }

    pub fn direct(metric_name: impl Into<String>, domain_type: DomainType) -> Self {
        Self::new(metric_name, MetricRole::Direct, domain_type)
    }

    pub fn condition(metric_name: impl Into<String>, domain_type: DomainType) -> Self {
        Self::new(metric_name, MetricRole::Condition, domain_type)
    }

    pub fn aggregate_partial(metric_name: impl Into<String>, domain_type: DomainType) -> Self {
        Self::new(metric_name, MetricRole::AggregatePartial, domain_type)
    }

    pub fn derivative(metric_name: impl Into<String>, domain_type: DomainType) -> Self {
        Self::new(metric_name, MetricRole::UnexpectedDerivative, domain_type)
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// The `metric_partial_fn` dependency, when this metric is finalized in a
    /// shared round trip.
    pub fn partial_dependency(&self) -> Option<&DependencySpec> {
        self.dependencies
            .iter()
            .find(|d| d.kind == DependencyKind::Phase)
    }
}

/// In-process provider: computes a value from materialized Arrow data.
pub type InProcessFn = fn(&InProcessCall<'_>) -> Result<MetricValue>;
/// SQL plan builder: returns a condition or deferred aggregate, no I/O.
pub type SqlPlanFn = fn(&SqlCall<'_>) -> Result<MetricValue>;
/// SQL query provider: executes its own statement (one counted round trip).
pub type SqlQueryFn = for<'a> fn(&'a SqlCall<'a>) -> BoxFuture<'a, Result<MetricValue>>;
/// Dataframe plan builder: returns a condition or deferred aggregate, no I/O.
pub type DataFramePlanFn = fn(&DataFrameCall<'_>) -> Result<MetricValue>;
/// Dataframe query provider: collects its own job (one counted round trip).
pub type DataFrameQueryFn = for<'a> fn(&'a DataFrameCall<'a>) -> BoxFuture<'a, Result<MetricValue>>;
/// Backend-agnostic provider computing a value from dependency values only.
pub type DerivedFn = fn(&ProviderCall<'_>) -> Result<MetricValue>;

/// A provider implementation.
#[derive(Clone, Copy)]
pub enum Provider {
    InProcess(InProcessFn),
    SqlPlan(SqlPlanFn),
    SqlQuery(SqlQueryFn),
    DataFramePlan(DataFramePlanFn),
    DataFrameQuery(DataFrameQueryFn),
    Derived(DerivedFn),
    /// Value comes from executing the `metric_partial_fn` dependency.
    Bundled,
}

impl Provider {
    /// Backend the provider is bound to; `None` for backend-agnostic ones.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::InProcess(_) => Some(BackendKind::InProcess),
            Self::SqlPlan(_) | Self::SqlQuery(_) => Some(BackendKind::Sql),
            Self::DataFramePlan(_) | Self::DataFrameQuery(_) => Some(BackendKind::DataFrame),
            Self::Derived(_) | Self::Bundled => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::InProcess(_) => "InProcess",
            Self::SqlPlan(_) => "SqlPlan",
            Self::SqlQuery(_) => "SqlQuery",
            Self::DataFramePlan(_) => "DataFramePlan",
            Self::DataFrameQuery(_) => "DataFrameQuery",
            Self::Derived(_) => "Derived",
            Self::Bundled => "Bundled",
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider::{}", self.name())
    }
}

/// A spec and its provider, as stored in the registry.
#[derive(Debug, Clone)]
pub struct Registration {
    pub spec: Arc<ProviderSpec>,
    pub provider: Provider,
}

type RegistryKey = (String, BackendKind);

/// Maps `(metric name, backend)` to a [`Registration`].
#[derive(Debug, Default)]
pub struct MetricRegistry {
    providers: RwLock<HashMap<RegistryKey, Registration>>,
}

impl MetricRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in provider.
    pub fn with_defaults() -> Result<Self> {
        let registry = Self::new();
        crate::metrics::register_defaults(&registry)?;
        Ok(registry)
    }

    /// Registers or replaces a provider. Returns `true` if one was replaced.
    pub fn register(&self, backend: BackendKind, spec: ProviderSpec, provider: Provider) -> Result<bool> {
        if let Some(bound) = provider.backend() {
            if bound != backend {
                return Err(MetricError::Internal(format!(
                    "{provider:?} provider for '{}' cannot serve the {backend} engine",
                    spec.metric_name
                )));
            }
        }
        if matches!(provider, Provider::Bundled) && spec.partial_dependency().is_none() {
            return Err(MetricError::Internal(format!(
                "bundled metric '{}' must declare a metric_partial_fn dependency",
                spec.metric_name
            )));
        }

        let key = (spec.metric_name.clone(), backend);
        let registration = Registration {
            spec: Arc::new(spec),
            provider,
        };
        let mut providers = self.write()?;
        let replaced = providers.insert(key, registration).is_some();
        if replaced {
            debug!(backend = %backend, "re-registered metric provider");
        }
        Ok(replaced)
    }

    /// Registers a backend-agnostic provider for every backend.
    pub fn register_derived(&self, spec: ProviderSpec, provider: DerivedFn) -> Result<()> {
        for backend in BackendKind::ALL {
            self.register(backend, spec.clone(), Provider::Derived(provider))?;
        }
        Ok(())
    }

    /// Looks up a provider, `None` when not registered.
    pub fn get(&self, metric_name: &str, backend: BackendKind) -> Result<Option<Registration>> {
        Ok(self
            .read()?
            .get(&(metric_name.to_string(), backend))
            .cloned())
    }

    /// Looks up a provider or fails naming the metric and the backend.
    pub fn lookup(&self, metric_name: &str, backend: BackendKind) -> Result<Registration> {
        self.get(metric_name, backend)?
            .ok_or_else(|| MetricError::ProviderNotRegistered {
                metric: metric_name.to_string(),
                backend,
            })
    }

    pub fn contains(&self, metric_name: &str, backend: BackendKind) -> bool {
        matches!(self.get(metric_name, backend), Ok(Some(_)))
    }

    /// Sorted metric names registered for a backend.
    pub fn metric_names(&self, backend: BackendKind) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .read()?
            .keys()
            .filter(|(_, b)| *b == backend)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> usize {
        self.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default configurations for every dependency the provider declares.
    ///
    /// Dependencies the configuration already carries are returned as given.
    pub fn evaluation_dependencies(
        &self,
        config: &MetricConfiguration,
        backend: BackendKind,
    ) -> Result<BTreeMap<String, MetricConfiguration>> {
        let registration = self.lookup(config.metric_name(), backend)?;
        let mut dependencies = config.dependencies().clone();
        for dependency in &registration.spec.dependencies {
            dependencies
                .entry(dependency.key.clone())
                .or_insert_with(|| dependency.default_configuration(config));
        }
        Ok(dependencies)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<RegistryKey, Registration>>> {
        self.providers
            .read()
            .map_err(|_| MetricError::Internal("metric registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<RegistryKey, Registration>>> {
        self.providers
            .write()
            .map_err(|_| MetricError::Internal("metric registry lock poisoned".to_string()))
    }
}

/// Domain kwargs naming a single column.
pub(crate) fn column_kwargs(column: &str) -> Kwargs {
    Kwargs::new().with(COLUMN, column)
}
