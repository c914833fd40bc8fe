//! Execution engines and the shared resolution entry point.
//!
//! Three backends implement [`ExecutionEngine`]:
//!
//! - [`InProcessEngine`]: materialized Arrow data, every provider computes locally
//! - [`SqlEngine`]: SQL text pushed down to a DataFusion session
//! - [`DataFrameEngine`]: lazy DataFusion dataframes
//!
//! All of them run the same resolution algorithm (see [`resolver`]); only
//! provider invocation and round-trip execution differ per backend.
//!
//! # Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use term_metrics::prelude::*;
//!
//! # async fn example(batch: arrow::record_batch::RecordBatch) -> Result<()> {
//! let registry = Arc::new(MetricRegistry::with_defaults()?);
//! let engine = InProcessEngine::new(registry);
//! engine.load_batch_data("b1", batch.schema(), vec![batch])?;
//!
//! let max = MetricConfiguration::new("column.max", Kwargs::new().with("column", "a"), Kwargs::new());
//! let resolution = engine.resolve_metrics(&[max.clone()], &MetricsMap::new()).await?;
//! println!("{}", resolution.value(&max)?);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::ArrayRef;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datafusion::execution::context::{SessionConfig, SessionContext};
use datafusion::execution::memory_pool::{FairSpillPool, MemoryPool};
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::DataFrame;
use serde::Serialize;
use serde_json::Value;

use crate::core::kwargs::json_type_name;
use crate::core::{
    Batch, BatchManager, DeferredAggregate, Kwargs, MetricConfiguration, MetricDomain, MetricId,
    MetricValue, MetricsMap, ResultFormat, UnexpectedCondition,
};
use crate::error::{MetricError, Result};
use crate::logging::LogConfig;
use crate::registry::{BackendKind, MetricRegistry, Provider, CONDITION_KEY};

pub mod dataframe;
pub mod in_process;
pub(crate) mod resolver;
pub mod sql;

pub use dataframe::DataFrameEngine;
pub use in_process::InProcessEngine;
pub use sql::SqlEngine;

/// DataFusion session settings shared by the SQL and dataframe engines.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Target number of partitions for parallel execution
    pub target_partitions: usize,
    /// Maximum memory for query execution (in bytes)
    pub max_memory: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            max_memory: 2 * 1024 * 1024 * 1024, // 2GB
        }
    }
}

impl SessionSettings {
    /// Builds a session context with a fair spill memory pool.
    pub fn build_context(&self) -> Result<SessionContext> {
        let session_config = SessionConfig::new()
            .with_batch_size(self.batch_size)
            .with_target_partitions(self.target_partitions);

        let memory_pool = Arc::new(FairSpillPool::new(self.max_memory)) as Arc<dyn MemoryPool>;
        let runtime_env = RuntimeEnvBuilder::new()
            .with_memory_pool(memory_pool)
            .build()
            .map(Arc::new)?;

        Ok(SessionContext::new_with_config_rt(session_config, runtime_env))
    }
}

/// Configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log: LogConfig,
    /// Upper bound for a single query or job; `None` waits indefinitely.
    pub round_trip_timeout: Option<Duration>,
    /// Maximum number of deferred aggregates combined into one round trip.
    pub max_bundle_size: usize,
    pub session: SessionSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            round_trip_timeout: None,
            max_bundle_size: 20,
            session: SessionSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = Some(timeout);
        self
    }

    /// Sets the bundle size; values below one are treated as one.
    pub fn with_max_bundle_size(mut self, size: usize) -> Self {
        self.max_bundle_size = size.max(1);
        self
    }

    pub fn with_session(mut self, session: SessionSettings) -> Self {
        self.session = session;
        self
    }
}

/// Why a requested metric was not resolved in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PendingReason {
    /// Its `metric_partial_fn` dependency has not been built yet.
    PartialNotBuilt,
    /// A dependency is finalized by a round trip executed in this call.
    AwaitingRoundTrip,
}

/// A metric that needs another resolution pass.
#[derive(Debug, Clone)]
pub struct PendingMetric {
    pub metric: MetricConfiguration,
    /// Configurations to resolve (or wait for) before re-issuing `metric`.
    pub needs: Vec<MetricConfiguration>,
    pub reason: PendingReason,
}

/// Bookkeeping about one resolution call.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionMetadata {
    pub backend: BackendKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Queries or jobs executed during the call.
    pub round_trips: usize,
    /// Combined aggregate round trips.
    pub bundles: usize,
    pub metrics_resolved: usize,
}

impl ResolutionMetadata {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Output of [`ExecutionEngine::resolve_metrics`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Values computed in this call, dependencies included.
    pub resolved: MetricsMap,
    pub pending: Vec<PendingMetric>,
    pub metadata: ResolutionMetadata,
}

impl Resolution {
    pub fn get(&self, config: &MetricConfiguration) -> Option<&MetricValue> {
        self.resolved.get(&config.id())
    }

    /// Value of a metric, or an error naming it when it was not resolved.
    pub fn value(&self, config: &MetricConfiguration) -> Result<&MetricValue> {
        self.get(config).ok_or_else(|| {
            MetricError::resolution(
                format!("Metric {} was not resolved", config.id()),
                config.metric_name(),
                config.domain_kwargs().to_canonical_json(),
            )
        })
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, config: &MetricConfiguration) -> bool {
        let id = config.id();
        self.pending.iter().any(|p| p.metric.id() == id)
    }
}

/// Common interface of all execution backends.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn backend_kind(&self) -> BackendKind;

    fn registry(&self) -> &Arc<MetricRegistry>;

    fn batch_manager(&self) -> &BatchManager;

    /// Total queries or jobs executed by this engine so far.
    fn round_trips(&self) -> usize;

    /// Resolves `metrics_to_resolve` and their transitive dependencies.
    ///
    /// Metrics already present in `known` are not recomputed. The returned
    /// [`Resolution`] holds only values computed in this call; callers merge
    /// them into their running map.
    async fn resolve_metrics(
        &self,
        metrics_to_resolve: &[MetricConfiguration],
        known: &MetricsMap,
    ) -> Result<Resolution>;

    /// Rows of the compute domain described by `domain_kwargs`.
    async fn get_domain_records(&self, domain_kwargs: &Kwargs) -> Result<Vec<RecordBatch>>;
}

/// State shared by every backend implementation.
#[derive(Debug)]
pub(crate) struct EngineCore {
    pub registry: Arc<MetricRegistry>,
    pub config: EngineConfig,
    pub batches: BatchManager,
    round_trips: AtomicUsize,
}

impl EngineCore {
    pub fn new(registry: Arc<MetricRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            batches: BatchManager::new(),
            round_trips: AtomicUsize::new(0),
        }
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Runs one query or job, counting it and applying the configured timeout.
    pub async fn round_trip<T, F>(&self, backend: BackendKind, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        match self.config.round_trip_timeout {
            Some(timeout) => tokio::time::timeout(timeout, work)
                .await
                .map_err(|_| MetricError::Timeout { backend, timeout })?,
            None => work.await,
        }
    }
}

/// Backend hooks used by the resolver.
#[async_trait]
pub(crate) trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn core(&self) -> &EngineCore;

    /// Schema of a loaded batch.
    async fn schema(&self, batch: &Batch) -> Result<SchemaRef>;

    /// Runs a backend-bound provider.
    async fn invoke(
        &self,
        provider: Provider,
        call: ProviderCall<'_>,
        batch: &Batch,
    ) -> Result<MetricValue>;

    /// Executes deferred aggregates sharing one compute domain in a single
    /// round trip, returning raw values in member order.
    async fn execute_bundle(&self, members: &[&DeferredAggregate]) -> Result<Vec<MetricValue>>;

    /// Materialized rows of a compute domain.
    async fn domain_records(&self, batch: &Batch, domain: &MetricDomain) -> Result<Vec<RecordBatch>>;
}

/// Everything a provider sees about the metric it computes.
#[derive(Debug, Clone)]
pub struct ProviderCall<'a> {
    pub backend: BackendKind,
    pub config: &'a MetricConfiguration,
    pub domain: &'a MetricDomain,
    pub batch_id: &'a str,
    /// Schema of the batch, before any row filtering.
    pub schema: SchemaRef,
    /// Resolved dependency values by dependency key.
    pub dependencies: BTreeMap<String, MetricValue>,
}

impl<'a> ProviderCall<'a> {
    pub fn metric_name(&self) -> &str {
        self.config.metric_name()
    }

    pub fn id(&self) -> MetricId {
        self.config.id()
    }

    pub fn value_kwargs(&self) -> &Kwargs {
        self.config.value_kwargs()
    }

    /// Canonical JSON of the domain kwargs, used in error messages.
    pub fn domain_json(&self) -> String {
        self.config.domain_kwargs().to_canonical_json()
    }

    pub fn dependency(&self, key: &str) -> Result<&MetricValue> {
        self.dependencies
            .get(key)
            .ok_or_else(|| MetricError::MissingDependency {
                metric: self.metric_name().to_string(),
                dependency: key.to_string(),
                backend: self.backend,
            })
    }

    /// The `unexpected_condition` dependency of a derivative.
    pub fn condition(&self) -> Result<&UnexpectedCondition> {
        self.dependency(CONDITION_KEY)?
            .as_condition()
            .ok_or_else(|| self.error("unexpected_condition dependency is not a condition"))
    }

    pub fn result_format(&self) -> Result<ResultFormat> {
        ResultFormat::from_value_kwargs(self.metric_name(), self.value_kwargs())
    }

    /// The single column of a column domain.
    pub fn column(&self) -> Result<&'a str> {
        self.domain.column().ok_or_else(|| {
            MetricError::configuration(
                self.config.metric_name(),
                "metric_domain_kwargs",
                format!("a column domain is required, got {}", self.domain.domain_type()),
            )
        })
    }

    /// Index of a column in the batch schema.
    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.schema
            .index_of(column)
            .map_err(|_| MetricError::ColumnNotFound {
                column: column.to_string(),
                metric_name: self.metric_name().to_string(),
                domain_kwargs: self.domain_json(),
            })
    }

    /// Column names of the batch, in schema order.
    pub fn schema_columns(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.value_kwargs().get(key).filter(|v| !v.is_null())
    }

    pub fn required_kwarg(&self, key: &str) -> Result<&Value> {
        self.kwarg(key)
            .ok_or_else(|| self.configuration_error(key, "is required"))
    }

    pub fn kwarg_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.kwarg(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(self.type_error(key, "a boolean", other)),
        }
    }

    pub fn kwarg_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.kwarg(key) {
            None => Ok(default),
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| self.type_error(key, "a non-negative integer", value)),
        }
    }

    pub fn kwarg_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.kwarg(key) {
            None => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.type_error(key, "a number", value)),
        }
    }

    pub fn kwarg_str(&self, key: &str) -> Result<Option<&str>> {
        match self.kwarg(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.type_error(key, "a string", other)),
        }
    }

    pub fn kwarg_list(&self, key: &str) -> Result<&[Value]> {
        match self.required_kwarg(key)? {
            Value::Array(items) => Ok(items),
            other => Err(self.type_error(key, "a list", other)),
        }
    }

    pub fn configuration_error(&self, kwarg: &str, message: impl Into<String>) -> MetricError {
        MetricError::configuration(self.metric_name(), kwarg, message)
    }

    /// A resolution error attributed to this metric and domain.
    pub fn error(&self, message: impl Into<String>) -> MetricError {
        MetricError::resolution(message, self.metric_name(), self.domain_json())
    }

    fn type_error(&self, key: &str, expected: &str, got: &Value) -> MetricError {
        self.configuration_error(key, format!("expected {expected}, got {}", json_type_name(got)))
    }
}

/// Provider input on the in-process engine.
#[derive(Debug, Clone)]
pub struct InProcessCall<'a> {
    pub call: ProviderCall<'a>,
    /// Rows of the compute domain (after `ignore_row_if`).
    pub records: RecordBatch,
}

impl<'a> InProcessCall<'a> {
    /// A column of the domain rows.
    pub fn column_array(&self, column: &str) -> Result<ArrayRef> {
        let index = self
            .records
            .schema()
            .index_of(column)
            .map_err(|_| MetricError::ColumnNotFound {
                column: column.to_string(),
                metric_name: self.metric_name().to_string(),
                domain_kwargs: self.domain_json(),
            })?;
        Ok(self.records.column(index).clone())
    }

    /// The column of a column domain.
    pub fn domain_column(&self) -> Result<ArrayRef> {
        let column = self.column()?;
        self.column_array(column)
    }
}

impl<'a> Deref for InProcessCall<'a> {
    type Target = ProviderCall<'a>;

    fn deref(&self) -> &Self::Target {
        &self.call
    }
}

/// Provider input on the SQL engine.
#[derive(Debug, Clone)]
pub struct SqlCall<'a> {
    pub call: ProviderCall<'a>,
    pub engine: &'a SqlEngine,
    /// FROM-clause relation of the compute domain.
    pub relation: String,
    /// Compute-domain key used to group deferred aggregates.
    pub domain_key: String,
}

impl<'a> SqlCall<'a> {
    /// Runs a statement as one counted round trip.
    pub async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        self.engine.query(sql).await
    }

    /// Quoted identifier of a domain column.
    pub fn quoted(&self, column: &str) -> Result<String> {
        crate::security::SqlSecurity::escape_identifier(column)
    }
}

impl<'a> Deref for SqlCall<'a> {
    type Target = ProviderCall<'a>;

    fn deref(&self) -> &Self::Target {
        &self.call
    }
}

/// Provider input on the dataframe engine.
#[derive(Debug, Clone)]
pub struct DataFrameCall<'a> {
    pub call: ProviderCall<'a>,
    pub engine: &'a DataFrameEngine,
    /// Lazy frame of the compute domain.
    pub frame: DataFrame,
    pub domain_key: String,
}

impl<'a> DataFrameCall<'a> {
    /// Collects a frame as one counted round trip.
    pub async fn collect(&self, frame: DataFrame) -> Result<Vec<RecordBatch>> {
        self.engine.collect(frame).await
    }
}

impl<'a> Deref for DataFrameCall<'a> {
    type Target = ProviderCall<'a>;

    fn deref(&self) -> &Self::Target {
        &self.call
    }
}
