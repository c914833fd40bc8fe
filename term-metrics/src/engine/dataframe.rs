//! Lazy dataframe backend.
//!
//! Mirrors the SQL engine with DataFusion `DataFrame` plans instead of SQL
//! text: deferred aggregates sharing a compute domain run as one
//! `aggregate(vec![], exprs)` job.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::{ident, DataFrame, Expr, SessionContext};
use tracing::instrument;

use super::{
    resolver, Backend, DataFrameCall, EngineConfig, EngineCore, ExecutionEngine, ProviderCall,
    Resolution,
};
use crate::core::value::single_row_values;
use crate::core::{
    AggregateSource, Batch, BatchData, BatchManager, ComputeDomain, DeferredAggregate, IgnoreRowIf,
    Kwargs, MetricConfiguration, MetricDomain, MetricValue, MetricsMap, RowFilter,
};
use crate::error::{MetricError, Result};
use crate::registry::{BackendKind, MetricRegistry, Provider};

/// Engine that evaluates metrics on lazy DataFusion dataframes.
pub struct DataFrameEngine {
    core: EngineCore,
    ctx: SessionContext,
}

impl std::fmt::Debug for DataFrameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFrameEngine")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl DataFrameEngine {
    pub fn new(registry: Arc<MetricRegistry>) -> Result<Self> {
        Self::with_config(registry, EngineConfig::default())
    }

    #[instrument(skip_all)]
    pub fn with_config(registry: Arc<MetricRegistry>, config: EngineConfig) -> Result<Self> {
        let ctx = config.session.build_context()?;
        Ok(Self {
            core: EngineCore::new(registry, config),
            ctx,
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Loads a dataframe as a batch and makes it the active one.
    #[instrument(skip(self, frame))]
    pub fn load_dataframe(&self, batch_id: &str, frame: DataFrame) -> Result<()> {
        self.core
            .batches
            .load_batch(Batch::new(batch_id, BatchData::DataFrame(frame)))
    }

    /// Wraps record batches in a dataframe and loads it.
    #[instrument(skip(self, schema, batches))]
    pub fn load_record_batches(
        &self,
        batch_id: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        let table = MemTable::try_new(schema, vec![batches])?;
        let frame = self.ctx.read_table(Arc::new(table))?;
        self.load_dataframe(batch_id, frame)
    }

    /// Collects a frame as one counted round trip.
    pub(crate) async fn collect(&self, frame: DataFrame) -> Result<Vec<RecordBatch>> {
        self.core
            .round_trip(BackendKind::DataFrame, async move { Ok(frame.collect().await?) })
            .await
    }

    fn frame(batch: &Batch) -> Result<&DataFrame> {
        match &batch.data {
            BatchData::DataFrame(frame) => Ok(frame),
            other => Err(MetricError::Internal(format!(
                "batch '{}' holds {} data, which the dataframe engine cannot read",
                batch.id,
                other.kind()
            ))),
        }
    }

    /// Frame of a domain, with `ignore_row_if` applied.
    pub(crate) fn domain_frame(frame: &DataFrame, domain: &MetricDomain) -> Result<DataFrame> {
        match domain.row_filter() {
            None => Ok(frame.clone()),
            Some(filter) => match keep_expr(&filter) {
                Some(keep) => Ok(frame.clone().filter(keep)?),
                None => Ok(frame.clone()),
            },
        }
    }
}

fn keep_expr(filter: &RowFilter) -> Option<Expr> {
    filter
        .columns
        .iter()
        .map(|c| ident(c).is_not_null())
        .reduce(|acc, present| match filter.ignore {
            IgnoreRowIf::AllMissing => acc.or(present),
            IgnoreRowIf::AnyMissing | IgnoreRowIf::Never => acc.and(present),
        })
}

#[async_trait]
impl Backend for DataFrameEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::DataFrame
    }

    fn core(&self) -> &EngineCore {
        &self.core
    }

    async fn schema(&self, batch: &Batch) -> Result<SchemaRef> {
        Ok(Self::frame(batch)?.schema().inner().clone())
    }

    async fn invoke(
        &self,
        provider: Provider,
        call: ProviderCall<'_>,
        batch: &Batch,
    ) -> Result<MetricValue> {
        let frame = Self::domain_frame(Self::frame(batch)?, call.domain)?;
        let domain_key = ComputeDomain::new(batch.id.clone(), call.domain).key();
        let call = DataFrameCall {
            call,
            engine: self,
            frame,
            domain_key,
        };
        match provider {
            Provider::DataFramePlan(build) => build(&call),
            Provider::DataFrameQuery(run) => run(&call).await,
            other => Err(MetricError::Internal(format!(
                "{other:?} provider cannot run on the dataframe engine"
            ))),
        }
    }

    async fn execute_bundle(&self, members: &[&DeferredAggregate]) -> Result<Vec<MetricValue>> {
        let mut frame: Option<&DataFrame> = None;
        let mut aggregates = Vec::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            let AggregateSource::DataFrame {
                frame: member_frame,
                expression,
            } = &member.source
            else {
                return Err(MetricError::Internal(
                    "dataframe engine received a non-dataframe deferred aggregate".to_string(),
                ));
            };
            if frame.is_none() {
                frame = Some(member_frame);
            }
            aggregates.push(expression.clone().alias(format!("m_{i}")));
        }
        let Some(frame) = frame else {
            return Ok(Vec::new());
        };
        let job = frame.clone().aggregate(vec![], aggregates)?;
        let batches = self.collect(job).await?;
        single_row_values(&batches)
    }

    async fn domain_records(&self, batch: &Batch, domain: &MetricDomain) -> Result<Vec<RecordBatch>> {
        let frame = Self::domain_frame(Self::frame(batch)?, domain)?;
        self.collect(frame).await
    }
}

#[async_trait]
impl ExecutionEngine for DataFrameEngine {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::DataFrame
    }

    fn registry(&self) -> &Arc<MetricRegistry> {
        &self.core.registry
    }

    fn batch_manager(&self) -> &BatchManager {
        &self.core.batches
    }

    fn round_trips(&self) -> usize {
        self.core.round_trips()
    }

    async fn resolve_metrics(
        &self,
        metrics_to_resolve: &[MetricConfiguration],
        known: &MetricsMap,
    ) -> Result<Resolution> {
        resolver::resolve(self, metrics_to_resolve, known).await
    }

    async fn get_domain_records(&self, domain_kwargs: &Kwargs) -> Result<Vec<RecordBatch>> {
        resolver::domain_records(self, domain_kwargs).await
    }
}
