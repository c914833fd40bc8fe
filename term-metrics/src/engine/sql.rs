//! SQL-pushdown backend.
//!
//! Providers build SQL fragments against a FROM-clause relation; deferred
//! aggregates sharing a compute domain are combined into a single
//! `SELECT agg_0 AS m_0, agg_1 AS m_1, ... FROM relation` statement.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::error::DataFusionError;
use datafusion::prelude::SessionContext;
use datafusion::sql::TableReference;
use tracing::instrument;

use super::{
    resolver, Backend, EngineConfig, EngineCore, ExecutionEngine, ProviderCall, Resolution, SqlCall,
};
use crate::core::value::single_row_values;
use crate::core::{
    AggregateSource, Batch, BatchData, BatchManager, ComputeDomain, DeferredAggregate, IgnoreRowIf,
    Kwargs, MetricConfiguration, MetricDomain, MetricValue, MetricsMap, RowFilter,
};
use crate::error::{MetricError, Result};
use crate::logging::truncate_field;
use crate::perf_debug;
use crate::registry::{BackendKind, MetricRegistry, Provider};
use crate::security::SqlSecurity;

/// Alias of the filtered compute-domain subquery.
const DOMAIN_ALIAS: &str = "\"__term_domain\"";

/// Engine that pushes metric computation down as SQL.
pub struct SqlEngine {
    core: EngineCore,
    ctx: SessionContext,
}

impl std::fmt::Debug for SqlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlEngine")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl SqlEngine {
    pub fn new(registry: Arc<MetricRegistry>) -> Result<Self> {
        Self::with_config(registry, EngineConfig::default())
    }

    #[instrument(skip_all)]
    pub fn with_config(registry: Arc<MetricRegistry>, config: EngineConfig) -> Result<Self> {
        let ctx = config.session.build_context()?;
        Ok(Self::with_context(registry, config, ctx))
    }

    /// Wraps an existing session, e.g. one with tables already registered.
    pub fn with_context(
        registry: Arc<MetricRegistry>,
        config: EngineConfig,
        ctx: SessionContext,
    ) -> Self {
        Self {
            core: EngineCore::new(registry, config),
            ctx,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Loads a table of the session as a batch and makes it the active one.
    #[instrument(skip(self))]
    pub fn load_table(&self, batch_id: &str, table_name: &str) -> Result<()> {
        SqlSecurity::validate_identifier(table_name)?;
        if !self.ctx.table_exist(TableReference::bare(table_name))? {
            return Err(DataFusionError::Plan(format!("table '{table_name}' not found")).into());
        }
        self.core.batches.load_batch(Batch::new(
            batch_id,
            BatchData::SqlTable {
                table_name: table_name.to_string(),
            },
        ))
    }

    /// Registers record batches as an in-memory table and loads it.
    #[instrument(skip(self, schema, batches))]
    pub fn register_record_batches(
        &self,
        batch_id: &str,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<()> {
        SqlSecurity::validate_identifier(table_name)?;
        let table = MemTable::try_new(schema, vec![batches])?;
        self.ctx
            .register_table(TableReference::bare(table_name), Arc::new(table))?;
        self.load_table(batch_id, table_name)
    }

    /// Executes a statement as one counted round trip.
    pub(crate) async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        perf_debug!(
            self.core.config.log,
            sql = %truncate_field(sql, self.core.config.log.max_field_length),
            "executing query"
        );
        self.core
            .round_trip(BackendKind::Sql, async {
                let frame = self.ctx.sql(sql).await?;
                Ok(frame.collect().await?)
            })
            .await
    }

    fn table_name(batch: &Batch) -> Result<&str> {
        match &batch.data {
            BatchData::SqlTable { table_name } => Ok(table_name),
            other => Err(MetricError::Internal(format!(
                "batch '{}' holds {} data, which the SQL engine cannot query",
                batch.id,
                other.kind()
            ))),
        }
    }

    /// FROM-clause relation for a domain of a table.
    pub(crate) fn relation(table_name: &str, domain: &MetricDomain) -> Result<String> {
        let table = SqlSecurity::escape_identifier(table_name)?;
        match domain.row_filter() {
            None => Ok(table),
            Some(filter) => Ok(format!(
                "(SELECT * FROM {table} WHERE {}) AS {DOMAIN_ALIAS}",
                keep_predicate(&filter)?
            )),
        }
    }
}

fn keep_predicate(filter: &RowFilter) -> Result<String> {
    let present = filter
        .columns
        .iter()
        .map(|c| Ok(format!("{} IS NOT NULL", SqlSecurity::escape_identifier(c)?)))
        .collect::<Result<Vec<_>>>()?;
    let joiner = match filter.ignore {
        IgnoreRowIf::AllMissing => " OR ",
        IgnoreRowIf::AnyMissing | IgnoreRowIf::Never => " AND ",
    };
    Ok(format!("({})", present.join(joiner)))
}

#[async_trait]
impl Backend for SqlEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn core(&self) -> &EngineCore {
        &self.core
    }

    async fn schema(&self, batch: &Batch) -> Result<SchemaRef> {
        let table_name = Self::table_name(batch)?;
        let frame = self.ctx.table(TableReference::bare(table_name)).await?;
        Ok(frame.schema().inner().clone())
    }

    async fn invoke(
        &self,
        provider: Provider,
        call: ProviderCall<'_>,
        batch: &Batch,
    ) -> Result<MetricValue> {
        let relation = Self::relation(Self::table_name(batch)?, call.domain)?;
        let domain_key = ComputeDomain::new(batch.id.clone(), call.domain).key();
        let call = SqlCall {
            call,
            engine: self,
            relation,
            domain_key,
        };
        match provider {
            Provider::SqlPlan(build) => build(&call),
            Provider::SqlQuery(run) => run(&call).await,
            other => Err(MetricError::Internal(format!(
                "{other:?} provider cannot run on the SQL engine"
            ))),
        }
    }

    async fn execute_bundle(&self, members: &[&DeferredAggregate]) -> Result<Vec<MetricValue>> {
        let mut relation: Option<&str> = None;
        let mut select = Vec::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            let AggregateSource::Sql {
                relation: member_relation,
                expression,
            } = &member.source
            else {
                return Err(MetricError::Internal(
                    "SQL engine received a non-SQL deferred aggregate".to_string(),
                ));
            };
            match relation {
                None => relation = Some(member_relation),
                Some(r) if r != member_relation => {
                    return Err(MetricError::Internal(format!(
                        "deferred aggregates on domain_id {} use different relations",
                        member.domain_key
                    )))
                }
                Some(_) => {}
            }
            select.push(format!("{expression} AS \"m_{i}\""));
        }
        let Some(relation) = relation else {
            return Ok(Vec::new());
        };
        let sql = format!("SELECT {} FROM {relation}", select.join(", "));
        let batches = self.query(&sql).await?;
        single_row_values(&batches)
    }

    async fn domain_records(&self, batch: &Batch, domain: &MetricDomain) -> Result<Vec<RecordBatch>> {
        let relation = Self::relation(Self::table_name(batch)?, domain)?;
        self.query(&format!("SELECT * FROM {relation}")).await
    }
}

#[async_trait]
impl ExecutionEngine for SqlEngine {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Sql
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
