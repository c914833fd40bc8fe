//! Metric resolution shared by all backends.
//!
//! A call runs in three steps:
//!
//! 1. **Plan**: walk the requested configurations depth-first, filling in
//!    default dependencies from the registry, detecting cycles and deciding
//!    which metrics must wait for another pass.
//! 2. **Compute**: visit nodes in dependency order. Direct, condition and
//!    partial providers run immediately; finalizers of deferred aggregates
//!    are queued.
//! 3. **Bundle**: queued aggregates are grouped by compute-domain key and each
//!    group is executed as one round trip per `max_bundle_size` members.

use std::collections::{BTreeMap, HashMap};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use tracing::{instrument, warn};

use super::{Backend, PendingMetric, PendingReason, ProviderCall, Resolution, ResolutionMetadata};
use crate::core::{
    BatchSnapshot, DeferredAggregate, Kwargs, MetricConfiguration, MetricId, MetricValue,
    MetricsMap, ParsedDomain,
};
use crate::error::{MetricError, Result};
use crate::logging::truncate_field;
use crate::registry::{
    BackendKind, DependencyKind, MetricRegistry, MetricRole, Provider, Registration, PARTIAL_FN_KEY,
};
use crate::{log_resolution, log_round_trip};

struct Node {
    config: MetricConfiguration,
    registration: Registration,
    dependencies: BTreeMap<String, MetricId>,
}

#[derive(Default)]
struct Plan {
    nodes: HashMap<MetricId, Node>,
    order: Vec<MetricId>,
    pending: BTreeMap<MetricId, PendingMetric>,
}

struct Planner<'a> {
    registry: &'a MetricRegistry,
    backend: BackendKind,
    known: &'a MetricsMap,
    /// Requested configurations by id; later requests win.
    requested: HashMap<MetricId, MetricConfiguration>,
    plan: Plan,
    path: Vec<MetricId>,
}

type VisitedDependencies = (BTreeMap<String, MetricId>, Option<PendingMetric>);

impl<'a> Planner<'a> {
    fn new(
        registry: &'a MetricRegistry,
        backend: BackendKind,
        known: &'a MetricsMap,
        metrics: &[MetricConfiguration],
    ) -> Self {
        let mut requested = HashMap::new();
        for config in metrics {
            requested.insert(config.id(), config.clone());
        }
        Self {
            registry,
            backend,
            known,
            requested,
            plan: Plan::default(),
            path: Vec::new(),
        }
    }

    fn build(mut self, metrics: &[MetricConfiguration]) -> Result<Plan> {
        for config in metrics {
            self.visit(config, None)?;
        }
        Ok(self.plan)
    }

    fn visit(&mut self, config: &MetricConfiguration, parent: Option<&MetricConfiguration>) -> Result<()> {
        let id = config.id();
        if self.known.contains_key(&id)
            || self.plan.nodes.contains_key(&id)
            || self.plan.pending.contains_key(&id)
        {
            return Ok(());
        }
        if let Some(start) = self.path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = self.path[start..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Err(MetricError::DependencyCycle {
                path: cycle.join(" -> "),
            });
        }

        let config = self
            .requested
            .get(&id)
            .cloned()
            .unwrap_or_else(|| config.clone());
        let Some(registration) = self.registry.get(config.metric_name(), self.backend)? else {
            return Err(match parent {
                None => MetricError::ProviderNotRegistered {
                    metric: config.metric_name().to_string(),
                    backend: self.backend,
                },
                Some(parent) => MetricError::MissingDependency {
                    metric: parent.metric_name().to_string(),
                    dependency: config.metric_name().to_string(),
                    backend: self.backend,
                },
            });
        };

        let mut dependencies = config.dependencies().clone();
        for spec in &registration.spec.dependencies {
            if dependencies.contains_key(&spec.key) {
                continue;
            }
            let default = spec.default_configuration(&config);
            if spec.kind == DependencyKind::Phase {
                let dep_id = default.id();
                if !self.known.contains_key(&dep_id) && !self.requested.contains_key(&dep_id) {
                    self.plan.pending.insert(
                        id,
                        PendingMetric {
                            metric: config,
                            needs: vec![default],
                            reason: PendingReason::PartialNotBuilt,
                        },
                    );
                    return Ok(());
                }
            }
            dependencies.insert(spec.key.clone(), default);
        }

        self.path.push(id.clone());
        let visited = self.visit_dependencies(&config, &dependencies);
        self.path.pop();
        let (dependency_ids, blocked) = visited?;

        if let Some(pending) = blocked {
            self.plan.pending.insert(id, pending);
            return Ok(());
        }
        self.plan.nodes.insert(
            id.clone(),
            Node {
                config,
                registration,
                dependencies: dependency_ids,
            },
        );
        self.plan.order.push(id);
        Ok(())
    }

    fn visit_dependencies(
        &mut self,
        config: &MetricConfiguration,
        dependencies: &BTreeMap<String, MetricConfiguration>,
    ) -> Result<VisitedDependencies> {
        let mut ids = BTreeMap::new();
        let mut blocked = None;
        for (key, dependency) in dependencies {
            self.visit(dependency, Some(config))?;
            let dep_id = dependency.id();
            if blocked.is_none() {
                if let Some(pending) = self.plan.pending.get(&dep_id) {
                    blocked = Some(PendingMetric {
                        metric: config.clone(),
                        needs: pending.needs.clone(),
                        reason: pending.reason,
                    });
                } else if self.finalized_by_round_trip(&dep_id) {
                    blocked = Some(PendingMetric {
                        metric: config.clone(),
                        needs: vec![dependency.clone()],
                        reason: PendingReason::AwaitingRoundTrip,
                    });
                }
            }
            ids.insert(key.clone(), dep_id);
        }
        Ok((ids, blocked))
    }

    fn finalized_by_round_trip(&self, id: &MetricId) -> bool {
        self.plan
            .nodes
            .get(id)
            .is_some_and(|node| matches!(node.registration.provider, Provider::Bundled))
    }
}

enum Outcome {
    Value(MetricValue),
    Deferred(DeferredAggregate),
}

struct BundleMember<'p> {
    id: &'p MetricId,
    config: &'p MetricConfiguration,
    deferred: DeferredAggregate,
}

/// Resolves `metrics` on `backend`; see [`super::ExecutionEngine::resolve_metrics`].
#[instrument(skip_all, fields(backend = %backend.kind(), requested = metrics.len()))]
pub(crate) async fn resolve<B: Backend + ?Sized>(
    backend: &B,
    metrics: &[MetricConfiguration],
    known: &MetricsMap,
) -> Result<Resolution> {
    let started_at = Utc::now();
    let core = backend.core();
    let round_trips_before = core.round_trips();
    let snapshot = core.batches.snapshot()?;
    let plan = Planner::new(&core.registry, backend.kind(), known, metrics).build(metrics)?;

    let mut resolved = MetricsMap::new();
    let mut schemas: HashMap<String, SchemaRef> = HashMap::new();
    let mut queue = Vec::new();

    for id in &plan.order {
        let Some(node) = plan.nodes.get(id) else {
            return Err(MetricError::Internal(format!("planned metric {id} has no node")));
        };
        let outcome = compute(backend, node, &snapshot, &mut schemas, &resolved, known)
            .await
            .map_err(|err| {
                err.attribute(
                    node.config.metric_name(),
                    &node.config.domain_kwargs().to_canonical_json(),
                )
            })?;
        match outcome {
            Outcome::Value(value) => {
                log_resolution!(core.config.log, metric = %id, value = %value, "resolved metric");
                resolved.insert(id.clone(), value);
            }
            Outcome::Deferred(deferred) => queue.push(BundleMember {
                id,
                config: &node.config,
                deferred,
            }),
        }
    }

    let bundles = execute_bundles(backend, queue, &mut resolved).await?;

    Ok(Resolution {
        metadata: ResolutionMetadata {
            backend: backend.kind(),
            started_at,
            finished_at: Utc::now(),
            round_trips: core.round_trips().saturating_sub(round_trips_before),
            bundles,
            metrics_resolved: resolved.len(),
        },
        resolved,
        pending: plan.pending.into_values().collect(),
    })
}

async fn compute<B: Backend + ?Sized>(
    backend: &B,
    node: &Node,
    snapshot: &BatchSnapshot,
    schemas: &mut HashMap<String, SchemaRef>,
    resolved: &MetricsMap,
    known: &MetricsMap,
) -> Result<Outcome> {
    let config = &node.config;
    let spec = &node.registration.spec;
    let metric_name = config.metric_name();

    let parsed = ParsedDomain::parse(metric_name, config.domain_kwargs())?;
    if parsed.domain.domain_type() != spec.domain_type {
        return Err(MetricError::configuration(
            metric_name,
            "metric_domain_kwargs",
            format!(
                "expected a {} domain, got {}",
                spec.domain_type,
                parsed.domain.domain_type()
            ),
        ));
    }

    let batch = snapshot.resolve(parsed.batch_id.as_deref())?;
    let schema = match schemas.get(&batch.id) {
        Some(schema) => schema.clone(),
        None => {
            let schema = backend.schema(batch).await?;
            schemas.insert(batch.id.clone(), schema.clone());
            schema
        }
    };
    check_columns(metric_name, config.domain_kwargs(), &parsed, &schema)?;

    let mut dependencies = BTreeMap::new();
    for (key, dep_id) in &node.dependencies {
        let value = resolved
            .get(dep_id)
            .or_else(|| known.get(dep_id))
            .ok_or_else(|| MetricError::MissingDependency {
                metric: metric_name.to_string(),
                dependency: dep_id.metric_name.clone(),
                backend: backend.kind(),
            })?;
        dependencies.insert(key.clone(), value.clone());
    }

    let call = ProviderCall {
        backend: backend.kind(),
        config,
        domain: &parsed.domain,
        batch_id: &batch.id,
        schema,
        dependencies,
    };

    let value = match node.registration.provider {
        Provider::Bundled => {
            let deferred = call
                .dependency(PARTIAL_FN_KEY)?
                .as_deferred()
                .cloned()
                .ok_or_else(|| call.error("metric_partial_fn dependency is not a deferred aggregate"))?;
            return Ok(Outcome::Deferred(deferred));
        }
        Provider::Derived(derive) => derive(&call)?,
        provider => backend.invoke(provider, call, batch).await?,
    };

    let role_ok = match spec.role {
        MetricRole::Condition => matches!(value, MetricValue::Condition(_)),
        MetricRole::AggregatePartial => matches!(value, MetricValue::Deferred(_)),
        MetricRole::Direct | MetricRole::UnexpectedDerivative => !value.is_backend_native(),
    };
    if !role_ok {
        return Err(MetricError::Internal(format!(
            "provider for {metric_name} returned {} for role {:?}",
            value.to_string_pretty(),
            spec.role
        )));
    }
    Ok(Outcome::Value(value))
}

fn check_columns(
    metric_name: &str,
    domain_kwargs: &Kwargs,
    parsed: &ParsedDomain,
    schema: &SchemaRef,
) -> Result<()> {
    for column in parsed.domain.columns() {
        if schema.index_of(column).is_err() {
            return Err(MetricError::ColumnNotFound {
                column: column.to_string(),
                metric_name: metric_name.to_string(),
                domain_kwargs: domain_kwargs.to_canonical_json(),
            });
        }
    }
    Ok(())
}

async fn execute_bundles<B: Backend + ?Sized>(
    backend: &B,
    members: Vec<BundleMember<'_>>,
    resolved: &mut MetricsMap,
) -> Result<usize> {
    let core = backend.core();
    let mut groups: BTreeMap<String, Vec<BundleMember<'_>>> = BTreeMap::new();
    for member in members {
        groups
            .entry(member.deferred.domain_key.clone())
            .or_default()
            .push(member);
    }

    let mut bundles = 0;
    for (domain_key, group) in &groups {
        for chunk in group.chunks(core.config.max_bundle_size.max(1)) {
            let deferred: Vec<&DeferredAggregate> = chunk.iter().map(|m| &m.deferred).collect();
            let raw = match backend.execute_bundle(&deferred).await {
                Ok(raw) => raw,
                Err(err) => return Err(attribute_failure(backend, chunk, domain_key, err).await),
            };
            if raw.len() != chunk.len() {
                return Err(MetricError::Internal(format!(
                    "round trip on domain_id {domain_key} returned {} values for {} metrics",
                    raw.len(),
                    chunk.len()
                )));
            }
            bundles += 1;
            log_round_trip!(
                core.config.log,
                "{} computed {} metrics on domain_id {}",
                backend.kind(),
                chunk.len(),
                truncate_field(domain_key, core.config.log.max_field_length)
            );
            for (member, value) in chunk.iter().zip(raw) {
                resolved.insert(member.id.clone(), member.deferred.finalize.apply(value));
            }
        }
    }
    Ok(bundles)
}

/// Re-runs each member of a failed bundle alone to find the culprit.
async fn attribute_failure<B: Backend + ?Sized>(
    backend: &B,
    chunk: &[BundleMember<'_>],
    domain_key: &str,
    err: MetricError,
) -> MetricError {
    if chunk.len() > 1 {
        for member in chunk {
            if let Err(member_err) = backend.execute_bundle(&[&member.deferred]).await {
                warn!(
                    metric = %member.id,
                    domain_id = %domain_key,
                    "combined round trip failed, isolated failing metric"
                );
                return MetricError::resolution_with_source(
                    format!(
                        "combined round trip on domain_id {domain_key} failed for metric '{}': {member_err}",
                        member.config.metric_name()
                    ),
                    member.config.metric_name(),
                    member.config.domain_kwargs().to_canonical_json(),
                    Box::new(member_err),
                );
            }
        }
    }
    match chunk.first() {
        Some(member) => MetricError::resolution_with_source(
            format!("combined round trip on domain_id {domain_key} failed: {err}"),
            member.config.metric_name(),
            member.config.domain_kwargs().to_canonical_json(),
            Box::new(err),
        ),
        None => err,
    }
}

/// Materializes the compute domain named by `domain_kwargs`.
#[instrument(skip_all, fields(backend = %backend.kind()))]
pub(crate) async fn domain_records<B: Backend + ?Sized>(
    backend: &B,
    domain_kwargs: &Kwargs,
) -> Result<Vec<RecordBatch>> {
    const CALLER: &str = "get_domain_records";
    let parsed = ParsedDomain::parse(CALLER, domain_kwargs)?;
    let snapshot = backend.core().batches.snapshot()?;
    let batch = snapshot.resolve(parsed.batch_id.as_deref())?;
    let schema = backend.schema(batch).await?;
    check_columns(CALLER, domain_kwargs, &parsed, &schema)?;
    backend.domain_records(batch, &parsed.domain).await
}
