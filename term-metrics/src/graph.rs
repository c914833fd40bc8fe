//! Metric dependency graphs and multi-pass resolution.
//!
//! A single [`ExecutionEngine::resolve_metrics`] call may leave metrics
//! pending (a partial still has to be built, or a dependency is finalized by a
//! round trip in the same call). [`resolve_validation_graph`] drives repeated
//! passes until the whole graph is resolved.
//!
//! # Examples
//!
//! ```rust,ignore
//! use term_metrics::graph::{resolve_validation_graph, ResolveOptions, ValidationGraph};
//!
//! let mut graph = ValidationGraph::new();
//! graph.build_metric_dependency_graph(engine.registry(), engine.backend_kind(), &max)?;
//! let outcome = resolve_validation_graph(&engine, &graph, &MetricsMap::new(), &ResolveOptions::default()).await?;
//! println!("{}", outcome.resolved[&max.id()]);
//! ```

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::{MetricConfiguration, MetricId, MetricsMap};
use crate::engine::{ExecutionEngine, Resolution};
use crate::error::{MetricError, Result};
use crate::registry::{BackendKind, MetricRegistry};

/// A directed edge from a metric to one of its dependencies.
///
/// Metrics without dependencies appear as an edge with no right side.
#[derive(Debug, Clone)]
pub struct MetricEdge {
    pub left: MetricConfiguration,
    pub right: Option<MetricConfiguration>,
}

impl MetricEdge {
    pub fn new(left: MetricConfiguration, right: Option<MetricConfiguration>) -> Self {
        Self { left, right }
    }

    pub fn id(&self) -> (MetricId, Option<MetricId>) {
        (self.left.id(), self.right.as_ref().map(MetricConfiguration::id))
    }
}

/// De-duplicated set of metric edges.
#[derive(Debug, Clone, Default)]
pub struct ValidationGraph {
    edges: Vec<MetricEdge>,
    edge_ids: HashSet<(MetricId, Option<MetricId>)>,
}

impl ValidationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an edge; returns `false` when an identical edge already exists.
    pub fn add(&mut self, edge: MetricEdge) -> bool {
        if !self.edge_ids.insert(edge.id()) {
            return false;
        }
        self.edges.push(edge);
        true
    }

    pub fn edges(&self) -> &[MetricEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Every metric appearing in the graph, in first-seen order.
    pub fn metrics(&self) -> Vec<MetricConfiguration> {
        let mut seen = HashSet::new();
        let mut metrics = Vec::new();
        for edge in &self.edges {
            for config in std::iter::once(&edge.left).chain(edge.right.as_ref()) {
                if seen.insert(config.id()) {
                    metrics.push(config.clone());
                }
            }
        }
        metrics
    }

    /// Adds `config` and, transitively, the dependencies the registry
    /// declares for it on `backend`.
    pub fn build_metric_dependency_graph(
        &mut self,
        registry: &MetricRegistry,
        backend: BackendKind,
        config: &MetricConfiguration,
    ) -> Result<()> {
        let mut path = Vec::new();
        self.add_with_dependencies(registry, backend, config, &mut path)
    }

    fn add_with_dependencies(
        &mut self,
        registry: &MetricRegistry,
        backend: BackendKind,
        config: &MetricConfiguration,
        path: &mut Vec<MetricId>,
    ) -> Result<()> {
        let id = config.id();
        if path.contains(&id) {
            let mut cycle: Vec<String> = path.iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Err(MetricError::DependencyCycle {
                path: cycle.join(" -> "),
            });
        }

        let dependencies = registry.evaluation_dependencies(config, backend)?;
        let mut with_dependencies = config.clone();
        with_dependencies.set_dependencies(dependencies.clone());

        if dependencies.is_empty() {
            self.add(MetricEdge::new(with_dependencies, None));
            return Ok(());
        }

        path.push(id);
        for dependency in dependencies.values() {
            let added = self.add(MetricEdge::new(
                with_dependencies.clone(),
                Some(dependency.clone()),
            ));
            if added {
                self.add_with_dependencies(registry, backend, dependency, path)?;
            }
        }
        path.pop();
        Ok(())
    }
}

/// Why a metric was dropped from a graph resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub exception_message: String,
    /// Metric the error was attributed to, when known.
    pub metric_name: Option<String>,
    pub raised_exception: bool,
}

impl ExceptionInfo {
    pub fn from_error(err: &MetricError) -> Self {
        Self {
            exception_message: err.to_string(),
            metric_name: err.metric_name().map(str::to_string),
            raised_exception: true,
        }
    }
}

/// A metric that could not be resolved.
#[derive(Debug, Clone)]
pub struct AbortedMetric {
    pub metric: MetricConfiguration,
    pub exception: ExceptionInfo,
}

/// Options of [`resolve_validation_graph`].
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Upper bound on `resolve_metrics` passes.
    pub max_passes: usize,
    /// Isolate failing metrics into [`GraphResolution::aborted`] instead of
    /// failing the whole resolution.
    pub catch_exceptions: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            max_passes: 10,
            catch_exceptions: false,
        }
    }
}

impl ResolveOptions {
    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes.max(1);
        self
    }

    pub fn with_catch_exceptions(mut self, catch_exceptions: bool) -> Self {
        self.catch_exceptions = catch_exceptions;
        self
    }
}

/// Output of [`resolve_validation_graph`].
#[derive(Debug, Clone, Default)]
pub struct GraphResolution {
    /// Values computed across all passes, dependencies included.
    pub resolved: MetricsMap,
    pub aborted: HashMap<MetricId, AbortedMetric>,
    pub passes: usize,
    /// Total round trips over all passes.
    pub round_trips: usize,
}

impl GraphResolution {
    pub fn is_aborted(&self, config: &MetricConfiguration) -> bool {
        self.aborted.contains_key(&config.id())
    }
}

struct Passes<'a> {
    known: &'a MetricsMap,
    outcome: GraphResolution,
}

impl Passes<'_> {
    fn is_done(&self, id: &MetricId) -> bool {
        self.known.contains_key(id)
            || self.outcome.resolved.contains_key(id)
            || self.outcome.aborted.contains_key(id)
    }

    /// Everything known so far, as seen by the next pass.
    fn available(&self) -> MetricsMap {
        let mut available = self.known.clone();
        available.extend(
            self.outcome
                .resolved
                .iter()
                .map(|(id, value)| (id.clone(), value.clone())),
        );
        available
    }

    /// Merges a pass and queues what it left pending.
    fn absorb(&mut self, resolution: Resolution, next: &mut Vec<MetricConfiguration>) {
        self.outcome.round_trips += resolution.metadata.round_trips;
        self.outcome.resolved.extend(resolution.resolved);
        for pending in resolution.pending {
            for config in pending.needs.into_iter().chain(std::iter::once(pending.metric)) {
                let id = config.id();
                if !self.is_done(&id) && !next.iter().any(|c| c.id() == id) {
                    next.push(config);
                }
            }
        }
    }

    fn abort(&mut self, config: &MetricConfiguration, err: &MetricError) {
        warn!(metric = %config.id(), error = %err, "metric aborted");
        self.outcome.aborted.insert(
            config.id(),
            AbortedMetric {
                metric: config.clone(),
                exception: ExceptionInfo::from_error(err),
            },
        );
    }
}

/// Resolves every metric of `graph`, re-issuing pending metrics until none
/// remain or `options.max_passes` is reached.
#[instrument(skip_all, fields(backend = %engine.backend_kind(), edges = graph.len()))]
pub async fn resolve_validation_graph<E: ExecutionEngine + ?Sized>(
    engine: &E,
    graph: &ValidationGraph,
    known: &MetricsMap,
    options: &ResolveOptions,
) -> Result<GraphResolution> {
    let mut passes = Passes {
        known,
        outcome: GraphResolution::default(),
    };
    let mut todo: Vec<MetricConfiguration> = graph
        .metrics()
        .into_iter()
        .filter(|config| !known.contains_key(&config.id()))
        .collect();

    while !todo.is_empty() {
        if passes.outcome.passes >= options.max_passes {
            let message = format!(
                "validation graph still has {} pending metrics after {} passes",
                todo.len(),
                options.max_passes
            );
            if !options.catch_exceptions {
                return Err(MetricError::Internal(message));
            }
            let err = MetricError::Internal(message);
            for config in &todo {
                passes.abort(config, &err);
            }
            break;
        }
        passes.outcome.passes += 1;
        debug!(pass = passes.outcome.passes, metrics = todo.len(), "resolution pass");

        let mut next = Vec::new();
        match engine.resolve_metrics(&todo, &passes.available()).await {
            Ok(resolution) => passes.absorb(resolution, &mut next),
            Err(err) if options.catch_exceptions => {
                warn!(error = %err, "pass failed, resolving metrics one by one");
                for config in &todo {
                    if passes.is_done(&config.id()) {
                        continue;
                    }
                    match engine
                        .resolve_metrics(std::slice::from_ref(config), &passes.available())
                        .await
                    {
                        Ok(resolution) => passes.absorb(resolution, &mut next),
                        Err(err) => passes.abort(config, &err),
                    }
                }
            }
            Err(err) => return Err(err),
        }
        next.retain(|config| !passes.is_done(&config.id()));
        todo = next;
    }

    info!(
        passes = passes.outcome.passes,
        resolved = passes.outcome.resolved.len(),
        aborted = passes.outcome.aborted.len(),
        "validation graph resolved"
    );
    Ok(passes.outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricValue;
    use crate::test_helpers::{in_process_engine, metric, mixed_batch, registry, sql_engine};
    use serde_json::json;

    #[test]
    fn test_edges_are_deduplicated() {
        let a = metric("column.max", json!({"column": "id"}), json!({}));
        let b = metric("column.min", json!({"column": "id"}), json!({}));
        let mut graph = ValidationGraph::new();
        assert!(graph.add(MetricEdge::new(a.clone(), Some(b.clone()))));
        assert!(!graph.add(MetricEdge::new(a.clone(), Some(b.clone()))));
        assert!(graph.add(MetricEdge::new(a, None)));
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.metrics().len(), 2);
    }

    #[test]
    fn test_build_includes_partials_on_sql() {
        let max = metric("column.max", json!({"column": "id"}), json!({}));
        let mut graph = ValidationGraph::new();
        graph
            .build_metric_dependency_graph(&registry(), BackendKind::Sql, &max)
            .unwrap();
        let names: Vec<String> = graph
            .metrics()
            .iter()
            .map(|m| m.metric_name().to_string())
            .collect();
        assert_eq!(names, vec!["column.max", "column.max.aggregate_fn"]);
    }

    #[tokio::test]
    async fn test_resolves_partition_in_several_passes() {
        let engine = sql_engine(mixed_batch());
        let partition = metric(
            "column.partition",
            json!({"column": "id"}),
            json!({"n_bins": 3}),
        );
        let mut graph = ValidationGraph::new();
        graph
            .build_metric_dependency_graph(engine.registry(), BackendKind::Sql, &partition)
            .unwrap();
        let outcome =
            resolve_validation_graph(&engine, &graph, &MetricsMap::new(), &ResolveOptions::default())
                .await
                .unwrap();
        assert!(outcome.passes >= 2);
        assert_eq!(
            outcome.resolved[&partition.id()].to_json(),
            json!([1.0, 2.0, 3.0, 4.0])
        );
        assert!(outcome.aborted.is_empty());
    }

    #[tokio::test]
    async fn test_catch_exceptions_isolates_failures() {
        let engine = in_process_engine(mixed_batch());
        let good = metric("column.max", json!({"column": "id"}), json!({}));
        let bad = metric("column.max", json!({"column": "missing"}), json!({}));
        let mut graph = ValidationGraph::new();
        for config in [&good, &bad] {
            graph
                .build_metric_dependency_graph(engine.registry(), BackendKind::InProcess, config)
                .unwrap();
        }

        let strict =
            resolve_validation_graph(&engine, &graph, &MetricsMap::new(), &ResolveOptions::default())
                .await;
        assert!(strict.is_err());

        let options = ResolveOptions::default().with_catch_exceptions(true);
        let outcome = resolve_validation_graph(&engine, &graph, &MetricsMap::new(), &options)
            .await
            .unwrap();
        assert_eq!(outcome.resolved[&good.id()], MetricValue::Integer(4));
        assert!(outcome.is_aborted(&bad));
        assert!(outcome.aborted[&bad.id()]
            .exception
            .exception_message
            .contains("does not exist"));
    }
}
