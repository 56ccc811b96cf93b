//! The built resource graph.
//!
//! A [`Graph`] comes out of [`GraphBuilder::build`](crate::GraphBuilder::build)
//! with its resources already in dependency order. From there it is walked
//! forward by [`Graph::realize`] to create resources through a provider, and
//! backward by [`Graph::teardown`] to destroy them.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
};

use colored::Colorize;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};

use crate::{
    output::{OutputSlot, Outputs},
    CycleSnafu, Declared, Error, HasDependencies, PartialApplySnafu, Property, Provision, Resource,
    Result, TeardownSnafu, UnknownReferenceSnafu,
};

/// Lifecycle state of a resource within a graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Status {
    /// Declared but not yet created.
    Pending,
    /// Created on the platform; outputs are resolvable.
    Realized,
    /// Creation was attempted and failed.
    Failed,
    /// Destroyed during a teardown pass.
    Destroyed,
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Pending => "pending",
            Status::Realized => "realized",
            Status::Failed => "failed",
            Status::Destroyed => "destroyed",
        })
    }
}

#[derive(Debug)]
struct Node {
    resource: Resource,
    slot: OutputSlot,
    status: Status,
    /// Direct dependencies as node indices, explicit and implicit.
    deps: Vec<usize>,
    /// Direct dependents as node indices.
    dependents: Vec<usize>,
}

/// Builds a [`Graph`] from the builder's declarations.
///
/// Collects explicit and implicit edges, validates every referenced name and
/// performs the topological sort.
pub(crate) fn build(
    declarations: Vec<Declared>,
    exports: Vec<(String, Property)>,
    index: BTreeMap<String, usize>,
) -> Result<Graph> {
    let mut nodes = Vec::with_capacity(declarations.len());
    for Declared { resource, slot } in declarations {
        let mut deps = BTreeSet::new();
        for dep in resource.dependencies() {
            log::debug!("'{}' depends on '{dep}'", resource.name());
            let Some(&dep_ix) = index.get(&dep) else {
                return UnknownReferenceSnafu {
                    name: dep,
                    referenced_by: resource.name().to_owned(),
                }
                .fail();
            };
            deps.insert(dep_ix);
        }
        nodes.push(Node {
            resource,
            slot,
            status: Status::Pending,
            deps: deps.into_iter().collect(),
            dependents: Vec::new(),
        });
    }

    for (name, property) in exports.iter() {
        for dep in property.dependencies() {
            if !index.contains_key(&dep) {
                return UnknownReferenceSnafu {
                    name: dep,
                    referenced_by: format!("export '{name}'"),
                }
                .fail();
            }
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &dep in &node.deps {
            dependents[dep].push(i);
        }
    }
    for (node, dependents_of) in nodes.iter_mut().zip(dependents) {
        node.dependents = dependents_of;
    }

    // Kahn's algorithm. The ready set is a min-heap over declaration
    // indices, which breaks ties by declaration order and keeps the result
    // reproducible.
    let mut indegree: Vec<usize> = nodes.iter().map(|node| node.deps.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &dependent in &nodes[i].dependents {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() != nodes.len() {
        // Everything with residual in-degree is either on a cycle or
        // waiting on one. Trim nodes with no residual dependents until only
        // the cycles themselves remain.
        let mut residual: BTreeSet<usize> = (0..nodes.len())
            .filter(|&i| indegree[i] > 0)
            .collect();
        loop {
            let downstream = residual.iter().copied().find(|&i| {
                nodes[i]
                    .dependents
                    .iter()
                    .all(|dependent| !residual.contains(dependent))
            });
            let Some(i) = downstream else { break };
            residual.remove(&i);
        }
        let names: Vec<String> = residual
            .iter()
            .map(|&i| nodes[i].resource.name().to_owned())
            .collect();
        log::error!("dependency cycle among resources: {}", names.join(", "));
        return CycleSnafu { names }.fail();
    }

    log::debug!(
        "built graph of {} resources: {:?}",
        nodes.len(),
        order
            .iter()
            .map(|&i| nodes[i].resource.name())
            .collect::<Vec<_>>()
    );
    Ok(Graph {
        nodes,
        order,
        index,
        exports,
    })
}

/// Options controlling a realize pass.
#[derive(Clone, Copy, Debug)]
pub struct ApplyOptions {
    /// Maximum number of creations in flight at once.
    ///
    /// The default of 1 realizes strictly sequentially in dependency order.
    pub limit: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { limit: 1 }
    }
}

impl ApplyOptions {
    /// Realize up to `limit` mutually independent resources concurrently.
    pub fn concurrent(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }
}

/// A dependency-ordered, acyclic set of declared resources.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Indices into `nodes`; dependencies strictly precede dependents.
    order: Vec<usize>,
    index: BTreeMap<String, usize>,
    exports: Vec<(String, Property)>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The resources in dependency order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().map(|&i| &self.nodes[i].resource)
    }

    /// Lifecycle state of the named resource.
    pub fn status(&self, name: &str) -> Option<Status> {
        self.index.get(name).map(|&i| self.nodes[i].status)
    }

    /// Renders the apply order as steps of mutually independent resources.
    pub fn schedule_string(&self) -> String {
        if self.nodes.is_empty() {
            return "--- No changes.\n".to_owned();
        }
        let mut level = vec![0usize; self.nodes.len()];
        for &i in &self.order {
            level[i] = self.nodes[i]
                .deps
                .iter()
                .map(|&dep| level[dep] + 1)
                .max()
                .unwrap_or(0);
        }
        let steps = level.iter().max().copied().unwrap_or(0) + 1;
        let mut out = String::new();
        for step in 0..steps {
            out.push_str(&format!("--- step {}\n", step + 1));
            for &i in &self.order {
                if level[i] == step {
                    let resource = &self.nodes[i].resource;
                    out.push_str(&format!("  create {} ({})\n", resource.name(), resource.ty()));
                }
            }
            out.push_str("---\n");
        }
        out
    }

    /// Walks the graph in dependency order, creating each resource through
    /// the provider once all of its dependencies are realized.
    ///
    /// With `options.limit > 1`, mutually independent resources are realized
    /// concurrently: a ready set is fed by dependency-count decrements and
    /// at most `limit` creations are in flight at once.
    ///
    /// On the first failure no further creations start. In-flight creations
    /// run to completion and their outcomes are still recorded.
    /// Already-realized resources are left intact (there is no automatic
    /// rollback) and the failure is reported as [`Error::PartialApply`],
    /// carrying the whole blast radius in one [`ApplyReport`].
    pub async fn realize<P: Provision>(
        &mut self,
        provider: &P,
        options: ApplyOptions,
    ) -> Result<RealizedSet> {
        let limit = options.limit.max(1);
        log::debug!("realizing {} resources, {limit} at a time", self.nodes.len());

        let mut remaining: Vec<usize> = self
            .nodes
            .iter()
            .map(|node| {
                node.deps
                    .iter()
                    .filter(|&&dep| self.nodes[dep].status != Status::Realized)
                    .count()
            })
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, node)| node.status == Status::Pending && remaining[*i] == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut report = ApplyReport::default();
        let mut halted = false;
        let mut in_flight = FuturesUnordered::new();

        loop {
            while !halted && in_flight.len() < limit {
                let Some(Reverse(i)) = ready.pop() else { break };
                let name = self.nodes[i].resource.name().to_owned();
                log::info!("create '{name}':");
                let properties = match self.nodes[i].resource.properties().resolve() {
                    Ok(properties) => properties,
                    Err(error) => {
                        log::error!("  could not resolve properties of '{name}': {error}");
                        self.nodes[i].status = Status::Failed;
                        report.failed.push((name, error));
                        halted = true;
                        break;
                    }
                };
                let resource = self.nodes[i].resource.clone();
                in_flight.push(
                    async move {
                        let result = provider.create(&resource, &properties).await;
                        (i, resource, result)
                    }
                    .boxed_local(),
                );
            }

            let Some((i, resource, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(outputs) => {
                    log::info!("  '{}' is realized", resource.name());
                    self.nodes[i].slot.set(Some(outputs));
                    self.nodes[i].status = Status::Realized;
                    report.realized.push(resource.name().to_owned());
                    for &dependent in &self.nodes[i].dependents {
                        remaining[dependent] -= 1;
                        if remaining[dependent] == 0
                            && self.nodes[dependent].status == Status::Pending
                        {
                            ready.push(Reverse(dependent));
                        }
                    }
                }
                Err(error) => {
                    let error = Error::Create {
                        name: resource.name().to_owned(),
                        error: Box::new(error),
                    };
                    log::error!("  {error}");
                    self.nodes[i].status = Status::Failed;
                    report.failed.push((resource.name().to_owned(), error));
                    halted = true;
                }
            }
        }

        report.unattempted = self
            .order
            .iter()
            .filter(|&&i| self.nodes[i].status == Status::Pending)
            .map(|&i| self.nodes[i].resource.name().to_owned())
            .collect();

        if !report.failed.is_empty() {
            return PartialApplySnafu { report }.fail();
        }

        let mut realized = RealizedSet::default();
        for &i in &self.order {
            let node = &self.nodes[i];
            if node.status == Status::Realized {
                if let Some(outputs) = node.slot.get() {
                    realized.outputs.insert(node.resource.name().to_owned(), outputs);
                }
            }
        }
        for (name, property) in &self.exports {
            let value = property.resolve()?;
            log::info!("export '{name}' = {value}");
            realized.exports.insert(name.clone(), value);
        }
        Ok(realized)
    }

    /// Destroys realized resources in reverse topological order.
    ///
    /// Teardown is best-effort: a failure on one resource is recorded and
    /// does not stop the walk, so independent subgraphs are still torn down.
    /// Resources that were never realized are skipped. Any failures are
    /// aggregated into a single [`Error::Teardown`].
    pub async fn teardown<P: Provision>(&mut self, provider: &P) -> Result<TeardownReport> {
        let order = self.order.clone();
        let mut report = TeardownReport::default();
        for &i in order.iter().rev() {
            let name = self.nodes[i].resource.name().to_owned();
            let outputs = match self.nodes[i].status {
                Status::Realized => self.nodes[i].slot.get(),
                _ => None,
            };
            let Some(outputs) = outputs else {
                log::debug!("skipping '{name}', nothing realized to destroy");
                report.skipped.push(name);
                continue;
            };
            log::info!("destroy '{name}':");
            let resource = self.nodes[i].resource.clone();
            match provider.destroy(&resource, &outputs).await {
                Ok(()) => {
                    log::info!("  '{name}' is destroyed");
                    self.nodes[i].slot.set(None);
                    self.nodes[i].status = Status::Destroyed;
                    report.destroyed.push(name);
                }
                Err(error) => {
                    let error = Error::Destroy {
                        name: name.clone(),
                        error: Box::new(error),
                    };
                    log::error!("  {error}");
                    report.failed.push((name, error));
                }
            }
        }

        if report.failed.is_empty() {
            Ok(report)
        } else {
            TeardownSnafu { report }.fail()
        }
    }
}

/// Everything a successful realize pass produced.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct RealizedSet {
    /// Realized outputs keyed by resource name.
    pub outputs: BTreeMap<String, Outputs>,
    /// Resolved stack exports.
    pub exports: BTreeMap<String, serde_json::Value>,
}

/// Outcome report of a realize pass, carried by [`Error::PartialApply`].
///
/// Distinguishes resources whose creation was attempted and failed from
/// resources never attempted because the apply halted first.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Successfully realized resources, in completion order.
    pub realized: Vec<String>,
    /// Resources whose creation was attempted and failed.
    pub failed: Vec<(String, Error)>,
    /// Resources never attempted.
    pub unattempted: Vec<String>,
}

impl core::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for name in &self.realized {
            writeln!(f, "  {} '{name}'", "realized".green())?;
        }
        for (name, error) in &self.failed {
            writeln!(f, "  {} '{name}': {error}", "failed".red())?;
        }
        for name in &self.unattempted {
            writeln!(f, "  {} '{name}'", "unattempted".yellow())?;
        }
        Ok(())
    }
}

/// Outcome report of a teardown pass.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Successfully destroyed resources, in destruction order.
    pub destroyed: Vec<String>,
    /// Resources whose destruction was attempted and failed.
    pub failed: Vec<(String, Error)>,
    /// Resources skipped because they were never realized.
    pub skipped: Vec<String>,
}

impl core::fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for name in &self.destroyed {
            writeln!(f, "  {} '{name}'", "destroyed".green())?;
        }
        for (name, error) in &self.failed {
            writeln!(f, "  {} '{name}': {error}", "failed".red())?;
        }
        for name in &self.skipped {
            writeln!(f, "  {} '{name}'", "skipped".dimmed())?;
        }
        Ok(())
    }
}
