//! Placement scheduler — binds partition groups to cluster nodes.
//!
//! [`schedule`] is the pure core: it takes a prebuilt affinity graph and
//! a resolved strategy. [`Scheduler`] is the context object carrying the
//! strategy registry and solver knobs, used by the deployer and the CLI.

use meshlab_core::config::SchedulerSettings;
use meshlab_core::{ClusterNode, Lab};
use tracing::{debug, info};

use crate::affinity::{self, AffinityGraph, AffinityMode};
use crate::constraint::{PlacementConstraint, PlacementGroup};
use crate::error::{PlacementError, PlacementResult};
use crate::hints;
use crate::strategy::{PartitionStrategy, StrategyConfig, StrategyRegistry};

/// Recorded as the strategy when every device got its own node.
pub const ONE_TO_ONE: &str = "one_to_one";

/// Partition the devices of `graph` over `nodes` using `strategy`.
///
/// When there are at least as many nodes as devices each device gets its
/// own node and the strategy is not run. Otherwise the strategy output is
/// validated before group `g` is bound to `nodes[g]`.
pub fn schedule(
    graph: &AffinityGraph,
    nodes: &[ClusterNode],
    strategy: &dyn PartitionStrategy,
) -> PlacementResult<PlacementConstraint> {
    if nodes.is_empty() {
        return Err(PlacementError::InvalidInput("no available cluster nodes".into()));
    }
    if graph.labels.is_empty() {
        return Err(PlacementError::InvalidInput("lab has no devices".into()));
    }

    let n = graph.labels.len();
    let (strategy_name, groups) = if nodes.len() >= n {
        debug!(devices = n, nodes = nodes.len(), "one device per node");
        (ONE_TO_ONE, (0..n).map(|i| vec![i]).collect())
    } else {
        let groups = strategy.partition(&graph.matrix, nodes.len())?;
        validate_partition(strategy.name(), &groups, n, nodes.len())?;
        (strategy.name(), groups)
    };

    let groups = groups
        .iter()
        .zip(nodes)
        .map(|(members, node)| PlacementGroup {
            node: node.clone(),
            devices: members
                .iter()
                .filter_map(|&i| graph.labels.label(i).map(str::to_string))
                .collect(),
        })
        .collect();

    Ok(PlacementConstraint {
        strategy: strategy_name.to_string(),
        groups,
    })
}

/// Every index in `0..n` exactly once, across exactly `k` non-empty groups.
fn validate_partition(
    strategy: &str,
    groups: &[Vec<usize>],
    n: usize,
    k: usize,
) -> PlacementResult<()> {
    let invalid = |reason: String| PlacementError::InvalidPartition {
        strategy: strategy.to_string(),
        reason,
    };

    if groups.len() != k {
        return Err(invalid(format!("expected {k} groups, got {}", groups.len())));
    }
    if let Some(g) = groups.iter().position(Vec::is_empty) {
        return Err(invalid(format!("group {g} is empty")));
    }

    let mut seen = vec![false; n];
    for &i in groups.iter().flatten() {
        if i >= n {
            return Err(invalid(format!("device index {i} out of range")));
        }
        if seen[i] {
            return Err(invalid(format!("device index {i} assigned twice")));
        }
        seen[i] = true;
    }
    if let Some(i) = seen.iter().position(|s| !s) {
        return Err(invalid(format!("device index {i} unassigned")));
    }
    Ok(())
}

/// Scheduling context: strategy registry plus solver configuration.
#[derive(Debug, Clone)]
pub struct Scheduler {
    registry: StrategyRegistry,
    config: StrategyConfig,
    default_strategy: String,
    semantic: bool,
}

impl Scheduler {
    pub fn new(registry: StrategyRegistry, settings: &SchedulerSettings) -> Self {
        Self {
            registry,
            config: StrategyConfig::from(settings),
            default_strategy: settings.strategy.clone(),
            semantic: settings.semantic,
        }
    }

    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self::new(StrategyRegistry::with_defaults(), settings)
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.registry
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    pub fn semantic(&self) -> bool {
        self.semantic
    }

    /// Schedule with the configured strategy and semantic flag.
    pub fn compute(&self, lab: &Lab, nodes: &[ClusterNode]) -> PlacementResult<PlacementConstraint> {
        self.compute_constraints(lab, nodes, &self.default_strategy, self.semantic)
    }

    /// Build the affinity graph of `lab` and schedule it over `nodes`.
    ///
    /// `use_semantic` selects weighted affinity plus routing hints; without
    /// it the binary matrix is used.
    pub fn compute_constraints(
        &self,
        lab: &Lab,
        nodes: &[ClusterNode],
        strategy_name: &str,
        use_semantic: bool,
    ) -> PlacementResult<PlacementConstraint> {
        lab.validate_names()?;
        let strategy = self.registry.resolve(strategy_name, &self.config)?;

        let mut graph = affinity::build_with_mode(lab, AffinityMode::from_semantic(use_semantic));
        if use_semantic {
            hints::apply(&mut graph, lab);
        }

        let constraint = schedule(&graph, nodes, strategy.as_ref())?;
        info!(
            strategy = %constraint.strategy,
            devices = constraint.device_count(),
            groups = constraint.group_count(),
            "placement computed"
        );
        Ok(constraint)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}
