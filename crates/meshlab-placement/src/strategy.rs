//! Partitioning capability and the strategy registry.
//!
//! A strategy splits the devices of an affinity matrix into `k`
//! non-empty groups. Strategies are registered by name and resolved once
//! per deployment, so new heuristics can be added without touching the
//! scheduler or the deployer.

use std::collections::BTreeMap;

use meshlab_core::config::SchedulerSettings;

use crate::affinity::AffinityMatrix;
use crate::error::{PlacementError, PlacementResult};
use crate::hierarchical::HierarchicalPartition;
use crate::round_robin::RoundRobinPartition;
use crate::spectral::SpectralPartition;

/// Knobs shared by every strategy factory.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    /// Restarts for randomized strategies.
    pub restarts: u32,
    /// Iteration cap for iterative solvers.
    pub max_iterations: u32,
    pub seed: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for StrategyConfig {
    fn from(s: &SchedulerSettings) -> Self {
        Self {
            restarts: s.restarts,
            max_iterations: s.max_iterations,
            seed: s.seed,
        }
    }
}

/// Partition devices `0..n` into exactly `k` non-empty groups.
pub trait PartitionStrategy: Send + Sync {
    /// Registry key of this strategy.
    fn name(&self) -> &'static str;

    /// Each returned group lists matrix indices. Every index in `0..n`
    /// must appear in exactly one group.
    fn partition(&self, matrix: &AffinityMatrix, k: usize) -> PlacementResult<Vec<Vec<usize>>>;
}

/// Reject `k` values no strategy can satisfy.
pub(crate) fn check_group_count(n: usize, k: usize) -> PlacementResult<()> {
    if n == 0 {
        return Err(PlacementError::InvalidInput("no devices to partition".into()));
    }
    if k == 0 {
        return Err(PlacementError::InvalidInput("cannot partition into zero groups".into()));
    }
    if k > n {
        return Err(PlacementError::TooManyGroups {
            requested: k,
            devices: n,
        });
    }
    Ok(())
}

/// Sort members of each group and order groups by their lowest member.
pub(crate) fn canonical(mut groups: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
    for g in &mut groups {
        g.sort_unstable();
    }
    groups.sort_by_key(|g| g.first().copied().unwrap_or(usize::MAX));
    groups
}

/// Builds a strategy from shared configuration.
pub type StrategyFactory = fn(&StrategyConfig) -> Box<dyn PartitionStrategy>;

/// Name → factory table, filled at startup.
#[derive(Clone)]
pub struct StrategyRegistry {
    factories: BTreeMap<&'static str, StrategyFactory>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `round_robin`, `spectral` and `hierarchical`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(RoundRobinPartition::NAME, round_robin);
        registry.register(SpectralPartition::NAME, spectral);
        registry.register(HierarchicalPartition::NAME, hierarchical);
        registry
    }

    /// Add or replace the factory for `name`.
    pub fn register(&mut self, name: &'static str, factory: StrategyFactory) {
        self.factories.insert(name, factory);
    }

    pub fn resolve(
        &self,
        name: &str,
        config: &StrategyConfig,
    ) -> PlacementResult<Box<dyn PartitionStrategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PlacementError::UnknownStrategy(name.to_string()))?;
        Ok(factory(config))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

fn round_robin(_: &StrategyConfig) -> Box<dyn PartitionStrategy> {
    Box::new(RoundRobinPartition)
}

fn spectral(config: &StrategyConfig) -> Box<dyn PartitionStrategy> {
    Box::new(SpectralPartition::from_config(config))
}

fn hierarchical(_: &StrategyConfig) -> Box<dyn PartitionStrategy> {
    Box::new(HierarchicalPartition)
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}
