//! Round-robin partitioning.
//!
//! Ignores affinity entirely: the device at position `p` goes to group
//! `p mod k`. Group sizes differ by at most one. Used when no topology
//! signal is wanted.

use crate::affinity::AffinityMatrix;
use crate::error::PlacementResult;
use crate::strategy::{PartitionStrategy, check_group_count};

#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinPartition;

impl RoundRobinPartition {
    pub const NAME: &'static str = "round_robin";
}

impl PartitionStrategy for RoundRobinPartition {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn partition(&self, matrix: &AffinityMatrix, k: usize) -> PlacementResult<Vec<Vec<usize>>> {
        let n = matrix.size();
        check_group_count(n, k)?;

        let mut groups = vec![Vec::new(); k];
        for p in 0..n {
            groups[p % k].push(p);
        }
        Ok(groups)
    }
}
