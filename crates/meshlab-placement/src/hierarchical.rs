//! Agglomerative clustering over hop distances.
//!
//! Starts from singleton clusters and repeatedly merges the pair with the
//! smallest average hop distance until `k` clusters remain. Ties prefer the
//! merge producing the smaller cluster, then the lowest indices.

use std::collections::VecDeque;

use tracing::debug;

use crate::affinity::AffinityMatrix;
use crate::error::PlacementResult;
use crate::strategy::{PartitionStrategy, canonical, check_group_count};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HierarchicalPartition;

impl HierarchicalPartition {
    pub const NAME: &'static str = "hierarchical";
}

/// All-pairs BFS hop counts. Unreachable pairs get distance `n`.
fn hop_distances(matrix: &AffinityMatrix) -> Vec<Vec<usize>> {
    let n = matrix.size();
    (0..n)
        .map(|start| {
            let mut dist = vec![n; n];
            dist[start] = 0;
            let mut queue = VecDeque::from([start]);
            while let Some(v) = queue.pop_front() {
                for w in matrix.neighbours(v) {
                    if dist[w] == n {
                        dist[w] = dist[v] + 1;
                        queue.push_back(w);
                    }
                }
            }
            dist
        })
        .collect()
}

fn average_linkage(a: &[usize], b: &[usize], dist: &[Vec<usize>]) -> f64 {
    let total: usize = a.iter().flat_map(|&i| b.iter().map(move |&j| dist[i][j])).sum();
    total as f64 / (a.len() * b.len()) as f64
}

impl PartitionStrategy for HierarchicalPartition {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn partition(&self, matrix: &AffinityMatrix, k: usize) -> PlacementResult<Vec<Vec<usize>>> {
        let n = matrix.size();
        check_group_count(n, k)?;

        let dist = hop_distances(matrix);
        let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

        while clusters.len() > k {
            let mut best: Option<(f64, usize, usize, usize)> = None;
            for a in 0..clusters.len() {
                for b in (a + 1)..clusters.len() {
                    let d = average_linkage(&clusters[a], &clusters[b], &dist);
                    let size = clusters[a].len() + clusters[b].len();
                    let better = match best {
                        None => true,
                        Some((bd, bsize, _, _)) => d < bd || (d == bd && size < bsize),
                    };
                    if better {
                        best = Some((d, size, a, b));
                    }
                }
            }
            let Some((d, _, a, b)) = best else { break };
            let merged = clusters.swap_remove(b);
            clusters[a].extend(merged);
            debug!(distance = d, remaining = clusters.len(), "clusters merged");
        }

        Ok(canonical(clusters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> AffinityMatrix {
        let mut m = AffinityMatrix::zeros(n);
        for i in 1..n {
            m.add_symmetric(i - 1, i, 1.0);
        }
        m
    }

    #[test]
    fn hop_distances_of_chain() {
        let d = hop_distances(&chain(4));
        assert_eq!(d[0], vec![0, 1, 2, 3]);
        assert_eq!(d[3][1], 2);
    }

    #[test]
    fn unreachable_pairs_are_far() {
        let d = hop_distances(&AffinityMatrix::zeros(3));
        assert_eq!(d[0], vec![0, 3, 3]);
    }

    #[test]
    fn chain_splits_into_contiguous_runs() {
        let groups = HierarchicalPartition.partition(&chain(6), 2).unwrap();
        assert_eq!(groups.len(), 2);
        for g in &groups {
            assert!(g.windows(2).all(|w| w[1] == w[0] + 1), "{g:?} is not contiguous");
        }
    }

    #[test]
    fn two_islands_stay_apart() {
        let mut m = AffinityMatrix::zeros(4);
        m.add_symmetric(0, 1, 1.0);
        m.add_symmetric(2, 3, 1.0);
        let groups = HierarchicalPartition.partition(&m, 2).unwrap();
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn single_group_and_singletons() {
        let m = chain(3);
        assert_eq!(HierarchicalPartition.partition(&m, 1).unwrap(), vec![vec![0, 1, 2]]);
        assert_eq!(
            HierarchicalPartition.partition(&m, 3).unwrap(),
            vec![vec![0], vec![1], vec![2]]
        );
    }
}
