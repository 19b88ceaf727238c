//! Spectral partitioning.
//!
//! Devices are embedded on the eigenvectors of the `k` smallest
//! eigenvalues of the normalized Laplacian and grouped with k-means.
//! Restarts share one seeded generator, so the result is a pure function
//! of the matrix, `k` and the configured seed.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::affinity::AffinityMatrix;
use crate::error::PlacementResult;
use crate::linalg::{self, Clustering};
use crate::strategy::{PartitionStrategy, StrategyConfig, canonical, check_group_count};

/// Upper bound on Jacobi sweeps.
const JACOBI_SWEEPS: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralPartition {
    pub restarts: u32,
    pub max_iterations: u32,
    pub seed: u64,
}

impl SpectralPartition {
    pub const NAME: &'static str = "spectral";

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self {
            restarts: config.restarts.max(1),
            max_iterations: config.max_iterations.max(1),
            seed: config.seed,
        }
    }

    /// Row-normalized spectral embedding, one point per device.
    fn embed(&self, matrix: &AffinityMatrix, k: usize) -> Vec<Vec<f64>> {
        let n = matrix.size();
        let laplacian = linalg::normalized_laplacian(matrix.as_slice(), n);
        let (values, vectors) = linalg::symmetric_eigen(&laplacian, n, JACOBI_SWEEPS);
        debug!(eigenvalues = ?&values[..k], "spectral embedding");

        (0..n)
            .map(|i| {
                let row: Vec<f64> = vectors[..k].iter().map(|v| v[i]).collect();
                let norm = row.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm > f64::EPSILON {
                    row.into_iter().map(|x| x / norm).collect()
                } else {
                    row
                }
            })
            .collect()
    }
}

impl Default for SpectralPartition {
    fn default() -> Self {
        Self::from_config(&StrategyConfig::default())
    }
}

impl PartitionStrategy for SpectralPartition {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn partition(&self, matrix: &AffinityMatrix, k: usize) -> PlacementResult<Vec<Vec<usize>>> {
        let n = matrix.size();
        check_group_count(n, k)?;
        if k == 1 {
            return Ok(vec![(0..n).collect()]);
        }
        if k == n {
            return Ok((0..n).map(|i| vec![i]).collect());
        }

        let points = self.embed(matrix, k);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut best: Clustering = linalg::kmeans(&points, k, self.max_iterations, &mut rng);
        for _ in 1..self.restarts {
            let run = linalg::kmeans(&points, k, self.max_iterations, &mut rng);
            if run.inertia < best.inertia {
                best = run;
            }
        }
        linalg::fill_empty_clusters(&points, &mut best, k);

        let mut groups = vec![Vec::new(); k];
        for (device, &cluster) in best.labels.iter().enumerate() {
            groups[cluster].push(device);
        }
        debug!(devices = n, k, inertia = best.inertia, "spectral partition computed");
        Ok(canonical(groups))
    }
}
