//! Small dense linear-algebra kernels for the spectral strategy.
//!
//! Matrices are row-major `Vec<f64>` of size `n * n`. Every loop here has
//! a fixed upper bound so scheduling never spins on a pathological input.

use rand::Rng;

const EPS: f64 = 1e-12;

/// `I - D^{-1/2} W D^{-1/2}`. Rows of isolated vertices become identity rows.
pub(crate) fn normalized_laplacian(w: &[f64], n: usize) -> Vec<f64> {
    let inv_sqrt: Vec<f64> = (0..n)
        .map(|i| {
            let d: f64 = w[i * n..(i + 1) * n].iter().sum();
            if d > EPS { 1.0 / d.sqrt() } else { 0.0 }
        })
        .collect();

    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            let norm = inv_sqrt[i] * w[i * n + j] * inv_sqrt[j];
            l[i * n + j] = if i == j { 1.0 - norm } else { -norm };
        }
    }
    l
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns eigenvalues in ascending order and the matching unit
/// eigenvectors, `vectors[k]` being the vector of `values[k]`.
pub(crate) fn symmetric_eigen(m: &[f64], n: usize, max_sweeps: u32) -> (Vec<f64>, Vec<Vec<f64>>) {
    let mut a = m.to_vec();
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }

    for _ in 0..max_sweeps {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p * n + q] * a[p * n + q])
            .sum();
        if off < EPS * EPS {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| a[x * n + x].total_cmp(&a[y * n + y]).then(x.cmp(&y)));

    let values = order.iter().map(|&j| a[j * n + j]).collect();
    let vectors = order
        .iter()
        .map(|&j| (0..n).map(|i| v[i * n + j]).collect())
        .collect();
    (values, vectors)
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of the closest centroid; ties go to the lowest index.
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d = sq_dist(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

/// k-means++ seeding.
fn seed_centroids<R: Rng>(points: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let n = points.len();
    let mut centroids = vec![points[rng.gen_range(0..n)].clone()];

    while centroids.len() < k {
        let weights: Vec<f64> = points.iter().map(|p| nearest(p, &centroids).1).collect();
        let total: f64 = weights.iter().sum();

        let pick = if total <= EPS {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = n - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        };
        centroids.push(points[pick].clone());
    }
    centroids
}

/// Result of one k-means run.
#[derive(Debug, Clone)]
pub(crate) struct Clustering {
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
}

/// Lloyd iterations from a k-means++ start.
pub(crate) fn kmeans<R: Rng>(
    points: &[Vec<f64>],
    k: usize,
    max_iterations: u32,
    rng: &mut R,
) -> Clustering {
    let dims = points.first().map_or(0, Vec::len);
    let mut centroids = seed_centroids(points, k, rng);
    let mut labels = vec![usize::MAX; points.len()];

    for _ in 0..max_iterations {
        let mut changed = false;
        for (i, p) in points.iter().enumerate() {
            let (c, _) = nearest(p, &centroids);
            if labels[i] != c {
                labels[i] = c;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (p, &c) in points.iter().zip(&labels) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(p) {
                *s += x;
            }
        }
        for c in 0..k {
            // An empty cluster keeps its previous centroid.
            if counts[c] > 0 {
                centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            }
        }
    }

    let inertia = points
        .iter()
        .zip(&labels)
        .map(|(p, &c)| sq_dist(p, &centroids[c]))
        .sum();
    Clustering {
        labels,
        centroids,
        inertia,
    }
}

/// Make every one of the `k` clusters non-empty.
///
/// While a cluster is empty, the member of the largest cluster that lies
/// farthest from its centroid is moved into it. Requires `k <= points.len()`.
pub(crate) fn fill_empty_clusters(points: &[Vec<f64>], clustering: &mut Clustering, k: usize) {
    for _ in 0..k {
        let mut counts = vec![0usize; k];
        for &c in &clustering.labels {
            counts[c] += 1;
        }
        let Some(empty) = counts.iter().position(|&c| c == 0) else {
            return;
        };
        let largest = (0..k).max_by_key(|&c| (counts[c], std::cmp::Reverse(c))).unwrap_or(0);
        if counts[largest] < 2 {
            return;
        }

        let farthest = clustering
            .labels
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == largest)
            .map(|(i, _)| (i, sq_dist(&points[i], &clustering.centroids[largest])))
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(i, _)| i);

        if let Some(i) = farthest {
            clustering.labels[i] = empty;
            clustering.centroids[empty] = points[i].clone();
        }
    }
}
