//! Affinity graph builder.
//!
//! Entry `(i, j)` of the matrix counts the distinct collision domains
//! shared by devices `i` and `j`. The matrix is symmetric with a zero
//! diagonal and is rebuilt for every scheduling run.

use std::collections::HashMap;

use meshlab_core::Lab;
use tracing::debug;

/// Whether shared collision domains are counted or only flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityMode {
    /// Entry = number of shared collision domains.
    Weighted,
    /// Entry = 1 if any collision domain is shared, else 0.
    Binary,
}

impl AffinityMode {
    /// `semantic` scheduling uses weighted affinity.
    pub fn from_semantic(semantic: bool) -> Self {
        if semantic { Self::Weighted } else { Self::Binary }
    }
}

/// Dense square symmetric matrix of non-negative affinities.
#[derive(Debug, Clone, PartialEq)]
pub struct AffinityMatrix {
    n: usize,
    data: Vec<f64>,
}

impl AffinityMatrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Build from explicit rows. Rows must form a square matrix.
    pub fn from_rows(rows: &[Vec<f64>]) -> Option<Self> {
        let n = rows.len();
        if rows.iter().any(|r| r.len() != n) {
            return None;
        }
        Some(Self {
            n,
            data: rows.iter().flatten().copied().collect(),
        })
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    pub(crate) fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Add `w` to both `(i, j)` and `(j, i)`. The diagonal is left untouched.
    pub fn add_symmetric(&mut self, i: usize, j: usize, w: f64) {
        if i == j {
            return;
        }
        self.data[i * self.n + j] += w;
        self.data[j * self.n + i] += w;
    }

    /// Multiply both `(i, j)` and `(j, i)` by `factor`.
    pub fn scale_symmetric(&mut self, i: usize, j: usize, factor: f64) {
        if i == j {
            return;
        }
        self.data[i * self.n + j] *= factor;
        self.data[j * self.n + i] *= factor;
    }

    /// Sum of row `i`.
    pub fn degree(&self, i: usize) -> f64 {
        self.row(i).iter().sum()
    }

    /// Indices with positive affinity to `i`, ascending.
    pub fn neighbours(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.row(i)
            .iter()
            .enumerate()
            .filter(move |(j, w)| *j != i && **w > 0.0)
            .map(|(j, _)| j)
    }

    /// Copy with every positive entry clamped to 1.
    pub fn binary(&self) -> Self {
        Self {
            n: self.n,
            data: self
                .data
                .iter()
                .map(|w| if *w > 0.0 { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    pub fn is_symmetric(&self) -> bool {
        (0..self.n).all(|i| (0..self.n).all(|j| self.get(i, j) == self.get(j, i)))
    }
}

/// Stable bijection between device names and matrix indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelIndex {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelIndex {
    pub fn new(labels: Vec<String>) -> Self {
        let index = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        Self { labels, index }
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.labels.get(idx).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Adjacency matrix plus the device-name ↔ index mapping it is built on.
#[derive(Debug, Clone, PartialEq)]
pub struct AffinityGraph {
    pub matrix: AffinityMatrix,
    pub labels: LabelIndex,
}

/// Build the weighted affinity graph of `lab`.
pub fn build(lab: &Lab) -> AffinityGraph {
    build_with_mode(lab, AffinityMode::Weighted)
}

/// Build the affinity graph of `lab` using `mode`.
///
/// Devices are indexed in name order, so repeated calls on the same lab
/// return identical graphs.
pub fn build_with_mode(lab: &Lab, mode: AffinityMode) -> AffinityGraph {
    let labels = LabelIndex::new(lab.device_names());
    let mut matrix = AffinityMatrix::zeros(labels.len());

    for lan in lab.lans() {
        let members: Vec<usize> = lan
            .devices()
            .into_iter()
            .filter_map(|d| labels.index_of(d))
            .collect();

        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                matrix.add_symmetric(i, j, 1.0);
            }
        }
    }

    if mode == AffinityMode::Binary {
        matrix = matrix.binary();
    }

    debug!(devices = labels.len(), lans = lab.lan_count(), ?mode, "affinity graph built");
    AffinityGraph { matrix, labels }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(links: &[(&str, u32, &str)]) -> Lab {
        let mut lab = Lab::named("affinity");
        for (device, iface, lan) in links {
            lab.connect(device, *iface, lan).unwrap();
        }
        lab
    }

    #[test]
    fn counts_shared_lans() {
        // a and b share L1 and L3; b and c share L2.
        let lab = lab(&[
            ("a", 0, "L1"),
            ("b", 0, "L1"),
            ("b", 1, "L2"),
            ("c", 0, "L2"),
            ("a", 1, "L3"),
            ("b", 2, "L3"),
        ]);
        let g = build(&lab);
        let (a, b, c) = (
            g.labels.index_of("a").unwrap(),
            g.labels.index_of("b").unwrap(),
            g.labels.index_of("c").unwrap(),
        );

        assert_eq!(g.matrix.get(a, b), 2.0);
        assert_eq!(g.matrix.get(b, c), 1.0);
        assert_eq!(g.matrix.get(a, c), 0.0);
        assert!(g.matrix.is_symmetric());
        for i in 0..3 {
            assert_eq!(g.matrix.get(i, i), 0.0);
        }
    }

    #[test]
    fn device_attached_twice_to_one_lan_counts_once() {
        let lab = lab(&[("a", 0, "L1"), ("a", 1, "L1"), ("b", 0, "L1")]);
        let g = build(&lab);
        assert_eq!(g.matrix.get(0, 1), 1.0);
        assert_eq!(g.matrix.get(0, 0), 0.0);
    }

    #[test]
    fn binary_mode_clamps_to_one() {
        let lab = lab(&[
            ("a", 0, "L1"),
            ("b", 0, "L1"),
            ("a", 1, "L2"),
            ("b", 1, "L2"),
        ]);
        assert_eq!(build(&lab).matrix.get(0, 1), 2.0);
        assert_eq!(build_with_mode(&lab, AffinityMode::Binary).matrix.get(0, 1), 1.0);
    }

    #[test]
    fn multi_device_lan_links_every_pair() {
        let lab = lab(&[("a", 0, "hub"), ("b", 0, "hub"), ("c", 0, "hub"), ("d", 0, "hub")]);
        let g = build(&lab);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 0.0 } else { 1.0 };
                assert_eq!(g.matrix.get(i, j), expected);
            }
        }
    }

    #[test]
    fn label_index_is_name_ordered_and_stable() {
        let lab = lab(&[("zed", 0, "L"), ("amy", 0, "L"), ("bob", 0, "M")]);
        let first = build(&lab);
        let second = build(&lab);
        assert_eq!(first, second);
        assert_eq!(first.labels.labels(), ["amy", "bob", "zed"]);
        assert_eq!(first.labels.label(2), Some("zed"));
    }

    #[test]
    fn trivial_labs() {
        assert_eq!(build(&Lab::named("empty")).matrix.size(), 0);

        let mut one = Lab::named("one");
        one.connect("solo", 0, "L").unwrap();
        let g = build(&one);
        assert_eq!(g.matrix.size(), 1);
        assert_eq!(g.matrix.get(0, 0), 0.0);
    }

    #[test]
    fn neighbours_and_degree() {
        let m = AffinityMatrix::from_rows(&[
            vec![0.0, 2.0, 0.0],
            vec![2.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0],
        ])
        .unwrap();
        assert_eq!(m.neighbours(1).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(m.degree(1), 3.0);
        assert!(AffinityMatrix::from_rows(&[vec![0.0, 1.0]]).is_none());
    }
}
