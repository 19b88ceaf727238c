//! Semantic routing-protocol hints.
//!
//! Devices may declare the routing domain they belong to in metadata
//! (`bgp_as = "65001"`, `ospf_area = "0"`). Devices in the same domain are
//! pulled together, devices in different domains pushed apart.
//!
//! A device without a metadata hint is looked up in its routing daemon
//! configuration under the lab directory
//! (`<lab>/<device>/etc/{zebra,quagga,frr}/{bgpd,ospfd}.conf`). Devices
//! still without a hint inherit it from their nearest hinted neighbour.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use meshlab_core::Lab;
use regex::Regex;
use tracing::{debug, warn};

use crate::affinity::AffinityGraph;

/// Metadata keys treated as routing-domain hints.
pub const HINT_KEYS: &[&str] = &["bgp_as", "ospf_area"];

/// Routing suites searched in order; the first one present wins.
pub const SUITES: &[&str] = &["zebra", "quagga", "frr"];

/// Per hint key: the daemon config file and the pattern capturing the value.
const CONFIG_SOURCES: &[(&str, &str, &str)] = &[
    ("bgp_as", "bgpd.conf", r"router bgp (\d+)"),
    ("ospf_area", "ospfd.conf", r"network .*? area (.*)"),
];

/// Affinity multiplier for two devices in the same routing domain.
pub const SAME_DOMAIN_FACTOR: f64 = 4.0 / 3.0;

/// Affinity divisor for two devices in different routing domains.
pub const CROSS_DOMAIN_DIVISOR: f64 = 3.75;

/// Apply every hint key present in `lab` to `graph`.
///
/// Returns the number of hint keys that were applied.
pub fn apply(graph: &mut AffinityGraph, lab: &Lab) -> usize {
    let mut applied = 0;
    for key in HINT_KEYS {
        let source = lab.path().and_then(|dir| config_source(dir, key));
        let mut values: BTreeMap<usize, String> = lab
            .devices()
            .filter_map(|d| {
                let idx = graph.labels.index_of(&d.name)?;
                let value = match d.meta.get(*key) {
                    Some(value) => value.clone(),
                    None => {
                        let (dir, file, pattern) = source.as_ref()?;
                        config_hint(dir, &d.name, file, pattern)?
                    }
                };
                Some((idx, value))
            })
            .collect();

        if values.is_empty() {
            continue;
        }

        infer_from_neighbours(graph, &mut values);
        enhance(graph, &values);
        debug!(key, hinted = values.len(), "protocol hints applied");
        applied += 1;
    }
    applied
}

fn config_source<'a>(dir: &'a Path, key: &str) -> Option<(&'a Path, &'static str, Regex)> {
    let (_, file, pattern) = CONFIG_SOURCES.iter().find(|(k, _, _)| *k == key)?;
    match Regex::new(pattern) {
        Ok(re) => Some((dir, *file, re)),
        Err(e) => {
            warn!(key, error = %e, "hint pattern rejected, config files ignored");
            None
        }
    }
}

/// Value of the last `pattern` match in `<lab_dir>/<device>/etc/<suite>/<file>`.
///
/// Only the first suite directory that exists is read.
pub fn config_hint(lab_dir: &Path, device: &str, file: &str, pattern: &Regex) -> Option<String> {
    let etc = lab_dir.join(device).join("etc");
    let suite = SUITES.iter().map(|s| etc.join(s)).find(|p| p.is_dir())?;
    let content = std::fs::read_to_string(suite.join(file)).ok()?;
    let value = pattern
        .captures_iter(&content)
        .last()
        .map(|caps| caps[1].trim().to_string())?;
    debug!(device, file, value = %value, "hint read from routing config");
    Some(value)
}

/// Give every unhinted device the hint of its nearest hinted neighbour.
fn infer_from_neighbours(graph: &AffinityGraph, values: &mut BTreeMap<usize, String>) {
    let n = graph.matrix.size();
    let known = values.clone();

    for start in 0..n {
        if known.contains_key(&start) {
            continue;
        }
        if let Some(value) = nearest_hint(graph, &known, start) {
            values.insert(start, value);
        }
    }
}

fn nearest_hint(
    graph: &AffinityGraph,
    known: &BTreeMap<usize, String>,
    start: usize,
) -> Option<String> {
    let mut visited = vec![false; graph.matrix.size()];
    let mut queue = VecDeque::from([start]);
    visited[start] = true;

    while let Some(v) = queue.pop_front() {
        for neighbour in graph.matrix.neighbours(v) {
            if visited[neighbour] {
                continue;
            }
            if let Some(value) = known.get(&neighbour) {
                return Some(value.clone());
            }
            visited[neighbour] = true;
            queue.push_back(neighbour);
        }
    }
    None
}

fn enhance(graph: &mut AffinityGraph, values: &BTreeMap<usize, String>) {
    let hinted: Vec<(&usize, &String)> = values.iter().collect();
    for (pos, (i, vi)) in hinted.iter().enumerate() {
        for (j, vj) in &hinted[pos + 1..] {
            let factor = if vi == vj {
                SAME_DOMAIN_FACTOR
            } else {
                1.0 / CROSS_DOMAIN_DIVISOR
            };
            graph.matrix.scale_symmetric(**i, **j, factor);
        }
    }
}
