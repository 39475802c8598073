//! HDBSCAN* over planar points.
//!
//! Pipeline:
//! 1. Core distance of each point: distance to its `min_samples`-th nearest
//!    neighbor, the point itself counting as the first.
//! 2. Minimum spanning tree of the mutual-reachability graph
//!    `max(core_a, core_b, d(a, b))` with Prim's algorithm.
//! 3. Single-linkage hierarchy from the sorted MST edges.
//! 4. Condensed tree: splits where both sides keep `min_cluster_size`
//!    points create new clusters, smaller sides fall out as points.
//! 5. Cluster selection (leaf or excess of mass); the root is never selected.
//! 6. Epsilon merge: MST components joined by edges `<= epsilon` with at
//!    least `min_cluster_size` points become one cluster, absorbing any
//!    selected clusters they touch.
//!
//! Labels are `-1` for noise and otherwise numbered by first appearance.

use std::collections::HashMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::rtree::{build_rtree, kth_neighbor_distance};
use crate::error::{BizmapError, OptionExt, Result};
use crate::union_find::UnionFind;

/// Noise label.
pub const NOISE: i32 = -1;

/// Upper bound for `1 / distance` when points coincide.
const LAMBDA_CAP: f64 = 1e12;

/// Below this many points the sequential path is faster than a pool.
#[cfg(feature = "parallel")]
const PARALLEL_MIN_POINTS: usize = 512;

/// How flat clusters are picked from the condensed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSelection {
    /// Clusters with no child clusters; many small homogeneous groups.
    #[default]
    Leaf,
    /// Most persistent clusters by stability.
    ExcessOfMass,
}

impl std::str::FromStr for ClusterSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "leaf" => Ok(ClusterSelection::Leaf),
            "eom" | "excess_of_mass" => Ok(ClusterSelection::ExcessOfMass),
            other => Err(format!("unknown cluster selection '{}'", other)),
        }
    }
}

/// HDBSCAN parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdbscanParams {
    /// Neighborhood size for core distances; also the minimum cluster size.
    pub min_samples: usize,
    /// Cluster-selection distance in coordinate units.
    pub epsilon: f64,
    pub selection: ClusterSelection,
    /// Worker threads for core distances and the spanning tree.
    pub workers: usize,
}

impl HdbscanParams {
    pub fn min_cluster_size(&self) -> usize {
        self.min_samples.max(2)
    }

    fn validate(&self) -> Result<()> {
        if self.min_samples == 0 {
            return Err(BizmapError::invalid("min_samples", "must be at least 1"));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(BizmapError::invalid(
                "epsilon",
                format!("{} is not a non-negative distance", self.epsilon),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MstEdge {
    a: usize,
    b: usize,
    weight: f64,
}

/// Merge of two nodes in the single-linkage hierarchy.
///
/// Nodes `< n` are points; node `n + i` is the result of row `i`.
#[derive(Debug, Clone, Copy)]
struct LinkageRow {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

/// Edge of the condensed tree. Clusters are labelled from `n`, the root
/// being `n`; children below `n` are points.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CondensedRow {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

/// Cluster `coords` and return one label per point, in input order.
pub fn hdbscan(coords: &[[f64; 2]], params: &HdbscanParams) -> Result<Vec<i32>> {
    params.validate()?;
    let n = coords.len();
    if let Some(bad) = coords.iter().position(|c| !c[0].is_finite() || !c[1].is_finite()) {
        return Err(BizmapError::ClusteringFailed {
            message: format!("point {} has non-finite coordinates", bad),
        });
    }
    if n < params.min_samples || n < 2 {
        return Ok(vec![NOISE; n]);
    }

    let mcs = params.min_cluster_size();
    let (core, mut mst) = build_spanning_tree(coords, params)?;
    log::debug!(
        "[Clusterer] Spanning tree over {} points (max core distance {:.3})",
        n,
        core.iter().cloned().fold(0.0, f64::max)
    );

    mst.sort_by(|x, y| x.weight.total_cmp(&y.weight));
    let linkage = single_linkage(n, &mst)?;
    let condensed = condense_tree(&linkage, n, mcs);
    let selected_of_point = select_point_clusters(&condensed, n, params.selection)?;

    Ok(assign_labels(n, mcs, &selected_of_point, &mst, params.epsilon))
}

// ============================================================================
// Core distances and spanning tree
// ============================================================================

fn build_spanning_tree(coords: &[[f64; 2]], params: &HdbscanParams) -> Result<(Vec<f64>, Vec<MstEdge>)> {
    #[cfg(feature = "parallel")]
    {
        if coords.len() >= PARALLEL_MIN_POINTS && params.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(params.workers)
                .build()
                .map_err(|e| BizmapError::ClusteringFailed {
                    message: format!("cannot start {} workers: {}", params.workers, e),
                })?;
            return pool.install(|| {
                let core = core_distances_parallel(coords, params.min_samples)?;
                let mst = prim_mst(coords, &core, true);
                Ok((core, mst))
            });
        }
    }

    let core = core_distances(coords, params.min_samples)?;
    let mst = prim_mst(coords, &core, false);
    Ok((core, mst))
}

fn core_distances(coords: &[[f64; 2]], min_samples: usize) -> Result<Vec<f64>> {
    let tree = build_rtree(coords);
    (0..coords.len())
        .map(|i| kth_neighbor_distance(&tree, coords, i, min_samples).ok_or_clustering("too few neighbors for core distance"))
        .collect()
}

#[cfg(feature = "parallel")]
fn core_distances_parallel(coords: &[[f64; 2]], min_samples: usize) -> Result<Vec<f64>> {
    let tree = build_rtree(coords);
    (0..coords.len())
        .into_par_iter()
        .map(|i| kth_neighbor_distance(&tree, coords, i, min_samples))
        .collect::<Option<Vec<f64>>>()
        .ok_or_clustering("too few neighbors for core distance")
}

#[inline]
fn mutual_reachability(coords: &[[f64; 2]], core: &[f64], a: usize, b: usize) -> f64 {
    let dx = coords[a][0] - coords[b][0];
    let dy = coords[a][1] - coords[b][1];
    (dx * dx + dy * dy).sqrt().max(core[a]).max(core[b])
}

/// Prim's algorithm on the dense mutual-reachability graph.
///
/// Ties pick the lowest point index, so the tree is the same for any worker
/// count.
#[cfg_attr(not(feature = "parallel"), allow(unused_variables))]
fn prim_mst(coords: &[[f64; 2]], core: &[f64], parallel: bool) -> Vec<MstEdge> {
    let n = coords.len();
    let mut in_tree = vec![false; n];
    // (best distance to the tree, tree endpoint)
    let mut frontier = vec![(f64::INFINITY, 0usize); n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));
    let order = |x: &(f64, usize), y: &(f64, usize)| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        let visited = &in_tree;
        let relax = |(j, slot): (usize, &mut (f64, usize))| -> Option<(f64, usize)> {
            if visited[j] {
                return None;
            }
            let d = mutual_reachability(coords, core, current, j);
            if d < slot.0 {
                *slot = (d, current);
            }
            Some((slot.0, j))
        };

        #[cfg(feature = "parallel")]
        let next = if parallel {
            frontier.par_iter_mut().enumerate().filter_map(relax).min_by(order)
        } else {
            frontier.iter_mut().enumerate().filter_map(relax).min_by(order)
        };
        #[cfg(not(feature = "parallel"))]
        let next = frontier.iter_mut().enumerate().filter_map(relax).min_by(order);

        let Some((weight, j)) = next else { break };
        edges.push(MstEdge {
            a: frontier[j].1,
            b: j,
            weight,
        });
        in_tree[j] = true;
        current = j;
    }
    edges
}

// ============================================================================
// Hierarchy
// ============================================================================

/// Single-linkage merges from MST edges sorted by weight.
fn single_linkage(n: usize, sorted_edges: &[MstEdge]) -> Result<Vec<LinkageRow>> {
    let mut uf = UnionFind::new(n);
    let mut node_of_root: Vec<usize> = (0..n).collect();
    let mut rows = Vec::with_capacity(sorted_edges.len());

    for (i, edge) in sorted_edges.iter().enumerate() {
        let root_a = uf.find(edge.a);
        let root_b = uf.find(edge.b);
        let size = uf.set_size(root_a) + uf.set_size(root_b);
        let row = LinkageRow {
            left: node_of_root[root_a],
            right: node_of_root[root_b],
            distance: edge.weight,
            size,
        };
        let merged = uf
            .union(root_a, root_b)
            .ok_or_clustering("spanning tree edge closes a cycle")?;
        node_of_root[merged] = n + i;
        rows.push(row);
    }

    if rows.len() + 1 != n {
        return Err(BizmapError::ClusteringFailed {
            message: format!("spanning tree has {} edges for {} points", rows.len(), n),
        });
    }
    Ok(rows)
}

fn lambda_of(distance: f64) -> f64 {
    if distance > 0.0 {
        (1.0 / distance).min(LAMBDA_CAP)
    } else {
        LAMBDA_CAP
    }
}

/// Collapse the single-linkage hierarchy under `min_cluster_size`.
fn condense_tree(linkage: &[LinkageRow], n: usize, min_cluster_size: usize) -> Vec<CondensedRow> {
    let node_size = |node: usize| if node < n { 1 } else { linkage[node - n].size };
    let mut rows = Vec::with_capacity(n * 2);
    let mut next_label = n + 1;

    // Points below `node` fall out of `cluster` at `lambda`
    let fall_out = |rows: &mut Vec<CondensedRow>, node: usize, cluster: usize, lambda: f64| {
        let mut pending = vec![node];
        while let Some(current) = pending.pop() {
            if current < n {
                rows.push(CondensedRow {
                    parent: cluster,
                    child: current,
                    lambda,
                    size: 1,
                });
            } else {
                let row = &linkage[current - n];
                pending.push(row.right);
                pending.push(row.left);
            }
        }
    };

    let root = n + linkage.len() - 1;
    let mut stack = vec![(root, n)];
    while let Some((node, cluster)) = stack.pop() {
        let row = &linkage[node - n];
        let lambda = lambda_of(row.distance);
        let (left, right) = (row.left, row.right);
        let (left_size, right_size) = (node_size(left), node_size(right));

        match (left_size >= min_cluster_size, right_size >= min_cluster_size) {
            (true, true) => {
                for (child, size) in [(left, left_size), (right, right_size)] {
                    let label = next_label;
                    next_label += 1;
                    rows.push(CondensedRow {
                        parent: cluster,
                        child: label,
                        lambda,
                        size,
                    });
                    stack.push((child, label));
                }
            }
            (false, false) => {
                fall_out(&mut rows, left, cluster, lambda);
                fall_out(&mut rows, right, cluster, lambda);
            }
            (true, false) => {
                fall_out(&mut rows, right, cluster, lambda);
                stack.push((left, cluster));
            }
            (false, true) => {
                fall_out(&mut rows, left, cluster, lambda);
                stack.push((right, cluster));
            }
        }
    }
    rows
}

/// Pick clusters and return, per point, the index of its selected cluster.
fn select_point_clusters(condensed: &[CondensedRow], n: usize, selection: ClusterSelection) -> Result<Vec<Option<usize>>> {
    let num_clusters = condensed
        .iter()
        .filter(|r| r.child >= n)
        .map(|r| r.child - n + 1)
        .max()
        .unwrap_or(1);

    let mut parent: Vec<Option<usize>> = vec![None; num_clusters];
    let mut birth = vec![0.0f64; num_clusters];
    for row in condensed.iter().filter(|r| r.child >= n) {
        parent[row.child - n] = Some(row.parent - n);
        birth[row.child - n] = row.lambda;
    }

    let mut stability = vec![0.0f64; num_clusters];
    for row in condensed {
        let p = row.parent - n;
        stability[p] += (row.lambda - birth[p]) * row.size as f64;
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); num_clusters];
    for (c, p) in parent.iter().enumerate() {
        if let Some(p) = *p {
            children[p].push(c);
        }
    }

    let selected: Vec<bool> = match selection {
        ClusterSelection::Leaf => (0..num_clusters).map(|c| c != 0 && children[c].is_empty()).collect(),
        ClusterSelection::ExcessOfMass => excess_of_mass(&children, &stability),
    };
    log::debug!(
        "[Clusterer] Condensed tree has {} clusters, {} selected ({:?})",
        num_clusters,
        selected.iter().filter(|s| **s).count(),
        selection
    );

    // Parents carry lower indices than their children
    let mut selected_ancestor: Vec<Option<usize>> = vec![None; num_clusters];
    for c in 1..num_clusters {
        selected_ancestor[c] = if selected[c] {
            Some(c)
        } else {
            parent[c].and_then(|p| selected_ancestor[p])
        };
    }

    let mut point_cluster: Vec<Option<usize>> = vec![None; n];
    let mut seen = vec![false; n];
    for row in condensed.iter().filter(|r| r.child < n) {
        point_cluster[row.child] = selected_ancestor[row.parent - n];
        seen[row.child] = true;
    }
    if seen.iter().any(|s| !s) {
        return Err(BizmapError::ClusteringFailed {
            message: "condensed tree lost points".to_string(),
        });
    }
    Ok(point_cluster)
}

fn excess_of_mass(children: &[Vec<usize>], stability: &[f64]) -> Vec<bool> {
    let num_clusters = stability.len();
    let mut selected = vec![true; num_clusters];
    selected[0] = false;
    let mut best = stability.to_vec();

    for c in (1..num_clusters).rev() {
        let subtree: f64 = children[c].iter().map(|&k| best[k]).sum();
        if subtree > best[c] {
            selected[c] = false;
            best[c] = subtree;
        } else {
            let mut pending = children[c].clone();
            while let Some(d) = pending.pop() {
                selected[d] = false;
                pending.extend_from_slice(&children[d]);
            }
        }
    }
    selected
}

// ============================================================================
// Labelling
// ============================================================================

fn assign_labels(
    n: usize,
    min_cluster_size: usize,
    point_cluster: &[Option<usize>],
    mst: &[MstEdge],
    epsilon: f64,
) -> Vec<i32> {
    let mut groups = UnionFind::new(n);
    let mut clustered = vec![false; n];

    let mut first_member: HashMap<usize, usize> = HashMap::new();
    for (p, cluster) in point_cluster.iter().enumerate() {
        if let Some(cluster) = *cluster {
            clustered[p] = true;
            let first = *first_member.entry(cluster).or_insert(p);
            groups.union(first, p);
        }
    }

    if epsilon > 0.0 {
        let mut reach = UnionFind::new(n);
        for edge in mst.iter().filter(|e| e.weight <= epsilon) {
            reach.union(edge.a, edge.b);
        }
        for component in reach.groups() {
            if component.len() < min_cluster_size {
                continue;
            }
            for &p in &component {
                clustered[p] = true;
                groups.union(component[0], p);
            }
        }
    }

    let mut label_of_root: HashMap<usize, i32> = HashMap::new();
    (0..n)
        .map(|p| {
            if !clustered[p] {
                return NOISE;
            }
            let root = groups.find(p);
            let next = label_of_root.len() as i32;
            *label_of_root.entry(root).or_insert(next)
        })
        .collect()
}
