//! Hierarchical agglomerative clustering with a distance threshold.
//!
//! Runs the nearest-neighbor-chain algorithm with Lance–Williams updates over
//! a condensed Euclidean distance matrix, then cuts the dendrogram at the
//! threshold: two clusters are merged only while their linkage distance is
//! strictly below it. All supported linkages are reducible, so merge heights
//! are monotone along the tree and the cut is a union over low merges.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::embedding::euclidean_distance;
use crate::union_find::UnionFind;

/// Linkage criterion between clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Minimum increase of within-cluster variance
    #[default]
    Ward,
    /// Mean pairwise distance
    Average,
    /// Maximum pairwise distance
    Complete,
    /// Minimum pairwise distance
    Single,
}

impl std::str::FromStr for Linkage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ward" => Ok(Linkage::Ward),
            "average" => Ok(Linkage::Average),
            "complete" => Ok(Linkage::Complete),
            "single" => Ok(Linkage::Single),
            other => Err(format!("unknown linkage '{}'", other)),
        }
    }
}

/// One merge of the dendrogram, by surviving slot index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub a: usize,
    pub b: usize,
    pub height: f64,
}

/// Condensed upper-triangular distance matrix.
struct CondensedMatrix {
    n: usize,
    data: Vec<f64>,
}

impl CondensedMatrix {
    fn from_points(points: &[Vec<f32>]) -> Self {
        let n = points.len();
        let row = |i: usize| -> Vec<f64> {
            ((i + 1)..n)
                .map(|j| euclidean_distance(&points[i], &points[j]))
                .collect()
        };

        #[cfg(feature = "parallel")]
        let rows: Vec<Vec<f64>> = (0..n).into_par_iter().map(row).collect();
        #[cfg(not(feature = "parallel"))]
        let rows: Vec<Vec<f64>> = (0..n).map(row).collect();

        Self {
            n,
            data: rows.concat(),
        }
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        self.n * i - i * (i + 1) / 2 + (j - i - 1)
    }

    #[inline]
    fn get(&self, i: usize, j: usize) -> f64 {
        self.data[self.index(i, j)]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, value: f64) {
        let idx = self.index(i, j);
        self.data[idx] = value;
    }
}

fn lance_williams(linkage: Linkage, d_ki: f64, d_kj: f64, d_ij: f64, n_i: f64, n_j: f64, n_k: f64) -> f64 {
    match linkage {
        Linkage::Single => d_ki.min(d_kj),
        Linkage::Complete => d_ki.max(d_kj),
        Linkage::Average => (n_i * d_ki + n_j * d_kj) / (n_i + n_j),
        Linkage::Ward => {
            let t = n_i + n_j + n_k;
            let value = ((n_i + n_k) * d_ki * d_ki + (n_j + n_k) * d_kj * d_kj - n_k * d_ij * d_ij) / t;
            value.max(0.0).sqrt()
        }
    }
}

/// Build the full dendrogram with the nearest-neighbor chain.
pub fn nn_chain(points: &[Vec<f32>], linkage: Linkage) -> Vec<Merge> {
    let n = points.len();
    if n < 2 {
        return Vec::new();
    }

    let mut dist = CondensedMatrix::from_points(points);
    let mut active = vec![true; n];
    let mut size = vec![1usize; n];
    let mut merges = Vec::with_capacity(n - 1);
    let mut chain: Vec<usize> = Vec::with_capacity(n);

    for _ in 0..(n - 1) {
        if chain.is_empty() {
            if let Some(first) = active.iter().position(|&a| a) {
                chain.push(first);
            }
        }

        // Grow the chain until the last two are reciprocal nearest neighbors
        let (a, b, height) = loop {
            let a = chain[chain.len() - 1];
            let prev = if chain.len() >= 2 { Some(chain[chain.len() - 2]) } else { None };

            let mut best = prev;
            let mut best_d = prev.map(|p| dist.get(a, p)).unwrap_or(f64::INFINITY);
            for k in 0..n {
                if k == a || !active[k] {
                    continue;
                }
                let d = dist.get(a, k);
                if d < best_d {
                    best_d = d;
                    best = Some(k);
                }
            }

            // At least two clusters remain active, so `best` is set
            let Some(b) = best else {
                return merges;
            };
            if Some(b) == prev {
                chain.pop();
                chain.pop();
                break (a, b, best_d);
            }
            chain.push(b);
        };

        // The merged cluster keeps the lower slot
        let (keep, drop) = if a < b { (a, b) } else { (b, a) };
        let (n_keep, n_drop) = (size[keep] as f64, size[drop] as f64);
        for k in 0..n {
            if !active[k] || k == keep || k == drop {
                continue;
            }
            let updated = lance_williams(
                linkage,
                dist.get(k, keep),
                dist.get(k, drop),
                height,
                n_keep,
                n_drop,
                size[k] as f64,
            );
            dist.set(k, keep, updated);
        }
        active[drop] = false;
        size[keep] += size[drop];
        merges.push(Merge {
            a: keep,
            b: drop,
            height,
        });
    }

    merges
}

/// Cluster points, merging while linkage distance is below `threshold`.
///
/// Returns groups of point indices; members ascend and groups are ordered by
/// their first member.
pub fn cluster_with_threshold(points: &[Vec<f32>], linkage: Linkage, threshold: f64) -> Vec<Vec<usize>> {
    let n = points.len();
    if n < 2 {
        return (0..n).map(|i| vec![i]).collect();
    }

    let merges = nn_chain(points, linkage);
    let mut uf = UnionFind::new(n);
    for merge in merges.iter().filter(|m| m.height < threshold) {
        uf.union(merge.a, merge.b);
    }
    uf.groups()
}
