//! R-tree over projected points for nearest-neighbor queries.

use rstar::{PointDistance, RTree, RTreeObject, AABB};

/// A planar point with its position in the input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedPoint {
    pub idx: usize,
    pub x: f64,
    pub y: f64,
}

impl RTreeObject for ProjectedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for ProjectedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.x - point[0];
        let dy = self.y - point[1];
        dx * dx + dy * dy
    }
}

/// Build an R-tree from `(x, y)` coordinates, tagging each with its index.
pub fn build_rtree(coords: &[[f64; 2]]) -> RTree<ProjectedPoint> {
    let points: Vec<ProjectedPoint> = coords
        .iter()
        .enumerate()
        .map(|(idx, c)| ProjectedPoint { idx, x: c[0], y: c[1] })
        .collect();
    RTree::bulk_load(points)
}

/// Distance from `coords[idx]` to its `k`-th nearest point, counting itself
/// as the first. Returns `None` when fewer than `k` points exist.
pub fn kth_neighbor_distance(tree: &RTree<ProjectedPoint>, coords: &[[f64; 2]], idx: usize, k: usize) -> Option<f64> {
    if k == 0 {
        return Some(0.0);
    }
    tree.nearest_neighbor_iter_with_distance_2(&coords[idx])
        .nth(k - 1)
        .map(|(_, d2)| d2.sqrt())
}
