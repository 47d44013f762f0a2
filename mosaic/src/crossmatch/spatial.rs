//! A 2-D k-d tree over tangent-plane positions.
//!
//! Built once per cross-match step with a median split on alternating axes,
//! then queried for every point with a fixed radius.

use glam::DVec2;

#[derive(Debug)]
pub struct KdTree {
    nodes: Vec<KdNode>,
    points: Vec<DVec2>,
}

#[derive(Debug, Clone)]
struct KdNode {
    /// Index into the points array
    point_idx: usize,
    left: Option<usize>,
    right: Option<usize>,
    /// Split dimension (0 = x, 1 = y)
    split_dim: usize,
}

#[inline]
fn axis(p: DVec2, dim: usize) -> f64 {
    if dim == 0 { p.x } else { p.y }
}

impl KdTree {
    /// Build a tree over `points`. Returns `None` for empty input.
    pub fn build(points: &[DVec2]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let points = points.to_vec();
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        Self::build_recursive(&points, &mut indices, 0, &mut nodes);

        Some(Self { nodes, points })
    }

    fn build_recursive(
        points: &[DVec2],
        indices: &mut [usize],
        depth: usize,
        nodes: &mut Vec<KdNode>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let split_dim = depth % 2;
        let median = indices.len() / 2;
        indices.select_nth_unstable_by(median, |&a, &b| {
            axis(points[a], split_dim).total_cmp(&axis(points[b], split_dim))
        });
        let point_idx = indices[median];

        let node_idx = nodes.len();
        nodes.push(KdNode {
            point_idx,
            left: None,
            right: None,
            split_dim,
        });

        let (left_indices, right_part) = indices.split_at_mut(median);
        let right_indices = &mut right_part[1..];

        let left = Self::build_recursive(points, left_indices, depth + 1, nodes);
        let right = Self::build_recursive(points, right_indices, depth + 1, nodes);

        nodes[node_idx].left = left;
        nodes[node_idx].right = right;

        Some(node_idx)
    }

    /// Append the indices of all points within `radius` of `query` to `out`.
    /// The order of appended indices is unspecified.
    pub fn radius_indices_into(&self, query: DVec2, radius: f64, out: &mut Vec<usize>) {
        if self.nodes.is_empty() {
            return;
        }
        self.radius_recursive(0, query, radius * radius, out);
    }

    fn radius_recursive(&self, node_idx: usize, query: DVec2, radius_sq: f64, out: &mut Vec<usize>) {
        let node = &self.nodes[node_idx];
        let point = self.points[node.point_idx];

        if query.distance_squared(point) <= radius_sq {
            out.push(node.point_idx);
        }

        let diff = axis(query, node.split_dim) - axis(point, node.split_dim);
        let diff_sq = diff * diff;

        if let Some(left_idx) = node.left
            && (diff <= 0.0 || diff_sq <= radius_sq)
        {
            self.radius_recursive(left_idx, query, radius_sq, out);
        }

        if let Some(right_idx) = node.right
            && (diff >= 0.0 || diff_sq <= radius_sq)
        {
            self.radius_recursive(right_idx, query, radius_sq, out);
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, idx: usize) -> DVec2 {
        self.points[idx]
    }
}
