//! Per-tile bounding volume tree over ground polygons
//!
//! Nodes are stored flat in depth-first order. A leaf holds a polygon index;
//! an internal node stores the negated index of the node that follows its
//! subtree so traversal can skip it without recursion.

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }

    pub fn expand_point(&mut self, p: &[f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    pub fn expand(&mut self, other: &Aabb) {
        self.expand_point(&other.min);
        self.expand_point(&other.max);
    }

    pub fn overlaps(&self, min: &[f32; 3], max: &[f32; 3]) -> bool {
        self.min[0] <= max[0]
            && self.max[0] >= min[0]
            && self.min[1] <= max[1]
            && self.max[1] >= min[1]
            && self.min[2] <= max[2]
            && self.max[2] >= min[2]
    }

    fn longest_axis(&self) -> usize {
        let dx = self.max[0] - self.min[0];
        let dy = self.max[1] - self.min[1];
        let dz = self.max[2] - self.min[2];
        if dx >= dy && dx >= dz {
            0
        } else if dy >= dz {
            1
        } else {
            2
        }
    }
}

/// Node of a tile's bounding volume tree
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BVNode {
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Polygon index for leaves, negated escape index for internal nodes
    pub index: i32,
}

impl BVNode {
    pub fn is_leaf(&self) -> bool {
        self.index >= 0
    }

    fn bounds(&self) -> Aabb {
        Aabb {
            min: self.bmin,
            max: self.bmax,
        }
    }
}

/// Builds the tree from one bounding box per polygon
pub(crate) fn build(items: &[(usize, Aabb)]) -> Vec<BVNode> {
    let mut nodes = Vec::with_capacity(items.len() * 2);
    let mut work: Vec<(usize, Aabb)> = items.to_vec();
    if !work.is_empty() {
        subdivide(&mut work, &mut nodes);
    }
    nodes
}

fn subdivide(items: &mut [(usize, Aabb)], nodes: &mut Vec<BVNode>) {
    let mut bounds = Aabb::empty();
    for (_, b) in items.iter() {
        bounds.expand(b);
    }

    let node_index = nodes.len();
    if items.len() == 1 {
        nodes.push(BVNode {
            bmin: bounds.min,
            bmax: bounds.max,
            index: items[0].0 as i32,
        });
        return;
    }

    nodes.push(BVNode {
        bmin: bounds.min,
        bmax: bounds.max,
        index: 0,
    });

    let axis = bounds.longest_axis();
    items.sort_by(|a, b| {
        let ca = a.1.min[axis] + a.1.max[axis];
        let cb = b.1.min[axis] + b.1.max[axis];
        ca.total_cmp(&cb)
    });
    let split = items.len() / 2;
    let (left, right) = items.split_at_mut(split);
    subdivide(left, nodes);
    subdivide(right, nodes);

    let escape = nodes.len() - node_index;
    nodes[node_index].index = -(escape as i32);
}

/// Indices of polygons whose boxes overlap `min`..`max`
pub(crate) fn query(nodes: &[BVNode], min: &[f32; 3], max: &[f32; 3], out: &mut Vec<usize>) {
    let mut i = 0;
    while i < nodes.len() {
        let node = &nodes[i];
        let overlap = node.bounds().overlaps(min, max);
        if node.is_leaf() {
            if overlap {
                out.push(node.index as usize);
            }
            i += 1;
        } else if overlap {
            i += 1;
        } else {
            i += node.index.unsigned_abs() as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32, z: f32) -> Aabb {
        Aabb {
            min: [x, 0.0, z],
            max: [x + 1.0, 0.5, z + 1.0],
        }
    }

    #[test]
    fn test_query_matches_brute_force() {
        let items: Vec<(usize, Aabb)> = (0..50)
            .map(|i| (i, unit_box((i % 10) as f32 * 1.5, (i / 10) as f32 * 1.5)))
            .collect();
        let tree = build(&items);
        assert_eq!(tree.iter().filter(|n| n.is_leaf()).count(), 50);

        let qmin = [2.0, -1.0, 2.0];
        let qmax = [5.0, 1.0, 4.0];
        let mut found = Vec::new();
        query(&tree, &qmin, &qmax, &mut found);
        found.sort_unstable();

        let expected: Vec<usize> = items
            .iter()
            .filter(|(_, b)| b.overlaps(&qmin, &qmax))
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_empty_and_single() {
        assert!(build(&[]).is_empty());
        let tree = build(&[(7, unit_box(0.0, 0.0))]);
        let mut found = Vec::new();
        query(&tree, &[0.5, 0.0, 0.5], &[0.6, 0.1, 0.6], &mut found);
        assert_eq!(found, vec![7]);
    }
}
