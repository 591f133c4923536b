//! Search nodes and the open list shared by the graph searches

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::PolyRef;

/// Node flags for search state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct NodeFlags(u8);

impl NodeFlags {
    pub const OPEN: NodeFlags = NodeFlags(0x01);
    pub const CLOSED: NodeFlags = NodeFlags(0x02);

    pub fn contains(&self, flag: NodeFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: NodeFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: NodeFlags) {
        self.0 &= !flag.0;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Position where the search entered the polygon
    pub pos: [f32; 3],
    /// Cost from the start
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    pub parent: Option<usize>,
    pub flags: NodeFlags,
    pub poly: PolyRef,
}

/// One node per polygon, bounded by `max_nodes`
#[derive(Debug, Clone)]
pub(crate) struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, usize>,
    max_nodes: usize,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            lookup: HashMap::new(),
            max_nodes: max_nodes.max(1),
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Clears the pool and allocates the node of `poly`, which gets index 0
    pub fn reset_with(&mut self, poly: PolyRef) -> usize {
        self.clear();
        self.nodes.push(Node {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::default(),
            poly,
        });
        self.lookup.insert(poly, 0);
        0
    }

    /// Returns the node of `poly`, allocating it if needed. `None` when the
    /// pool is exhausted.
    pub fn get_or_alloc(&mut self, poly: PolyRef) -> Option<usize> {
        if let Some(&idx) = self.lookup.get(&poly) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::default(),
            poly,
        });
        self.lookup.insert(poly, idx);
        Some(idx)
    }

    pub fn find(&self, poly: PolyRef) -> Option<usize> {
        self.lookup.get(&poly).copied()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Polygons from the start to `idx` by following parents. Stops at an
    /// index the pool does not hold.
    pub fn path_to(&self, idx: usize) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut cur = Some(idx);
        while let Some(node) = cur.and_then(|i| self.nodes.get(i)) {
            path.push(node.poly);
            cur = node.parent;
        }
        path.reverse();
        path
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    total: f32,
    node: usize,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties go to the older node
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Min-priority queue of node indices keyed by their total cost.
///
/// Re-pushing a node with a lower total leaves the old entry behind; stale
/// entries are dropped when popped.
#[derive(Debug, Clone, Default)]
pub(crate) struct OpenList {
    heap: BinaryHeap<OpenEntry>,
}

impl OpenList {
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push(&mut self, node: usize, total: f32) {
        self.heap.push(OpenEntry { total, node });
    }

    /// Pops the open node with the lowest total
    pub fn pop(&mut self, pool: &NodePool) -> Option<usize> {
        while let Some(entry) = self.heap.pop() {
            let node = pool.node(entry.node);
            if node.flags.contains(NodeFlags::OPEN) && node.total == entry.total {
                return Some(entry.node);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
