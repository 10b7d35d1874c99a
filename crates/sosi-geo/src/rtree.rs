//! Arena-owned R-tree for geographic group search.
//!
//! Nodes and leaves live in two arenas with free lists. A group table entry keeps a
//! [`LeafHandle`] to its leaf; handles carry a generation so a handle to a removed
//! leaf is detected instead of aliasing a reused slot.
//!
//! Node layout:
//! +---------------------+
//! | parent: Option<u32> |
//! | kind: Leaves|Nodes  |
//! | bbox: BoundingBox   |  covers every child
//! | children: [u32; ..] |  at most MAX_CHILDREN
//! +---------------------+

use sosi_common::{BoundingBox, GroupNo};

/// Maximum number of children per node.
pub const MAX_CHILDREN: usize = 3;

/// Handle to a leaf in a [`GeoTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Leaves,
    Nodes,
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<u32>,
    kind: Kind,
    bbox: BoundingBox,
    children: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct LeafEntry {
    group: GroupNo,
    bbox: BoundingBox,
    parent: u32,
}

#[derive(Debug, Clone)]
struct LeafSlot {
    generation: u32,
    entry: Option<LeafEntry>,
}

/// R-tree keyed by bounding box, one leaf per group with geometry.
#[derive(Debug, Default)]
pub struct GeoTree {
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    leaves: Vec<LeafSlot>,
    free_leaves: Vec<u32>,
    root: Option<u32>,
    len: usize,
}

impl GeoTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the tree holds no leaves.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Box covering every leaf, or `None` for an empty tree.
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.root.map(|r| self.nodes[r as usize].bbox)
    }

    /// Removes every leaf and node.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Returns the group and box stored under a handle.
    pub fn get(&self, handle: LeafHandle) -> Option<(GroupNo, BoundingBox)> {
        let slot = self.leaves.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.map(|e| (e.group, e.bbox))
    }

    /// Inserts a leaf and returns its handle.
    pub fn insert(&mut self, group: GroupNo, bbox: BoundingBox) -> LeafHandle {
        let root = match self.root {
            Some(r) => r,
            None => {
                let r = self.alloc_node(None, Kind::Leaves);
                self.root = Some(r);
                r
            }
        };

        let (handle, split) = self.insert_at(root, group, bbox);

        // Root was split, grow the tree by one level
        if let Some(sibling) = split {
            let new_root = self.alloc_node(None, Kind::Nodes);
            let mut bbox = self.nodes[root as usize].bbox;
            bbox.union(&self.nodes[sibling as usize].bbox);
            let node = &mut self.nodes[new_root as usize];
            node.children.push(root);
            node.children.push(sibling);
            node.bbox = bbox;
            self.nodes[root as usize].parent = Some(new_root);
            self.nodes[sibling as usize].parent = Some(new_root);
            self.root = Some(new_root);
        }

        self.len += 1;
        handle
    }

    fn insert_at(&mut self, node_id: u32, group: GroupNo, bbox: BoundingBox) -> (LeafHandle, Option<u32>) {
        if self.nodes[node_id as usize].kind == Kind::Leaves {
            let handle = self.alloc_leaf(group, bbox, node_id);
            let node = &mut self.nodes[node_id as usize];
            if node.children.len() < MAX_CHILDREN {
                node.children.push(handle.index);
                node.bbox.union(&bbox);
                return (handle, None);
            }
            let sibling = self.split(node_id, handle.index);
            return (handle, Some(sibling));
        }

        // Descend into the child whose box grows least
        let node = &self.nodes[node_id as usize];
        let mut best = node.children[0];
        let mut best_area = f64::MAX;
        for &child in &node.children {
            let area = self.nodes[child as usize].bbox.union_area(&bbox);
            if area < best_area {
                best_area = area;
                best = child;
            }
        }

        let (handle, split) = self.insert_at(best, group, bbox);
        match split {
            None => {
                self.nodes[node_id as usize].bbox.union(&bbox);
                (handle, None)
            }
            Some(new_child) => {
                let node = &mut self.nodes[node_id as usize];
                if node.children.len() < MAX_CHILDREN {
                    node.children.push(new_child);
                    node.bbox.union(&bbox);
                    self.nodes[new_child as usize].parent = Some(node_id);
                    (handle, None)
                } else {
                    let sibling = self.split(node_id, new_child);
                    (handle, Some(sibling))
                }
            }
        }
    }

    /// Splits a full node plus one extra child into two nodes (linear cost).
    ///
    /// The node keeps the child with the largest west edge, the new sibling takes
    /// the child with the smallest east edge, and the rest go where the union
    /// area is smaller.
    fn split(&mut self, node_id: u32, extra: u32) -> u32 {
        let kind = self.nodes[node_id as usize].kind;
        let parent = self.nodes[node_id as usize].parent;
        let mut candidates: Vec<u32> = std::mem::take(&mut self.nodes[node_id as usize].children);
        candidates.push(extra);
        let boxes: Vec<BoundingBox> = candidates.iter().map(|&c| self.child_box(kind, c)).collect();

        let mut idx_max = 0;
        let mut max_west = f64::MIN;
        for (i, b) in boxes.iter().enumerate() {
            if b.min_east > max_west {
                max_west = b.min_east;
                idx_max = i;
            }
        }
        let mut idx_min = if idx_max == 0 { 1 } else { 0 };
        let mut min_east = f64::MAX;
        for (i, b) in boxes.iter().enumerate() {
            if i != idx_max && b.max_east < min_east {
                min_east = b.max_east;
                idx_min = i;
            }
        }

        let sibling = self.alloc_node(parent, kind);

        self.nodes[node_id as usize].bbox = boxes[idx_max];
        self.nodes[node_id as usize].children.push(candidates[idx_max]);
        self.nodes[sibling as usize].bbox = boxes[idx_min];
        self.nodes[sibling as usize].children.push(candidates[idx_min]);
        self.set_parent(kind, candidates[idx_max], node_id);
        self.set_parent(kind, candidates[idx_min], sibling);

        for (i, (&child, b)) in candidates.iter().zip(boxes.iter()).enumerate() {
            if i == idx_max || i == idx_min {
                continue;
            }
            let target = if self.nodes[node_id as usize].bbox.union_area(b)
                < self.nodes[sibling as usize].bbox.union_area(b)
            {
                node_id
            } else {
                sibling
            };
            let node = &mut self.nodes[target as usize];
            node.children.push(child);
            node.bbox.union(b);
            self.set_parent(kind, child, target);
        }

        sibling
    }

    /// Removes a leaf. Returns its group, or `None` for a stale handle.
    pub fn remove(&mut self, handle: LeafHandle) -> Option<GroupNo> {
        let slot = self.leaves.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_leaves.push(handle.index);
        self.len -= 1;

        let mut node_id = entry.parent;
        self.nodes[node_id as usize].children.retain(|&c| c != handle.index);

        // Condense empty nodes and tighten boxes on the way up
        loop {
            let parent = self.nodes[node_id as usize].parent;
            if self.nodes[node_id as usize].children.is_empty() {
                self.free_node(node_id);
                match parent {
                    Some(p) => {
                        self.nodes[p as usize].children.retain(|&c| c != node_id);
                        node_id = p;
                        continue;
                    }
                    None => {
                        self.root = None;
                        break;
                    }
                }
            }
            self.recompute_box(node_id);
            match parent {
                Some(p) => node_id = p,
                None => break,
            }
        }

        Some(entry.group)
    }

    /// Lazily yields the groups whose boxes intersect `region`.
    ///
    /// Order is unspecified. Calling `query` again restarts the search.
    pub fn query(&self, region: BoundingBox) -> Query<'_> {
        Query {
            tree: self,
            region,
            nodes: self.root.into_iter().collect(),
            leaves: Vec::new(),
        }
    }

    /// Lazily yields the groups whose boxes contain the point.
    pub fn query_point(&self, east: f64, north: f64) -> Query<'_> {
        self.query(BoundingBox::new(east, north, east, north))
    }

    fn child_box(&self, kind: Kind, child: u32) -> BoundingBox {
        match kind {
            Kind::Nodes => self.nodes[child as usize].bbox,
            Kind::Leaves => self.leaves[child as usize]
                .entry
                .map(|e| e.bbox)
                .unwrap_or_else(BoundingBox::empty),
        }
    }

    fn set_parent(&mut self, kind: Kind, child: u32, parent: u32) {
        match kind {
            Kind::Nodes => self.nodes[child as usize].parent = Some(parent),
            Kind::Leaves => {
                if let Some(e) = self.leaves[child as usize].entry.as_mut() {
                    e.parent = parent;
                }
            }
        }
    }

    fn recompute_box(&mut self, node_id: u32) {
        let kind = self.nodes[node_id as usize].kind;
        let mut bbox = BoundingBox::empty();
        for &child in &self.nodes[node_id as usize].children {
            bbox.union(&self.child_box(kind, child));
        }
        self.nodes[node_id as usize].bbox = bbox;
    }

    fn alloc_node(&mut self, parent: Option<u32>, kind: Kind) -> u32 {
        let node = Node {
            parent,
            kind,
            bbox: BoundingBox::empty(),
            children: Vec::with_capacity(MAX_CHILDREN + 1),
        };
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn free_node(&mut self, node_id: u32) {
        self.nodes[node_id as usize].children.clear();
        self.free_nodes.push(node_id);
    }

    fn alloc_leaf(&mut self, group: GroupNo, bbox: BoundingBox, parent: u32) -> LeafHandle {
        let entry = Some(LeafEntry { group, bbox, parent });
        match self.free_leaves.pop() {
            Some(index) => {
                let slot = &mut self.leaves[index as usize];
                slot.entry = entry;
                LeafHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.leaves.push(LeafSlot {
                    generation: 0,
                    entry,
                });
                LeafHandle {
                    index: (self.leaves.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }
}

/// Lazy iterator over groups matching a region.
pub struct Query<'a> {
    tree: &'a GeoTree,
    region: BoundingBox,
    nodes: Vec<u32>,
    leaves: Vec<u32>,
}

impl Iterator for Query<'_> {
    type Item = GroupNo;

    fn next(&mut self) -> Option<GroupNo> {
        loop {
            if let Some(leaf) = self.leaves.pop() {
                if let Some(e) = &self.tree.leaves[leaf as usize].entry {
                    if e.bbox.intersects(&self.region) {
                        return Some(e.group);
                    }
                }
                continue;
            }

            let node_id = self.nodes.pop()?;
            let node = &self.tree.nodes[node_id as usize];
            if !node.bbox.intersects(&self.region) {
                continue;
            }
            match node.kind {
                Kind::Leaves => self.leaves.extend(node.children.iter().copied()),
                Kind::Nodes => self.nodes.extend(node.children.iter().copied()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::{HashMap, HashSet};

    fn sorted(q: Query<'_>) -> Vec<GroupNo> {
        let mut v: Vec<GroupNo> = q.collect();
        v.sort_unstable();
        v
    }

    /// Checks parent links, fan-out and box coverage of every reachable node.
    fn check_invariants(tree: &GeoTree) {
        let Some(root) = tree.root else {
            assert_eq!(tree.len(), 0);
            return;
        };
        assert!(tree.nodes[root as usize].parent.is_none());
        let mut stack = vec![root];
        let mut leaves = 0;
        while let Some(id) = stack.pop() {
            let node = &tree.nodes[id as usize];
            assert!(!node.children.is_empty());
            assert!(node.children.len() <= MAX_CHILDREN);
            for &c in &node.children {
                let cb = tree.child_box(node.kind, c);
                let mut covered = node.bbox;
                covered.union(&cb);
                assert_eq!(covered, node.bbox, "node box must cover children");
                match node.kind {
                    Kind::Nodes => {
                        assert_eq!(tree.nodes[c as usize].parent, Some(id));
                        stack.push(c);
                    }
                    Kind::Leaves => {
                        let e = tree.leaves[c as usize].entry.unwrap();
                        assert_eq!(e.parent, id);
                        leaves += 1;
                    }
                }
            }
        }
        assert_eq!(leaves, tree.len());
    }

    #[test]
    fn test_query_overlap_and_disjoint() {
        let mut tree = GeoTree::new();
        tree.insert(7, BoundingBox::new(0.0, 0.0, 10.0, 10.0));

        assert_eq!(sorted(tree.query(BoundingBox::new(5.0, 5.0, 15.0, 15.0))), vec![7]);
        assert!(sorted(tree.query(BoundingBox::new(20.0, 20.0, 30.0, 30.0))).is_empty());
    }

    #[test]
    fn test_query_point() {
        let mut tree = GeoTree::new();
        tree.insert(1, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        tree.insert(2, BoundingBox::new(8.0, 8.0, 20.0, 20.0));
        assert_eq!(sorted(tree.query_point(9.0, 9.0)), vec![1, 2]);
        assert_eq!(sorted(tree.query_point(1.0, 1.0)), vec![1]);
        assert!(sorted(tree.query_point(-1.0, 1.0)).is_empty());
    }

    #[test]
    fn test_query_is_restartable() {
        let mut tree = GeoTree::new();
        for g in 0..10 {
            let x = g as f64 * 10.0;
            tree.insert(g, BoundingBox::new(x, 0.0, x + 5.0, 5.0));
        }
        let region = BoundingBox::new(0.0, 0.0, 100.0, 10.0);
        let mut first = tree.query(region);
        assert!(first.next().is_some());
        assert_eq!(sorted(tree.query(region)).len(), 10);
    }

    #[test]
    fn test_split_grows_tree() {
        let mut tree = GeoTree::new();
        for g in 0..50 {
            let x = (g % 7) as f64 * 13.0;
            let y = (g / 7) as f64 * 11.0;
            tree.insert(g, BoundingBox::new(x, y, x + 4.0, y + 4.0));
            check_invariants(&tree);
        }
        assert_eq!(tree.len(), 50);
        let all = sorted(tree.query(tree.bounds().unwrap()));
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_and_stale_handle() {
        let mut tree = GeoTree::new();
        let a = tree.insert(1, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        let b = tree.insert(2, BoundingBox::new(5.0, 5.0, 6.0, 6.0));

        assert_eq!(tree.remove(a), Some(1));
        assert_eq!(tree.remove(a), None);
        assert_eq!(tree.get(a), None);
        assert_eq!(tree.get(b), Some((2, BoundingBox::new(5.0, 5.0, 6.0, 6.0))));

        // Slot reuse must not revive the old handle
        let c = tree.insert(3, BoundingBox::new(2.0, 2.0, 3.0, 3.0));
        assert_ne!(a, c);
        assert_eq!(tree.get(a), None);
        assert_eq!(tree.len(), 2);
        check_invariants(&tree);
    }

    #[test]
    fn test_remove_all_empties_tree() {
        let mut tree = GeoTree::new();
        let handles: Vec<_> = (0..20)
            .map(|g| {
                let x = g as f64;
                tree.insert(g, BoundingBox::new(x, x, x + 1.0, x + 1.0))
            })
            .collect();
        for h in handles {
            assert!(tree.remove(h).is_some());
            check_invariants(&tree);
        }
        assert!(tree.is_empty());
        assert!(tree.bounds().is_none());
        assert_eq!(tree.query(BoundingBox::new(-1e9, -1e9, 1e9, 1e9)).count(), 0);
    }

    #[test]
    fn test_remove_tightens_bounds() {
        let mut tree = GeoTree::new();
        tree.insert(1, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        let far = tree.insert(2, BoundingBox::new(100.0, 100.0, 101.0, 101.0));
        tree.remove(far);
        assert_eq!(tree.bounds(), Some(BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_random_against_brute_force() {
        let mut rng = rand::rng();
        let mut tree = GeoTree::new();
        let mut live: HashMap<GroupNo, (LeafHandle, BoundingBox)> = HashMap::new();

        for g in 0..400u32 {
            let x = rng.random_range(0.0..1000.0);
            let y = rng.random_range(0.0..1000.0);
            let w = rng.random_range(0.0..40.0);
            let h = rng.random_range(0.0..40.0);
            let b = BoundingBox::new(x, y, x + w, y + h);
            live.insert(g, (tree.insert(g, b), b));

            // Remove roughly one in four
            if rng.random_range(0..4) == 0 {
                let victim = *live.keys().next().unwrap();
                let (handle, _) = live.remove(&victim).unwrap();
                assert_eq!(tree.remove(handle), Some(victim));
            }
        }
        check_invariants(&tree);

        for _ in 0..50 {
            let x = rng.random_range(0.0..1000.0);
            let y = rng.random_range(0.0..1000.0);
            let region = BoundingBox::new(x, y, x + 100.0, y + 100.0);
            let expected: HashSet<GroupNo> = live
                .iter()
                .filter(|(_, (_, b))| b.intersects(&region))
                .map(|(g, _)| *g)
                .collect();
            let found: HashSet<GroupNo> = tree.query(region).collect();
            assert_eq!(found, expected);
        }
    }
}
