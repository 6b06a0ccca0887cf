//! The two-level octree index.
//!
//! A single flat array of nodes represents the *coarse* octree, whose
//! leaves are pages; callers needing the *fine* in-page octree build a
//! second, page-local [Octree] with `only_to_leaves = true` over just that
//! page's points (see [crate::page]).
//!
//! Nodes reference each other purely by index, parent-to-child: there are
//! no back-pointers from child to parent beyond the single `parent` field,
//! and no interior mutability. This mirrors the pure-DAG, array-of-structs
//! layout of a compiled index sidecar (see [crate::octree::sidecar]) much
//! more directly than a pointer-tree would, since the two are meant to be
//! the same bits on disk and in memory.

pub mod sidecar;

use crate::error::{CoreError, RangeError};
use crate::geometry::bounding_box::{Aabb, OptionAabb};
use nalgebra::Point3;
use std::collections::HashMap;
use std::num::NonZeroU32;

/// 1-based index of a node within an [Octree]'s flat node array. `NodeId`s
/// are only ever compared for equality or used to index back into the
/// octree they came from; they carry no meaning on their own.
pub type NodeId = NonZeroU32;

fn idx(id: NodeId) -> usize {
    (id.get() - 1) as usize
}

/// Which octant (0-7) of a box a child occupies. Bit 0 is the x half, bit
/// 1 the y half, bit 2 the z half; 0 = the low half, 1 = the high half.
pub type Octant = u8;

#[derive(Debug, Clone)]
pub struct OctreeNode {
    pub parent: Option<NodeId>,
    pub children: [Option<NodeId>; 8],
    /// Number of points directly owned by this node (not including
    /// descendants), after [Octree::insert] has counted them. Once
    /// [Octree::build_end] has run this instead holds the number of
    /// points in this node's contiguous range of the page-ordered
    /// storage - for an inner node in leaf-only mode that is the sum of
    /// all of its descendants' points.
    pub size: u64,
    /// Byte/point offset of this node's first point within the
    /// page-ordered storage, assigned by [Octree::build_end].
    pub from: u64,
    /// Reserved sidecar field, always zero. The builder used to persist
    /// each page's fine, in-page octree here as a separate sidecar chunk
    /// and record its byte offset in this field; nothing ever read that
    /// chunk back, so the builder now keeps the fine octree in memory
    /// only (for point reordering) and never writes it out. Kept as a
    /// field rather than removed so the sidecar node record's on-disk
    /// layout does not change.
    pub offset: u64,
}

/// A three-valued classification of how a query region relates to a
/// node's box, used to prune the recursive selection in [Octree::select_leaves]
/// and [Octree::select_nodes].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Partial,
    Full,
}

/// Something that can classify an axis-aligned box against a query
/// region. Implemented once per region shape (box, cone, cylinder,
/// sphere) in [crate::query]; the octree itself has no notion of which
/// shape it is being queried with.
pub trait Region {
    fn test(&self, b: &Aabb) -> Containment;
}

pub struct Octree {
    nodes: Vec<OctreeNode>,
    root_box: Aabb,
    points_box: OptionAabb,
    max_size: u64,
    max_level: u32,
    only_to_leaves: bool,
}

/// Maximum coarse-index depth, matching the depth at which a 32-bit
/// Morton-style path code still fits comfortably in the octant-code
/// bookkeeping [Octree::node_box] performs.
pub const OCTREE_MAX_LEVEL: u32 = 17;

impl Octree {
    /// Begins building a new octree over `root_box`. `only_to_leaves`
    /// forces every inserted point all the way down to `max_level`,
    /// ignoring `max_size` (matching the fine, in-page octree's
    /// leaf-only construction); otherwise points settle at the first
    /// node along their descent whose size does not exceed `max_size`.
    pub fn build_begin(root_box: Aabb, max_size: u64, max_level: u32, only_to_leaves: bool) -> Self {
        let max_level = max_level.min(OCTREE_MAX_LEVEL);
        let root = OctreeNode {
            parent: None,
            children: [None; 8],
            size: 0,
            from: 0,
            offset: 0,
        };
        Octree {
            nodes: vec![root],
            root_box,
            points_box: OptionAabb::empty(),
            max_size: if only_to_leaves { 0 } else { max_size },
            max_level,
            only_to_leaves,
        }
    }

    /// Reconstructs an already-compiled octree from its flat node array,
    /// as loaded back from a sidecar (see [crate::octree::sidecar]). The
    /// result has no growth budget left: further [Octree::insert] calls
    /// would treat every node as already full.
    pub fn from_parts(nodes: Vec<OctreeNode>, root_box: Aabb, points_box: OptionAabb) -> Self {
        Octree {
            nodes,
            root_box,
            points_box,
            max_size: 0,
            max_level: OCTREE_MAX_LEVEL,
            only_to_leaves: true,
        }
    }

    pub fn root_id(&self) -> NodeId {
        NonZeroU32::new(1).unwrap()
    }

    pub fn root_box(&self) -> Aabb {
        self.root_box
    }

    pub fn points_box(&self) -> OptionAabb {
        self.points_box
    }

    pub fn node(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[idx(id)]
    }

    /// All leaves (nodes with no children), in node-array order.
    pub fn leaves(&self) -> Vec<NodeId> {
        (1..=self.nodes.len())
            .map(|i| NonZeroU32::new(i as u32).unwrap())
            .filter(|&id| self.nodes[idx(id)].children.iter().all(|c| c.is_none()))
            .collect()
    }

    /// Every node that directly owns at least one point once `max_size`
    /// has stopped it from growing further - the complete set of
    /// storage units a builder's `NODE_INSERT` phase must visit and a
    /// query's page selection must enumerate. A general (non-leaf-only)
    /// build lets an inner node retain up to `max_size` points of its
    /// own before subsequent inserts cascade into its children (see
    /// [Octree::insert]); `leaves()` alone would silently miss those, so
    /// this is the right traversal for the *coarse* index's "pages",
    /// which are not always true leaves.
    ///
    /// Only meaningful on a general, breadth-first-compiled octree
    /// (`only_to_leaves = false` at `build_begin`): on a leaf-only tree,
    /// `build_end` sums child sizes up into every ancestor, so every
    /// node would show `size > 0` even though only the true leaves own
    /// points directly.
    pub fn pages(&self) -> Vec<NodeId> {
        (1..=self.nodes.len())
            .map(|i| NonZeroU32::new(i as u32).unwrap())
            .filter(|&id| self.nodes[idx(id)].size > 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ensure_child(&mut self, parent: NodeId, octant: Octant) -> NodeId {
        if let Some(existing) = self.nodes[idx(parent)].children[octant as usize] {
            return existing;
        }
        self.nodes.push(OctreeNode {
            parent: Some(parent),
            children: [None; 8],
            size: 0,
            from: 0,
            offset: 0,
        });
        let new_id = NonZeroU32::new(self.nodes.len() as u32).unwrap();
        self.nodes[idx(parent)].children[octant as usize] = Some(new_id);
        new_id
    }

    /// Inserts one point, descending the tree according to `max_size`/
    /// `max_level`/`only_to_leaves`, and returns the node it settled at.
    pub fn insert(&mut self, point: Point3<f64>) -> NodeId {
        self.points_box.extend(&point);

        let mut current = self.root_id();
        let mut node_box = self.root_box;
        let mut level = 0u32;
        loop {
            let at_max_level = level >= self.max_level;
            let full = !self.only_to_leaves && self.nodes[idx(current)].size >= self.max_size;
            if at_max_level || !full {
                self.nodes[idx(current)].size += 1;
                return current;
            }
            let octant = divide(&node_box, &point);
            let child = self.ensure_child(current, octant);
            node_box = child_box(&node_box, octant);
            current = child;
            level += 1;
        }
    }

    /// Compiles the per-node `from` ranges once every point has been
    /// inserted, and returns the total number of points stored.
    ///
    /// In general (non-leaf-only) mode, each node's range only covers the
    /// points that settled directly at it, assigned breadth-first so that
    /// a whole level's nodes occupy a contiguous block of ranges. In
    /// leaf-only mode every point lives at a leaf, so node ranges are
    /// assigned depth-first and inner node sizes become the sum of their
    /// children's sizes, so that each subtree still maps to one
    /// contiguous range.
    pub fn build_end(&mut self) -> u64 {
        if self.only_to_leaves {
            self.compile_depth_first(self.root_id(), 0)
        } else {
            self.compile_breadth_first()
        }
    }

    fn compile_breadth_first(&mut self) -> u64 {
        let mut offset = 0u64;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.root_id());
        while let Some(id) = queue.pop_front() {
            self.nodes[idx(id)].from = offset;
            offset += self.nodes[idx(id)].size;
            for child in self.nodes[idx(id)].children {
                if let Some(child) = child {
                    queue.push_back(child);
                }
            }
        }
        offset
    }

    fn compile_depth_first(&mut self, id: NodeId, offset: u64) -> u64 {
        let children = self.nodes[idx(id)].children;
        let has_children = children.iter().any(|c| c.is_some());
        if !has_children {
            self.nodes[idx(id)].from = offset;
            return offset + self.nodes[idx(id)].size;
        }
        let mut cursor = offset;
        for child in children.into_iter().flatten() {
            cursor = self.compile_depth_first(child, cursor);
        }
        self.nodes[idx(id)].from = offset;
        self.nodes[idx(id)].size = cursor - offset;
        cursor
    }

    /// Reconstructs the box of `id` by walking up to the root to collect
    /// its octant path, then re-descending, halving `root_box` once per
    /// level. Nodes carry no box of their own - this keeps the on-disk
    /// and in-memory representations a pure parent-linked DAG.
    pub fn node_box(&self, id: NodeId) -> Aabb {
        let mut path = Vec::new();
        let mut current = id;
        while let Some(parent) = self.nodes[idx(current)].parent {
            let octant = self.nodes[idx(parent)]
                .children
                .iter()
                .position(|c| *c == Some(current))
                .expect("child must be registered with its parent") as Octant;
            path.push(octant);
            current = parent;
        }
        path.reverse();

        let mut b = self.root_box;
        for octant in path {
            b = child_box(&b, octant);
        }
        b
    }

    /// Selects the leaves (nodes with no children) that overlap `region`,
    /// along with whether each leaf lies fully inside it or only
    /// partially.
    pub fn select_leaves<R: Region>(&self, region: &R) -> Vec<(NodeId, Containment)> {
        let mut out = Vec::new();
        self.select_leaves_rec(self.root_id(), self.root_box, region, &mut out);
        out
    }

    fn select_leaves_rec<R: Region>(
        &self,
        id: NodeId,
        b: Aabb,
        region: &R,
        out: &mut Vec<(NodeId, Containment)>,
    ) {
        let containment = region.test(&b);
        if containment == Containment::Outside {
            return;
        }
        let node = &self.nodes[idx(id)];
        let has_children = node.children.iter().any(|c| c.is_some());
        if !has_children {
            out.push((id, containment));
            return;
        }
        for (octant, child) in node.children.iter().enumerate() {
            if let Some(child) = child {
                self.select_leaves_rec(*child, child_box(&b, octant as Octant), region, out);
            }
        }
    }

    /// Selects every node that both overlaps `region` and directly owns
    /// at least one point (see [Octree::pages]), recursing into children
    /// regardless so a page-bearing inner node never hides page-bearing
    /// descendants. This is the traversal query selection uses over the
    /// coarse index in place of [Octree::select_leaves], since a page is
    /// any node with points of its own, not only a true leaf.
    pub fn select_pages<R: Region>(&self, region: &R) -> Vec<(NodeId, Containment)> {
        let mut out = Vec::new();
        self.select_pages_rec(self.root_id(), self.root_box, region, &mut out);
        out
    }

    fn select_pages_rec<R: Region>(
        &self,
        id: NodeId,
        b: Aabb,
        region: &R,
        out: &mut Vec<(NodeId, Containment)>,
    ) {
        let containment = region.test(&b);
        if containment == Containment::Outside {
            return;
        }
        let node = &self.nodes[idx(id)];
        if node.size > 0 {
            out.push((id, containment));
        }
        for (octant, child) in node.children.iter().enumerate() {
            if let Some(child) = child {
                self.select_pages_rec(*child, child_box(&b, octant as Octant), region, out);
            }
        }
    }

    /// Selects every node (inner and leaf) that overlaps `region`,
    /// used to order/prioritize pages by a camera rather than simply
    /// enumerate matches.
    pub fn select_nodes<R: Region>(&self, region: &R) -> Vec<(NodeId, Containment)> {
        let mut out = Vec::new();
        self.select_nodes_rec(self.root_id(), self.root_box, region, &mut out);
        out
    }

    fn select_nodes_rec<R: Region>(
        &self,
        id: NodeId,
        b: Aabb,
        region: &R,
        out: &mut Vec<(NodeId, Containment)>,
    ) {
        let containment = region.test(&b);
        if containment == Containment::Outside {
            return;
        }
        out.push((id, containment));
        let node = &self.nodes[idx(id)];
        for (octant, child) in node.children.iter().enumerate() {
            if let Some(child) = child {
                self.select_nodes_rec(*child, child_box(&b, octant as Octant), region, out);
            }
        }
    }

    /// Plain descent to the leaf that would contain `point`, ignoring
    /// capacity - used to look up which page a single point belongs to.
    pub fn select_leaf(&self, point: &Point3<f64>) -> NodeId {
        let mut current = self.root_id();
        let mut b = self.root_box;
        loop {
            let node = &self.nodes[idx(current)];
            let has_children = node.children.iter().any(|c| c.is_some());
            if !has_children {
                return current;
            }
            let octant = divide(&b, point);
            match node.children[octant as usize] {
                Some(child) => {
                    current = child;
                    b = child_box(&b, octant);
                }
                None => return current,
            }
        }
    }

    /// Re-derives, for a point already counted during [Octree::insert],
    /// which node it should be written into during the sorting pass: the
    /// same first-fit-by-capacity descent `insert` performed, but reading
    /// capacity from an external `used` counter instead of mutating node
    /// sizes (which by this point already hold their final totals).
    pub fn select_node_with_used(
        &self,
        used: &mut HashMap<NodeId, u64>,
        point: &Point3<f64>,
    ) -> NodeId {
        let mut current = self.root_id();
        let mut b = self.root_box;
        let mut level = 0u32;
        loop {
            let at_max_level = level >= self.max_level;
            let consumed = *used.get(&current).unwrap_or(&0);
            let full = !self.only_to_leaves && consumed >= self.max_size;
            if at_max_level || !full {
                *used.entry(current).or_insert(0) += 1;
                return current;
            }
            let octant = divide(&b, point);
            let node = &self.nodes[idx(current)];
            match node.children[octant as usize] {
                Some(child) => {
                    current = child;
                    b = child_box(&b, octant);
                }
                None => {
                    *used.entry(current).or_insert(0) += 1;
                    return current;
                }
            }
            level += 1;
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.nodes.len() > u32::MAX as usize {
            return Err(RangeError {
                what: "octree node count",
                got: self.nodes.len() as i64,
                valid_min: 0,
                valid_max: u32::MAX as i64,
            }
            .into());
        }
        Ok(())
    }
}

/// Which octant of `b` contains `point`, halving along every axis. Ties
/// (the point lies exactly on the splitting plane) go to the low half,
/// matching `coord > center` (strictly greater) routing to the high half.
pub fn divide(b: &Aabb, point: &Point3<f64>) -> Octant {
    let c = b.center();
    let mut code = 0u8;
    if point.x > c.x {
        code |= 0b001;
    }
    if point.y > c.y {
        code |= 0b010;
    }
    if point.z > c.z {
        code |= 0b100;
    }
    code
}

/// The box of the given octant of `b`.
pub fn child_box(b: &Aabb, octant: Octant) -> Aabb {
    let min = b.min();
    let max = b.max();
    let c = b.center();
    let (x0, x1) = if octant & 0b001 != 0 { (c.x, max.x) } else { (min.x, c.x) };
    let (y0, y1) = if octant & 0b010 != 0 { (c.y, max.y) } else { (min.y, c.y) };
    let (z0, z1) = if octant & 0b100 != 0 { (c.z, max.z) } else { (min.z, c.z) };
    Aabb::new(Point3::new(x0, y0, z0), Point3::new(x1, y1, z1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb {
        Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(8.0, 8.0, 8.0))
    }

    #[test]
    fn insert_grows_tree_once_over_capacity() {
        let mut tree = Octree::build_begin(unit_box(), 2, 8, false);
        for _ in 0..5 {
            tree.insert(Point3::new(1.0, 1.0, 1.0));
        }
        // with max_size=2, the root should have overflowed into a child.
        assert!(tree.len() > 1);
    }

    #[test]
    fn leaf_only_mode_always_descends_to_max_level() {
        let mut tree = Octree::build_begin(unit_box(), 1000, 2, true);
        let leaf = tree.insert(Point3::new(1.0, 1.0, 1.0));
        assert_eq!(tree.node_box(leaf).length(0), 2.0);
    }

    #[test]
    fn node_box_round_trips_through_parent_walk() {
        let mut tree = Octree::build_begin(unit_box(), 0, 3, true);
        let leaf = tree.insert(Point3::new(7.5, 0.5, 0.5));
        let b = tree.node_box(leaf);
        assert!(b.contains(&Point3::new(7.5, 0.5, 0.5)));
        assert!(!b.contains(&Point3::new(0.5, 0.5, 0.5)));
    }

    struct BoxRegion(Aabb);
    impl Region for BoxRegion {
        fn test(&self, b: &Aabb) -> Containment {
            if !self.0.intersects(b) {
                Containment::Outside
            } else if b.inside(&self.0) {
                Containment::Full
            } else {
                Containment::Partial
            }
        }
    }

    #[test]
    fn pages_includes_inner_nodes_that_own_points_directly() {
        // max_size=1 forces the root to close to new points after its
        // first insert, but it keeps that first point itself - every
        // later insert cascades into a child instead.
        let mut tree = Octree::build_begin(unit_box(), 1, 8, false);
        let root = tree.insert(Point3::new(1.0, 1.0, 1.0));
        assert_eq!(root, tree.root_id());
        tree.insert(Point3::new(7.0, 7.0, 7.0));
        tree.insert(Point3::new(7.0, 7.0, 7.0));
        tree.build_end();

        let pages = tree.pages();
        assert!(pages.contains(&tree.root_id()), "root kept a point of its own and must count as a page");
        assert!(pages.len() > 1, "the cascaded points must also land at their own pages");
    }

    #[test]
    fn select_pages_finds_points_select_leaves_would_miss() {
        let mut tree = Octree::build_begin(unit_box(), 1, 8, false);
        tree.insert(Point3::new(1.0, 1.0, 1.0));
        tree.insert(Point3::new(7.0, 7.0, 7.0));
        tree.insert(Point3::new(7.0, 7.0, 7.0));
        tree.build_end();

        let region = BoxRegion(unit_box());
        let via_leaves = tree.select_leaves(&region);
        let via_pages = tree.select_pages(&region);
        assert!(
            via_pages.len() > via_leaves.len(),
            "select_leaves must undercount once an inner node owns points directly"
        );
        assert!(via_pages.iter().any(|(id, _)| *id == tree.root_id()));
    }

    #[test]
    fn select_leaves_prunes_disjoint_subtrees() {
        let mut tree = Octree::build_begin(unit_box(), 1, 8, false);
        tree.insert(Point3::new(1.0, 1.0, 1.0));
        tree.insert(Point3::new(7.0, 7.0, 7.0));
        tree.insert(Point3::new(7.0, 7.0, 7.0));
        let region = BoxRegion(Aabb::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 4.0, 4.0),
        ));
        let selected = tree.select_leaves(&region);
        assert!(!selected.is_empty());
        for (id, _) in &selected {
            assert!(region.0.intersects(&tree.node_box(*id)));
        }
    }
}
