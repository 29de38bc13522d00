//! The "SPACE" Engine - fixed-depth octree over a cubic world
//!
//! The world is the cube `[0, 2^world_bits)^3`. Each level of the octree
//! halves every axis; the octant index at a level packs one bit of each
//! axis as `x y z` (x most significant), so the path of a position is just
//! its interleaved high-order coordinate bits:
//!
//! ```text
//! x = 0b1010..., y = 0b0110..., z = 0b0011...
//! level 0: x1 y0 z0 -> 4
//! level 1: x0 y1 z0 -> 2
//! level 2: x1 y1 z1 -> 7
//! ```
//!
//! Leaves (depth == octree depth) own a [`NameSet`]; internal nodes compute
//! their membership on demand from the leaves below them.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::entity::EntityName;
use crate::error::SpaceError;
use crate::name_set::NameSet;

/// Default octree depth (leaf edge = 512 in a 65536 world).
pub const DEFAULT_DEPTH: usize = 7;

/// Default world extent exponent.
pub const DEFAULT_WORLD_BITS: u32 = 16;

// ============================================================================
// REGION PATHS
// ============================================================================

/// Sequence of octant indices from the root.
///
/// Textual form joins the digits with `/` (`"2/4/1"`); the root is the empty
/// string. Parsing ignores leading/trailing separators and a leading `-1`
/// root marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RegionPath(Vec<u8>);

impl RegionPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }
    
    /// Builds a path, rejecting digits above 7.
    pub fn new(digits: Vec<u8>) -> Result<Self, SpaceError> {
        if let Some(bad) = digits.iter().find(|&&d| d > 7) {
            return Err(SpaceError::InvalidPath(format!("octant index {}", bad)));
        }
        Ok(Self(digits))
    }
    
    pub fn digits(&self) -> &[u8] {
        &self.0
    }
    
    pub fn depth(&self) -> usize {
        self.0.len()
    }
    
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
    
    pub fn parent(&self) -> Option<RegionPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }
    
    /// The ancestor `levels` above this node, stopping at the root.
    pub fn ancestor(&self, levels: usize) -> RegionPath {
        Self(self.0[..self.0.len().saturating_sub(levels)].to_vec())
    }
    
    pub fn child(&self, index: u8) -> Result<RegionPath, SpaceError> {
        let mut digits = self.0.clone();
        digits.push(index);
        Self::new(digits)
    }
    
    /// True if `self` is `other` or lies above it.
    pub fn contains(&self, other: &RegionPath) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for RegionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

impl FromStr for RegionPath {
    type Err = SpaceError;
    
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digits = Vec::new();
        for (i, segment) in s.split('/').filter(|seg| !seg.is_empty()).enumerate() {
            if i == 0 && segment == "-1" {
                continue;
            }
            let digit: u8 = segment
                .parse()
                .map_err(|_| SpaceError::InvalidPath(s.to_string()))?;
            digits.push(digit);
        }
        Self::new(digits).map_err(|_| SpaceError::InvalidPath(s.to_string()))
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Axis-aligned cube covered by a region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    /// Minimum corner (inclusive)
    pub min: Vector3<f32>,
    
    /// Edge length
    pub size: f32,
}

impl Region {
    /// Half-open containment: `min <= p < min + size` on every axis.
    pub fn contains(&self, p: &Vector3<f32>) -> bool {
        (0..3).all(|axis| p[axis] >= self.min[axis] && p[axis] < self.min[axis] + self.size)
    }
    
    pub fn center(&self) -> Vector3<f32> {
        self.min.add_scalar(self.size / 2.0)
    }
}

/// Mapping between world coordinates and region paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldGeometry {
    depth: usize,
    world_bits: u32,
}

impl WorldGeometry {
    /// `depth` levels over a world of `2^world_bits` per axis.
    ///
    /// World bits are capped at 24 so every integer coordinate is exact in `f32`.
    pub fn new(depth: usize, world_bits: u32) -> Result<Self, SpaceError> {
        if depth == 0 || world_bits > 24 || depth as u32 > world_bits {
            return Err(SpaceError::InvalidGeometry { depth, world_bits });
        }
        Ok(Self { depth, world_bits })
    }
    
    pub fn depth(&self) -> usize {
        self.depth
    }
    
    /// World edge length.
    pub fn extent(&self) -> f32 {
        (1u32 << self.world_bits) as f32
    }
    
    /// Edge length of a leaf cell.
    pub fn leaf_size(&self) -> f32 {
        (1u32 << (self.world_bits - self.depth as u32)) as f32
    }
    
    pub fn in_world(&self, p: &Vector3<f32>) -> bool {
        let extent = self.extent();
        // NaN fails both comparisons
        p.iter().all(|&v| v >= 0.0 && v < extent)
    }
    
    /// Leaf path containing `p`. Coordinates are truncated to integers.
    pub fn octant_for_position(&self, p: &Vector3<f32>) -> Result<RegionPath, SpaceError> {
        if !self.in_world(p) {
            return Err(SpaceError::OutOfWorld { x: p.x, y: p.y, z: p.z });
        }
        let (x, y, z) = (p.x as u32, p.y as u32, p.z as u32);
        let digits = (0..self.depth)
            .map(|level| {
                let shift = self.world_bits - 1 - level as u32;
                let bit = |v: u32| ((v >> shift) & 1) as u8;
                (bit(x) << 2) | (bit(y) << 1) | bit(z)
            })
            .collect();
        Ok(RegionPath(digits))
    }
    
    /// Cube covered by `path` (any depth up to the octree depth).
    pub fn region_for_path(&self, path: &RegionPath) -> Result<Region, SpaceError> {
        if path.depth() > self.depth {
            return Err(SpaceError::TooDeep { depth: path.depth(), max: self.depth });
        }
        let (mut x, mut y, mut z) = (0u32, 0u32, 0u32);
        for &d in path.digits() {
            x = (x << 1) | ((d >> 2) & 1) as u32;
            y = (y << 1) | ((d >> 1) & 1) as u32;
            z = (z << 1) | (d & 1) as u32;
        }
        let size = 1u32 << (self.world_bits - path.depth() as u32);
        Ok(Region {
            min: Vector3::new((x * size) as f32, (y * size) as f32, (z * size) as f32),
            size: size as f32,
        })
    }
}

impl Default for WorldGeometry {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            world_bits: DEFAULT_WORLD_BITS,
        }
    }
}

// ============================================================================
// OCTREE
// ============================================================================

/// A node of the octree.
#[derive(Debug, Clone)]
pub struct Octant {
    /// Position among siblings (0-7); 0 for the root
    index: u8,
    
    /// Distance from the root
    depth: usize,
    
    /// Existing children, sorted by index
    children: Vec<Octant>,
    
    /// Membership (meaningful on leaves only)
    names: NameSet,
    
    /// A subscription toward this region is active
    tracked: bool,
}

impl Octant {
    fn new(index: u8, depth: usize) -> Self {
        Self {
            index,
            depth,
            children: Vec::new(),
            names: NameSet::new(),
            tracked: false,
        }
    }
    
    pub fn index(&self) -> u8 {
        self.index
    }
    
    pub fn depth(&self) -> usize {
        self.depth
    }
    
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }
    
    pub fn names(&self) -> &NameSet {
        &self.names
    }
    
    pub fn children(&self) -> &[Octant] {
        &self.children
    }
    
    fn child(&self, index: u8) -> Option<&Octant> {
        self.children
            .binary_search_by_key(&index, |c| c.index)
            .ok()
            .map(|pos| &self.children[pos])
    }
    
    fn child_mut(&mut self, index: u8) -> Option<&mut Octant> {
        match self.children.binary_search_by_key(&index, |c| c.index) {
            Ok(pos) => Some(&mut self.children[pos]),
            Err(_) => None,
        }
    }
    
    fn child_or_insert(&mut self, index: u8) -> &mut Octant {
        let pos = match self.children.binary_search_by_key(&index, |c| c.index) {
            Ok(pos) => pos,
            Err(pos) => {
                self.children.insert(pos, Octant::new(index, self.depth + 1));
                pos
            }
        };
        &mut self.children[pos]
    }
}

/// Sparse octree of regions this peer cares about.
#[derive(Debug, Clone)]
pub struct Octree {
    geometry: WorldGeometry,
    root: Octant,
}

impl Octree {
    pub fn new(geometry: WorldGeometry) -> Self {
        Self {
            geometry,
            root: Octant::new(0, 0),
        }
    }
    
    pub fn geometry(&self) -> &WorldGeometry {
        &self.geometry
    }
    
    /// True if `path` addresses a leaf.
    pub fn is_leaf_path(&self, path: &RegionPath) -> bool {
        path.depth() == self.geometry.depth()
    }
    
    /// Finds the node at `path`, if it exists.
    pub fn lookup(&self, path: &RegionPath) -> Option<&Octant> {
        let mut node = &self.root;
        for &d in path.digits() {
            node = node.child(d)?;
        }
        Some(node)
    }
    
    fn lookup_mut(&mut self, path: &RegionPath) -> Option<&mut Octant> {
        let mut node = &mut self.root;
        for &d in path.digits() {
            node = node.child_mut(d)?;
        }
        Some(node)
    }
    
    /// Returns the node at `path`, creating missing nodes on the way.
    pub fn insert(&mut self, path: &RegionPath) -> Result<&mut Octant, SpaceError> {
        if path.depth() > self.geometry.depth() {
            return Err(SpaceError::TooDeep {
                depth: path.depth(),
                max: self.geometry.depth(),
            });
        }
        let mut node = &mut self.root;
        for &d in path.digits() {
            node = node.child_or_insert(d);
        }
        Ok(node)
    }
    
    /// Union of every leaf NameSet under `path`, breadth first.
    ///
    /// Returned set has a fresh digest.
    pub fn aggregate_names(&self, path: &RegionPath) -> Option<NameSet> {
        let start = self.lookup(path)?;
        let leaf_depth = self.geometry.depth();
        let mut result = NameSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if node.depth == leaf_depth {
                result.extend_from(&node.names);
            } else {
                queue.extend(node.children.iter());
            }
        }
        result.refresh_digest();
        Some(result)
    }
    
    /// Leaf: cached digest. Internal: digest of the aggregate.
    pub fn digest(&self, path: &RegionPath) -> Option<u32> {
        if self.is_leaf_path(path) {
            self.lookup(path).map(|leaf| leaf.names.digest())
        } else {
            self.aggregate_names(path).map(|names| names.digest())
        }
    }
    
    /// Marks `path` tracked, creating it if needed.
    pub fn track(&mut self, path: &RegionPath) -> Result<(), SpaceError> {
        self.insert(path)?.tracked = true;
        Ok(())
    }
    
    /// Clears the tracked flag. Returns true if it was set.
    pub fn untrack(&mut self, path: &RegionPath) -> bool {
        match self.lookup_mut(path) {
            Some(node) => std::mem::replace(&mut node.tracked, false),
            None => false,
        }
    }
    
    pub fn is_tracked(&self, path: &RegionPath) -> bool {
        self.lookup(path).map_or(false, Octant::is_tracked)
    }
    
    /// True if `path` or any node below it is tracked.
    pub fn has_tracked_descendants(&self, path: &RegionPath) -> bool {
        let Some(start) = self.lookup(path) else {
            return false;
        };
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node.tracked {
                return true;
            }
            stack.extend(node.children.iter());
        }
        false
    }
    
    /// Adds `name` to the leaf at `path` and refreshes its digest.
    pub fn add_name(&mut self, path: &RegionPath, name: EntityName) -> Result<bool, SpaceError> {
        if !self.is_leaf_path(path) {
            return Err(SpaceError::InvalidPath(format!("{} is not a leaf", path)));
        }
        let leaf = self.insert(path)?;
        let inserted = leaf.names.insert(name);
        leaf.names.refresh_digest();
        Ok(inserted)
    }
    
    /// Removes `name` from the leaf at `path` and refreshes its digest.
    pub fn remove_name(&mut self, path: &RegionPath, name: &EntityName) -> bool {
        match self.lookup_mut(path) {
            Some(leaf) => {
                let removed = leaf.names.remove(name);
                leaf.names.refresh_digest();
                removed
            }
            None => false,
        }
    }
    
    pub fn contains_name(&self, path: &RegionPath, name: &EntityName) -> bool {
        self.lookup(path).map_or(false, |leaf| leaf.names.contains(name))
    }
    
    /// Paths of every tracked leaf, in index order.
    pub fn tracked_leaves(&self) -> Vec<RegionPath> {
        let mut out = Vec::new();
        let mut stack = vec![(&self.root, Vec::new())];
        while let Some((node, digits)) = stack.pop() {
            if node.depth == self.geometry.depth() {
                if node.tracked {
                    out.push(RegionPath(digits));
                }
                continue;
            }
            for child in node.children.iter().rev() {
                let mut next = digits.clone();
                next.push(child.index);
                stack.push((child, next));
            }
        }
        out
    }
    
    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
    
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    
    fn path(digits: &[u8]) -> RegionPath {
        RegionPath::new(digits.to_vec()).unwrap()
    }
    
    fn name(id: &str) -> EntityName {
        EntityName::new("/hub", id).unwrap()
    }
    
    #[test]
    fn test_octant_for_position_bits() {
        let geo = WorldGeometry::default();
        // x = 0b1010..., y = 0b0110..., z = 0b0011... (top bits of 16)
        let p = Vector3::new(0xA000 as f32, 0x6000 as f32, 0x3000 as f32);
        let leaf = geo.octant_for_position(&p).unwrap();
        assert_eq!(leaf.digits(), &[4, 2, 7, 1, 0, 0, 0]);
    }
    
    #[test]
    fn test_octant_for_origin_and_corner() {
        let geo = WorldGeometry::default();
        let origin = geo.octant_for_position(&Vector3::zeros()).unwrap();
        assert_eq!(origin.digits(), &[0; 7]);
        
        let corner = geo.octant_for_position(&Vector3::new(65535.9, 65535.9, 65535.9)).unwrap();
        assert_eq!(corner.digits(), &[7; 7]);
    }
    
    #[test]
    fn test_out_of_world_rejected() {
        let geo = WorldGeometry::default();
        for p in [
            Vector3::new(-0.5, 1.0, 1.0),
            Vector3::new(1.0, 65536.0, 1.0),
            Vector3::new(1.0, 1.0, f32::NAN),
            Vector3::new(f32::INFINITY, 1.0, 1.0),
        ] {
            assert!(matches!(geo.octant_for_position(&p), Err(SpaceError::OutOfWorld { .. })));
        }
    }
    
    #[test]
    fn test_region_for_path() {
        let geo = WorldGeometry::default();
        let leaf = geo.region_for_path(&path(&[7, 0, 0, 0, 0, 0, 1])).unwrap();
        assert_eq!(leaf.size, 512.0);
        assert_eq!(leaf.min, Vector3::new(32768.0, 32768.0, 32768.0 + 512.0));
        
        let root = geo.region_for_path(&RegionPath::root()).unwrap();
        assert_eq!(root.size, 65536.0);
        assert_eq!(root.min, Vector3::zeros());
        
        assert!(matches!(
            geo.region_for_path(&path(&[0; 8])),
            Err(SpaceError::TooDeep { depth: 8, max: 7 })
        ));
    }
    
    #[test]
    fn test_geometry_validation() {
        assert!(WorldGeometry::new(0, 16).is_err());
        assert!(WorldGeometry::new(17, 16).is_err());
        assert!(WorldGeometry::new(8, 25).is_err());
        assert_eq!(WorldGeometry::new(8, 16).unwrap().leaf_size(), 256.0);
    }
    
    #[test]
    fn test_path_display_and_parse() {
        assert_eq!(path(&[2, 4, 1]).to_string(), "2/4/1");
        assert_eq!(RegionPath::root().to_string(), "");
        assert_eq!("2/4/1".parse::<RegionPath>().unwrap(), path(&[2, 4, 1]));
        assert_eq!("/2/4/1/".parse::<RegionPath>().unwrap(), path(&[2, 4, 1]));
        assert_eq!("-1/2/4".parse::<RegionPath>().unwrap(), path(&[2, 4]));
        assert_eq!("".parse::<RegionPath>().unwrap(), RegionPath::root());
        assert!("2/8".parse::<RegionPath>().is_err());
        assert!("2/x".parse::<RegionPath>().is_err());
        assert!("2/-1".parse::<RegionPath>().is_err());
    }
    
    #[test]
    fn test_path_relations() {
        let leaf = path(&[1, 2, 3]);
        assert_eq!(leaf.parent(), Some(path(&[1, 2])));
        assert_eq!(leaf.ancestor(2), path(&[1]));
        assert_eq!(leaf.ancestor(9), RegionPath::root());
        assert!(path(&[1]).contains(&leaf));
        assert!(leaf.contains(&leaf));
        assert!(!path(&[2]).contains(&leaf));
        assert_eq!(RegionPath::root().parent(), None);
    }
    
    #[test]
    fn test_lookup_and_insert() {
        let mut tree = Octree::new(WorldGeometry::default());
        let leaf = path(&[2, 4, 1, 0, 6, 3, 1]);
        assert!(tree.lookup(&leaf).is_none());
        
        tree.insert(&leaf).unwrap();
        assert_eq!(tree.lookup(&leaf).unwrap().depth(), 7);
        assert_eq!(tree.len(), 8);
        
        // Idempotent
        tree.insert(&leaf).unwrap();
        assert_eq!(tree.len(), 8);
        
        assert!(tree.insert(&path(&[0; 8])).is_err());
    }
    
    #[test]
    fn test_children_stay_sorted() {
        let mut tree = Octree::new(WorldGeometry::default());
        for i in [5, 1, 7, 3] {
            tree.insert(&path(&[i])).unwrap();
        }
        let indices: Vec<u8> = tree
            .lookup(&RegionPath::root())
            .unwrap()
            .children()
            .iter()
            .map(Octant::index)
            .collect();
        assert_eq!(indices, vec![1, 3, 5, 7]);
    }
    
    #[test]
    fn test_add_remove_refreshes_leaf_digest() {
        let mut tree = Octree::new(WorldGeometry::default());
        let leaf = path(&[0, 0, 0, 0, 0, 0, 1]);
        
        assert!(tree.add_name(&leaf, name("a")).unwrap());
        assert!(!tree.add_name(&leaf, name("a")).unwrap());
        assert_eq!(tree.digest(&leaf), Some(NameSet::from_iter([name("a")]).digest()));
        assert!(tree.contains_name(&leaf, &name("a")));
        
        assert!(tree.remove_name(&leaf, &name("a")));
        assert_eq!(tree.digest(&leaf), Some(NameSet::new().digest()));
        
        // Names only live in leaves
        assert!(tree.add_name(&path(&[0]), name("a")).is_err());
    }
    
    #[test]
    fn test_aggregate_collects_leaves_breadth_first() {
        let mut tree = Octree::new(WorldGeometry::default());
        let a = path(&[1, 0, 0, 0, 0, 0, 2]);
        let b = path(&[1, 0, 0, 0, 0, 0, 5]);
        let c = path(&[3, 0, 0, 0, 0, 0, 0]);
        tree.add_name(&a, name("a")).unwrap();
        tree.add_name(&b, name("b")).unwrap();
        tree.add_name(&c, name("c")).unwrap();
        
        let under_one = tree.aggregate_names(&path(&[1])).unwrap();
        let ids: Vec<&str> = under_one.iter().map(EntityName::id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        
        let all = tree.aggregate_names(&RegionPath::root()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(tree.digest(&RegionPath::root()), Some(all.digest()));
        
        assert!(tree.aggregate_names(&path(&[6])).is_none());
    }
    
    #[test]
    fn test_tracking_flags() {
        let mut tree = Octree::new(WorldGeometry::default());
        let a = path(&[1, 0, 0, 0, 0, 0, 2]);
        let b = path(&[1, 0, 0, 0, 0, 0, 5]);
        tree.track(&a).unwrap();
        tree.track(&b).unwrap();
        
        assert!(tree.is_tracked(&a));
        assert_eq!(tree.tracked_leaves(), vec![a.clone(), b.clone()]);
        
        let parent = a.parent().unwrap();
        assert!(tree.has_tracked_descendants(&parent));
        assert!(tree.untrack(&a));
        assert!(!tree.untrack(&a));
        assert!(tree.has_tracked_descendants(&parent));
        tree.untrack(&b);
        assert!(!tree.has_tracked_descendants(&parent));
        assert!(tree.tracked_leaves().is_empty());
    }
    
    proptest! {
        #[test]
        fn prop_octant_region_contains_position(
            x in 0.0f32..65535.0,
            y in 0.0f32..65535.0,
            z in 0.0f32..65535.0,
        ) {
            let geo = WorldGeometry::default();
            let p = Vector3::new(x, y, z);
            let leaf = geo.octant_for_position(&p).unwrap();
            prop_assert_eq!(leaf.depth(), 7);
            prop_assert!(geo.region_for_path(&leaf).unwrap().contains(&p));
            // Every ancestor box contains it too
            for up in 0..=7 {
                prop_assert!(geo.region_for_path(&leaf.ancestor(up)).unwrap().contains(&p));
            }
        }
        
        #[test]
        fn prop_path_string_roundtrip(digits in proptest::collection::vec(0u8..8, 0..8)) {
            let p = RegionPath::new(digits).unwrap();
            prop_assert_eq!(p.to_string().parse::<RegionPath>().unwrap(), p);
        }
    }
}
