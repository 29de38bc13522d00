//! Ground truth oracle for simulation.
//!
//! The Oracle holds the "God's eye view" of the simulated world: the true
//! position of every avatar and the seeded random walk that moves them.
//! Peers are told their own position by the oracle and learn everyone
//! else's only through the sync protocols.

use matryoshka_core::{RegionPath, WorldGeometry};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;

/// Keeps avatars strictly inside `[0, extent)`.
const EDGE_MARGIN: f32 = 0.5;

/// A ground truth avatar.
#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    /// Index of the owning peer
    pub id: usize,

    /// True position in world units
    pub position: Vector3<f32>,

    /// Frozen avatars ignore the walk (e.g. crossed on purpose)
    pub frozen: bool,
}

/// The Oracle - maintains ground truth positions.
pub struct Oracle {
    geometry: WorldGeometry,

    /// RNG for movement (separate from network loss decisions)
    rng: ChaCha8Rng,

    /// Avatars by peer index
    avatars: BTreeMap<usize, Avatar>,

    /// Random walk standard deviation in units per second
    walk_speed: f32,

    /// Current simulation time (seconds)
    current_time: f64,
}

impl Oracle {
    /// Creates a new Oracle with the given movement seed.
    pub fn new(geometry: WorldGeometry, physics_seed: u64) -> Self {
        Self {
            geometry,
            rng: ChaCha8Rng::seed_from_u64(physics_seed),
            avatars: BTreeMap::new(),
            walk_speed: 4.0,
            current_time: 0.0,
        }
    }

    pub fn set_walk_speed(&mut self, units_per_sec: f32) {
        self.walk_speed = units_per_sec.max(0.0);
    }

    pub fn geometry(&self) -> &WorldGeometry {
        &self.geometry
    }

    /// Places avatar `id` uniformly inside `leaf`, away from its faces by
    /// `inset` units so a short walk stays in the leaf.
    pub fn spawn_in(&mut self, id: usize, leaf: &RegionPath, inset: f32) -> Option<Vector3<f32>> {
        let region = self.geometry.region_for_path(leaf).ok()?;
        let size = region.size;
        let inset = inset.clamp(0.0, size / 2.0 - EDGE_MARGIN);
        let mut coordinate = |min: f32| min + inset + self.rng.gen::<f32>() * (size - 2.0 * inset - EDGE_MARGIN);
        let position = Vector3::new(
            coordinate(region.min.x),
            coordinate(region.min.y),
            coordinate(region.min.z),
        );
        self.place(id, position);
        Some(position)
    }

    /// Puts avatar `id` at `position` (clamped into the world).
    pub fn place(&mut self, id: usize, position: Vector3<f32>) {
        let position = self.clamp(position);
        self.avatars
            .entry(id)
            .and_modify(|avatar| avatar.position = position)
            .or_insert(Avatar {
                id,
                position,
                frozen: false,
            });
    }

    pub fn freeze(&mut self, id: usize) {
        if let Some(avatar) = self.avatars.get_mut(&id) {
            avatar.frozen = true;
        }
    }

    pub fn remove(&mut self, id: usize) -> Option<Avatar> {
        self.avatars.remove(&id)
    }

    /// Advances the random walk by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        let sigma = self.walk_speed * (dt as f32).sqrt();
        let Ok(noise) = Normal::new(0.0f32, sigma) else {
            return;
        };
        let extent = self.geometry.extent();
        for avatar in self.avatars.values_mut().filter(|avatar| !avatar.frozen) {
            let delta = Vector3::new(
                noise.sample(&mut self.rng),
                noise.sample(&mut self.rng),
                noise.sample(&mut self.rng),
            );
            avatar.position = (avatar.position + delta).map(|c| c.clamp(0.0, extent - EDGE_MARGIN));
        }
    }

    pub fn position(&self, id: usize) -> Option<Vector3<f32>> {
        self.avatars.get(&id).map(|avatar| avatar.position)
    }

    /// Leaf of avatar `id`'s true position.
    pub fn leaf_of(&self, id: usize) -> Option<RegionPath> {
        self.position(id)
            .and_then(|position| self.geometry.octant_for_position(&position).ok())
    }

    pub fn avatars(&self) -> impl Iterator<Item = &Avatar> {
        self.avatars.values()
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    fn clamp(&self, position: Vector3<f32>) -> Vector3<f32> {
        let extent = self.geometry.extent();
        position.map(|c| if c.is_finite() { c.clamp(0.0, extent - EDGE_MARGIN) } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r1() -> RegionPath {
        RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap()
    }

    #[test]
    fn test_spawn_lands_inside_leaf() {
        let mut oracle = Oracle::new(WorldGeometry::default(), 42);
        for id in 0..20 {
            oracle.spawn_in(id, &r1(), 100.0).unwrap();
            assert_eq!(oracle.leaf_of(id), Some(r1()));
        }
    }

    #[test]
    fn test_walk_is_deterministic_per_seed() {
        let run = |seed| {
            let mut oracle = Oracle::new(WorldGeometry::default(), seed);
            oracle.spawn_in(0, &r1(), 100.0);
            for _ in 0..50 {
                oracle.step(0.1);
            }
            oracle.position(0).unwrap()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }

    #[test]
    fn test_walk_stays_in_world_and_frozen_stays_put() {
        let mut oracle = Oracle::new(WorldGeometry::default(), 1);
        oracle.set_walk_speed(5000.0);
        oracle.place(0, Vector3::new(1.0, 1.0, 1.0));
        oracle.place(1, Vector3::new(30000.0, 30000.0, 30000.0));
        oracle.freeze(1);
        for _ in 0..100 {
            oracle.step(1.0);
            assert!(oracle.leaf_of(0).is_some());
        }
        assert_eq!(oracle.position(1), Some(Vector3::new(30000.0, 30000.0, 30000.0)));
        assert!((oracle.time() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_place_clamps_out_of_world() {
        let mut oracle = Oracle::new(WorldGeometry::default(), 1);
        oracle.place(3, Vector3::new(-10.0, 70000.0, f32::NAN));
        let position = oracle.position(3).unwrap();
        assert_eq!(position.x, 0.0);
        assert!(position.y < 65536.0);
        assert_eq!(position.z, 0.0);
        assert!(oracle.remove(3).is_some());
        assert!(oracle.position(3).is_none());
    }

    proptest::proptest! {
        #[test]
        fn test_placed_avatars_always_have_a_leaf(
            x in proptest::num::f32::ANY,
            y in -1.0e6f32..1.0e6,
            z in -1.0e6f32..1.0e6,
        ) {
            let mut oracle = Oracle::new(WorldGeometry::default(), 5);
            oracle.place(0, Vector3::new(x, y, z));
            proptest::prop_assert!(oracle.leaf_of(0).is_some());
        }
    }
}
