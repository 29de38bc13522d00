//! SimWorld - The simulation harness container.

use crate::agent::SimulatedPeer;
use crate::context::SimContext;
use crate::network::{HubStats, SimHub, SimNetworkController};
use crate::oracle::Oracle;

use matryoshka_core::{InstanceConfig, RegionPath, SpaceError, SyncError};
use matryoshka_env::NodeId;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peers to spawn
    pub num_peers: usize,

    /// Length of the main phase of a scenario in seconds
    pub duration_secs: f64,

    /// Oracle update rate in Hz
    pub tick_rate_hz: u32,

    /// Random walk speed in world units per second
    pub walk_speed: f32,

    /// Loss rate applied to every link
    pub loss_rate: f64,

    /// Distance a remote position may trail the truth and still count
    pub tolerance: f32,

    /// Settings of every peer instance
    pub instance: InstanceConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 6,
            duration_secs: 10.0,
            tick_rate_hz: 10,
            walk_speed: 4.0,
            loss_rate: 0.0,
            tolerance: 25.0,
            instance: InstanceConfig::default(),
        }
    }
}

/// Pairwise visibility at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Visibility {
    /// Observer/subject pairs where the subject sits in a leaf the observer tracks
    pub expected: usize,

    /// Expected pairs whose remote position is within tolerance of the truth
    pub accurate: usize,
}

impl Visibility {
    pub fn converged(&self) -> bool {
        self.expected == self.accurate
    }
}

/// The SimWorld - container for the entire simulation.
///
/// Must be created inside a tokio runtime with a paused clock.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context
    pub context: Arc<SimContext>,

    /// Ground truth oracle
    pub oracle: Oracle,

    /// Shared face broker
    pub hub: Arc<SimHub>,

    /// Peers by index; `None` once shut down
    peers: Vec<Option<SimulatedPeer>>,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Result<Self, SyncError> {
        // Derive separate seeds for different subsystems
        let physics_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let network_seed = config.seed.wrapping_mul(0x517cc1b727220a95);

        let geometry = config.instance.geometry()?;
        let context = SimContext::shared(config.seed);
        let mut oracle = Oracle::new(geometry, physics_seed);
        oracle.set_walk_speed(config.walk_speed);

        let controller = Arc::new(SimNetworkController::new(network_seed));
        controller.set_default_loss(config.loss_rate);
        let hub = SimHub::new(controller);

        Ok(Self {
            config,
            context,
            oracle,
            hub,
            peers: Vec::new(),
        })
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        self.hub.controller()
    }

    /// Spawns `num_peers` avatars inside `leaf` and starts a peer for each.
    pub async fn spawn_peers(&mut self, leaf: &RegionPath) -> Result<Vec<NodeId>, SyncError> {
        let inset = self.oracle.geometry().leaf_size() / 4.0;
        let mut ids = Vec::new();
        for index in self.peers.len()..self.peers.len() + self.config.num_peers {
            let position = self
                .oracle
                .spawn_in(index, leaf, inset)
                .ok_or_else(|| SpaceError::InvalidPath(leaf.to_string()))?;
            let peer = SimulatedPeer::new(&self.context, &self.hub, index, self.config.instance.clone(), position)?;
            peer.start().await?;
            ids.push(peer.node);
            self.peers.push(Some(peer));
        }
        tracing::info!(peers = ids.len(), region = %leaf, "peers started");
        Ok(ids)
    }

    /// Lets virtual time pass while the oracle keeps moving avatars.
    pub async fn run_for(&mut self, duration: Duration) {
        let tick = Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64);
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(tick).await;
            self.oracle.step(tick.as_secs_f64());
            for peer in self.peers.iter().flatten() {
                if let Some(position) = self.oracle.position(peer.index) {
                    peer.move_to(position);
                }
            }
        }
    }

    pub fn peer(&self, index: usize) -> Option<&SimulatedPeer> {
        self.peers.get(index).and_then(Option::as_ref)
    }

    pub fn live_peers(&self) -> impl Iterator<Item = &SimulatedPeer> {
        self.peers.iter().flatten()
    }

    /// Stops one peer and removes its avatar.
    pub async fn stop_peer(&mut self, index: usize) {
        if let Some(peer) = self.peers.get_mut(index).and_then(Option::take) {
            peer.shutdown().await;
            self.oracle.remove(index);
            tracing::info!(peer = index, "peer stopped");
        }
    }

    /// Stops every peer.
    pub async fn shutdown(&mut self) {
        for index in 0..self.peers.len() {
            self.stop_peer(index).await;
        }
    }

    /// Compares every live peer's table against the oracle.
    pub fn visibility(&self) -> Visibility {
        let mut visibility = Visibility::default();
        for observer in self.live_peers() {
            let tracked = observer.instance().tracked_regions();
            let known = observer.known_positions();
            for subject in self.live_peers().filter(|p| p.index != observer.index) {
                let (Some(truth), Some(leaf)) = (self.oracle.position(subject.index), self.oracle.leaf_of(subject.index))
                else {
                    continue;
                };
                if !tracked.contains(&leaf) {
                    continue;
                }
                visibility.expected += 1;
                if known
                    .get(&subject.name())
                    .is_some_and(|seen| (seen - truth).norm() <= self.config.tolerance)
                {
                    visibility.accurate += 1;
                }
            }
        }
        visibility
    }

    pub fn stats(&self) -> HubStats {
        self.hub.stats()
    }

    /// Current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.oracle.time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r1() -> RegionPath {
        RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_world_converges() {
        let config = SimConfig {
            num_peers: 3,
            ..Default::default()
        };
        let mut world = SimWorld::new(config).unwrap();
        let ids = world.spawn_peers(&r1()).await.unwrap();
        assert_eq!(ids.len(), 3);

        world.run_for(Duration::from_secs(5)).await;

        let visibility = world.visibility();
        assert_eq!(visibility.expected, 6);
        assert!(visibility.converged(), "{:?}", visibility);
        assert!((world.time() - 5.0).abs() < 0.2);

        world.shutdown().await;
        assert_eq!(world.live_peers().count(), 0);
        assert_eq!(world.hub.registration_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_world_rejects_bad_geometry() {
        let mut config = SimConfig::default();
        config.instance.world_bits = 40;
        assert!(SimWorld::new(config).is_err());
    }
}
