//! Scenario runner - executes fault scenarios on a paused clock.

use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld, Visibility};

use matryoshka_core::{RegionPath, SyncError};
use matryoshka_env::{NetworkController, NodeId};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Peers spawned
    pub peer_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected at the end of a scenario.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Requests expressed on the hub
    pub requests: u64,

    /// Hops lost to partitions or loss
    pub dropped: u64,

    /// Requests that got an answer
    pub answered: u64,

    /// Observer/subject pairs that should see each other
    pub expected_pairs: usize,

    /// Of those, pairs with an accurate position
    pub accurate_pairs: usize,

    /// Entity drops reported through callbacks
    pub drops_reported: usize,
}

/// Verdict of one scenario body: `None` passes.
type Verdict = Result<Option<String>, SyncError>;

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers
    num_peers: usize,

    /// Length of the main phase in seconds
    duration_secs: f64,
}

/// Leaf every scenario starts in.
fn home_leaf() -> RegionPath {
    RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap_or_default()
}

/// Leaf far from home, under a different subscription.
fn away_leaf() -> RegionPath {
    RegionPath::new(vec![5, 1, 1, 1, 1, 1, 1]).unwrap_or_default()
}

impl ScenarioRunner {
    /// Creates a new scenario runner. At least two peers are always used.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers: num_peers.max(2),
            duration_secs: 10.0,
        }
    }

    /// Sets the main phase duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs.max(1.0);
        self
    }

    fn config(&self, scenario: ScenarioId) -> SimConfig {
        SimConfig {
            seed: self.seed,
            num_peers: self.num_peers,
            duration_secs: self.duration_secs,
            loss_rate: if scenario == ScenarioId::LossyLink { 0.2 } else { 0.0 },
            ..SimConfig::default()
        }
    }

    fn main_phase(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    /// Runs a scenario on a fresh single-threaded runtime with a paused clock.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_in_runtime(scenario)),
            Err(e) => self.failed(scenario, format!("cannot build runtime: {}", e)),
        }
    }

    async fn run_in_runtime(&self, scenario: ScenarioId) -> ScenarioResult {
        let mut world = match SimWorld::new(self.config(scenario)) {
            Ok(world) => world,
            Err(e) => return self.failed(scenario, format!("cannot build world: {}", e)),
        };

        let verdict = match world.spawn_peers(&home_leaf()).await {
            Err(e) => Err(e),
            Ok(_) => match scenario {
                ScenarioId::Convergence => self.run_convergence(&mut world).await,
                ScenarioId::Crossing => self.run_crossing(&mut world).await,
                ScenarioId::Dropout => self.run_dropout(&mut world).await,
                ScenarioId::SplitBrain => self.run_split_brain(&mut world).await,
                ScenarioId::LossyLink => self.run_lossy_link(&mut world).await,
            },
        };

        let visibility = world.visibility();
        let stats = world.stats();
        let metrics = ScenarioMetrics {
            requests: stats.requests,
            dropped: stats.dropped,
            answered: stats.answered,
            expected_pairs: visibility.expected,
            accurate_pairs: visibility.accurate,
            drops_reported: world.live_peers().map(|p| p.recorder().drops().len()).sum(),
        };
        let final_time_secs = world.time();
        world.shutdown().await;

        let failure_reason = match verdict {
            Ok(reason) => reason,
            Err(e) => Some(format!("peer error: {}", e)),
        };
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            final_time_secs,
            peer_count: self.num_peers,
            failure_reason,
            metrics,
        }
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            final_time_secs: 0.0,
            peer_count: self.num_peers,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    /// All peers start in one leaf and must end with accurate positions of
    /// every other peer and no drops.
    async fn run_convergence(&self, world: &mut SimWorld) -> Verdict {
        world.run_for(self.main_phase()).await;

        let n = self.num_peers;
        let visibility = world.visibility();
        if visibility.expected != n * (n - 1) {
            return Ok(Some(format!("expected {} pairs in one leaf, found {}", n * (n - 1), visibility.expected)));
        }
        Ok(check_converged(visibility).or_else(|| check_no_drops(world)))
    }

    /// Peer 0 jumps to a far leaf; the rest must evict it. Peer 1 then
    /// follows and must rediscover it there.
    async fn run_crossing(&self, world: &mut SimWorld) -> Verdict {
        world.run_for(Duration::from_secs(5)).await;

        let away = away_leaf();
        let Some(target) = world.oracle.geometry().region_for_path(&away).ok().map(|r| r.center()) else {
            return Ok(Some(format!("invalid leaf {}", away)));
        };
        world.oracle.place(0, target);
        world.oracle.freeze(0);
        world.run_for(Duration::from_secs(5)).await;

        let (Some(mover), Some(follower)) = (world.peer(0), world.peer(1)) else {
            return Ok(Some("missing peers".to_string()));
        };
        let mover_name = mover.name();
        if !mover.instance().tracked_regions().contains(&away) {
            return Ok(Some(format!("{} does not track {}", mover_name, away)));
        }
        if let Some(observer) = world.live_peers().find(|p| p.index != 0 && p.known_positions().contains_key(&mover_name)) {
            return Ok(Some(format!("{} still holds a position for {}", observer.name(), mover_name)));
        }
        let follower_index = follower.index;
        debug!("mover evicted by every observer");

        world.oracle.place(follower_index, target.add_scalar(10.0));
        world.oracle.freeze(follower_index);
        world.run_for(self.main_phase()).await;

        let Some(follower) = world.peer(follower_index) else {
            return Ok(Some("follower vanished".to_string()));
        };
        if follower.known_positions().get(&mover_name) != Some(&target) {
            return Ok(Some(format!("{} did not rediscover {} in {}", follower.name(), mover_name, away)));
        }
        Ok(check_converged(world.visibility()))
    }

    /// The last peer shuts down; every survivor must report its drop and
    /// hold no position for it.
    async fn run_dropout(&self, world: &mut SimWorld) -> Verdict {
        world.run_for(Duration::from_secs(5)).await;

        let silent = self.num_peers - 1;
        let Some(silent_name) = world.peer(silent).map(|p| p.name()) else {
            return Ok(Some("missing peer".to_string()));
        };
        world.stop_peer(silent).await;

        // Drop needs drop_threshold + 1 consecutive poll timeouts
        let config = &world.config.instance;
        let drop_after = config.position_timeout() * (config.drop_threshold + 1);
        world.run_for(self.main_phase().max(drop_after + Duration::from_secs(5))).await;

        for peer in world.live_peers() {
            if !peer.recorder().drops().contains(&silent_name) {
                return Ok(Some(format!("{} never dropped {}", peer.name(), silent_name)));
            }
            if peer.known_positions().contains_key(&silent_name) {
                return Ok(Some(format!("{} still holds a position for {}", peer.name(), silent_name)));
            }
        }
        Ok(check_converged(world.visibility()))
    }

    /// Halves cannot talk for 8s, shorter than the drop horizon; after the
    /// heal everyone must see everyone again without any drop.
    async fn run_split_brain(&self, world: &mut SimWorld) -> Verdict {
        world.run_for(Duration::from_secs(5)).await;

        let nodes: Vec<NodeId> = world.live_peers().map(|p| p.node).collect();
        let (left, right) = nodes.split_at(nodes.len() / 2);
        world.controller().partition(left, right);
        info!(left = left.len(), right = right.len(), "partitioned");
        world.run_for(Duration::from_secs(8)).await;

        world.controller().heal_all();
        info!("healed");
        world.run_for(self.main_phase()).await;

        Ok(check_converged(world.visibility()).or_else(|| check_no_drops(world)))
    }

    /// Every link loses 20% of messages; positions must still converge
    /// and nobody may be dropped.
    async fn run_lossy_link(&self, world: &mut SimWorld) -> Verdict {
        world.run_for(self.main_phase() + Duration::from_secs(5)).await;
        Ok(check_converged(world.visibility()).or_else(|| check_no_drops(world)))
    }
}

fn check_converged(visibility: Visibility) -> Option<String> {
    if visibility.converged() {
        None
    } else {
        Some(format!(
            "only {}/{} peer pairs have an accurate position",
            visibility.accurate, visibility.expected
        ))
    }
}

fn check_no_drops(world: &SimWorld) -> Option<String> {
    world.live_peers().find_map(|peer| {
        let drops = peer.recorder().drops();
        (!drops.is_empty()).then(|| format!("{} dropped {:?}", peer.name(), drops))
    })
}
