//! SimulatedPeer - runs a `PeerInstance` on the simulated face.
//!
//! The wrapper records everything the instance reports through its host
//! callbacks so scenarios can assert on what each peer believes.

use crate::context::SimContext;
use crate::network::{SimFace, SimHub};

use matryoshka_core::{
    Callbacks, Ed25519Signer, EntityLocation, EntityName, InfoSink, InstanceConfig, LocationSink, LogLevel,
    LogRecord, LogSink, PeerInstance, SyncError,
};
use matryoshka_env::NodeId;
use nalgebra::Vector3;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a peer's callbacks reported.
#[derive(Debug, Default)]
pub struct Recorder {
    locations: Mutex<HashMap<EntityName, EntityLocation>>,
    drops: Mutex<Vec<EntityName>>,
    render_tags: Mutex<HashMap<EntityName, String>>,
    errors: Mutex<Vec<LogRecord>>,
}

impl Recorder {
    /// Last reported location per entity.
    pub fn locations(&self) -> HashMap<EntityName, EntityLocation> {
        lock(&self.locations).clone()
    }

    pub fn drops(&self) -> Vec<EntityName> {
        lock(&self.drops).clone()
    }

    pub fn render_tag(&self, name: &EntityName) -> Option<String> {
        lock(&self.render_tags).get(name).cloned()
    }

    pub fn errors(&self) -> Vec<LogRecord> {
        lock(&self.errors).clone()
    }
}

impl LocationSink for Recorder {
    fn on_location(&self, name: &EntityName, location: EntityLocation) {
        if location == EntityLocation::Dropped {
            lock(&self.drops).push(name.clone());
        }
        lock(&self.locations).insert(name.clone(), location);
    }
}

impl LogSink for Recorder {
    fn on_log(&self, record: &LogRecord) {
        if record.level == LogLevel::Error {
            lock(&self.errors).push(record.clone());
        }
    }
}

impl InfoSink for Recorder {
    fn on_render_info(&self, name: &EntityName, render_tag: &str) {
        lock(&self.render_tags).insert(name.clone(), render_tag.to_string());
    }
}

/// A simulated peer running in the deterministic environment.
pub struct SimulatedPeer {
    /// Peer index (for key derivation and oracle lookups)
    pub index: usize,

    /// Node identity on the hub
    pub node: NodeId,

    instance: PeerInstance<SimContext, SimFace>,
    recorder: Arc<Recorder>,
}

impl SimulatedPeer {
    /// Creates a peer named `p<index>` at `position`. Not started yet.
    pub fn new(
        context: &Arc<SimContext>,
        hub: &Arc<SimHub>,
        index: usize,
        config: InstanceConfig,
        position: Vector3<f32>,
    ) -> Result<Self, SyncError> {
        let node = NodeId::from_seed(index as u64);
        let recorder = Arc::new(Recorder::default());
        let callbacks = Callbacks::default()
            .with_location(recorder.clone())
            .with_log(recorder.clone())
            .with_info(recorder.clone());
        let signer = Ed25519Signer::from_context(&**context, index as u64);
        let instance = PeerInstance::new(
            Arc::clone(context),
            hub.face(node),
            config,
            &format!("p{}", index),
            position,
            signer,
            callbacks,
        )?;
        Ok(Self {
            index,
            node,
            instance,
            recorder,
        })
    }

    pub async fn start(&self) -> Result<(), SyncError> {
        self.instance.start().await
    }

    pub async fn shutdown(&self) {
        self.instance.shutdown().await;
    }

    pub fn name(&self) -> EntityName {
        self.instance.local_name()
    }

    pub fn instance(&self) -> &PeerInstance<SimContext, SimFace> {
        &self.instance
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Feeds the oracle's truth into the instance.
    pub fn move_to(&self, position: Vector3<f32>) {
        if let Err(e) = self.instance.set_local_position(position) {
            tracing::warn!(peer = self.index, error = %e, "rejected oracle position");
        }
    }

    /// Remote entities this peer currently has a position for.
    pub fn known_positions(&self) -> HashMap<EntityName, Vector3<f32>> {
        self.instance
            .remote_entities()
            .into_iter()
            .filter_map(|entity| entity.location.position().map(|p| (entity.name, p)))
            .collect()
    }

    /// Whether `name` is still in this peer's entity table.
    pub fn knows(&self, name: &EntityName) -> bool {
        self.instance.state().remote_entity(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SimNetworkController;
    use matryoshka_core::{RegionPath, WorldGeometry};
    use std::time::Duration;

    fn r1_center() -> Vector3<f32> {
        let leaf = RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap();
        WorldGeometry::default().region_for_path(&leaf).unwrap().center()
    }

    #[tokio::test(start_paused = true)]
    async fn test_peers_record_each_other() {
        let context = SimContext::shared(42);
        let hub = SimHub::new(Arc::new(SimNetworkController::new(42)));
        let a = SimulatedPeer::new(&context, &hub, 0, InstanceConfig::default(), r1_center()).unwrap();
        let b = SimulatedPeer::new(&context, &hub, 1, InstanceConfig::default(), r1_center().add_scalar(5.0))
            .unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(a.known_positions().get(&b.name()), Some(&r1_center().add_scalar(5.0)));
        assert_eq!(
            a.recorder().locations().get(&b.name()),
            Some(&EntityLocation::Known(r1_center().add_scalar(5.0)))
        );
        assert_eq!(a.recorder().render_tag(&b.name()).as_deref(), Some("default"));
        assert!(b.knows(&a.name()));
        assert!(a.recorder().errors().is_empty());

        a.shutdown().await;
        b.shutdown().await;
        assert_eq!(hub.registration_count(), 0);
    }
}
