//! Shared peer state and the synchronous half of every protocol step.
//!
//! Each collection sits behind its own mutex. Methods that touch more than
//! one take the locks in this order and release them before returning:
//!
//! ```text
//! local -> entities -> octree -> broadcast_set -> subscriptions
//! ```
//!
//! Nothing here awaits, so no guard ever lives across a suspension point.
//! Host callbacks are invoked only after every guard has been dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use matryoshka_env::{Name, RegistrationId, Request, SignedResponse};
use nalgebra::Vector3;

use crate::callbacks::{Callbacks, LogLevel};
use crate::config::InstanceConfig;
use crate::discovery::{decode_body, encode_body, DiscoveryQuery, DiscoverySync};
use crate::entity::{EntityLocation, EntityName, LocalEntity, RemoteEntity};
use crate::error::{SpaceError, SyncError, WireError};
use crate::position::{
    respond, response_sequence, PositionPayload, PositionReply, SequenceWindow,
};
use crate::space::{Octree, RegionPath, WorldGeometry};
use crate::trust::{verify_response, ResponseSigner};

/// Recovers the guard from a poisoned mutex; every critical section leaves
/// its collection consistent before anything can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What an accepted-or-rejected position did, reported after unlocking.
enum Applied {
    OutOfWorld(Vector3<f32>),
    Accepted { position: Vector3<f32>, leaf: RegionPath, evicted: bool },
}

/// One unit of work in a discovery sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepTarget {
    /// Whole-frame request for one tracked leaf
    Leaf(RegionPath),

    /// Part-frame request for tracked leaves sharing a parent
    Siblings { parent: RegionPath, children: Vec<u8> },
}

/// Result of a track bookkeeping change that needs transport work.
#[derive(Debug, Default)]
pub struct UntrackOutcome {
    /// Subscription to release, if no tracked leaf remains under it
    pub released: Option<(RegionPath, RegistrationId)>,

    /// Remote entities evicted with the region
    pub evicted: Vec<EntityName>,
}

/// All mutable state of one peer.
pub struct PeerState {
    config: InstanceConfig,

    geometry: WorldGeometry,

    window: SequenceWindow,

    discovery: DiscoverySync,

    signer: Arc<dyn ResponseSigner>,

    callbacks: Callbacks,

    local: Mutex<LocalEntity>,

    entities: Mutex<HashMap<EntityName, RemoteEntity>>,

    octree: Mutex<Octree>,

    /// Tracked leaves in the order they are swept
    broadcast_set: Mutex<Vec<RegionPath>>,

    /// Discovery registrations by ancestor region
    subscriptions: Mutex<HashMap<RegionPath, RegistrationId>>,
}

impl PeerState {
    /// Creates the state with the local entity listed in its starting leaf.
    pub fn new(
        config: InstanceConfig,
        local_id: &str,
        position: Vector3<f32>,
        signer: Arc<dyn ResponseSigner>,
        callbacks: Callbacks,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let geometry = config.geometry()?;
        let window = config.window();
        let discovery = DiscoverySync::new(config.broadcast_name()?, config.broadcast_timeout());

        let name = EntityName::new(config.hub_prefix.clone(), local_id)?;
        let region = geometry.octant_for_position(&position)?;
        let mut octree = Octree::new(geometry);
        octree.add_name(&region, name.clone())?;
        let local = LocalEntity::new(name, position, region, window.size, config.render_tag.clone());

        Ok(Self {
            config,
            geometry,
            window,
            discovery,
            signer,
            callbacks,
            local: Mutex::new(local),
            entities: Mutex::new(HashMap::new()),
            octree: Mutex::new(octree),
            broadcast_set: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn geometry(&self) -> &WorldGeometry {
        &self.geometry
    }

    pub fn window(&self) -> &SequenceWindow {
        &self.window
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    fn sign(&self, name: Name, content: Vec<u8>, freshness: Duration, timestamp_ms: u64) -> Option<SignedResponse> {
        match self.signer.sign(name.clone(), content, freshness, timestamp_ms) {
            Ok(response) => Some(response),
            Err(e) => {
                self.callbacks.log(LogLevel::Error, format!("signing {} failed: {}", name, e));
                None
            }
        }
    }

    fn verified(&self, response: &SignedResponse) -> bool {
        match verify_response(response) {
            Ok(()) => true,
            Err(e) => {
                self.callbacks.log(
                    LogLevel::Warn,
                    format!("dropping response {}: {}", response.name, e),
                );
                false
            }
        }
    }

    // ========================================================================
    // LOCAL ENTITY
    // ========================================================================

    pub fn local_name(&self) -> EntityName {
        lock(&self.local).name.clone()
    }

    pub fn local_snapshot(&self) -> LocalEntity {
        lock(&self.local).clone()
    }

    /// Moves the local avatar. Out-of-world positions are refused.
    pub fn set_local_position(&self, position: Vector3<f32>) -> Result<(), SpaceError> {
        if !self.geometry.in_world(&position) {
            return Err(SpaceError::OutOfWorld { x: position.x, y: position.y, z: position.z });
        }
        lock(&self.local).position = position;
        Ok(())
    }

    /// Advances the local sequence, records the position, and moves the
    /// local name if the avatar crossed into another leaf.
    ///
    /// Returns the new leaf when the avatar changed leaf and the new one is
    /// not tracked yet. An untracked leaf the avatar stays in is left alone.
    pub fn publish_tick(&self) -> Option<RegionPath> {
        let mut local = lock(&self.local);
        let seq = match local.sequence {
            Some(seq) => self.window.next(seq),
            None => 0,
        };
        local.sequence = Some(seq);
        let position = local.position;
        local.history.record(seq, position);

        // Validated on every set_local_position
        let leaf = self.geometry.octant_for_position(&position).ok()?;
        let mut octree = lock(&self.octree);
        if leaf != local.region {
            let name = local.name.clone();
            octree.remove_name(&local.region, &name);
            if let Err(e) = octree.add_name(&leaf, name.clone()) {
                tracing::warn!(entity = %name, region = %leaf, error = %e, "cannot move local entity");
                return None;
            }
            tracing::debug!(entity = %name, from = %local.region, to = %leaf, "local entity changed region");
            local.region = leaf.clone();
            if !octree.is_tracked(&leaf) {
                return Some(leaf);
            }
        }
        None
    }

    /// Decision for a position request about the local entity.
    pub fn position_reply(&self, requested: Option<u32>) -> PositionReply {
        let local = lock(&self.local);
        respond(&self.window, local.sequence, &local.history, requested)
    }

    /// Signs a position answer under `<position>/<sequence>`.
    pub fn sign_position(&self, sequence: u32, payload: &PositionPayload, timestamp_ms: u64) -> Option<SignedResponse> {
        let name = self.local_name().position_prefix().child(sequence.to_string());
        self.sign(name, payload.to_bytes(), self.config.position_freshness(), timestamp_ms)
    }

    /// Signs the render tag under the request name.
    pub fn sign_render_info(&self, request_name: &Name, timestamp_ms: u64) -> Option<SignedResponse> {
        let tag = lock(&self.local).render_tag.clone();
        self.sign(request_name.clone(), tag.into_bytes(), self.config.digest_freshness(), timestamp_ms)
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Name prefix under which requests about `region` arrive.
    pub fn region_prefix(&self, region: &RegionPath) -> Name {
        region
            .digits()
            .iter()
            .fold(self.discovery.broadcast_prefix.clone(), |name, d| name.child(d.to_string()))
    }

    /// Snapshot of the broadcast set, grouped by parent when batching.
    pub fn sweep_targets(&self) -> Vec<SweepTarget> {
        let leaves = lock(&self.broadcast_set).clone();
        if !self.config.batch_siblings {
            return leaves.into_iter().map(SweepTarget::Leaf).collect();
        }
        let mut targets: Vec<SweepTarget> = Vec::new();
        for leaf in leaves {
            let (Some(parent), Some(&index)) = (leaf.parent(), leaf.digits().last()) else {
                targets.push(SweepTarget::Leaf(leaf));
                continue;
            };
            let existing = targets.iter_mut().find_map(|t| match t {
                SweepTarget::Siblings { parent: p, children } if *p == parent => Some(children),
                _ => None,
            });
            match existing {
                Some(children) => children.push(index),
                None => targets.push(SweepTarget::Siblings { parent, children: vec![index] }),
            }
        }
        targets
    }

    /// Request for one sweep target with the digests as of now.
    pub fn discovery_request(&self, target: &SweepTarget) -> Request {
        let octree = lock(&self.octree);
        match target {
            SweepTarget::Leaf(leaf) => self.discovery.build_request(&octree, leaf),
            SweepTarget::Siblings { parent, children } => {
                self.discovery.build_batch_request(&octree, parent, children)
            }
        }
    }

    /// Answers a discovery request, or stays silent when every named region
    /// agrees (or none is tracked here).
    pub fn answer_discovery(&self, request: &Request, timestamp_ms: u64) -> Option<SignedResponse> {
        let query = match DiscoveryQuery::from_name(&self.discovery.broadcast_prefix, &request.name) {
            Ok(query) => query,
            Err(e) => {
                self.callbacks.log(LogLevel::Warn, format!("bad discovery request {}: {}", request.name, e));
                return None;
            }
        };
        let listings = {
            let octree = lock(&self.octree);
            self.discovery.answer(&octree, &query)
        };
        if listings.is_empty() {
            return None;
        }
        tracing::debug!(name = %request.name, regions = listings.len(), "answering discovery");
        self.sign(request.name.clone(), encode_body(&listings), self.config.digest_freshness(), timestamp_ms)
    }

    /// Registers every unknown name in a discovery answer. Returns the names
    /// that became new remote entities.
    pub fn apply_discovery_response(&self, response: &SignedResponse) -> Vec<EntityName> {
        if !self.verified(response) {
            return Vec::new();
        }
        let listings = match decode_body(&response.content) {
            Ok(listings) => listings,
            Err(e) => {
                self.callbacks.log(LogLevel::Warn, format!("discarding discovery answer {}: {}", response.name, e));
                return Vec::new();
            }
        };
        let self_name = self.local_name();
        let mut discovered = Vec::new();
        {
            let mut entities = lock(&self.entities);
            let mut octree = lock(&self.octree);
            for (region, name) in self.discovery.unknown_names(&octree, &listings, &self_name) {
                // Known elsewhere: the position protocol will move it
                if entities.contains_key(&name) {
                    continue;
                }
                if octree.add_name(&region, name.clone()).is_err() {
                    continue;
                }
                let region_text = region.to_string();
                entities.insert(
                    name.clone(),
                    RemoteEntity::discovered(name.clone(), region, self.window.size),
                );
                discovered.push((name, region_text));
            }
        }
        discovered
            .into_iter()
            .map(|(name, region)| {
                self.callbacks.log(LogLevel::Info, format!("discovered {} at {}", name, region));
                self.callbacks.location.on_location(&name, EntityLocation::New);
                name
            })
            .collect()
    }

    // ========================================================================
    // POSITION POLLING
    // ========================================================================

    /// Requests for every entity without an outstanding poll; marks them
    /// in flight.
    pub fn position_targets(&self) -> Vec<(EntityName, Request)> {
        let mut entities = lock(&self.entities);
        let lifetime = self.config.position_timeout();
        entities
            .values_mut()
            .filter(|entity| !entity.in_flight)
            .map(|entity| {
                entity.in_flight = true;
                let mut name = entity.name.position_prefix();
                if let Some(seq) = entity.sequence {
                    name = name.child(self.window.next(seq).to_string());
                }
                (entity.name.clone(), Request::new(name, lifetime))
            })
            .collect()
    }

    /// Applies a position answer for `name`.
    pub fn apply_position_response(&self, name: &EntityName, response: &SignedResponse) {
        let parsed = if self.verified(response) {
            response_sequence(&name.position_prefix(), &response.name)
                .and_then(|seq| PositionPayload::from_bytes(&response.content).map(|p| (seq, p)))
                .map_err(|e| {
                    self.callbacks.log(LogLevel::Warn, format!("discarding position {}: {}", response.name, e));
                })
                .ok()
        } else {
            None
        };

        let outcome = {
            let mut entities = lock(&self.entities);
            let Some(entity) = entities.get_mut(name) else {
                return;
            };
            entity.in_flight = false;
            let Some((seq, payload)) = parsed else {
                return;
            };
            match payload {
                PositionPayload::Reset { sequence, reason } => {
                    tracing::debug!(entity = %name, sequence, reason = %reason, "position reset");
                    entity.sequence = Some(self.window.prev(sequence));
                    entity.timeout_count = 0;
                    return;
                }
                PositionPayload::Position(position) => {
                    if !self.window.is_newer(entity.sequence, seq) {
                        tracing::debug!(entity = %name, seq, last = ?entity.sequence, "stale position ignored");
                        return;
                    }
                    match self.geometry.octant_for_position(&position) {
                        Err(_) => Applied::OutOfWorld(position),
                        Ok(leaf) => {
                            entity.location = EntityLocation::Known(position);
                            entity.sequence = Some(seq);
                            entity.history.record(seq, position);
                            entity.timeout_count = 0;

                            let mut octree = lock(&self.octree);
                            let mut evicted = false;
                            if entity.region.as_ref() != Some(&leaf) {
                                if let Some(old) = entity.region.take() {
                                    octree.remove_name(&old, name);
                                }
                                if octree.is_tracked(&leaf) && octree.add_name(&leaf, name.clone()).is_ok() {
                                    entity.region = Some(leaf.clone());
                                } else {
                                    evicted = true;
                                }
                            }
                            drop(octree);
                            if evicted {
                                entities.remove(name);
                            }
                            Applied::Accepted { position, leaf, evicted }
                        }
                    }
                }
            }
        };

        match outcome {
            Applied::OutOfWorld(position) => self.callbacks.log(
                LogLevel::Warn,
                format!("rejecting out-of-world position {:?} for {}", position, name),
            ),
            Applied::Accepted { position, leaf, evicted } => {
                if evicted {
                    self.callbacks.log(
                        LogLevel::Info,
                        format!("{} left tracked space for {}", name, leaf),
                    );
                }
                self.callbacks.location.on_location(name, EntityLocation::Known(position));
            }
        }
    }

    /// Records an unanswered poll; drops the entity past the threshold.
    ///
    /// Below the threshold the expected sequence is cleared so the next
    /// poll resynchronizes with the bootstrap form.
    pub fn position_timeout(&self, name: &EntityName) {
        let dropped = {
            let mut entities = lock(&self.entities);
            let Some(entity) = entities.get_mut(name) else {
                return;
            };
            entity.in_flight = false;
            entity.timeout_count += 1;
            if entity.timeout_count <= self.config.drop_threshold {
                entity.sequence = None;
                return;
            }
            let Some(mut entity) = entities.remove(name) else {
                return;
            };
            entity.location = EntityLocation::Dropped;
            if let Some(region) = entity.region.take() {
                lock(&self.octree).remove_name(&region, name);
            }
            entity.timeout_count
        };
        self.callbacks.log(
            LogLevel::Info,
            format!("dropped {} after {} timeouts", name, dropped),
        );
        self.callbacks.location.on_location(name, EntityLocation::Dropped);
    }

    /// Entities whose render info has not been asked for yet; marks them.
    pub fn info_targets(&self) -> Vec<(EntityName, Request)> {
        let mut entities = lock(&self.entities);
        let lifetime = self.config.info_timeout();
        entities
            .values_mut()
            .filter(|entity| !entity.info_requested)
            .map(|entity| {
                entity.info_requested = true;
                (entity.name.clone(), Request::new(entity.name.render_info_name(), lifetime))
            })
            .collect()
    }

    /// Hands a verified render tag to the info sink.
    pub fn apply_info_response(&self, name: &EntityName, response: &SignedResponse) {
        if !self.verified(response) {
            return;
        }
        match std::str::from_utf8(&response.content) {
            Ok(tag) => self.callbacks.info.on_render_info(name, tag),
            Err(_) => self.callbacks.log(
                LogLevel::Warn,
                format!("discarding render info for {}: {}", name, WireError::NotUtf8),
            ),
        }
    }

    // ========================================================================
    // TRACKING BOOKKEEPING
    // ========================================================================

    /// Ancestor whose prefix carries the discovery subscription for `leaf`.
    pub fn subscription_for(&self, leaf: &RegionPath) -> RegionPath {
        leaf.ancestor(self.config.subscription_levels_up)
    }

    pub fn has_subscription(&self, ancestor: &RegionPath) -> bool {
        lock(&self.subscriptions).contains_key(ancestor)
    }

    pub fn record_subscription(&self, ancestor: RegionPath, id: RegistrationId) {
        lock(&self.subscriptions).insert(ancestor, id);
    }

    pub fn is_tracked(&self, region: &RegionPath) -> bool {
        lock(&self.octree).is_tracked(region)
    }

    /// Marks `leaf` tracked and appends it to the broadcast set.
    pub fn mark_tracked(&self, leaf: &RegionPath) -> Result<(), SpaceError> {
        if !lock(&self.octree).is_leaf_path(leaf) {
            return Err(SpaceError::InvalidPath(format!("{} is not a leaf", leaf)));
        }
        lock(&self.octree).track(leaf)?;
        let mut broadcast_set = lock(&self.broadcast_set);
        if !broadcast_set.contains(leaf) {
            broadcast_set.push(leaf.clone());
        }
        Ok(())
    }

    /// Stops tracking `leaf`, evicts its remote entities, and returns the
    /// ancestor subscription if nothing under it is tracked anymore.
    pub fn unmark_tracked(&self, leaf: &RegionPath) -> UntrackOutcome {
        let mut outcome = UntrackOutcome::default();
        let mut entities = lock(&self.entities);
        let mut octree = lock(&self.octree);
        if !octree.untrack(leaf) {
            return outcome;
        }

        let leaving: Vec<EntityName> = entities
            .values()
            .filter(|entity| entity.region.as_ref() == Some(leaf))
            .map(|entity| entity.name.clone())
            .collect();
        for name in leaving {
            entities.remove(&name);
            octree.remove_name(leaf, &name);
            outcome.evicted.push(name);
        }

        lock(&self.broadcast_set).retain(|tracked| tracked != leaf);

        let ancestor = self.subscription_for(leaf);
        if !octree.has_tracked_descendants(&ancestor) {
            if let Some(id) = lock(&self.subscriptions).remove(&ancestor) {
                outcome.released = Some((ancestor, id));
            }
        }
        outcome
    }

    /// Removes and returns every subscription.
    pub fn drain_subscriptions(&self) -> Vec<(RegionPath, RegistrationId)> {
        lock(&self.subscriptions).drain().collect()
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    pub fn remote_entities(&self) -> Vec<RemoteEntity> {
        lock(&self.entities).values().cloned().collect()
    }

    pub fn remote_entity(&self, name: &EntityName) -> Option<RemoteEntity> {
        lock(&self.entities).get(name).cloned()
    }

    /// Members of a region (aggregated for internal nodes).
    pub fn region_names(&self, region: &RegionPath) -> Vec<EntityName> {
        lock(&self.octree)
            .aggregate_names(region)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn region_digest(&self, region: &RegionPath) -> Option<u32> {
        lock(&self.octree).digest(region)
    }

    /// Tracked leaves in sweep order.
    pub fn tracked_regions(&self) -> Vec<RegionPath> {
        lock(&self.broadcast_set).clone()
    }

    pub fn subscribed_regions(&self) -> Vec<RegionPath> {
        let mut regions: Vec<RegionPath> = lock(&self.subscriptions).keys().cloned().collect();
        regions.sort();
        regions
    }
}
