//! Peer Instance - orchestrates discovery, polling and publishing.
//!
//! This module is the integration layer between the synchronous protocol
//! state ([`PeerState`]) and the environment abstraction
//! ([`SyncContext`], [`FaceTransport`]).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PeerInstance                          │
//! │                                                              │
//! │  discovery loop ──┐    position loop ──┐   publish loop ──┐  │
//! │   (per interval)  │     (per interval) │    (per tick)    │  │
//! │                   ▼                    ▼                  ▼  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ PeerState: local | entities | octree | broadcast | subs│  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                   ▲                    ▲                     │
//! │   DiscoveryHandler (per subscription)  PlayerHandler (self)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All three loops race every wait against one cancellation token, so
//! [`PeerInstance::shutdown`] abandons in-flight requests and returns once
//! every loop has exited.
//!
//! # Usage
//!
//! ```ignore
//! let instance = PeerInstance::new(ctx, face, InstanceConfig::default(), "alice", spawn, signer, callbacks)?;
//! instance.start().await?;
//! instance.set_local_position(next)?;
//! instance.shutdown().await;
//! ```

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use matryoshka_env::{FaceTransport, RegistrationId, Request, RequestHandler, SignedResponse, SyncContext};
use nalgebra::Vector3;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::callbacks::{Callbacks, LogLevel};
use crate::config::InstanceConfig;
use crate::entity::{EntityName, RemoteEntity};
use crate::error::{SpaceError, SyncError};
use crate::position::{PlayerQuery, PositionReply};
use crate::space::RegionPath;
use crate::state::{lock, PeerState};
use crate::trust::ResponseSigner;

fn timestamp_ms<Ctx: SyncContext>(ctx: &Ctx) -> u64 {
    ctx.system_time()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// REQUEST HANDLERS
// ============================================================================

/// Answers position and render-info requests about the local entity.
struct PlayerHandler<Ctx: SyncContext> {
    context: Arc<Ctx>,
    state: Arc<PeerState>,
}

#[async_trait]
impl<Ctx: SyncContext> RequestHandler for PlayerHandler<Ctx> {
    async fn on_request(&self, request: Request) -> Option<SignedResponse> {
        let prefix = self.state.local_name().player_prefix();
        let query = match PlayerQuery::from_name(&prefix, &request.name) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!(name = %request.name, error = %e, "ignoring player request");
                return None;
            }
        };
        match query {
            PlayerQuery::RenderInfo => {
                self.state.sign_render_info(&request.name, timestamp_ms(&*self.context))
            }
            PlayerQuery::Position(requested) => {
                let mut retries = self.state.config().ahead_retries;
                loop {
                    match self.state.position_reply(requested) {
                        PositionReply::Reply { sequence, payload } => {
                            return self.state.sign_position(sequence, &payload, timestamp_ms(&*self.context));
                        }
                        PositionReply::Silent => return None,
                        PositionReply::Defer if retries > 0 => {
                            retries -= 1;
                            self.context.sleep(self.state.config().position_interval()).await;
                        }
                        PositionReply::Defer => {
                            tracing::debug!(requested = ?requested, "request still ahead, not answering");
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Answers discovery requests under one subscribed ancestor.
struct DiscoveryHandler<Ctx: SyncContext> {
    context: Arc<Ctx>,
    state: Arc<PeerState>,
}

#[async_trait]
impl<Ctx: SyncContext> RequestHandler for DiscoveryHandler<Ctx> {
    async fn on_request(&self, request: Request) -> Option<SignedResponse> {
        self.state.answer_discovery(&request, timestamp_ms(&*self.context))
    }
}

// ============================================================================
// INSTANCE
// ============================================================================

struct Inner<Ctx: SyncContext, T: FaceTransport> {
    context: Arc<Ctx>,
    transport: Arc<T>,
    state: Arc<PeerState>,
    cancel: CancellationToken,

    /// Serializes track/untrack so one ancestor is registered once
    track_lock: tokio::sync::Mutex<()>,

    player_registration: Mutex<Option<RegistrationId>>,
    started: AtomicBool,

    /// Cloned into every spawned loop; `stopped` closes when all are gone
    alive: Mutex<Option<mpsc::Sender<()>>>,
    stopped: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

/// A running peer. Cheap to clone; clones share the same peer.
///
/// Generic over the context and transport so the same code runs against
/// a production face or the in-memory simulation hub.
pub struct PeerInstance<Ctx: SyncContext, T: FaceTransport> {
    inner: Arc<Inner<Ctx, T>>,
}

impl<Ctx: SyncContext, T: FaceTransport> Clone for PeerInstance<Ctx, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Ctx, T> PeerInstance<Ctx, T>
where
    Ctx: SyncContext,
    T: FaceTransport,
{
    /// Creates an instance with the local player `local_id` at `position`.
    ///
    /// Nothing touches the transport until [`start`](Self::start).
    pub fn new(
        context: Arc<Ctx>,
        transport: Arc<T>,
        config: InstanceConfig,
        local_id: &str,
        position: Vector3<f32>,
        signer: Arc<dyn ResponseSigner>,
        callbacks: Callbacks,
    ) -> Result<Self, SyncError> {
        let state = Arc::new(PeerState::new(config, local_id, position, signer, callbacks)?);
        let (alive, stopped) = mpsc::channel(1);
        Ok(Self {
            inner: Arc::new(Inner {
                context,
                transport,
                state,
                cancel: CancellationToken::new(),
                track_lock: tokio::sync::Mutex::new(()),
                player_registration: Mutex::new(None),
                started: AtomicBool::new(false),
                alive: Mutex::new(Some(alive)),
                stopped: tokio::sync::Mutex::new(stopped),
            }),
        })
    }

    pub fn state(&self) -> &Arc<PeerState> {
        &self.inner.state
    }

    pub fn local_name(&self) -> EntityName {
        self.inner.state.local_name()
    }

    pub fn local_position(&self) -> Vector3<f32> {
        self.inner.state.local_snapshot().position
    }

    /// Moves the local avatar; picked up by the next publish tick.
    pub fn set_local_position(&self, position: Vector3<f32>) -> Result<(), SyncError> {
        Ok(self.inner.state.set_local_position(position)?)
    }

    pub fn remote_entities(&self) -> Vec<RemoteEntity> {
        self.inner.state.remote_entities()
    }

    pub fn region_names(&self, region: &RegionPath) -> Vec<EntityName> {
        self.inner.state.region_names(region)
    }

    pub fn tracked_regions(&self) -> Vec<RegionPath> {
        self.inner.state.tracked_regions()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    /// Registers the local player prefix, publishes the first position,
    /// tracks the starting leaf, and spawns the three loops.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }
        let state = &self.inner.state;

        let leaf = match self.announce().await {
            Ok(leaf) => leaf,
            Err(e) => {
                // Leave the instance startable again
                let player = lock(&self.inner.player_registration).take();
                if let Some(id) = player {
                    if let Err(e) = self.inner.transport.unregister_prefix(id).await {
                        tracing::warn!(error = %e, "unregister of player prefix failed");
                    }
                }
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let this = self.clone();
        self.spawn_tracked("discovery", async move { this.discovery_loop().await });
        let this = self.clone();
        self.spawn_tracked("position", async move { this.position_loop().await });
        let this = self.clone();
        self.spawn_tracked("publish", async move { this.publish_loop().await });

        state.callbacks().log(
            LogLevel::Info,
            format!("{} started at {}", state.local_name(), leaf),
        );
        Ok(())
    }

    /// Registers the player prefix, publishes the first position, and tracks
    /// the starting leaf.
    async fn announce(&self) -> Result<RegionPath, SyncError> {
        let state = &self.inner.state;
        let handler = Arc::new(PlayerHandler {
            context: Arc::clone(&self.inner.context),
            state: Arc::clone(state),
        });
        let id = self
            .inner
            .transport
            .register_prefix(state.local_name().player_prefix(), handler)
            .await?;
        *lock(&self.inner.player_registration) = Some(id);

        state.publish_tick();
        let leaf = state.local_snapshot().region;
        self.track_region(&leaf).await?;
        Ok(leaf)
    }

    /// Cancels every loop, waits for them to exit, and releases all
    /// registrations. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.alive).take();
        {
            let mut stopped = self.inner.stopped.lock().await;
            while stopped.recv().await.is_some() {}
        }

        let transport = &self.inner.transport;
        for (region, id) in self.inner.state.drain_subscriptions() {
            if let Err(e) = transport.unregister_prefix(id).await {
                tracing::warn!(region = %region, error = %e, "unregister failed");
            }
        }
        let player = lock(&self.inner.player_registration).take();
        if let Some(id) = player {
            if let Err(e) = transport.unregister_prefix(id).await {
                tracing::warn!(error = %e, "unregister of player prefix failed");
            }
        }
        tracing::debug!(entity = %self.local_name(), "instance stopped");
    }

    // ========================================================================
    // TRACKING
    // ========================================================================

    /// Starts answering and sweeping `leaf`.
    ///
    /// The discovery subscription for the leaf's ancestor is registered
    /// first; if that fails the leaf stays untracked.
    pub async fn track_region(&self, leaf: &RegionPath) -> Result<(), SyncError> {
        let state = &self.inner.state;
        if leaf.depth() != state.geometry().depth() {
            return Err(SpaceError::InvalidPath(format!("{} is not a leaf", leaf)).into());
        }
        let _guard = self.inner.track_lock.lock().await;
        if state.is_tracked(leaf) {
            return Ok(());
        }

        let ancestor = state.subscription_for(leaf);
        if !state.has_subscription(&ancestor) {
            let handler = Arc::new(DiscoveryHandler {
                context: Arc::clone(&self.inner.context),
                state: Arc::clone(state),
            });
            let prefix = state.region_prefix(&ancestor);
            match self.inner.transport.register_prefix(prefix.clone(), handler).await {
                Ok(id) => state.record_subscription(ancestor, id),
                Err(e) => {
                    state.callbacks().log(
                        LogLevel::Error,
                        format!("cannot subscribe {} for {}: {}", prefix, leaf, e),
                    );
                    return Err(e.into());
                }
            }
        }
        state.mark_tracked(leaf)?;
        tracing::info!(region = %leaf, "tracking region");
        Ok(())
    }

    /// Stops tracking `leaf`, evicting its remote entities and releasing the
    /// ancestor subscription once nothing under it is tracked.
    pub async fn untrack_region(&self, leaf: &RegionPath) -> Result<(), SyncError> {
        let _guard = self.inner.track_lock.lock().await;
        let outcome = self.inner.state.unmark_tracked(leaf);
        for name in &outcome.evicted {
            tracing::debug!(entity = %name, region = %leaf, "evicted with region");
        }
        if let Some((ancestor, id)) = outcome.released {
            tracing::info!(region = %ancestor, "releasing discovery subscription");
            self.inner.transport.unregister_prefix(id).await?;
        }
        Ok(())
    }

    // ========================================================================
    // LOOPS
    // ========================================================================

    fn spawn_tracked<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Already shutting down
        let Some(alive) = lock(&self.inner.alive).clone() else {
            return;
        };
        self.inner.context.spawn(name, async move {
            future.await;
            drop(alive);
        });
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            _ = self.inner.context.sleep(duration) => true,
        }
    }

    async fn discovery_loop(&self) {
        let interval = self.inner.state.config().broadcast_interval();
        loop {
            let started = self.inner.context.now();
            if self.discovery_sweep().await.is_break() {
                break;
            }
            let elapsed = self.inner.context.now().saturating_sub(started);
            if !self.pause(interval.saturating_sub(elapsed)).await {
                break;
            }
        }
        tracing::debug!("discovery loop stopped");
    }

    /// One pass over a snapshot of the broadcast set, one request at a time.
    pub async fn discovery_sweep(&self) -> ControlFlow<()> {
        let state = &self.inner.state;
        for target in state.sweep_targets() {
            let request = state.discovery_request(&target);
            let name = request.name.clone();
            let result = tokio::select! {
                _ = self.inner.cancel.cancelled() => return ControlFlow::Break(()),
                result = self.inner.transport.express(request) => result,
            };
            match result {
                Ok(Some(response)) => {
                    state.apply_discovery_response(&response);
                }
                Ok(None) => tracing::trace!(name = %name, "no discovery answer"),
                Err(e) => tracing::warn!(name = %name, error = %e, "discovery request failed"),
            }
        }
        ControlFlow::Continue(())
    }

    async fn position_loop(&self) {
        let interval = self.inner.state.config().position_interval();
        loop {
            let started = self.inner.context.now();
            self.fetch_render_info();
            if self.position_sweep().await.is_break() {
                break;
            }
            let elapsed = self.inner.context.now().saturating_sub(started);
            if !self.pause(interval.saturating_sub(elapsed)).await {
                break;
            }
        }
        tracing::debug!("position loop stopped");
    }

    /// Polls every idle remote entity concurrently and applies the outcomes.
    pub async fn position_sweep(&self) -> ControlFlow<()> {
        let state = &self.inner.state;
        let mut polls = JoinSet::new();
        for (name, request) in state.position_targets() {
            let transport = Arc::clone(&self.inner.transport);
            polls.spawn(async move {
                let result = transport.express(request).await;
                (name, result)
            });
        }
        loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    polls.abort_all();
                    return ControlFlow::Break(());
                }
                next = polls.join_next() => next,
            };
            match next {
                None => break,
                Some(Ok((name, Ok(Some(response))))) => state.apply_position_response(&name, &response),
                Some(Ok((name, Ok(None)))) => state.position_timeout(&name),
                Some(Ok((name, Err(e)))) => {
                    tracing::warn!(entity = %name, error = %e, "position request failed");
                    state.position_timeout(&name);
                }
                Some(Err(e)) => tracing::error!(error = %e, "position poll task failed"),
            }
        }
        ControlFlow::Continue(())
    }

    /// Asks each newly discovered entity for its render info, once.
    fn fetch_render_info(&self) {
        for (name, request) in self.inner.state.info_targets() {
            let this = self.clone();
            self.spawn_tracked("render-info", async move {
                let result = tokio::select! {
                    _ = this.inner.cancel.cancelled() => return,
                    result = this.inner.transport.express(request) => result,
                };
                match result {
                    Ok(Some(response)) => this.inner.state.apply_info_response(&name, &response),
                    Ok(None) => tracing::debug!(entity = %name, "no render info"),
                    Err(e) => tracing::warn!(entity = %name, error = %e, "render info request failed"),
                }
            });
        }
    }

    async fn publish_loop(&self) {
        let interval = self.inner.state.config().position_interval();
        while self.pause(interval).await {
            self.publish_once().await;
        }
        tracing::debug!("publish loop stopped");
    }

    /// Advances the local sequence and tracks the local leaf if it changed.
    pub async fn publish_once(&self) {
        if let Some(leaf) = self.inner.state.publish_tick() {
            if let Err(e) = self.track_region(&leaf).await {
                tracing::warn!(region = %leaf, error = %e, "cannot track new local region");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::InfoSink;
    use crate::entity::EntityLocation;
    use crate::space::WorldGeometry;
    use crate::trust::Ed25519Signer;
    use ed25519_dalek::SigningKey;
    use matryoshka_env::{EnvError, Name, NodeId, TokioContext};
    use rand::rngs::OsRng;
    use std::sync::atomic::AtomicU64;

    /// Minimal in-process face: handlers are tried in registration order.
    #[derive(Default)]
    struct Hub {
        routes: Mutex<Vec<(NodeId, RegistrationId, Name, Arc<dyn RequestHandler>)>>,
        next_id: AtomicU64,
        refused: Mutex<Option<Name>>,
    }

    struct Face {
        node: NodeId,
        hub: Arc<Hub>,
    }

    #[async_trait]
    impl FaceTransport for Face {
        async fn express(&self, request: Request) -> Result<Option<SignedResponse>, EnvError> {
            let handlers: Vec<Arc<dyn RequestHandler>> = self
                .hub
                .routes
                .lock()
                .unwrap()
                .iter()
                .filter(|(node, _, prefix, _)| *node != self.node && prefix.is_prefix_of(&request.name))
                .map(|(_, _, _, handler)| Arc::clone(handler))
                .collect();
            let lifetime = request.lifetime;
            let attempt = async move {
                for handler in handlers {
                    if let Some(response) = handler.on_request(request.clone()).await {
                        return Some(response);
                    }
                }
                // Nobody answers: wait out the lifetime like a real face
                std::future::pending::<Option<SignedResponse>>().await
            };
            Ok(tokio::time::timeout(lifetime, attempt).await.ok().flatten())
        }

        async fn register_prefix(
            &self,
            prefix: Name,
            handler: Arc<dyn RequestHandler>,
        ) -> Result<RegistrationId, EnvError> {
            if let Some(refused) = self.hub.refused.lock().unwrap().as_ref() {
                if refused.is_prefix_of(&prefix) {
                    return Err(EnvError::registration(&prefix, "refused"));
                }
            }
            let id = RegistrationId(self.hub.next_id.fetch_add(1, Ordering::SeqCst));
            self.hub.routes.lock().unwrap().push((self.node, id, prefix, handler));
            Ok(id)
        }

        async fn unregister_prefix(&self, id: RegistrationId) -> Result<(), EnvError> {
            self.hub.routes.lock().unwrap().retain(|(_, rid, _, _)| *rid != id);
            Ok(())
        }

        fn local_id(&self) -> NodeId {
            self.node
        }
    }

    #[derive(Default)]
    struct RenderTags(Mutex<Vec<(EntityName, String)>>);

    impl InfoSink for RenderTags {
        fn on_render_info(&self, name: &EntityName, render_tag: &str) {
            self.0.lock().unwrap().push((name.clone(), render_tag.to_string()));
        }
    }

    type TestPeer = PeerInstance<TokioContext, Face>;

    fn r1_center() -> Vector3<f32> {
        let leaf = RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap();
        WorldGeometry::default().region_for_path(&leaf).unwrap().center()
    }

    fn peer(hub: &Arc<Hub>, seed: u64, id: &str, position: Vector3<f32>, callbacks: Callbacks) -> TestPeer {
        let face = Arc::new(Face { node: NodeId::from_seed(seed), hub: Arc::clone(hub) });
        let signer = Arc::new(Ed25519Signer::new(SigningKey::generate(&mut OsRng)));
        PeerInstance::new(
            TokioContext::shared(),
            face,
            InstanceConfig::default(),
            id,
            position,
            signer,
            callbacks,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_peers_discover_each_other() {
        let hub = Arc::new(Hub::default());
        let tags = Arc::new(RenderTags::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default().with_info(tags.clone()));
        let b = peer(&hub, 2, "b", r1_center().add_scalar(3.0), Callbacks::default());
        a.start().await.unwrap();
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        let known = a.remote_entities();
        assert_eq!(known.len(), 1);
        assert_eq!(&known[0].name, &b.local_name());
        assert_eq!(known[0].location, EntityLocation::Known(b.local_position()));
        assert_eq!(b.remote_entities().len(), 1);

        let leaf = RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap();
        let names = a.region_names(&leaf);
        assert!(names.contains(&a.local_name()) && names.contains(&b.local_name()));

        assert_eq!(*tags.0.lock().unwrap(), vec![(b.local_name(), "default".to_string())]);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_positions_follow_movement() {
        let hub = Arc::new(Hub::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default());
        let b = peer(&hub, 2, "b", r1_center(), Callbacks::default());
        a.start().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let moved = r1_center().add_scalar(10.0);
        b.set_local_position(moved).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let seen = a.state().remote_entity(&b.local_name()).unwrap();
        assert_eq!(seen.location, EntityLocation::Known(moved));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_dropped() {
        let hub = Arc::new(Hub::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default());
        let b = peer(&hub, 2, "b", r1_center(), Callbacks::default());
        a.start().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(a.remote_entities().len(), 1);

        b.shutdown().await;
        // 21 unanswered polls at one timeout each
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(a.remote_entities().is_empty());
        assert!(!a.region_names(&RegionPath::root()).contains(&b.local_name()));
        a.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails_and_shutdown_unregisters() {
        let hub = Arc::new(Hub::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default());
        a.start().await.unwrap();
        assert!(a.is_running());
        assert!(matches!(a.start().await, Err(SyncError::AlreadyStarted)));
        // Player prefix plus one discovery subscription
        assert_eq!(hub.routes.lock().unwrap().len(), 2);

        a.shutdown().await;
        assert!(!a.is_running());
        assert!(hub.routes.lock().unwrap().is_empty());
        a.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_can_be_retried() {
        let hub = Arc::new(Hub::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default());
        *hub.refused.lock().unwrap() = Some(InstanceConfig::default().broadcast_name().unwrap());

        assert!(matches!(a.start().await, Err(SyncError::Env(_))));
        assert!(!a.is_running());
        assert!(a.tracked_regions().is_empty());
        assert!(hub.routes.lock().unwrap().is_empty());

        *hub.refused.lock().unwrap() = None;
        a.start().await.unwrap();
        assert!(a.is_running());
        assert_eq!(hub.routes.lock().unwrap().len(), 2);
        a.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_home_leaf_stays_untracked() {
        let hub = Arc::new(Hub::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default());
        let leaf = RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap();
        a.start().await.unwrap();
        assert_eq!(a.tracked_regions(), vec![leaf.clone()]);

        a.untrack_region(&leaf).await.unwrap();
        a.publish_once().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(a.tracked_regions().is_empty());
        // Only the player prefix is left
        assert_eq!(hub.routes.lock().unwrap().len(), 1);
        a.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_and_untrack_share_ancestor_subscription() {
        let hub = Arc::new(Hub::default());
        let a = peer(&hub, 1, "a", r1_center(), Callbacks::default());
        let leaf = RegionPath::new(vec![2, 4, 1, 0, 6, 3, 1]).unwrap();
        let sibling = leaf.parent().unwrap().child(6).unwrap();

        a.track_region(&leaf).await.unwrap();
        a.track_region(&sibling).await.unwrap();
        assert_eq!(hub.routes.lock().unwrap().len(), 1);
        assert_eq!(a.tracked_regions(), vec![leaf.clone(), sibling.clone()]);

        a.untrack_region(&leaf).await.unwrap();
        assert_eq!(hub.routes.lock().unwrap().len(), 1);
        a.untrack_region(&sibling).await.unwrap();
        assert!(hub.routes.lock().unwrap().is_empty());

        assert!(a.track_region(&leaf.parent().unwrap()).await.is_err());
    }
}
