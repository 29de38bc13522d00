//! Simulated named-data face with fault injection.
//!
//! Every node gets a [`SimFace`] onto one shared [`SimHub`]. A request is
//! offered to every other node's registration whose prefix matches, each
//! hop passing through the [`SimNetworkController`] (partition, loss,
//! latency). The first non-empty answer inside the request lifetime wins.

use async_trait::async_trait;
use matryoshka_env::{
    EnvError, FaceTransport, Name, NetworkController, NodeId, RegistrationId, Request, RequestHandler,
    SignedResponse,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Per-link latency in milliseconds
    link_latency: Mutex<HashMap<(NodeId, NodeId), u64>>,

    /// Per-link loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(NodeId, NodeId), f64>>,

    /// Loss rate for links without an explicit entry
    default_loss: Mutex<f64>,

    /// Active partitions (nodes that cannot communicate)
    partitions: Mutex<Vec<(Vec<NodeId>, Vec<NodeId>)>>,

    /// Seeded RNG for loss decisions
    rng: Mutex<ChaCha8Rng>,
}

impl SimNetworkController {
    /// Creates a controller whose loss decisions derive from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            default_loss: Mutex::new(0.0),
            partitions: Mutex::new(Vec::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Sets the loss rate of every link without its own setting.
    pub fn set_default_loss(&self, loss_rate: f64) {
        *lock(&self.default_loss) = loss_rate.clamp(0.0, 1.0);
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        let partitions = lock(&self.partitions);
        !partitions.iter().any(|(group_a, group_b)| {
            (group_a.contains(&from) && group_b.contains(&to)) || (group_b.contains(&from) && group_a.contains(&to))
        })
    }

    /// Gets the latency for a link (default 0).
    pub fn latency(&self, from: NodeId, to: NodeId) -> Duration {
        let latencies = lock(&self.link_latency);
        Duration::from_millis(latencies.get(&(from, to)).copied().unwrap_or(0))
    }

    /// Gets the loss rate for a link.
    pub fn loss(&self, from: NodeId, to: NodeId) -> f64 {
        let losses = lock(&self.link_loss);
        losses.get(&(from, to)).copied().unwrap_or_else(|| *lock(&self.default_loss))
    }

    /// Decides whether one message on `from -> to` gets through.
    pub fn delivers(&self, from: NodeId, to: NodeId) -> bool {
        if !self.can_communicate(from, to) {
            return false;
        }
        let loss = self.loss(from, to);
        loss <= 0.0 || !lock(&self.rng).gen_bool(loss)
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        lock(&self.partitions).push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        lock(&self.partitions).clear();
    }

    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64) {
        lock(&self.link_latency).insert((from, to), latency_ms);
    }

    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64) {
        lock(&self.link_loss).insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}

// ============================================================================
// HUB
// ============================================================================

/// Traffic counters of one hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Requests expressed by any face
    pub requests: u64,

    /// Hops lost to partitions or loss
    pub dropped: u64,

    /// Requests answered within their lifetime
    pub answered: u64,
}

struct Route {
    node: NodeId,
    id: RegistrationId,
    prefix: Name,
    handler: Arc<dyn RequestHandler>,
}

/// Shared broker of all simulated faces.
pub struct SimHub {
    routes: Mutex<Vec<Route>>,
    next_id: AtomicU64,
    controller: Arc<SimNetworkController>,

    requests: AtomicU64,
    dropped: AtomicU64,
    answered: AtomicU64,
}

impl SimHub {
    pub fn new(controller: Arc<SimNetworkController>) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            controller,
            requests: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            answered: AtomicU64::new(0),
        })
    }

    /// Opens a face for `node`.
    pub fn face(self: &Arc<Self>, node: NodeId) -> Arc<SimFace> {
        Arc::new(SimFace {
            node,
            hub: Arc::clone(self),
        })
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        lock(&self.routes).len()
    }

    /// Live registrations owned by `node`.
    pub fn registrations_of(&self, node: NodeId) -> Vec<Name> {
        lock(&self.routes)
            .iter()
            .filter(|route| route.node == node)
            .map(|route| route.prefix.clone())
            .collect()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            requests: self.requests.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
        }
    }

    fn matching(&self, from: NodeId, name: &Name) -> Vec<(NodeId, Arc<dyn RequestHandler>)> {
        lock(&self.routes)
            .iter()
            .filter(|route| route.node != from && route.prefix.is_prefix_of(name))
            .map(|route| (route.node, Arc::clone(&route.handler)))
            .collect()
    }

    fn hop(&self, from: NodeId, to: NodeId) -> Option<Duration> {
        if self.controller.delivers(from, to) {
            Some(self.controller.latency(from, to))
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// One node's view of the hub.
pub struct SimFace {
    node: NodeId,
    hub: Arc<SimHub>,
}

#[async_trait]
impl FaceTransport for SimFace {
    async fn express(&self, request: Request) -> Result<Option<SignedResponse>, EnvError> {
        let hub = &self.hub;
        hub.requests.fetch_add(1, Ordering::Relaxed);
        let lifetime = request.lifetime;
        let (tx, mut rx) = mpsc::channel(1);

        for (target, handler) in hub.matching(self.node, &request.name) {
            let Some(outbound) = hub.hop(self.node, target) else {
                continue;
            };
            let hub = Arc::clone(hub);
            let tx = tx.clone();
            let request = request.clone();
            let from = self.node;
            tokio::spawn(async move {
                tokio::time::sleep(outbound).await;
                let Some(response) = handler.on_request(request).await else {
                    return;
                };
                let Some(inbound) = hub.hop(target, from) else {
                    return;
                };
                tokio::time::sleep(inbound).await;
                // Requester may have moved on
                let _ = tx.try_send(response);
            });
        }
        drop(tx);

        let first = async {
            match rx.recv().await {
                Some(response) => Some(response),
                // Nobody will answer; wait out the lifetime like a real face
                None => std::future::pending().await,
            }
        };
        let answer = tokio::time::timeout(lifetime, first).await.ok().flatten();
        if answer.is_some() {
            hub.answered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(answer)
    }

    async fn register_prefix(
        &self,
        prefix: Name,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<RegistrationId, EnvError> {
        let id = RegistrationId(self.hub.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(node = %self.node, prefix = %prefix, id = %id, "register");
        lock(&self.hub.routes).push(Route {
            node: self.node,
            id,
            prefix,
            handler,
        });
        Ok(id)
    }

    async fn unregister_prefix(&self, id: RegistrationId) -> Result<(), EnvError> {
        let mut routes = lock(&self.hub.routes);
        let before = routes.len();
        routes.retain(|route| !(route.id == id && route.node == self.node));
        if routes.len() == before {
            return Err(EnvError::UnknownRegistration(id.0));
        }
        Ok(())
    }

    fn local_id(&self) -> NodeId {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl RequestHandler for Echo {
        async fn on_request(&self, request: Request) -> Option<SignedResponse> {
            Some(SignedResponse {
                name: request.name,
                content: self.0.as_bytes().to_vec(),
                freshness_ms: 0,
                timestamp_ms: 0,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn on_request(&self, _request: Request) -> Option<SignedResponse> {
            None
        }
    }

    fn setup() -> (Arc<SimHub>, Arc<SimFace>, Arc<SimFace>, NodeId, NodeId) {
        let hub = SimHub::new(Arc::new(SimNetworkController::new(7)));
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        let face_a = hub.face(a);
        let face_b = hub.face(b);
        (hub, face_a, face_b, a, b)
    }

    fn request(text: &str) -> Request {
        Request::new(Name::parse(text).unwrap(), Duration::from_millis(500))
    }

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new(1);

        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        let c = NodeId::from_seed(3);

        // Initially all can communicate
        assert!(controller.can_communicate(a, b));
        assert!(controller.can_communicate(b, c));

        // Partition: {a} vs {b, c}
        controller.partition(&[a], &[b, c]);
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(c, a));
        assert!(!controller.delivers(a, c));

        // But b and c can still talk
        assert!(controller.can_communicate(b, c));

        controller.heal_all();
        assert!(controller.can_communicate(a, b));
    }

    #[test]
    fn test_link_settings_override_default() {
        let controller = SimNetworkController::new(1);
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);

        controller.set_default_loss(0.25);
        controller.set_link_loss(a, b, 1.0);
        controller.set_link_latency(a, b, 40);

        assert_eq!(controller.loss(a, b), 1.0);
        assert_eq!(controller.loss(b, a), 0.25);
        assert_eq!(controller.latency(a, b), Duration::from_millis(40));
        assert_eq!(controller.latency(b, a), Duration::ZERO);
        assert!(!controller.delivers(a, b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_express_reaches_prefix_owner_only() {
        let (hub, face_a, face_b, _, _) = setup();
        face_a.register_prefix(Name::parse("/x").unwrap(), Arc::new(Echo("a"))).await.unwrap();
        face_b.register_prefix(Name::parse("/x").unwrap(), Arc::new(Echo("b"))).await.unwrap();

        let answer = face_a.express(request("/x/y")).await.unwrap().unwrap();
        assert_eq!(answer.content, b"b");

        // No matching prefix: waits out the lifetime
        let start = tokio::time::Instant::now();
        assert!(face_a.express(request("/z")).await.unwrap().is_none());
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        assert_eq!(hub.stats(), HubStats { requests: 2, dropped: 0, answered: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_non_empty_answer_wins() {
        let hub = SimHub::new(Arc::new(SimNetworkController::new(7)));
        let asker = hub.face(NodeId::from_seed(1));
        let quiet = hub.face(NodeId::from_seed(2));
        let slow = hub.face(NodeId::from_seed(3));
        quiet.register_prefix(Name::parse("/x").unwrap(), Arc::new(Silent)).await.unwrap();
        slow.register_prefix(Name::parse("/x").unwrap(), Arc::new(Echo("slow"))).await.unwrap();
        hub.controller().set_link_latency(NodeId::from_seed(3), NodeId::from_seed(1), 100);

        let start = tokio::time::Instant::now();
        let answer = asker.express(request("/x")).await.unwrap().unwrap();
        assert_eq!(answer.content, b"slow");
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_past_lifetime_times_out() {
        let (_, face_a, face_b, a, b) = setup();
        face_b.register_prefix(Name::parse("/x").unwrap(), Arc::new(Echo("b"))).await.unwrap();
        face_a.hub.controller().set_link_latency(a, b, 300);
        face_a.hub.controller().set_link_latency(b, a, 300);

        assert!(face_a.express(request("/x")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_blocks_and_unregister_removes() {
        let (hub, face_a, face_b, a, b) = setup();
        let id = face_b.register_prefix(Name::parse("/x").unwrap(), Arc::new(Echo("b"))).await.unwrap();
        assert_eq!(hub.registrations_of(b), vec![Name::parse("/x").unwrap()]);

        hub.controller().partition(&[a], &[b]);
        assert!(face_a.express(request("/x")).await.unwrap().is_none());
        assert_eq!(hub.stats().dropped, 1);
        hub.controller().heal_all();
        assert!(face_a.express(request("/x")).await.unwrap().is_some());

        // Only the owner can remove a registration
        assert!(face_a.unregister_prefix(id).await.is_err());
        face_b.unregister_prefix(id).await.unwrap();
        assert_eq!(hub.registration_count(), 0);
        assert!(matches!(face_b.unregister_prefix(id).await, Err(EnvError::UnknownRegistration(_))));
    }
}
