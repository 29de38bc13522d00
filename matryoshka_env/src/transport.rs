//! Named request/response transport abstraction for Matryoshka peers.

use std::sync::Arc;

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{Name, NodeId, RegistrationId, Request, SignedResponse};

/// Answers requests that arrive under a registered prefix.
///
/// Returning `None` publishes nothing; the requester will observe a
/// timeout. Handlers may suspend (e.g. to defer an answer) but must not
/// outlive the request lifetime by much, since late answers are dropped.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn on_request(&self, request: Request) -> Option<SignedResponse>;
}

/// Abstraction for the publish/subscribe face shared by all peers.
///
/// # Implementations
///
/// - **Production**: a named-data forwarder client
/// - **Simulation**: `SimFace`, an in-memory hub with latency/loss/partitions
///
/// # Request Flow
///
/// ```text
/// Peer A                      Face                       Peer B
///   |                           |                          |
///   |-- express(/x/y/z) ------->|                          |
///   |                           |-- prefix match /x/y ---->|
///   |                           |                          |-- on_request()
///   |                           |<------- response --------|
///   |<-- Some(response) --------|                          |
/// ```
#[async_trait]
pub trait FaceTransport: Send + Sync + 'static {
    /// Expresses a request and waits for the first response.
    ///
    /// # Returns
    /// * `Ok(Some(response))` - a matching response arrived within the lifetime
    /// * `Ok(None)` - the lifetime elapsed without an answer
    /// * `Err(EnvError::NetworkError)` - the face itself is unusable
    async fn express(&self, request: Request) -> Result<Option<SignedResponse>, EnvError>;
    
    /// Registers `handler` for every request whose name starts with `prefix`.
    ///
    /// A node never receives its own requests through its registrations.
    async fn register_prefix(
        &self,
        prefix: Name,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<RegistrationId, EnvError>;
    
    /// Removes a registration made by `register_prefix`.
    async fn unregister_prefix(&self, id: RegistrationId) -> Result<(), EnvError>;
    
    /// Returns this node's ID.
    fn local_id(&self) -> NodeId;
}

/// Marker trait for network controllers in simulation.
///
/// Allows injecting faults like partitions and latency.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);
    
    /// Heals all partitions.
    fn heal_all(&self);
    
    /// Sets latency for a specific link.
    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64);
    
    /// Sets loss probability for a link (0.0 - 1.0), applied per message.
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);
}
