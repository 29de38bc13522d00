//! Core environment context trait for Matryoshka peers.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the sync loops can run
/// in both production (tokio) and simulation (seeded, paused clock).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `OsRng`
/// - **Simulation**: `SimContext` - paused tokio clock, `ChaCha8Rng(seed)`
#[async_trait]
pub trait SyncContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Drives poll bookkeeping and the "sleep the rest of the interval"
    /// arithmetic of every loop.
    fn now(&self) -> Duration;
    
    /// Returns the wall-clock time used to stamp signed responses.
    fn system_time(&self) -> SystemTime;
    
    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);
    
    /// Spawns a background task.
    ///
    /// `name` identifies the loop in logs; implementations run the task
    /// inside a `task` span carrying it.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
    
    /// Generates a deterministic keypair from a seed extension.
    ///
    /// The implementation combines the global seed with `seed_extension`
    /// to derive unique but reproducible keys.
    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey;
    
    /// Returns the context's seed (0 in production).
    fn seed(&self) -> u64;
}
