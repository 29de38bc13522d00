//! Simulation context implementing SyncContext for deterministic testing.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use matryoshka_env::SyncContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::Instrument;

/// Simulation context backed by the tokio clock and a fixed seed.
///
/// Run it inside a runtime built with `start_paused(true)`: virtual time
/// then only moves when every task is blocked on a timer, so a 30 second
/// scenario completes instantly and always interleaves the same way.
///
/// - Monotonic time is measured from context creation on the tokio clock
/// - Wall time is a fixed epoch plus monotonic time
/// - Keys come from ChaCha8 seeded by the master seed and an extension
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Virtual time zero
    start: Instant,

    /// Wall-clock time at virtual time zero
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }
}

#[async_trait]
impl SyncContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(tracing::info_span!("task", name = %name)));
    }

    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey {
        // Combine master seed with extension for deterministic key
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95) ^ seed_extension;
        let mut key_rng = ChaCha8Rng::seed_from_u64(combined_seed);
        SigningKey::generate(&mut key_rng)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
