//! Production implementation of SyncContext using Tokio.

use crate::SyncContext;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::Instrument;

/// Production context backed by Tokio and OS entropy.
///
/// Monotonic time follows the tokio clock (so paused test runtimes
/// advance it), wall time the system clock, randomness OsRng.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
    
    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
    
    fn system_time(&self) -> SystemTime {
        SystemTime::now()
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
    
    fn derive_signing_key(&self, _seed_extension: u64) -> SigningKey {
        // In production, generate a truly random key
        use rand::rngs::OsRng;
        SigningKey::generate(&mut OsRng)
    }
    
    fn seed(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();
        
        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }
    
    #[tokio::test]
    async fn test_tokio_context_keypair() {
        let ctx = TokioContext::new();
        let key1 = ctx.derive_signing_key(1);
        let key2 = ctx.derive_signing_key(1);
        
        // In production, keys should be different (random)
        assert_ne!(key1.to_bytes(), key2.to_bytes());
    }
    
    #[tokio::test]
    async fn test_tokio_context_spawn_runs_task() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("worker", async move {
            let _ = tx.send(42u32);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }
    
    #[tokio::test]
    async fn test_tokio_context_spawn_enters_named_span() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("discovery", async move {
            let span = tracing::Span::current();
            let _ = tx.send(span.metadata().map(|m| m.name()));
        });
        assert_eq!(rx.await.unwrap(), Some("task"));
    }
}
