//! Wall-clock federation context.

use crate::FederationContext;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio::task::JoinHandle;

/// Context for federations that run against real time.
///
/// Every `derive_rng` call returns a fresh, process-seeded stream, so COA
/// draws differ between runs unless the federation config pins a seed.
pub struct TokioContext {
    created: Instant,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
        }
    }

    /// Context behind an `Arc`, ready to hand to a manager or federate.
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
impl FederationContext for TokioContext {
    fn now(&self) -> Duration {
        self.created.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = name.to_string();
        tokio::spawn(async move {
            future.await;
            tracing::trace!(%task, "Task finished");
        })
    }

    fn derive_rng(&self, _seed_extension: u64) -> ChaCha8Rng {
        ChaCha8Rng::from_entropy()
    }

    fn seed(&self) -> u64 {
        0
    }
}
