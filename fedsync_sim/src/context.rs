//! Virtual-clock context for simulated federations.

use async_trait::async_trait;
use fedsync_env::FederationContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Wall-clock reading of virtual time zero (2024-01-01T00:00:00Z).
const VIRTUAL_EPOCH_SECS: u64 = 1_704_067_200;

/// Multiplier spreading the run seed before a stream id is mixed in.
const STREAM_MIX: u64 = 0x517c_c1b7_2722_0a95;

/// Federation context of one simulated run.
///
/// Time is the Tokio clock, which the harness keeps paused so that it only
/// jumps forward once every task is blocked, plus whatever `advance_time`
/// added by hand. Every random consumer gets its own ChaCha8 stream derived
/// from the run seed, so join stamps, COA draws and federate ids replay
/// exactly.
pub struct SimContext {
    seed: u64,
    start: Instant,

    /// Shared between clones
    offset: Arc<Mutex<Duration>>,

    /// What `system_time` reports at virtual time zero
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            epoch: UNIX_EPOCH + Duration::from_secs(VIRTUAL_EPOCH_SECS),
        }
    }

    /// Context behind an `Arc`, the form the manager and participants take.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Jumps this context (and its clones) forward without sleeping.
    pub fn advance_time(&self, duration: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += duration;
    }

    /// Virtual time elapsed since creation, in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.now().as_nanos() as u64
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            offset: Arc::clone(&self.offset),
            ..*self
        }
    }
}

#[async_trait]
impl FederationContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed() + self.offset()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Resolves as soon as all tasks idle when the runtime is paused
        tokio::time::sleep(duration).await
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "Spawning simulated task");
        tokio::spawn(future)
    }

    fn derive_rng(&self, seed_extension: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(STREAM_MIX) ^ seed_extension)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
