//! Core environment context trait for federation components.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the time-advance loops,
/// the orchestrator and the participants can run both in production and
/// inside the deterministic simulation harness.
///
/// `TokioContext` runs on wall-clock time with process entropy; the
/// simulator supplies a paused-clock context seeded per run.
///
/// # Determinism
///
/// All methods that would normally introduce non-determinism (time,
/// randomness) are controlled by the implementation.
#[async_trait]
pub trait FederationContext: Send + Sync + 'static {
    /// Monotonic time since the context was created; drives real-time
    /// pacing and the resign timeout.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp join and resign events.
    fn system_time(&self) -> SystemTime;

    /// Waits for `duration` of this context's time.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task and returns its join handle.
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a random source from a seed extension.
    ///
    /// The COA engine draws random durations and probabilistic branches
    /// from the generator returned here. The implementation combines the
    /// global seed with `seed_extension` so that distinct consumers get
    /// distinct but reproducible streams.
    fn derive_rng(&self, seed_extension: u64) -> ChaCha8Rng;

    /// Seed the streams derive from; 0 when the context is unseeded.
    fn seed(&self) -> u64;
}
