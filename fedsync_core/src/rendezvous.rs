//! Rendezvous handoff between a worker and its time-advance loop.
//!
//! A rendezvous is split in two halves: the loop-side [`RendezvousRequest`]
//! that sits in the request queue, and the worker-side [`RendezvousTicket`].
//! Each half owns one end of two single-use slots (grant, then release), so a
//! cycle is always `grant` followed by `release` and never the reverse.
//!
//! ```text
//!  Worker                                       Time-Advance Loop
//!    | submit(t) ──► RequestQueue ───────────────────► pop earliest
//!    | await_grant() ◄────────── grant(t') ──────────── |
//!    |   ... step work at t' ...                        | (waits)
//!    | submit(t + step)                                 |
//!    | release(&next) ─────────────────────────────────►| next cycle
//! ```

use fedsync_env::LogicalTime;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Granted-time sentinel for a request that has not been granted yet.
pub const NOT_GRANTED: LogicalTime = -1.0;

/// Lifecycle signal broadcast by a time-advance loop to its tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// Accepting and granting requests
    Running,

    /// No further requests expected; exit once the queue is empty
    Draining,

    /// Stop now; pending waits return early
    Terminated,
}

impl LoopSignal {
    pub fn is_terminated(self) -> bool {
        self == Self::Terminated
    }

    pub fn accepts_requests(self) -> bool {
        self == Self::Running
    }
}

/// Errors surfaced to worker code by the rendezvous primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("time advance loop terminated")]
    Terminated,

    #[error("time advance loop is no longer accepting requests")]
    NotAccepting,

    #[error("grant already awaited for this request")]
    AlreadyAwaited,

    #[error("request released before it was granted")]
    NotGranted,

    #[error("next request belongs to a different time advance loop")]
    ForeignTicket,
}

/// A rejected release; the ticket is handed back unchanged.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct ReleaseError {
    pub reason: SyncError,
    pub ticket: RendezvousTicket,
}

/// Resolves once the loop is terminated or its signal sender is gone.
pub(crate) async fn terminated(signal: &mut watch::Receiver<LoopSignal>) {
    let _ = signal.wait_for(|s| s.is_terminated()).await;
}

/// Loop-side half of a rendezvous, ordered in the request queue.
#[derive(Debug)]
pub struct RendezvousRequest {
    requested_time: LogicalTime,
    seq: u64,
    grant_tx: oneshot::Sender<LogicalTime>,
    release_rx: oneshot::Receiver<()>,
}

impl RendezvousRequest {
    pub fn requested_time(&self) -> LogicalTime {
        self.requested_time
    }

    /// Submission sequence number, used to break time ties FIFO.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Hands `time` to the worker and returns the slot its release arrives on.
    ///
    /// Returns `None` when the worker already dropped its ticket.
    pub(crate) fn grant(self, time: LogicalTime) -> Option<oneshot::Receiver<()>> {
        match self.grant_tx.send(time) {
            Ok(()) => Some(self.release_rx),
            Err(_) => None,
        }
    }
}

/// Worker-side half of a rendezvous.
///
/// Dropping a granted ticket without releasing it releases the loop.
#[derive(Debug)]
pub struct RendezvousTicket {
    requested_time: LogicalTime,
    granted_time: LogicalTime,
    seq: u64,
    owner: u64,
    grant_rx: Option<oneshot::Receiver<LogicalTime>>,
    release_tx: oneshot::Sender<()>,
    signal: watch::Receiver<LoopSignal>,
}

/// Creates both halves of a rendezvous for the loop identified by `owner`.
pub(crate) fn rendezvous(
    requested_time: LogicalTime,
    seq: u64,
    owner: u64,
    signal: watch::Receiver<LoopSignal>,
) -> (RendezvousRequest, RendezvousTicket) {
    let (grant_tx, grant_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let request = RendezvousRequest {
        requested_time,
        seq,
        grant_tx,
        release_rx,
    };
    let ticket = RendezvousTicket {
        requested_time,
        granted_time: NOT_GRANTED,
        seq,
        owner,
        grant_rx: Some(grant_rx),
        release_tx,
        signal,
    };
    (request, ticket)
}

impl RendezvousTicket {
    pub fn requested_time(&self) -> LogicalTime {
        self.requested_time
    }

    /// Granted time, or `None` while [`NOT_GRANTED`].
    pub fn granted_time(&self) -> Option<LogicalTime> {
        if self.granted_time == NOT_GRANTED {
            None
        } else {
            Some(self.granted_time)
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits until the loop grants this request.
    ///
    /// Cancel-safe: dropping the returned future before completion leaves the
    /// ticket waiting. Returns [`SyncError::Terminated`] as soon as the loop
    /// is terminated.
    pub async fn await_grant(&mut self) -> Result<LogicalTime, SyncError> {
        let mut signal = self.signal.clone();
        let outcome = {
            let grant = self.grant_rx.as_mut().ok_or(SyncError::AlreadyAwaited)?;
            tokio::select! {
                biased;
                granted = grant => Some(granted),
                _ = terminated(&mut signal) => None,
            }
        };

        match outcome {
            Some(Ok(time)) => {
                self.grant_rx = None;
                self.granted_time = time;
                Ok(time)
            }
            Some(Err(_)) => {
                self.grant_rx = None;
                Err(SyncError::Terminated)
            }
            None => Err(SyncError::Terminated),
        }
    }

    /// Lets the loop proceed past this grant.
    ///
    /// `next` is the worker's follow-up request, which must already be
    /// submitted to the same loop; requiring it here keeps the loop from
    /// advancing past a time the worker has not scheduled.
    pub fn release(self, next: &RendezvousTicket) -> Result<(), ReleaseError> {
        if next.owner != self.owner {
            return Err(ReleaseError {
                reason: SyncError::ForeignTicket,
                ticket: self,
            });
        }
        if self.granted_time().is_none() {
            return Err(ReleaseError {
                reason: SyncError::NotGranted,
                ticket: self,
            });
        }
        // The loop may already have been terminated
        let _ = self.release_tx.send(());
        Ok(())
    }

    /// Releases the last grant of a worker that submits nothing further.
    pub fn release_final(self) {
        let _ = self.release_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_then_release_alternates() {
        let (_signal_tx, signal) = watch::channel(LoopSignal::Running);
        let (request, mut ticket) = rendezvous(3.0, 0, 1, signal.clone());
        let (_next_request, next) = rendezvous(4.0, 1, 1, signal);

        assert_eq!(ticket.granted_time(), None);
        let release = request.grant(3.0).unwrap();
        assert_eq!(ticket.await_grant().await, Ok(3.0));
        assert_eq!(ticket.granted_time(), Some(3.0));

        ticket.release(&next).unwrap();
        assert!(release.await.is_ok());
    }

    #[tokio::test]
    async fn test_release_rejects_foreign_ticket() {
        let (_signal_tx, signal) = watch::channel(LoopSignal::Running);
        let (request, mut ticket) = rendezvous(1.0, 0, 1, signal.clone());
        let (_other_request, other) = rendezvous(2.0, 0, 2, signal);

        let _release = request.grant(1.0).unwrap();
        ticket.await_grant().await.unwrap();

        let err = ticket.release(&other).unwrap_err();
        assert_eq!(err.reason, SyncError::ForeignTicket);
        assert_eq!(err.ticket.granted_time(), Some(1.0));
    }

    #[tokio::test]
    async fn test_release_before_grant_rejected() {
        let (_signal_tx, signal) = watch::channel(LoopSignal::Running);
        let (_request, ticket) = rendezvous(1.0, 0, 1, signal.clone());
        let (_next_request, next) = rendezvous(2.0, 1, 1, signal);

        let err = ticket.release(&next).unwrap_err();
        assert_eq!(err.reason, SyncError::NotGranted);
    }

    #[tokio::test]
    async fn test_await_grant_returns_on_terminate() {
        let (signal_tx, signal) = watch::channel(LoopSignal::Running);
        let (_request, mut ticket) = rendezvous(1.0, 0, 1, signal);

        let waiter = tokio::spawn(async move { ticket.await_grant().await });
        signal_tx.send_replace(LoopSignal::Terminated);

        assert_eq!(waiter.await.unwrap(), Err(SyncError::Terminated));
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_loop() {
        let (_signal_tx, signal) = watch::channel(LoopSignal::Running);
        let (request, ticket) = rendezvous(1.0, 0, 1, signal);

        let release = request.grant(1.0).unwrap();
        drop(ticket);

        assert!(release.await.is_err());
    }
}
