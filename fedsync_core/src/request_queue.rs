//! Time-ordered queue of pending rendezvous requests.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};

use fedsync_env::LogicalTime;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::rendezvous::RendezvousRequest;

/// Heap entry; reverses the natural order so `BinaryHeap` pops the minimum.
#[derive(Debug)]
struct Queued(RendezvousRequest);

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .requested_time()
            .total_cmp(&self.0.requested_time())
            .then_with(|| other.0.seq().cmp(&self.0.seq()))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

/// Unbounded priority queue of requests, earliest requested time first.
///
/// Requests with equal times leave in submission order (by sequence
/// number). Producers only hold the lock for a push; the single consumer
/// is woken through a [`Notify`] permit.
#[derive(Debug, Default)]
pub struct RequestQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request and wakes the consumer.
    pub fn push(&self, request: RendezvousRequest) {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Queued(request));
        self.notify.notify_one();
    }

    /// Removes the earliest request.
    pub fn pop(&self) -> Option<RendezvousRequest> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .map(|queued| queued.0)
    }

    /// Requested time of the earliest request, if any.
    pub fn peek_time(&self) -> Option<LogicalTime> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek()
            .map(|queued| queued.0.requested_time())
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Future that completes after the next push (or a stored permit).
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{rendezvous, LoopSignal, RendezvousTicket};
    use proptest::prelude::*;
    use tokio::sync::watch;

    fn enqueue(queue: &RequestQueue, time: LogicalTime, seq: u64) -> RendezvousTicket {
        let (_tx, signal) = watch::channel(LoopSignal::Running);
        let (request, ticket) = rendezvous(time, seq, 0, signal);
        queue.push(request);
        ticket
    }

    #[test]
    fn test_pops_earliest_first() {
        let queue = RequestQueue::new();
        let _a = enqueue(&queue, 5.0, 0);
        let _b = enqueue(&queue, 1.0, 1);
        let _c = enqueue(&queue, 3.0, 2);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_time(), Some(1.0));
        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|r| r.requested_time())
            .collect();
        assert_eq!(order, vec![1.0, 3.0, 5.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_leave_in_submission_order() {
        let queue = RequestQueue::new();
        let _tickets: Vec<_> = [4, 1, 3, 0, 2]
            .iter()
            .map(|&seq| enqueue(&queue, 2.0, seq))
            .collect();

        let seqs: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|r| r.seq()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    proptest! {
        #[test]
        fn test_draining_is_monotonic(times in proptest::collection::vec(0u32..50, 1..64)) {
            let queue = RequestQueue::new();
            let _tickets: Vec<_> = times
                .iter()
                .enumerate()
                .map(|(seq, &t)| enqueue(&queue, t as f64 * 0.5, seq as u64))
                .collect();

            let mut last: Option<(LogicalTime, u64)> = None;
            while let Some(request) = queue.pop() {
                let key = (request.requested_time(), request.seq());
                if let Some(prev) = last {
                    prop_assert!(prev.0 < key.0 || (prev.0 == key.0 && prev.1 < key.1));
                }
                last = Some(key);
            }
        }
    }
}
