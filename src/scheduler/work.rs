//! Work packages and the orderings applied to them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

use crate::rpc::{ErrorPayload, Response, ResponsePayload};
use crate::scheduler::worker::Worker;
use crate::sequence::SequenceNumber;

/// Groups work for round-robin fairness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a worker-state lineage. Every session belongs to exactly one
/// user for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server-side handle to a parked RPC reply.
///
/// The connection handler blocks on the receiving half until the scheduler
/// commits. Committing consumes the context, so a reply can be committed at
/// most once; dropping it uncommitted releases the caller without a payload
/// (used to silently discard work for dead sessions).
pub struct ReplyContext<R> {
    tx: Sender<Response<R>>,
}

impl<R> ReplyContext<R> {
    pub fn new(tx: Sender<Response<R>>) -> Self {
        ReplyContext { tx }
    }

    /// Commit the worker's return value.
    pub fn commit_ok(self, value: R) {
        self.commit_response(Response::ok(ResponsePayload::Work { value }));
    }

    /// Commit an error to the caller.
    pub fn commit_err(self, err: ErrorPayload) {
        self.commit_response(Response::err(err));
    }

    /// Commit a prepared response.
    pub fn commit_response(self, response: Response<R>) {
        // The handler may have gone away with its connection; nothing to do.
        let _ = self.tx.send(response);
    }

    /// Release the caller without sending anything.
    pub fn discard(self) {}
}

impl<R> fmt::Debug for ReplyContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyContext")
    }
}

/// One queued unit of work.
///
/// Owns its parked reply exclusively; ownership moves input queue → worker
/// thread → output queue, and committing (or dropping) the reply releases the
/// waiting caller.
pub struct WorkPackage<W: Worker> {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub payload: W::Payload,
    pub sequence_num: SequenceNumber,
    pub reply: ReplyContext<W::Output>,
}

impl<W: Worker> fmt::Display for WorkPackage<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}@{}] {}",
            self.user_id, self.session_id, self.sequence_num
        )
    }
}

/// Ordering applied to a user's queue.
///
/// `Ordering::Less` means "dispatched earlier". Queues keep a stable order,
/// so packages comparing equal retain submission order.
pub trait WorkOrder<W: Worker>: Send + Sync {
    fn cmp(&self, a: &WorkPackage<W>, b: &WorkPackage<W>) -> Ordering;
}

fn session_hash(session_id: &SessionId) -> u64 {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    hasher.finish()
}

/// Sort key within one session: ascending sequence number, with all
/// out-of-order packages mutually equal (and after the sequenced ones, so the
/// comparator stays a total order).
fn sequence_key(seq: SequenceNumber) -> u64 {
    seq.value().unwrap_or(u64::MAX)
}

/// Base queue order: batch by session (via a stable hash — several sessions
/// per user is unusual but must not confuse the queue), then lowest sequence
/// number first.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceOrder;

impl<W: Worker> WorkOrder<W> for SequenceOrder {
    fn cmp(&self, a: &WorkPackage<W>, b: &WorkPackage<W>) -> Ordering {
        session_hash(&a.session_id)
            .cmp(&session_hash(&b.session_id))
            .then_with(|| sequence_key(a.sequence_num).cmp(&sequence_key(b.sequence_num)))
    }
}

/// Order that drains lagging sessions first.
///
/// Sessions whose sequence counter is furthest behind come out first; ties
/// fall back to [`SequenceOrder`]. Built from a snapshot of the session
/// counters so the sort is stable while the queue is held.
#[derive(Debug, Clone, Default)]
pub struct SessionProgressOrder {
    counters: HashMap<SessionId, u64>,
}

impl SessionProgressOrder {
    pub fn new(counters: HashMap<SessionId, u64>) -> Self {
        SessionProgressOrder { counters }
    }

    fn progress(&self, session_id: &SessionId) -> u64 {
        self.counters.get(session_id).copied().unwrap_or(0)
    }
}

impl<W: Worker> WorkOrder<W> for SessionProgressOrder {
    fn cmp(&self, a: &WorkPackage<W>, b: &WorkPackage<W>) -> Ordering {
        self.progress(&a.session_id)
            .cmp(&self.progress(&b.session_id))
            .then_with(|| WorkOrder::<W>::cmp(&SequenceOrder, a, b))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crossbeam::channel::unbounded;

    use super::*;
    use crate::scheduler::worker::WorkerFault;

    /// Minimal worker used by queue/session unit tests.
    pub(crate) struct NullWorker;

    impl Worker for NullWorker {
        type Payload = u64;
        type Output = u64;
        type Reinit = u64;

        fn setup(&mut self) -> Result<(), WorkerFault> {
            Ok(())
        }

        fn work(&mut self, payload: u64) -> Result<u64, WorkerFault> {
            Ok(payload)
        }

        fn perform_reinit(&mut self, _data: &u64) -> Result<(), WorkerFault> {
            Ok(())
        }

        fn teardown(&mut self) -> Result<(), WorkerFault> {
            Ok(())
        }
    }

    pub(crate) fn package<W: Worker>(
        user: &str,
        session: &str,
        seq: SequenceNumber,
        payload: W::Payload,
    ) -> WorkPackage<W> {
        let (tx, _rx) = unbounded();
        WorkPackage {
            user_id: UserId(user.to_string()),
            session_id: SessionId(session.to_string()),
            payload,
            sequence_num: seq,
            reply: ReplyContext::new(tx),
        }
    }

    #[test]
    fn sequence_order_prefers_lower_numbers() {
        let a = package::<NullWorker>("u", "s", SequenceNumber::new(1), 0);
        let b = package::<NullWorker>("u", "s", SequenceNumber::new(4), 0);
        assert_eq!(WorkOrder::<NullWorker>::cmp(&SequenceOrder, &a, &b), Ordering::Less);
    }

    #[test]
    fn out_of_order_packages_compare_equal() {
        let a = package::<NullWorker>("u", "s", SequenceNumber::out_of_order(), 0);
        let b = package::<NullWorker>("u", "s", SequenceNumber::out_of_order(), 0);
        assert_eq!(WorkOrder::<NullWorker>::cmp(&SequenceOrder, &a, &b), Ordering::Equal);
    }

    #[test]
    fn sessions_batch_before_sequence() {
        let a = package::<NullWorker>("u", "s1", SequenceNumber::new(9), 0);
        let b = package::<NullWorker>("u", "s2", SequenceNumber::new(1), 0);
        let cmp = WorkOrder::<NullWorker>::cmp(&SequenceOrder, &a, &b);
        // Whichever session hashes lower wins regardless of sequence.
        assert_ne!(cmp, Ordering::Equal);
    }

    #[test]
    fn lagging_sessions_drain_first() {
        let behind = package::<NullWorker>("u", "behind", SequenceNumber::new(9), 0);
        let ahead = package::<NullWorker>("u", "ahead", SequenceNumber::new(0), 0);
        let mut counters = HashMap::new();
        counters.insert(SessionId("behind".into()), 2);
        counters.insert(SessionId("ahead".into()), 40);
        let order = SessionProgressOrder::new(counters);
        assert_eq!(
            WorkOrder::<NullWorker>::cmp(&order, &behind, &ahead),
            Ordering::Less
        );
    }
}
