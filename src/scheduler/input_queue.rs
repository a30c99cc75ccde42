//! Pending work, organised per user and served round-robin.
//!
//! Each user owns a queue kept in heap order by the caller-supplied
//! [`WorkOrder`]; a ring of users with queued work supplies the round-robin
//! rotation. If the period per user is zero the user is switched at every
//! dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::scheduler::work::{UserId, WorkOrder, WorkPackage};
use crate::scheduler::worker::Worker;

type UserQueue<W> = Arc<Mutex<Vec<WorkPackage<W>>>>;

struct Ring<W: Worker> {
    /// Per-user queues. Lock order: ring mutex first, then a user queue.
    queues: HashMap<UserId, UserQueue<W>>,
    /// Users with queued work; the front entry is the current user.
    users: VecDeque<UserId>,
    last_user_switch: Instant,
    period_per_user: Duration,
}

impl<W: Worker> Ring<W> {
    /// Whether the current user's slice is up. A zero period switches at
    /// every dispatch.
    fn slice_expired(&self) -> bool {
        self.period_per_user.is_zero()
            || self.last_user_switch.elapsed() >= self.period_per_user
    }

    /// Rotate the current user to the back of the ring, dropping it instead
    /// if its queue has drained.
    fn advance(&mut self) {
        if let Some(user) = self.users.pop_front() {
            let drained = self
                .queues
                .get(&user)
                .map(|q| q.lock().expect("user queue poisoned").is_empty())
                .unwrap_or(true);
            if drained {
                self.queues.remove(&user);
            } else {
                self.users.push_back(user);
            }
        }
        self.last_user_switch = Instant::now();
    }
}

pub struct InputQueue<W: Worker> {
    inner: Mutex<Ring<W>>,
}

impl<W: Worker> InputQueue<W> {
    pub fn new(period_per_user: Duration) -> Self {
        InputQueue {
            inner: Mutex::new(Ring {
                queues: HashMap::new(),
                users: VecDeque::new(),
                last_user_switch: Instant::now(),
                period_per_user,
            }),
        }
    }

    pub fn set_period_per_user(&self, period: Duration) {
        self.inner.lock().expect("input queue poisoned").period_per_user = period;
    }

    pub fn period_per_user(&self) -> Duration {
        self.inner.lock().expect("input queue poisoned").period_per_user
    }

    /// Restart the current user's time slice.
    pub fn reset_user_switch_timer(&self) {
        self.inner.lock().expect("input queue poisoned").last_user_switch = Instant::now();
    }

    /// Add a package to its user's queue, registering the user in the ring
    /// if it had no pending work.
    pub fn add_work(&self, pkg: WorkPackage<W>, sorter: &dyn WorkOrder<W>) {
        let mut inner = self.inner.lock().expect("input queue poisoned");
        let user = pkg.user_id.clone();
        let queue = Arc::clone(
            inner
                .queues
                .entry(user.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new()))),
        );

        let mut packages = queue.lock().expect("user queue poisoned");
        if packages.is_empty() && !inner.users.contains(&user) {
            inner.users.push_back(user);
            if inner.users.len() == 1 {
                inner.last_user_switch = Instant::now();
            }
        }
        packages.push(pkg);
        // Restore heap order; the stable sort keeps submission order among
        // packages the sorter considers equal.
        packages.sort_by(|a, b| sorter.cmp(a, b));
    }

    /// Pop the next package in round-robin order.
    ///
    /// Panics if no user has queued work; callers check [`is_empty`] first
    /// (the worker thread is the only consumer, so the check cannot go
    /// stale).
    ///
    /// [`is_empty`]: InputQueue::is_empty
    pub fn retrieve_work(&self, sorter: &dyn WorkOrder<W>) -> WorkPackage<W> {
        let mut inner = self.inner.lock().expect("input queue poisoned");
        if inner.slice_expired() {
            inner.advance();
        }
        loop {
            let user = inner
                .users
                .front()
                .expect("retrieve_work called on an empty input queue")
                .clone();
            let queue = Arc::clone(inner.queues.get(&user).expect("ring user has a queue"));
            let mut packages = queue.lock().expect("user queue poisoned");
            if packages.is_empty() {
                drop(packages);
                inner.users.pop_front();
                inner.queues.remove(&user);
                continue;
            }
            packages.sort_by(|a, b| sorter.cmp(a, b));
            return packages.remove(0);
        }
    }

    /// Explicitly rotate to the next user (used when the current user's head
    /// package cannot run yet). Tolerates an empty ring: the detached requeue
    /// helper may call this after the queue has drained.
    pub fn advance_user(&self) {
        self.inner.lock().expect("input queue poisoned").advance();
    }

    /// True iff no user has queued work.
    pub fn is_empty(&self) -> bool {
        self.total_job_count() == 0
    }

    /// Total number of packages across all users.
    pub fn total_job_count(&self) -> usize {
        let inner = self.inner.lock().expect("input queue poisoned");
        inner
            .queues
            .values()
            .map(|q| q.lock().expect("user queue poisoned").len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::work::tests::{NullWorker, package};
    use crate::scheduler::work::SequenceOrder;
    use crate::sequence::SequenceNumber;

    fn queue_with_slice(ms: u64) -> InputQueue<NullWorker> {
        InputQueue::new(Duration::from_millis(ms))
    }

    #[test]
    fn zero_slice_rotates_every_dispatch() {
        let queue = queue_with_slice(0);
        for i in 0..3u64 {
            queue.add_work(
                package("a", "sa", SequenceNumber::out_of_order(), i),
                &SequenceOrder,
            );
            queue.add_work(
                package("b", "sb", SequenceNumber::out_of_order(), i),
                &SequenceOrder,
            );
        }

        let mut users = Vec::new();
        while !queue.is_empty() {
            users.push(queue.retrieve_work(&SequenceOrder).user_id.0);
        }
        // Strict alternation after the first pick.
        for pair in users.windows(2) {
            assert_ne!(pair[0], pair[1], "dispatch order was {users:?}");
        }
        assert_eq!(users.len(), 6);
    }

    #[test]
    fn long_slice_keeps_the_current_user() {
        let queue = queue_with_slice(60_000);
        for i in 0..3u64 {
            queue.add_work(
                package("a", "sa", SequenceNumber::new(i), i),
                &SequenceOrder,
            );
        }
        queue.add_work(
            package("b", "sb", SequenceNumber::new(0), 9),
            &SequenceOrder,
        );

        let first = queue.retrieve_work(&SequenceOrder);
        let second = queue.retrieve_work(&SequenceOrder);
        assert_eq!(first.user_id, second.user_id);
    }

    #[test]
    fn heap_order_pops_lowest_sequence_first() {
        let queue = queue_with_slice(0);
        for seq in [4u64, 2, 0, 3, 1] {
            queue.add_work(
                package("a", "sa", SequenceNumber::new(seq), seq),
                &SequenceOrder,
            );
        }
        let mut seen = Vec::new();
        while !queue.is_empty() {
            seen.push(
                queue
                    .retrieve_work(&SequenceOrder)
                    .sequence_num
                    .value()
                    .unwrap(),
            );
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drained_users_are_evicted_and_can_return() {
        let queue = queue_with_slice(0);
        queue.add_work(
            package("a", "sa", SequenceNumber::out_of_order(), 1),
            &SequenceOrder,
        );
        let pkg = queue.retrieve_work(&SequenceOrder);
        assert_eq!(pkg.user_id.0, "a");
        assert!(queue.is_empty());

        queue.add_work(
            package("a", "sa", SequenceNumber::out_of_order(), 2),
            &SequenceOrder,
        );
        assert_eq!(queue.total_job_count(), 1);
        let pkg = queue.retrieve_work(&SequenceOrder);
        assert_eq!(pkg.payload, 2);
    }

    #[test]
    fn advance_user_skips_the_current_head() {
        let queue = queue_with_slice(60_000);
        queue.add_work(
            package("a", "sa", SequenceNumber::out_of_order(), 1),
            &SequenceOrder,
        );
        queue.add_work(
            package("b", "sb", SequenceNumber::out_of_order(), 2),
            &SequenceOrder,
        );
        let first = queue.retrieve_work(&SequenceOrder).user_id.0.clone();
        queue.advance_user();
        let second = queue.retrieve_work(&SequenceOrder).user_id.0.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn advance_on_empty_queue_is_harmless() {
        let queue = queue_with_slice(0);
        queue.advance_user();
        assert!(queue.is_empty());
    }
}
