//! Per-session state: liveness, reinit protocol, sequence counters.
//!
//! Reinit freshness is governed by three ids per session — *notified*,
//! *pending* and *stored*. The stored payload is authoritative only while all
//! three are present and equal; any inequality means the client has announced
//! a newer program than the server holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::scheduler::deferred::DeferredReply;
use crate::scheduler::work::{ReplyContext, SessionId, SessionProgressOrder};
use crate::scheduler::worker::Worker;
use crate::sequence::SequenceNumber;
use crate::util::fd;

/// Fraction of the fd soft limit at which warnings start.
const FD_PRESSURE_WARN: f64 = 0.95;

struct Session<W: Worker> {
    /// Live client connections referencing this session.
    refcount: i64,
    last_modified: Instant,

    notified: Option<u32>,
    pending: Option<u32>,
    pending_reply: Option<DeferredReply<W::Output>>,
    stored: Option<u32>,
    reinit_data: Option<Arc<W::Reinit>>,
    /// Client demanded a reinit before the next work unit.
    reinit_enforced: bool,

    /// Next expected ordered sequence number.
    next_sequence_num: u64,
    /// Ordered numbers submitted but not yet executed, rejected or
    /// discarded. Guards fast-forward against jumping over a predecessor
    /// that is merely on its way back through a requeue.
    outstanding: BTreeSet<u64>,
}

impl<W: Worker> Session<W> {
    fn new() -> Self {
        Session {
            refcount: 0,
            last_modified: Instant::now(),
            notified: None,
            pending: None,
            pending_reply: None,
            stored: None,
            reinit_data: None,
            reinit_enforced: false,
            next_sequence_num: 0,
            outstanding: BTreeSet::new(),
        }
    }

    fn touch(&mut self) {
        self.last_modified = Instant::now();
    }

    /// The stored payload is authoritative for the latest notification.
    fn reinit_up_to_date(&self) -> bool {
        self.notified.is_some()
            && self.notified == self.pending
            && self.pending == self.stored
            && self.reinit_data.is_some()
    }
}

struct Inner<W: Worker> {
    sessions: RwLock<HashMap<SessionId, Session<W>>>,

    /// Broadcast for freshly stored reinit payloads. Waiters re-check the
    /// session map after every wakeup, so the generation counter only has to
    /// order store against wait.
    reinit_generation: Mutex<u64>,
    cv_new_reinit: Condvar,

    cleanup_stop: Mutex<bool>,
    cv_cleanup: Condvar,

    session_timeout: Duration,
    fd_soft_limit: Option<u64>,
}

/// Stores and serves session-specific data, most prominently reinit data.
pub struct SessionStorage<W: Worker> {
    inner: Arc<Inner<W>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Worker> SessionStorage<W> {
    /// `session_timeout` doubles as the cleanup wake period; idle sessions
    /// older than it are evicted.
    pub fn new(session_timeout: Duration) -> Self {
        let inner = Arc::new(Inner {
            sessions: RwLock::new(HashMap::new()),
            reinit_generation: Mutex::new(0),
            cv_new_reinit: Condvar::new(),
            cleanup_stop: Mutex::new(false),
            cv_cleanup: Condvar::new(),
            session_timeout,
            fd_soft_limit: fd::soft_limit(),
        });

        let cleanup = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("session-cleanup".into())
                .spawn(move || cleanup_thread(inner))
                .expect("spawn session cleanup thread")
        };

        SessionStorage {
            inner,
            cleanup: Mutex::new(Some(cleanup)),
        }
    }

    /// Stop the cleanup thread. Called once during server shutdown.
    pub fn shutdown(&self) {
        {
            let mut stop = self.inner.cleanup_stop.lock().expect("session storage poisoned");
            *stop = true;
        }
        self.inner.cv_cleanup.notify_all();
        let handle = self.cleanup.lock().expect("session storage poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // -------------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------------

    /// Create the session entry if this is the first time we see it.
    pub fn ensure_registered(&self, session_id: &SessionId) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        if !sessions.contains_key(session_id) {
            debug!(%session_id, "registering new session");
            sessions.insert(session_id.clone(), Session::new());
        }
    }

    /// A client connection started referencing the session.
    pub fn register_connection(&self, session_id: &SessionId) {
        self.check_fd_pressure();
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.refcount += 1;
        session.touch();
    }

    /// A client connection referencing the session has closed. This is the
    /// only way refcounts decrease; heartbeats are unnecessary.
    pub fn connection_closed(&self, session_id: &SessionId) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            if session.refcount == 0 {
                warn!(%session_id, "connection closed for session with zero refcount");
            } else {
                session.refcount -= 1;
            }
            session.touch();
        }
    }

    /// Whether the session still has live connections. Work for inactive
    /// sessions is discarded at dispatch.
    pub fn is_active(&self, session_id: &SessionId) -> bool {
        let sessions = self.inner.sessions.read().expect("session map poisoned");
        sessions
            .get(session_id)
            .map(|s| s.refcount > 0)
            .unwrap_or(false)
    }

    /// Sum of refcounts over all tracked sessions.
    pub fn total_refcount(&self) -> u64 {
        let sessions = self.inner.sessions.read().expect("session map poisoned");
        sessions.values().map(|s| s.refcount.max(0) as u64).sum()
    }

    fn check_fd_pressure(&self) {
        let Some(limit) = self.inner.fd_soft_limit else {
            return;
        };
        let Some(open) = fd::num_open_fds() else {
            return;
        };
        if open >= limit {
            error!(open, limit, "file descriptor limit reached, new connections will fail");
        } else if open as f64 >= limit as f64 * FD_PRESSURE_WARN {
            warn!(open, limit, "file descriptor usage approaching the limit");
        }
    }

    // -------------------------------------------------------------------------
    // Reinit three-id protocol
    // -------------------------------------------------------------------------

    /// Client announced a new candidate reinit program.
    pub fn reinit_handle_notify(&self, session_id: &SessionId, reinit_id: u32) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.touch();

        if session.notified == Some(reinit_id) {
            trace!(%session_id, reinit_id, "reinit already notified");
            return;
        }

        debug!(%session_id, reinit_id, "new reinit notified, dropping stored payload");
        session.stored = None;
        session.reinit_data = None;
        session.pending = None;
        // Resume the superseded pending call with "do not upload".
        if let Some(mut previous) = session.pending_reply.take() {
            previous.abort();
        }
        session.notified = Some(reinit_id);
    }

    /// Client offered to upload; park the reply until the scheduler decides.
    ///
    /// A mismatched id is answered immediately with *false* — the client's
    /// offer is stale and it should not upload.
    pub fn reinit_handle_pending(
        &self,
        session_id: &SessionId,
        reinit_id: u32,
        reply: ReplyContext<W::Output>,
    ) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.touch();

        if session.notified != Some(reinit_id) {
            drop(sessions);
            debug!(%session_id, reinit_id, "pending id does not match notification, refusing");
            let mut refused = DeferredReply::new(reply);
            refused.abort();
            return;
        }

        if let Some(mut previous) = session.pending_reply.take() {
            previous.abort();
        }
        session.pending = Some(reinit_id);
        session.pending_reply = Some(DeferredReply::new(reply));
        trace!(%session_id, reinit_id, "parked pending reinit upload");
    }

    /// Store an uploaded payload if it matches the full notification chain.
    pub fn reinit_store(&self, session_id: &SessionId, data: W::Reinit, reinit_id: u32) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.touch();

        if session.notified != Some(reinit_id) || session.pending != Some(reinit_id) {
            warn!(%session_id, reinit_id, "dropping reinit upload with mismatched id");
            return;
        }

        session.reinit_data = Some(Arc::new(data));
        session.stored = Some(reinit_id);
        info!(%session_id, reinit_id, "stored reinit payload");
        drop(sessions);

        let mut generation = self
            .inner
            .reinit_generation
            .lock()
            .expect("reinit generation poisoned");
        *generation += 1;
        drop(generation);
        self.inner.cv_new_reinit.notify_all();
    }

    /// Ask the client for the payload if there is an unanswered offer.
    pub fn reinit_request(&self, session_id: &SessionId) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        if session.reinit_up_to_date() {
            return;
        }
        if let Some(reply) = session.pending_reply.as_mut() {
            if !reply.was_requested() {
                debug!(%session_id, "requesting reinit upload from client");
                reply.request();
            }
        }
    }

    /// Whether the session must not run work without a reinit in place.
    pub fn reinit_is_needed(&self, session_id: &SessionId) -> bool {
        let sessions = self.inner.sessions.read().expect("session map poisoned");
        sessions
            .get(session_id)
            .map(|s| s.reinit_enforced || s.notified.is_some())
            .unwrap_or(false)
    }

    /// Mark the session as requiring a reinit before its next work unit.
    pub fn reinit_set_needed(&self, session_id: &SessionId) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.reinit_enforced = true;
        session.touch();
    }

    /// The worker applied the reinit identified by `reinit_id`.
    pub fn reinit_mark_performed(&self, session_id: &SessionId, reinit_id: u32) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            if session.stored == Some(reinit_id) {
                session.reinit_enforced = false;
            }
            session.touch();
        }
    }

    /// Fetch up-to-date reinit data, requesting the upload and waiting up to
    /// `grace` for it to arrive.
    pub fn reinit_get(
        &self,
        session_id: &SessionId,
        grace: Duration,
    ) -> Option<(u32, Arc<W::Reinit>)> {
        self.reinit_request(session_id);

        let deadline = Instant::now() + grace;
        loop {
            if let Some(found) = self.up_to_date_payload(session_id) {
                return Some(found);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let generation = self
                .inner
                .reinit_generation
                .lock()
                .expect("reinit generation poisoned");
            // Re-check while holding the generation lock so a store cannot
            // slip between the check and the wait.
            if let Some(found) = self.up_to_date_payload(session_id) {
                return Some(found);
            }
            let (_guard, timeout) = self
                .inner
                .cv_new_reinit
                .wait_timeout(generation, remaining)
                .expect("reinit generation poisoned");
            if timeout.timed_out() {
                return self.up_to_date_payload(session_id);
            }
        }
    }

    fn up_to_date_payload(&self, session_id: &SessionId) -> Option<(u32, Arc<W::Reinit>)> {
        let sessions = self.inner.sessions.read().expect("session map poisoned");
        let session = sessions.get(session_id)?;
        if session.reinit_up_to_date() {
            Some((
                session.stored.expect("stored id present when up to date"),
                Arc::clone(session.reinit_data.as_ref().expect("payload present")),
            ))
        } else {
            None
        }
    }

    // -------------------------------------------------------------------------
    // Sequence counters
    // -------------------------------------------------------------------------

    /// Record an ordered submission so fast-forward can see what is still in
    /// flight for the session.
    pub fn sequence_num_submitted(&self, session_id: &SessionId, submitted: SequenceNumber) {
        let Some(value) = submitted.value() else {
            return;
        };
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        session.outstanding.insert(value);
        session.touch();
    }

    /// The submission left the system: executed, rejected or discarded.
    pub fn sequence_num_settled(&self, session_id: &SessionId, submitted: SequenceNumber) {
        let Some(value) = submitted.value() else {
            return;
        };
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            session.outstanding.remove(&value);
        }
    }

    /// Adopt the client's counter after a server restart: if we still expect
    /// zero but the client is already further, jump forward instead of
    /// stalling forever.
    ///
    /// The jump is refused while a lower-numbered submission is outstanding —
    /// that predecessor may simply be on its way back through a requeue, and
    /// jumping over it would wrongly invalidate it.
    pub fn sequence_num_fast_forward(&self, session_id: &SessionId, submitted: SequenceNumber) {
        let Some(value) = submitted.value() else {
            return;
        };
        if value == 0 {
            return;
        }
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(Session::new);
        let lower_outstanding = session
            .outstanding
            .first()
            .is_some_and(|&min| min < value);
        if session.next_sequence_num == 0 && !lower_outstanding {
            info!(%session_id, to = value, "fast-forwarding sequence counter");
            session.next_sequence_num = value;
        }
    }

    /// The next expected ordered sequence number.
    pub fn sequence_num_get(&self, session_id: &SessionId) -> u64 {
        let sessions = self.inner.sessions.read().expect("session map poisoned");
        sessions
            .get(session_id)
            .map(|s| s.next_sequence_num)
            .unwrap_or(0)
    }

    /// Advance after a completed ordered work unit.
    pub fn sequence_num_next(&self, session_id: &SessionId) {
        let mut sessions = self.inner.sessions.write().expect("session map poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            session.next_sequence_num += 1;
            session.touch();
        }
    }

    /// Queue order that drains the sessions furthest behind first, from a
    /// snapshot of the current counters.
    pub fn session_progress_order(&self) -> SessionProgressOrder {
        let sessions = self.inner.sessions.read().expect("session map poisoned");
        SessionProgressOrder::new(
            sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.next_sequence_num))
                .collect(),
        )
    }
}

impl<W: Worker> Drop for SessionStorage<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn cleanup_thread<W: Worker>(inner: Arc<Inner<W>>) {
    let mut stop = inner.cleanup_stop.lock().expect("session storage poisoned");
    loop {
        let (guard, _) = inner
            .cv_cleanup
            .wait_timeout(stop, inner.session_timeout)
            .expect("session storage poisoned");
        stop = guard;
        if *stop {
            break;
        }
        drop(stop);

        let mut sessions = inner.sessions.write().expect("session map poisoned");
        let before = sessions.len();
        sessions.retain(|session_id, session| {
            let keep = session.refcount > 0
                || session.last_modified.elapsed() < inner.session_timeout;
            if !keep {
                debug!(%session_id, "evicting idle session");
            }
            keep
        });
        let evicted = before - sessions.len();
        drop(sessions);
        if evicted > 0 {
            info!(evicted, "session cleanup pass finished");
        }

        stop = inner.cleanup_stop.lock().expect("session storage poisoned");
    }
}
