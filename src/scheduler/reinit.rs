//! Session transitions on the worker thread.
//!
//! Between retrieving a package and running it, the dispatch loop validates
//! the package against its session, switches sessions if necessary, and makes
//! sure the incoming session's reinit program has run before its work does.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::rpc::ErrorPayload;
use crate::scheduler::work::{SequenceOrder, WorkPackage};
use crate::scheduler::worker::Worker;
use crate::scheduler::worker_thread::Dispatch;

impl<W: Worker> Dispatch<W> {
    /// Validate and prepare a package. Returns the package when the worker
    /// may run it; `None` when it was discarded, rejected or requeued.
    pub(crate) fn transition(&mut self, pkg: WorkPackage<W>) -> Option<WorkPackage<W>> {
        if !self.sessions.is_active(&pkg.session_id) {
            // Client crashed or disconnected; nothing waits for the reply,
            // so the package is dropped uncommitted.
            debug!(package = %pkg, "discarding work for inactive session");
            self.sessions
                .sequence_num_settled(&pkg.session_id, pkg.sequence_num);
            return None;
        }

        if let Some(submitted) = pkg.sequence_num.value() {
            // Restart recovery: a fresh counter adopts the client's position.
            // Deciding this at dispatch (not submission) lets a lower number
            // already sitting in the sorted queue win over a later one that
            // merely arrived first.
            self.sessions
                .sequence_num_fast_forward(&pkg.session_id, pkg.sequence_num);
            let expected = self.sessions.sequence_num_get(&pkg.session_id);
            if submitted < expected {
                warn!(package = %pkg, expected, "rejecting stale sequence number");
                self.sessions
                    .sequence_num_settled(&pkg.session_id, pkg.sequence_num);
                pkg.reply
                    .commit_err(ErrorPayload::invalid_sequence_number(submitted, expected));
                return None;
            }
            if submitted > expected {
                // The predecessors have not arrived; holding this package on
                // the worker would block every other user, so it goes back to
                // the queue and the ring advances.
                trace!(package = %pkg, expected, "sequence gap, requeueing");
                self.requeue(pkg);
                return None;
            }
        }

        if !self.ensure_session_via_reinit(&pkg) {
            self.requeue(pkg);
            return None;
        }
        Some(pkg)
    }

    /// Switch to the package's session and run its reinit if one is due.
    ///
    /// Returns false when the switch cannot complete yet (reinit payload not
    /// on hand, or the reinit itself faulted) and the package should be
    /// requeued.
    fn ensure_session_via_reinit(&mut self, pkg: &WorkPackage<W>) -> bool {
        let session_id = &pkg.session_id;
        if self.current_session.as_ref() != Some(session_id) {
            if let Some(outgoing) = self.current_session.take() {
                trace!(%outgoing, incoming = %session_id, "switching session");
                // Prompt the outgoing session's uploader so its reinit is on
                // hand when we come back to it.
                self.sessions.reinit_request(&outgoing);
            }
            self.current_session = Some(session_id.clone());
            self.current_reinit_id = None;
        }

        if !self.sessions.reinit_is_needed(session_id) {
            return true;
        }

        // Allow a short grace period for an in-flight upload when nothing
        // else is waiting; with other work queued, come back later instead.
        let grace = if self.input.is_empty() {
            self.reinit_grace
        } else {
            Duration::ZERO
        };
        match self.sessions.reinit_get(session_id, grace) {
            Some((reinit_id, _)) if self.current_reinit_id == Some(reinit_id) => true,
            Some((reinit_id, data)) => {
                debug!(%session_id, reinit_id, "performing reinit");
                match self.worker.perform_reinit(&data) {
                    Ok(()) => {
                        self.current_reinit_id = Some(reinit_id);
                        self.sessions.reinit_mark_performed(session_id, reinit_id);
                        true
                    }
                    Err(fault) => {
                        warn!(%session_id, %fault, "reinit faulted, tearing worker down");
                        self.perform_teardown();
                        false
                    }
                }
            }
            None => {
                trace!(%session_id, "reinit not on hand yet");
                false
            }
        }
    }

    /// Hand the package back to the input queue from a detached helper so we
    /// never re-enter the queue lock from the dispatch path, and move on to
    /// the next user meanwhile.
    fn requeue(&self, pkg: WorkPackage<W>) {
        self.input.advance_user();
        let input = Arc::clone(&self.input);
        let status = Arc::clone(&self.status);
        std::thread::spawn(move || {
            // Pace the retry loop for packages that cannot run yet.
            std::thread::sleep(Duration::from_millis(1));
            input.add_work(pkg, &SequenceOrder);
            let guard = status.inner.lock().expect("worker status poisoned");
            status.cv.notify_one();
            drop(guard);
        });
    }
}
