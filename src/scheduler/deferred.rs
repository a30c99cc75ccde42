//! Parked replies for the on-demand reinit protocol.
//!
//! A `reinit_pending` call does not return to the client until the scheduler
//! decides whether it wants the upload. The reply is held here in a suspended
//! state; `request` resumes the caller with *true* (perform the upload),
//! `abort` with *false*. Dropping an undecided reply aborts it.

use tracing::trace;

use crate::rpc::{Response, ResponsePayload};
use crate::scheduler::work::ReplyContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Parked,
    Requested,
    Aborted,
}

pub struct DeferredReply<R> {
    reply: Option<ReplyContext<R>>,
    state: State,
}

impl<R> DeferredReply<R> {
    pub fn new(reply: ReplyContext<R>) -> Self {
        DeferredReply {
            reply: Some(reply),
            state: State::Parked,
        }
    }

    fn commit(&mut self, upload: bool) {
        let reply = self
            .reply
            .take()
            .expect("deferred reply committed twice");
        reply.commit_response(Response::ok(ResponsePayload::Pending { upload }));
        self.state = if upload {
            State::Requested
        } else {
            State::Aborted
        };
    }

    /// Resume the parked caller with the request to upload.
    pub fn request(&mut self) {
        if self.state == State::Parked {
            trace!("requesting parked upload");
            self.commit(true);
        } else {
            trace!("no upload parked, nothing requested");
        }
    }

    /// Resume the parked caller telling it the upload is not wanted.
    pub fn abort(&mut self) {
        if self.state == State::Parked {
            self.commit(false);
        }
    }

    /// Whether the upload has been requested from the client.
    pub fn was_requested(&self) -> bool {
        self.state == State::Requested
    }
}

impl<R> Drop for DeferredReply<R> {
    fn drop(&mut self) {
        self.abort();
    }
}
