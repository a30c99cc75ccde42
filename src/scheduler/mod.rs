//! Round-robin scheduling core.
//!
//! Provides:
//! - per-user input queue with round-robin rotation and time slices
//! - output pool committing finished replies
//! - session storage with the on-demand reinit protocol
//! - the worker thread owning the exclusive resource
//! - idle-timeout driver

pub mod deferred;
pub mod idle;
pub mod input_queue;
pub mod output_queue;
mod reinit;
pub mod session;
pub mod work;
pub mod worker;
pub mod worker_thread;

pub use deferred::DeferredReply;
pub use idle::IdleTimeout;
pub use input_queue::InputQueue;
pub use output_queue::OutputQueue;
pub use session::SessionStorage;
pub use work::{
    ReplyContext, SequenceOrder, SessionId, SessionProgressOrder, UserId, WorkOrder, WorkPackage,
};
pub use worker::{Verifier, Worker, WorkerFault};
pub use worker_thread::{WorkerHandle, WorkerThread};
