#![forbid(unsafe_code)]

//! Server-side scheduler multiplexing a single exclusive hardware resource
//! (the *worker*) across many concurrent clients.
//!
//! Clients submit work units over RPC; the scheduler orders them fairly
//! across users in round-robin fashion, preserves per-session ordering via
//! sequence numbers, and interleaves user-supplied *reinit* programs so that
//! the hardware is restored to the correct state whenever it is handed from
//! one session to another.

pub mod client;
pub mod config;
pub mod error;
pub mod rpc;
pub mod scheduler;
pub mod sequence;
pub mod server;
pub mod telemetry;
pub mod util;

pub use error::{ConfigError, Error, ServerError};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::client::{OnDemandUploader, SchedulerClient};
pub use crate::config::Config;
pub use crate::rpc::{ErrorPayload, Request, Response, ResponsePayload, RpcError};
pub use crate::scheduler::{
    SequenceOrder, SessionId, UserId, Verifier, WorkOrder, WorkPackage, Worker, WorkerFault,
};
pub use crate::sequence::SequenceNumber;
pub use crate::server::{Scheduler, ShutdownCause, StopHandle};
