//! The capability surface of the scheduled resource.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::scheduler::work::{SessionId, UserId};

/// Failure raised by the worker while operating the resource.
///
/// A fault during `work` is committed to the submitting client and tears the
/// worker down, since the resource state must be assumed corrupted.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct WorkerFault(pub String);

impl WorkerFault {
    pub fn new(message: impl Into<String>) -> Self {
        WorkerFault(message.into())
    }
}

/// The exclusive resource being scheduled.
///
/// Exactly one thread owns the worker at any time; none of these methods need
/// to be thread-safe. `setup` runs before the first work unit after an idle
/// period, `teardown` releases the resource when control is relinquished.
pub trait Worker: Send + 'static {
    /// Unit of work submitted by clients.
    type Payload: Serialize + DeserializeOwned + Send + 'static;
    /// Result returned to the submitting client.
    type Output: Serialize + DeserializeOwned + Send + 'static;
    /// Session restoration program uploaded by clients.
    type Reinit: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Acquire the resource.
    fn setup(&mut self) -> Result<(), WorkerFault>;

    /// Execute one unit of work.
    fn work(&mut self, payload: Self::Payload) -> Result<Self::Output, WorkerFault>;

    /// Restore the state of the incoming session before its next work unit.
    fn perform_reinit(&mut self, data: &Self::Reinit) -> Result<(), WorkerFault>;

    /// Release the resource.
    fn teardown(&mut self) -> Result<(), WorkerFault>;
}

/// Maps per-call user data to an authenticated user and session.
///
/// Shared by all connection handlers, so implementations must be thread-safe;
/// this is the only authentication hook the scheduler has.
pub trait Verifier: Send + Sync + 'static {
    /// `None` rejects the caller; the call is answered with an authorization
    /// error and never enters a queue.
    fn verify_user(&self, user_data: &str) -> Option<(UserId, SessionId)>;
}

impl<F> Verifier for F
where
    F: Fn(&str) -> Option<(UserId, SessionId)> + Send + Sync + 'static,
{
    fn verify_user(&self, user_data: &str) -> Option<(UserId, SessionId)> {
        self(user_data)
    }
}
