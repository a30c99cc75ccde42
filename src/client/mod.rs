//! Blocking RPC client.
//!
//! Every call opens a fresh connection (which also refreshes
//! authentication), writes one request and blocks for the reply. Cancellation
//! is coarse: reads poll at the progress period and observe the caller's stop
//! token in between.

pub mod uploader;

pub use uploader::{OnDemandUploader, UploadError};

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::rpc::{self, Request, Response, ResponsePayload, RpcError};
use crate::sequence::SequenceNumber;

/// How often blocking calls check their stop token.
pub const PROGRESS_PERIOD: Duration = Duration::from_millis(10);

/// Default remote-call timeout; worker calls can legitimately take hours.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoint, `ip:port`.
    pub addr: String,
    /// Authentication string attached to every call.
    pub user_data: String,
    /// Upper bound on one remote call.
    pub call_timeout: Duration,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, user_data: impl Into<String>) -> Self {
        ClientConfig {
            addr: addr.into(),
            user_data: user_data.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Client for a scheduler serving payload `P`, output `R`, reinit data `D`.
pub struct SchedulerClient<P, R, D> {
    config: ClientConfig,
    _marker: PhantomData<fn(P, D) -> R>,
}

impl<P, R, D> Clone for SchedulerClient<P, R, D> {
    fn clone(&self) -> Self {
        SchedulerClient {
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P, R, D> SchedulerClient<P, R, D>
where
    P: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned,
    D: Serialize + DeserializeOwned,
{
    pub fn new(config: ClientConfig) -> Self {
        SchedulerClient {
            config,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Submit one unit of work and block until the worker has run it.
    pub fn submit_work(&self, payload: P, sequence_num: SequenceNumber) -> Result<R, RpcError> {
        let request: Request<P, D> = Request::SubmitWork {
            user_data: self.config.user_data.clone(),
            payload,
            sequence_num,
        };
        match self.call(&request, None)? {
            ResponsePayload::Work { value } => Ok(value),
            other => Err(unexpected_payload(&other)),
        }
    }

    /// Announce a new reinit program under `reinit_id`.
    pub fn reinit_notify(&self, reinit_id: u32, stop: Option<&AtomicBool>) -> Result<(), RpcError> {
        let request: Request<P, D> = Request::ReinitNotify {
            user_data: self.config.user_data.clone(),
            reinit_id,
        };
        match self.call(&request, stop)? {
            ResponsePayload::Ack => Ok(()),
            other => Err(unexpected_payload(&other)),
        }
    }

    /// Offer the upload; blocks server-side until it is wanted (true) or
    /// abandoned (false).
    pub fn reinit_pending(
        &self,
        reinit_id: u32,
        stop: Option<&AtomicBool>,
    ) -> Result<bool, RpcError> {
        let request: Request<P, D> = Request::ReinitPending {
            user_data: self.config.user_data.clone(),
            reinit_id,
        };
        match self.call(&request, stop)? {
            ResponsePayload::Pending { upload } => Ok(upload),
            other => Err(unexpected_payload(&other)),
        }
    }

    /// Deliver the reinit payload.
    pub fn reinit_upload(
        &self,
        data: &D,
        reinit_id: u32,
        stop: Option<&AtomicBool>,
    ) -> Result<(), RpcError> {
        let request = Request::<&P, &D>::ReinitUpload {
            user_data: self.config.user_data.clone(),
            data,
            reinit_id,
        };
        match self.call(&request, stop)? {
            ResponsePayload::Ack => Ok(()),
            other => Err(unexpected_payload(&other)),
        }
    }

    /// Require a reinit before the session's next work unit.
    pub fn reinit_enforce(&self) -> Result<(), RpcError> {
        let request: Request<P, D> = Request::ReinitEnforce {
            user_data: self.config.user_data.clone(),
        };
        match self.call(&request, None)? {
            ResponsePayload::Ack => Ok(()),
            other => Err(unexpected_payload(&other)),
        }
    }

    /// One request/response round trip on a fresh connection.
    fn call<Q: Serialize>(
        &self,
        request: &Q,
        stop: Option<&AtomicBool>,
    ) -> Result<ResponsePayload<R>, RpcError> {
        let mut stream = TcpStream::connect(&self.config.addr)?;
        stream.set_nodelay(true)?;
        let bytes = rpc::encode_line(request)?;
        stream.write_all(&bytes)?;

        let line = read_line_cancellable(&mut stream, self.config.call_timeout, stop)?;
        let response: Response<R> = rpc::decode_line(line.trim())?;
        response.into_result().map_err(RpcError::Rejected)
    }
}

fn unexpected_payload<R>(payload: &ResponsePayload<R>) -> RpcError {
    RpcError::Rejected(crate::rpc::ErrorPayload::new(
        "unexpected_response",
        format!("unexpected response kind for this call: {}", payload_kind(payload)),
    ))
}

fn payload_kind<R>(payload: &ResponsePayload<R>) -> &'static str {
    match payload {
        ResponsePayload::Work { .. } => "work",
        ResponsePayload::Pending { .. } => "pending",
        ResponsePayload::Ack => "ack",
    }
}

/// Read one `\n`-terminated line, polling the stop token at the progress
/// period so long calls stay cancellable.
fn read_line_cancellable(
    stream: &mut TcpStream,
    call_timeout: Duration,
    stop: Option<&AtomicBool>,
) -> Result<String, RpcError> {
    stream.set_read_timeout(Some(PROGRESS_PERIOD))?;
    let deadline = Instant::now() + call_timeout;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Err(RpcError::Disconnected),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\n') {
                    return Ok(String::from_utf8_lossy(&buf).into_owned());
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if let Some(stop) = stop {
                    if stop.load(Ordering::SeqCst) {
                        return Err(RpcError::Cancelled);
                    }
                }
                if Instant::now() >= deadline {
                    return Err(RpcError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "remote call timed out",
                    )));
                }
            }
            Err(e) => return Err(RpcError::Io(e)),
        }
    }
}

/// Invoke `call` until it succeeds, retrying transport failures with a fixed
/// wait in between. Non-transient errors propagate immediately. Feedback is
/// logged at most once per second to avoid spamming the terminal.
pub fn retrying_invoke<T>(
    attempt_num_max: usize,
    wait_between_attempts: Duration,
    mut call: impl FnMut() -> Result<T, RpcError>,
) -> Result<T, RpcError> {
    assert!(attempt_num_max > 0, "at least one attempt is required");

    let mut last_user_notification = Instant::now();
    let mut first = true;
    for attempt in 1..=attempt_num_max {
        match call() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempt_num_max => {
                if first || last_user_notification.elapsed() > Duration::from_secs(1) {
                    info!(
                        attempt,
                        max = attempt_num_max,
                        "server not ready yet, waiting {} ms between attempts",
                        wait_between_attempts.as_millis()
                    );
                    last_user_notification = Instant::now();
                    first = false;
                }
                std::thread::sleep(wait_between_attempts);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt");
}
