//! The scheduler server: RPC surface, connection handling, lifecycle.
//!
//! One accept thread hands connections to per-connection handler threads
//! (bounded by `max_connections`). Handlers authenticate each call, feed the
//! queues and block on the reply channel until the scheduler commits — a
//! parked reply is nothing more than the scheduler still holding the sending
//! half.

use std::collections::HashSet;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::rpc::{self, ErrorPayload, Request, Response, ResponsePayload};
use crate::scheduler::idle::IdleTimeout;
use crate::scheduler::input_queue::InputQueue;
use crate::scheduler::output_queue::OutputQueue;
use crate::scheduler::session::SessionStorage;
use crate::scheduler::work::{ReplyContext, SequenceOrder, SessionId, WorkPackage};
use crate::scheduler::worker::{Verifier, Worker};
use crate::scheduler::worker_thread::{WorkerHandle, WorkerThread};
use crate::util::fd;

/// Why the server stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The worker was idle past the configured timeout.
    IdleTimeout,
    /// SIGINT/SIGTERM, or an explicit [`StopHandle::stop`].
    Signal,
    /// Unrecoverable failure; the process should exit non-zero.
    Fatal(String),
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<ShutdownCause>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(ShutdownCause::Signal);
    }
}

/// Wraps a [`Worker`] in an RPC server that schedules work from several
/// producers round-robin.
pub struct Scheduler<W: Worker> {
    config: Config,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    verifier: Arc<dyn Verifier>,
    input: Arc<InputQueue<W>>,
    output: Arc<OutputQueue<W::Output>>,
    sessions: Arc<SessionStorage<W>>,
    worker_thread: WorkerThread<W>,
    worker_handle: WorkerHandle,
    idle: Arc<IdleTimeout>,
    shutdown_tx: Sender<ShutdownCause>,
    shutdown_rx: Receiver<ShutdownCause>,
    fatal_forwarder: Option<JoinHandle<()>>,
}

impl<W: Worker> Scheduler<W> {
    /// Bind the endpoint and spin up the scheduling machinery. The server
    /// does not accept connections until [`run`] is called.
    ///
    /// [`run`]: Scheduler::run
    pub fn new(
        config: Config,
        worker: W,
        verifier: impl Verifier,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen_addr).map_err(|source| {
            ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            }
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;

        let input = Arc::new(InputQueue::new(config.period_per_user()));
        let output = Arc::new(OutputQueue::new(config.output_threads));
        let sessions = Arc::new(SessionStorage::new(config.session_timeout()));

        let (shutdown_tx, shutdown_rx) = unbounded();
        let (fatal_tx, fatal_rx) = unbounded::<String>();
        let fatal_forwarder = {
            let shutdown_tx = shutdown_tx.clone();
            std::thread::Builder::new()
                .name("fatal-forwarder".into())
                .spawn(move || {
                    for message in fatal_rx {
                        error!(%message, "fatal worker failure");
                        let _ = shutdown_tx.send(ShutdownCause::Fatal(message));
                    }
                })
                .expect("spawn fatal forwarder")
        };

        let worker_thread = WorkerThread::spawn(
            worker,
            Arc::clone(&input),
            Arc::clone(&output),
            Arc::clone(&sessions),
            config.release_interval(),
            config.reinit_grace(),
            fatal_tx,
        );
        let worker_handle = worker_thread.handle();
        let idle = Arc::new(IdleTimeout::new(worker_handle.clone()));

        Ok(Scheduler {
            config,
            listener: Some(listener),
            local_addr,
            verifier: Arc::new(verifier),
            input,
            output,
            sessions,
            worker_thread,
            worker_handle,
            idle,
            shutdown_tx,
            shutdown_rx,
            fatal_forwarder: Some(fatal_forwarder),
        })
    }

    /// The bound endpoint (useful when the config asked for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Whether any work is still queued.
    pub fn has_work_left(&self) -> bool {
        !self.input.is_empty()
    }

    pub fn set_period_per_user(&self, period: Duration) {
        self.input.set_period_per_user(period);
    }

    pub fn period_per_user(&self) -> Duration {
        self.input.period_per_user()
    }

    pub fn set_release_interval(&self, interval: Duration) {
        self.worker_handle.set_release_interval(interval);
    }

    /// Manually restart the idle clock.
    pub fn reset_idle_timeout(&self) {
        self.worker_handle.reset_last_idle();
    }

    /// Serve until the idle timeout fires, a signal arrives or a fatal error
    /// occurs, then shut everything down in order.
    pub fn run(&mut self) -> ShutdownCause {
        if let Err(e) = fd::raise_soft_limit() {
            warn!("could not raise file descriptor limit: {e}");
        }

        let listener = self.listener.take().expect("run called twice");
        listener
            .set_nonblocking(true)
            .expect("set listener non-blocking");
        info!(addr = %self.local_addr, "server listening");

        let signal_flag = Arc::new(AtomicBool::new(false));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, signal_flag.clone());
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, signal_flag.clone());

        let accept_stop = Arc::new(AtomicBool::new(false));
        let accept_handle = {
            let ctx = HandlerContext {
                verifier: Arc::clone(&self.verifier),
                input: Arc::clone(&self.input),
                sessions: Arc::clone(&self.sessions),
                worker: self.worker_handle.clone(),
                connections: Arc::new(AtomicUsize::new(0)),
                max_connections: self.config.max_connections,
            };
            let stop = Arc::clone(&accept_stop);
            let signal_flag = Arc::clone(&signal_flag);
            let shutdown_tx = self.shutdown_tx.clone();
            std::thread::Builder::new()
                .name("acceptor".into())
                .spawn(move || accept_loop(listener, ctx, stop, signal_flag, shutdown_tx))
                .expect("spawn acceptor")
        };

        let idle_handle = {
            let idle = Arc::clone(&self.idle);
            let timeout = self.config.idle_timeout();
            let shutdown_tx = self.shutdown_tx.clone();
            std::thread::Builder::new()
                .name("idle-timeout".into())
                .spawn(move || {
                    if idle.wait_until_idle_for(timeout) {
                        let _ = shutdown_tx.send(ShutdownCause::IdleTimeout);
                    }
                })
                .expect("spawn idle timeout driver")
        };

        let cause = self
            .shutdown_rx
            .recv()
            .unwrap_or(ShutdownCause::Signal);
        info!(?cause, "shutting down");

        // Reverse of construction order: idle timeout, worker thread,
        // session storage, output queue, input queue, RPC server.
        self.idle.interrupt();
        let _ = idle_handle.join();
        self.worker_thread.shutdown();
        if let Some(forwarder) = self.fatal_forwarder.take() {
            let _ = forwarder.join();
        }
        self.sessions.shutdown();
        self.output.shutdown();
        accept_stop.store(true, Ordering::SeqCst);
        let _ = accept_handle.join();
        info!("server stopped");

        cause
    }
}

/// Everything a connection handler needs.
struct HandlerContext<W: Worker> {
    verifier: Arc<dyn Verifier>,
    input: Arc<InputQueue<W>>,
    sessions: Arc<SessionStorage<W>>,
    worker: WorkerHandle,
    connections: Arc<AtomicUsize>,
    max_connections: usize,
}

impl<W: Worker> Clone for HandlerContext<W> {
    fn clone(&self) -> Self {
        HandlerContext {
            verifier: Arc::clone(&self.verifier),
            input: Arc::clone(&self.input),
            sessions: Arc::clone(&self.sessions),
            worker: self.worker.clone(),
            connections: Arc::clone(&self.connections),
            max_connections: self.max_connections,
        }
    }
}

fn accept_loop<W: Worker>(
    listener: TcpListener,
    ctx: HandlerContext<W>,
    stop: Arc<AtomicBool>,
    signal_flag: Arc<AtomicBool>,
    shutdown_tx: Sender<ShutdownCause>,
) {
    let mut signal_sent = false;
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if signal_flag.load(Ordering::SeqCst) && !signal_sent {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(ShutdownCause::Signal);
            signal_sent = true;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                if ctx.connections.load(Ordering::SeqCst) >= ctx.max_connections {
                    warn!(%peer, "refusing connection, limit reached");
                    let mut stream = stream;
                    let _ = rpc::send_line(
                        &mut stream,
                        &Response::<W::Output>::err(ErrorPayload::new(
                            "server_busy",
                            "connection limit reached",
                        )),
                    );
                    continue;
                }
                ctx.connections.fetch_add(1, Ordering::SeqCst);
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    handle_connection(stream, &ctx);
                    ctx.connections.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}

/// Serve one client connection until it closes.
///
/// Each connection that touches a session holds one reference on it; the
/// reference is dropped when the connection goes away, which is how client
/// disconnects are observed.
fn handle_connection<W: Worker>(stream: TcpStream, ctx: &HandlerContext<W>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    debug!(%peer, "client connected");

    let mut registered: HashSet<SessionId> = HashSet::new();
    let result = serve_requests(stream, ctx, &mut registered);
    if let Err(e) = result {
        debug!(%peer, "connection ended: {e}");
    }

    for session_id in registered {
        ctx.sessions.connection_closed(&session_id);
    }
    debug!(%peer, "client disconnected");
}

fn serve_requests<W: Worker>(
    stream: TcpStream,
    ctx: &HandlerContext<W>,
    registered: &mut HashSet<SessionId>,
) -> Result<(), rpc::RpcError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    while let Some(line) = rpc::read_line(&mut reader)? {
        let request: Request<W::Payload, W::Reinit> = match rpc::decode_line(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                warn!("undecodable request: {e}");
                rpc::send_line(
                    &mut stream,
                    &Response::<W::Output>::err(ErrorPayload::new("parse_error", e.to_string())),
                )?;
                continue;
            }
        };

        let Some((user_id, session_id)) = ctx.verifier.verify_user(request.user_data()) else {
            debug!(op = request.op_name(), "rejecting unauthorized call");
            rpc::send_line(
                &mut stream,
                &Response::<W::Output>::err(ErrorPayload::user_not_authorized()),
            )?;
            continue;
        };

        if registered.insert(session_id.clone()) {
            ctx.sessions.register_connection(&session_id);
        }

        match request {
            Request::SubmitWork {
                payload,
                sequence_num,
                ..
            } => {
                ctx.sessions.sequence_num_submitted(&session_id, sequence_num);
                let (tx, rx) = unbounded();
                ctx.input.add_work(
                    WorkPackage {
                        user_id,
                        session_id,
                        payload,
                        sequence_num,
                        reply: ReplyContext::new(tx),
                    },
                    &SequenceOrder,
                );
                ctx.worker.notify();
                // Parked until the scheduler commits; may take a long time.
                match await_reply(&stream, &rx) {
                    Some(response) => rpc::send_line(&mut stream, &response)?,
                    // Reply dropped uncommitted (discarded package), or the
                    // client went away while parked.
                    None => break,
                }
            }

            Request::ReinitNotify { reinit_id, .. } => {
                ctx.sessions.reinit_handle_notify(&session_id, reinit_id);
                rpc::send_line(&mut stream, &Response::<W::Output>::ok(ResponsePayload::Ack))?;
            }

            Request::ReinitPending { reinit_id, .. } => {
                let (tx, rx) = unbounded();
                ctx.sessions
                    .reinit_handle_pending(&session_id, reinit_id, ReplyContext::new(tx));
                match await_reply(&stream, &rx) {
                    Some(response) => rpc::send_line(&mut stream, &response)?,
                    None => break,
                }
            }

            Request::ReinitUpload {
                data, reinit_id, ..
            } => {
                ctx.sessions.reinit_store(&session_id, data, reinit_id);
                ctx.worker.notify();
                rpc::send_line(&mut stream, &Response::<W::Output>::ok(ResponsePayload::Ack))?;
            }

            Request::ReinitEnforce { .. } => {
                ctx.sessions.reinit_set_needed(&session_id);
                rpc::send_line(&mut stream, &Response::<W::Output>::ok(ResponsePayload::Ack))?;
            }
        }
    }
    Ok(())
}

/// Wait for a parked reply, watching the connection so a client that goes
/// away while parked releases its session references instead of pinning them
/// forever. `None` means there is nothing left to send.
fn await_reply<R>(
    stream: &TcpStream,
    rx: &Receiver<Response<R>>,
) -> Option<Response<R>> {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(response) => return Some(response),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if peer_disconnected(stream) {
                    return None;
                }
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// A parked client sends nothing, so readable-with-zero-bytes means EOF.
fn peer_disconnected(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let disconnected = match stream.peek(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    disconnected
}
