//! The single thread owning the worker.
//!
//! The worker is exclusive hardware and not thread-safe; everything that
//! touches it — setup, work, reinit, teardown — happens on this thread.
//! Teardown in particular must run here: a worker owning a child process
//! would see its parent-death signal fire if another thread tore it down.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use tracing::{debug, error, info, trace};

use crate::scheduler::input_queue::InputQueue;
use crate::scheduler::output_queue::OutputQueue;
use crate::scheduler::session::SessionStorage;
use crate::scheduler::work::SessionId;
use crate::scheduler::worker::Worker;

pub(crate) struct StatusInner {
    pub(crate) stop: bool,
    pub(crate) is_set_up: bool,
    pub(crate) is_idle: bool,
    pub(crate) last_idle: Instant,
    pub(crate) last_release: Instant,
    pub(crate) release_interval: Duration,
}

pub(crate) struct Status {
    pub(crate) inner: Mutex<StatusInner>,
    pub(crate) cv: Condvar,
}

/// Shared view of the worker thread used by the RPC handlers and the idle
/// timeout driver.
#[derive(Clone)]
pub struct WorkerHandle {
    status: Arc<Status>,
}

impl WorkerHandle {
    pub(crate) fn from_status(status: Arc<Status>) -> Self {
        WorkerHandle { status }
    }

    /// Wake the dispatch loop; called after new work is queued.
    pub fn notify(&self) {
        let guard = self.status.inner.lock().expect("worker status poisoned");
        self.status.cv.notify_one();
        drop(guard);
    }

    /// Ask the dispatch loop to exit and wake it.
    pub fn request_stop(&self) {
        let mut inner = self.status.inner.lock().expect("worker status poisoned");
        inner.stop = true;
        self.status.cv.notify_all();
        drop(inner);
    }

    pub fn is_set_up(&self) -> bool {
        self.status.inner.lock().expect("worker status poisoned").is_set_up
    }

    pub fn is_idle(&self) -> bool {
        self.status.inner.lock().expect("worker status poisoned").is_idle
    }

    /// When the worker last became idle; now if it is busy.
    pub fn last_idle(&self) -> Instant {
        let inner = self.status.inner.lock().expect("worker status poisoned");
        if inner.is_idle {
            inner.last_idle
        } else {
            Instant::now()
        }
    }

    pub fn set_release_interval(&self, interval: Duration) {
        self.status
            .inner
            .lock()
            .expect("worker status poisoned")
            .release_interval = interval;
    }

    /// Time remaining until the worker must relinquish the resource.
    pub fn time_till_next_teardown(&self) -> Duration {
        let inner = self.status.inner.lock().expect("worker status poisoned");
        inner
            .release_interval
            .saturating_sub(inner.last_release.elapsed())
    }

    /// Manually restart the idle clock.
    pub fn reset_last_idle(&self) {
        self.status
            .inner
            .lock()
            .expect("worker status poisoned")
            .last_idle = Instant::now();
    }
}

/// Owns the dispatch thread; dropping or calling [`shutdown`] joins it.
///
/// [`shutdown`]: WorkerThread::shutdown
pub struct WorkerThread<W: Worker> {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
    _marker: std::marker::PhantomData<fn() -> W>,
}

impl<W: Worker> WorkerThread<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        worker: W,
        input: Arc<InputQueue<W>>,
        output: Arc<OutputQueue<W::Output>>,
        sessions: Arc<SessionStorage<W>>,
        release_interval: Duration,
        reinit_grace: Duration,
        fatal_tx: Sender<String>,
    ) -> Self {
        let status = Arc::new(Status {
            inner: Mutex::new(StatusInner {
                stop: false,
                is_set_up: false,
                is_idle: true,
                last_idle: Instant::now(),
                last_release: Instant::now(),
                release_interval,
            }),
            cv: Condvar::new(),
        });

        let dispatch = Dispatch {
            worker,
            input,
            output,
            sessions,
            status: Arc::clone(&status),
            reinit_grace,
            fatal_tx,
            current_session: None,
            current_reinit_id: None,
        };

        let thread = std::thread::Builder::new()
            .name("worker".into())
            .spawn(move || dispatch.run())
            .expect("spawn worker thread");

        WorkerThread {
            handle: WorkerHandle { status },
            thread: Some(thread),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop and join the dispatch thread. The worker tears down on its own
    /// thread before it exits.
    pub fn shutdown(&mut self) {
        self.handle.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("worker thread stopped");
    }
}

impl<W: Worker> Drop for WorkerThread<W> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

/// State of the dispatch loop; lives entirely on the worker thread.
pub(crate) struct Dispatch<W: Worker> {
    pub(crate) worker: W,
    pub(crate) input: Arc<InputQueue<W>>,
    pub(crate) output: Arc<OutputQueue<W::Output>>,
    pub(crate) sessions: Arc<SessionStorage<W>>,
    pub(crate) status: Arc<Status>,
    pub(crate) reinit_grace: Duration,
    pub(crate) fatal_tx: Sender<String>,
    pub(crate) current_session: Option<SessionId>,
    pub(crate) current_reinit_id: Option<u32>,
}

impl<W: Worker> Dispatch<W> {
    fn run(mut self) {
        info!("worker thread running");
        loop {
            let mut inner = self.status.inner.lock().expect("worker status poisoned");
            if inner.stop {
                break;
            }

            if inner.is_set_up && self.teardown_due(&inner) {
                drop(inner);
                self.perform_teardown();
                continue;
            }

            if self.input.is_empty() {
                if !inner.is_idle {
                    inner.is_idle = true;
                    inner.last_idle = Instant::now();
                    trace!("worker going idle");
                }
                inner = if inner.is_set_up {
                    // Resources are still held, sleep only until the next
                    // scheduled release.
                    let wait = inner
                        .release_interval
                        .saturating_sub(inner.last_release.elapsed());
                    self.status
                        .cv
                        .wait_timeout(inner, wait)
                        .expect("worker status poisoned")
                        .0
                } else {
                    self.status
                        .cv
                        .wait(inner)
                        .expect("worker status poisoned")
                };
                drop(inner);
                continue;
            }

            inner.is_idle = false;
            drop(inner);

            if !self.ensure_set_up() {
                break;
            }

            let sorter = self.sessions.session_progress_order();
            let pkg = self.input.retrieve_work(&sorter);
            trace!(package = %pkg, "dispatching");
            let Some(pkg) = self.transition(pkg) else {
                continue;
            };

            let session_id = pkg.session_id.clone();
            let sequence_num = pkg.sequence_num;
            match self.worker.work(pkg.payload) {
                Ok(value) => {
                    if sequence_num.is_in_order() {
                        self.sessions.sequence_num_next(&session_id);
                    }
                    self.sessions.sequence_num_settled(&session_id, sequence_num);
                    self.output.push_back(
                        pkg.reply,
                        crate::rpc::Response::ok(crate::rpc::ResponsePayload::Work { value }),
                    );
                }
                Err(fault) => {
                    // The failed call may have corrupted the hardware state:
                    // release the resource and ask the session's uploader to
                    // re-prime its reinit.
                    error!(%session_id, %fault, "work unit faulted, tearing worker down");
                    self.sessions.sequence_num_settled(&session_id, sequence_num);
                    pkg.reply
                        .commit_err(crate::rpc::ErrorPayload::worker_fault(fault.to_string()));
                    self.perform_teardown();
                    self.sessions.reinit_request(&session_id);
                }
            }
        }

        let is_set_up = {
            let inner = self.status.inner.lock().expect("worker status poisoned");
            inner.is_set_up
        };
        if is_set_up {
            self.perform_teardown();
        }
        info!("worker thread exiting");
    }

    /// Two reasons to release the resource: the release interval elapsed, or
    /// there is no interval and no work left.
    fn teardown_due(&self, inner: &StatusInner) -> bool {
        if inner.release_interval > Duration::ZERO {
            inner.last_release.elapsed() >= inner.release_interval
        } else {
            self.input.is_empty()
        }
    }

    fn ensure_set_up(&mut self) -> bool {
        let already_up = {
            let inner = self.status.inner.lock().expect("worker status poisoned");
            inner.is_set_up
        };
        if already_up {
            return true;
        }
        debug!("setting up worker");
        if let Err(fault) = self.worker.setup() {
            error!(%fault, "worker setup failed");
            let _ = self
                .fatal_tx
                .send(format!("worker setup failed: {fault}"));
            return false;
        }
        let mut inner = self.status.inner.lock().expect("worker status poisoned");
        inner.is_set_up = true;
        inner.last_release = Instant::now();
        true
    }

    pub(crate) fn perform_teardown(&mut self) {
        debug!("tearing down worker");
        self.current_session = None;
        self.current_reinit_id = None;
        if let Err(fault) = self.worker.teardown() {
            error!(%fault, "worker teardown failed");
            let _ = self
                .fatal_tx
                .send(format!("worker teardown failed: {fault}"));
        }
        let mut inner = self.status.inner.lock().expect("worker status poisoned");
        inner.is_set_up = false;
    }
}
