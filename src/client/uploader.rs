//! Client-side on-demand reinit upload.
//!
//! The server only needs a session's reinit program at specific moments, and
//! the program may be large, so it is not attached to every work unit.
//! Instead this controller announces each new program (`notify`), offers it
//! (`pending`, parked server-side) and delivers it (`upload`) when the server
//! asks. The loop then starts over so the server can request the program
//! again after handing the hardware to someone else.
//!
//! Cancellation is only observed at the progress-poll period, so a
//! superseded loop thread cannot be joined immediately; it is moved to a
//! stopped list and collected later. Every loop carries its own copy of the
//! unique id to decide on its own whether it is stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::SchedulerClient;
use crate::rpc::RpcError;

/// Consecutive transport failures tolerated before the loop gives up.
const MAX_CONSECUTIVE_ERRORS: usize = 10;
/// Wait after a failed call before retrying.
const DELAY_AFTER_ERROR: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// The server resolved the offer with *false* and never asked for the
    /// payload.
    #[error("upload was abandoned by the server")]
    Abandoned,

    /// The loop hit its consecutive-error budget.
    #[error("upload loop gave up after {attempts} consecutive errors")]
    TooManyErrors { attempts: usize },
}

struct Shared<D> {
    upload_data: Mutex<Option<Arc<D>>>,
    unique_id: Mutex<u32>,
    is_notified: AtomicBool,
    is_uploaded: AtomicBool,
    last_outcome: Mutex<Option<UploadError>>,
    finish_mutex: Mutex<()>,
    cv_finish: Condvar,
}

struct LoopThread {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LoopThread {
    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Keeps the server supplied with the session's current reinit program.
pub struct OnDemandUploader<P, R, D> {
    client: SchedulerClient<P, R, D>,
    shared: Arc<Shared<D>>,
    current: Mutex<Option<LoopThread>>,
    stopped: Mutex<Vec<LoopThread>>,
    retry_delay: Duration,
}

impl<P, R, D> OnDemandUploader<P, R, D>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(client: SchedulerClient<P, R, D>) -> Self {
        OnDemandUploader {
            client,
            shared: Arc::new(Shared {
                upload_data: Mutex::new(None),
                unique_id: Mutex::new(0),
                is_notified: AtomicBool::new(false),
                is_uploaded: AtomicBool::new(false),
                last_outcome: Mutex::new(None),
                finish_mutex: Mutex::new(()),
                cv_finish: Condvar::new(),
            }),
            current: Mutex::new(None),
            stopped: Mutex::new(Vec::new()),
            retry_delay: DELAY_AFTER_ERROR,
        }
    }

    /// Shorten the error backoff (used by tests).
    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    /// Notify the server about `data` and upload it once requested.
    ///
    /// Supersedes any upload still in flight; the old loop is told to stop
    /// and collected later.
    pub fn upload(&self, data: D) {
        self.prepare_new_upload();

        let unique_id = rand::rng().random::<u32>();
        *self.shared.unique_id.lock().expect("uploader poisoned") = unique_id;
        *self.shared.upload_data.lock().expect("uploader poisoned") = Some(Arc::new(data));
        debug!(unique_id, "starting upload loop");
        self.start_loop(unique_id);
    }

    /// Restart the loop with the existing id if it has exited while data is
    /// still held, keeping the server primed.
    pub fn refresh(&self) {
        let mut current = self.current.lock().expect("uploader poisoned");
        if let Some(running) = current.as_ref() {
            if !running.is_finished() {
                return;
            }
        }
        if self.shared.upload_data.lock().expect("uploader poisoned").is_none() {
            return;
        }
        if let Some(finished) = current.take() {
            self.stopped.lock().expect("uploader poisoned").push(finished);
        }
        drop(current);
        self.trim_stopped_threads(false);

        *self.shared.last_outcome.lock().expect("uploader poisoned") = None;
        let unique_id = *self.shared.unique_id.lock().expect("uploader poisoned");
        debug!(unique_id, "refreshing upload loop");
        self.start_loop(unique_id);
    }

    /// Whether data has been handed to this uploader.
    pub fn holds_data(&self) -> bool {
        self.shared.upload_data.lock().expect("uploader poisoned").is_some()
    }

    /// Whether the server requested and received the payload.
    pub fn is_uploaded(&self) -> bool {
        self.shared.is_uploaded.load(Ordering::SeqCst)
    }

    /// Whether the announcement reached the server.
    pub fn is_notified(&self) -> bool {
        self.shared.is_notified.load(Ordering::SeqCst)
    }

    /// Stop the in-flight loop without dropping the held data.
    pub fn abort(&self) {
        let mut current = self.current.lock().expect("uploader poisoned");
        if let Some(thread) = current.take() {
            thread.request_stop();
            self.stopped.lock().expect("uploader poisoned").push(thread);
        }
    }

    /// Block until the payload has been transferred upstream.
    pub fn wait(&self) -> Result<(), UploadError> {
        let mut guard = self.shared.finish_mutex.lock().expect("uploader poisoned");
        loop {
            if self.shared.is_uploaded.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(outcome) = self
                .shared
                .last_outcome
                .lock()
                .expect("uploader poisoned")
                .clone()
            {
                return Err(outcome);
            }
            guard = self
                .shared
                .cv_finish
                .wait_timeout(guard, Duration::from_millis(100))
                .expect("uploader poisoned")
                .0;
        }
    }

    fn prepare_new_upload(&self) {
        self.abort();
        self.trim_stopped_threads(false);
        self.shared.is_notified.store(false, Ordering::SeqCst);
        self.shared.is_uploaded.store(false, Ordering::SeqCst);
        *self.shared.last_outcome.lock().expect("uploader poisoned") = None;
    }

    fn start_loop(&self, unique_id: u32) {
        let data = self
            .shared
            .upload_data
            .lock()
            .expect("uploader poisoned")
            .clone()
            .expect("upload data present when starting the loop");

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let handle = {
            let client = self.client.clone();
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            let finished = Arc::clone(&finished);
            let retry_delay = self.retry_delay;
            std::thread::Builder::new()
                .name("reinit-upload".into())
                .spawn(move || {
                    upload_loop(client, data, unique_id, retry_delay, &stop, &shared);
                    finished.store(true, Ordering::SeqCst);
                    let _guard = shared.finish_mutex.lock().expect("uploader poisoned");
                    shared.cv_finish.notify_all();
                })
                .expect("spawn upload loop")
        };

        *self.current.lock().expect("uploader poisoned") = Some(LoopThread {
            stop,
            finished,
            handle,
        });
    }

    /// Collect stopped loops. Only threads that have signalled completion are
    /// joined early; the rest wait for destruction.
    fn trim_stopped_threads(&self, join_all: bool) {
        let mut stopped = self.stopped.lock().expect("uploader poisoned");
        let mut keep = Vec::new();
        for thread in stopped.drain(..) {
            if join_all || thread.is_finished() {
                thread
                    .handle
                    .join()
                    .expect("upload loop thread panicked");
            } else {
                keep.push(thread);
            }
        }
        *stopped = keep;
    }
}

impl<P, R, D> Drop for OnDemandUploader<P, R, D> {
    fn drop(&mut self) {
        let current = self.current.get_mut().expect("uploader poisoned").take();
        if let Some(thread) = current {
            thread.request_stop();
            let _ = thread.handle.join();
        }
        let stopped = std::mem::take(&mut *self.stopped.get_mut().expect("uploader poisoned"));
        for thread in stopped {
            thread.request_stop();
            let _ = thread.handle.join();
        }
    }
}

fn upload_loop<P, R, D>(
    client: SchedulerClient<P, R, D>,
    data: Arc<D>,
    unique_id: u32,
    retry_delay: Duration,
    stop: &AtomicBool,
    shared: &Shared<D>,
) where
    P: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned,
    D: Serialize + DeserializeOwned,
{
    let mut consecutive_errors = 0usize;

    macro_rules! attempt {
        ($call:expr) => {
            match $call {
                Ok(value) => {
                    consecutive_errors = 0;
                    value
                }
                Err(RpcError::Cancelled) => return,
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!(
                            unique_id,
                            attempts = consecutive_errors,
                            "giving up on upload loop: {e}"
                        );
                        *shared.last_outcome.lock().expect("uploader poisoned") =
                            Some(UploadError::TooManyErrors {
                                attempts: consecutive_errors,
                            });
                        return;
                    }
                    warn!(unique_id, "upload call failed, retrying: {e}");
                    std::thread::sleep(retry_delay);
                    continue;
                }
            }
        };
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        attempt!(client.reinit_notify(unique_id, Some(stop)));
        shared.is_notified.store(true, Ordering::SeqCst);

        let wanted = attempt!(client.reinit_pending(unique_id, Some(stop)));
        if !wanted {
            debug!(unique_id, "server abandoned the upload offer");
            if !shared.is_uploaded.load(Ordering::SeqCst) {
                *shared.last_outcome.lock().expect("uploader poisoned") =
                    Some(UploadError::Abandoned);
            }
            return;
        }

        attempt!(client.reinit_upload(&data, unique_id, Some(stop)));
        shared.is_uploaded.store(true, Ordering::SeqCst);
        {
            let _guard = shared.finish_mutex.lock().expect("uploader poisoned");
            shared.cv_finish.notify_all();
        }
        info!(unique_id, "reinit payload uploaded");
        // Offer the data again so the server can re-request it after the
        // hardware has been handed to another session.
    }
}
