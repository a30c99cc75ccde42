//! Pool of committer threads delivering finished replies.
//!
//! Committing returns the result to the parked client call and may block on
//! network IO, so it always happens outside the queue lock.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::rpc::Response;
use crate::scheduler::work::ReplyContext;

struct State<R> {
    queue: VecDeque<(ReplyContext<R>, Response<R>)>,
    stop: bool,
}

struct Shared<R> {
    state: Mutex<State<R>>,
    cond: Condvar,
}

pub struct OutputQueue<R: Send + 'static> {
    shared: Arc<Shared<R>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Send + 'static> OutputQueue<R> {
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        });

        let threads = (0..num_threads.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("output-{i}"))
                    .spawn(move || output_thread(shared))
                    .expect("spawn output thread")
            })
            .collect();

        OutputQueue {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Queue a finished reply for delivery.
    pub fn push_back(&self, reply: ReplyContext<R>, response: Response<R>) {
        let mut state = self.shared.state.lock().expect("output queue poisoned");
        state.queue.push_back((reply, response));
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Stop the pool. Replies already queued are drained before the threads
    /// exit.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("output queue poisoned");
            state.stop = true;
        }
        self.shared.cond.notify_all();
        let handles = std::mem::take(&mut *self.threads.lock().expect("output queue poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
        debug!("output queue stopped");
    }
}

impl<R: Send + 'static> Drop for OutputQueue<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn output_thread<R: Send + 'static>(shared: Arc<Shared<R>>) {
    let mut state = shared.state.lock().expect("output queue poisoned");
    loop {
        while state.queue.is_empty() && !state.stop {
            state = shared
                .cond
                .wait(state)
                .expect("output queue poisoned");
        }
        // Drain the remaining queue before honouring the stop flag.
        let Some((reply, response)) = state.queue.pop_front() else {
            break;
        };
        drop(state);
        trace!("committing reply");
        reply.commit_response(response);
        state = shared.state.lock().expect("output queue poisoned");
    }
}
