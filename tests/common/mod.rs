//! Shared fixture: a live scheduler on a loopback port driving a recording
//! worker, plus clients and uploaders bound to it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use turnstile::client::{ClientConfig, OnDemandUploader, SchedulerClient};
use turnstile::scheduler::{SessionId, UserId};
use turnstile::server::{Scheduler, ShutdownCause, StopHandle};
use turnstile::{Config, Worker, WorkerFault};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUnit {
    pub tag: String,
    pub sleep_ms: u64,
    pub fail: bool,
}

impl TestUnit {
    pub fn tagged(tag: &str) -> Self {
        TestUnit {
            tag: tag.to_string(),
            sleep_ms: 0,
            fail: false,
        }
    }

    pub fn sleeping(tag: &str, sleep_ms: u64) -> Self {
        TestUnit {
            tag: tag.to_string(),
            sleep_ms,
            fail: false,
        }
    }

    pub fn failing(tag: &str) -> Self {
        TestUnit {
            tag: tag.to_string(),
            sleep_ms: 0,
            fail: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReinit {
    pub tag: String,
}

impl TestReinit {
    pub fn tagged(tag: &str) -> Self {
        TestReinit {
            tag: tag.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Setup,
    Work(String),
    Reinit(String),
    Teardown,
}

/// Worker that records everything done to it.
pub struct RecordingWorker {
    events: Arc<Mutex<Vec<WorkerEvent>>>,
}

impl Worker for RecordingWorker {
    type Payload = TestUnit;
    type Output = String;
    type Reinit = TestReinit;

    fn setup(&mut self) -> Result<(), WorkerFault> {
        self.events.lock().unwrap().push(WorkerEvent::Setup);
        Ok(())
    }

    fn work(&mut self, unit: TestUnit) -> Result<String, WorkerFault> {
        self.events
            .lock()
            .unwrap()
            .push(WorkerEvent::Work(unit.tag.clone()));
        if unit.sleep_ms > 0 {
            std::thread::sleep(Duration::from_millis(unit.sleep_ms));
        }
        if unit.fail {
            return Err(WorkerFault::new(format!("unit {} failed", unit.tag)));
        }
        Ok(unit.tag)
    }

    fn perform_reinit(&mut self, data: &TestReinit) -> Result<(), WorkerFault> {
        self.events
            .lock()
            .unwrap()
            .push(WorkerEvent::Reinit(data.tag.clone()));
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), WorkerFault> {
        self.events.lock().unwrap().push(WorkerEvent::Teardown);
        Ok(())
    }
}

/// `user:session` user data, sessions qualified by user.
pub fn verify_colon_data(user_data: &str) -> Option<(UserId, SessionId)> {
    let (user, session) = user_data.split_once(':')?;
    if user.is_empty() || session.is_empty() {
        return None;
    }
    Some((
        UserId(user.to_string()),
        SessionId(format!("{user}@{session}")),
    ))
}

pub type TestClient = SchedulerClient<TestUnit, String, TestReinit>;
pub type TestUploader = OnDemandUploader<TestUnit, String, TestReinit>;

pub struct ServerFixture {
    pub addr: String,
    events: Arc<Mutex<Vec<WorkerEvent>>>,
    stop: StopHandle,
    handle: Option<JoinHandle<ShutdownCause>>,
}

impl ServerFixture {
    pub fn start(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.listen_addr = "127.0.0.1:0".to_string();
        config.logging.stdout = false;
        configure(&mut config);

        let events = Arc::new(Mutex::new(Vec::new()));
        let worker = RecordingWorker {
            events: Arc::clone(&events),
        };
        let mut scheduler =
            Scheduler::new(config, worker, verify_colon_data).expect("bind test server");
        let addr = scheduler.local_addr().to_string();
        let stop = scheduler.stop_handle();
        let handle = std::thread::spawn(move || scheduler.run());

        ServerFixture {
            addr,
            events,
            stop,
            handle: Some(handle),
        }
    }

    pub fn client(&self, user_data: &str) -> TestClient {
        SchedulerClient::new(ClientConfig::new(self.addr.clone(), user_data))
    }

    pub fn uploader(&self, user_data: &str) -> TestUploader {
        OnDemandUploader::new(self.client(user_data))
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn work_tags(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Work(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    /// Poll the event log until `pred` holds or `timeout` elapses.
    pub fn wait_for_events(
        &self,
        timeout: Duration,
        pred: impl Fn(&[WorkerEvent]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.events()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Stop the server and return why it shut down.
    pub fn stop(mut self) -> ShutdownCause {
        self.stop.stop();
        self.handle
            .take()
            .expect("fixture stopped twice")
            .join()
            .expect("server thread panicked")
    }

    /// Wait for the server to stop on its own (idle timeout tests).
    pub fn wait_shutdown(mut self) -> ShutdownCause {
        self.handle
            .take()
            .expect("fixture stopped twice")
            .join()
            .expect("server thread panicked")
    }
}

impl Drop for ServerFixture {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.stop();
            let _ = handle.join();
        }
    }
}

/// Index of the first event matching `pred`.
pub fn event_index(events: &[WorkerEvent], pred: impl Fn(&WorkerEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}
