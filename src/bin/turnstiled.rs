//! Scheduler daemon hosting the built-in waiting worker.
//!
//! The waiting worker sleeps for the requested duration per work unit and
//! tracks which session the hardware is currently prepared for, which makes
//! it a faithful stand-in for real exclusive hardware when soak-testing the
//! scheduler.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use turnstile::scheduler::{SessionId, UserId};
use turnstile::server::ShutdownCause;
use turnstile::{Config, Scheduler, Worker, WorkerFault};

#[derive(Debug, Parser)]
#[command(name = "turnstiled", about = "Round-robin scheduler for an exclusive worker")]
struct Cli {
    /// Optional TOML config file; CLI flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen endpoint, `ip:port`.
    #[arg(long)]
    listen: Option<String>,

    /// Reply-committing threads.
    #[arg(long)]
    output_threads: Option<usize>,

    /// Shut down after this many seconds of idleness (0 = never).
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Force a worker release after this many seconds (0 = when drained).
    #[arg(long)]
    release_interval: Option<u64>,

    /// Per-user time slice in milliseconds (0 = switch every dispatch).
    #[arg(long)]
    user_slice_ms: Option<u64>,

    /// Maximum concurrent client connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Users refused by the demo verifier. May be given multiple times.
    #[arg(long = "deny", value_name = "USER")]
    denied_users: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> (Config, Vec<String>, u8) {
        let mut config = turnstile::config::load_or_default(self.config.as_deref());
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(n) = self.output_threads {
            config.output_threads = n;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.release_interval {
            config.release_interval_secs = secs;
        }
        if let Some(ms) = self.user_slice_ms {
            config.period_per_user_ms = ms;
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        (config, self.denied_users, self.verbose)
    }
}

/// One unit of demo work: sleep, then report a job number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub runtime_ms: u64,
    pub message: String,
    pub session_id: String,
    /// The first unit of a session establishes which session the hardware is
    /// prepared for.
    pub first_unit: bool,
}

/// Demo reinit program: sleep, then mark the hardware as prepared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinitProgram {
    pub runtime_ms: u64,
    pub message: String,
    pub session_id: String,
}

struct WaitingWorker {
    job_count: u64,
    current_session: Option<String>,
}

impl WaitingWorker {
    fn new() -> Self {
        WaitingWorker {
            job_count: 0,
            current_session: None,
        }
    }
}

impl Worker for WaitingWorker {
    type Payload = WorkUnit;
    type Output = u64;
    type Reinit = ReinitProgram;

    fn setup(&mut self) -> Result<(), WorkerFault> {
        info!("setting up");
        Ok(())
    }

    fn work(&mut self, unit: WorkUnit) -> Result<u64, WorkerFault> {
        if unit.first_unit {
            self.current_session = Some(unit.session_id.clone());
            info!(session = %unit.session_id, "first unit for session");
        } else if self.current_session.as_deref() != Some(unit.session_id.as_str()) {
            return Err(WorkerFault::new(format!(
                "worker prepared for session {:?} but the unit expected {}",
                self.current_session, unit.session_id
            )));
        }

        let job_id = self.job_count;
        self.job_count += 1;
        info!(job_id, runtime_ms = unit.runtime_ms, "job started");
        std::thread::sleep(std::time::Duration::from_millis(unit.runtime_ms));
        info!(job_id, message = %unit.message, "job finished");
        Ok(job_id)
    }

    fn perform_reinit(&mut self, program: &ReinitProgram) -> Result<(), WorkerFault> {
        info!(runtime_ms = program.runtime_ms, message = %program.message, "running reinit");
        std::thread::sleep(std::time::Duration::from_millis(program.runtime_ms));
        self.current_session = Some(program.session_id.clone());
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), WorkerFault> {
        info!("tearing down");
        self.current_session = None;
        Ok(())
    }
}

/// Treats user data as `user:session`; the session id is qualified with the
/// user name so two users naming their session alike stay separate.
struct ColonVerifier {
    denied_users: Vec<String>,
}

impl turnstile::Verifier for ColonVerifier {
    fn verify_user(&self, user_data: &str) -> Option<(UserId, SessionId)> {
        let (user, session) = user_data.split_once(':')?;
        if user.is_empty() || session.is_empty() {
            warn!(user_data, "invalid user data");
            return None;
        }
        if self.denied_users.iter().any(|denied| denied == user) {
            warn!(user, "denied by configuration");
            return None;
        }
        Some((
            UserId(user.to_string()),
            SessionId(format!("{user}@{session}")),
        ))
    }
}

fn main() -> ExitCode {
    let (config, denied_users, verbose) = Cli::parse().into_config();
    let _telemetry = turnstile::telemetry::init(verbose.max(1), &config.logging);

    let verifier = ColonVerifier { denied_users };
    let mut scheduler = match Scheduler::new(config, WaitingWorker::new(), verifier) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("turnstiled: {e}");
            return ExitCode::from(2);
        }
    };

    match scheduler.run() {
        ShutdownCause::IdleTimeout | ShutdownCause::Signal => ExitCode::SUCCESS,
        ShutdownCause::Fatal(message) => {
            eprintln!("turnstiled: fatal: {message}");
            ExitCode::FAILURE
        }
    }
}
