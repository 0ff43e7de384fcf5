//! Process isolation with a prewarmed pool of single-use workers
//!
//! Workers are instances of the host binary started in worker mode. A pool
//! keeps a few of them spawned and idle so that an invocation only pays for
//! handing over the event, not for process startup. Every worker serves one
//! invocation and is then killed and reaped, whatever the outcome.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::wire::{self, WorkerRequest};
use super::InvocationResult;

/// Set on worker processes so `start` serves one invocation over stdio
pub const WORKER_MODE_ENV: &str = "FUNC_WORKER_MODE";

/// How to launch a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: vec![(WORKER_MODE_ENV.into(), "1".into())],
        }
    }

    /// Re-execute the running binary as the worker.
    pub fn current_exe() -> io::Result<Self> {
        let mut command = Self::new(std::env::current_exe()?);
        command.args = std::env::args_os().skip(1).collect();
        Ok(command)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    }
}

/// Spawned, idle worker processes waiting for their single invocation
pub struct ProcessPool {
    command: WorkerCommand,
    size: usize,
    idle: Mutex<VecDeque<Child>>,
}

impl ProcessPool {
    pub fn new(command: WorkerCommand, size: usize) -> Arc<Self> {
        Arc::new(Self {
            command,
            size,
            idle: Mutex::new(VecDeque::with_capacity(size)),
        })
    }

    /// Fill the pool up to its target size.
    pub fn prewarm(&self) -> io::Result<()> {
        while self.idle_count() < self.size {
            let child = self.command.spawn()?;
            self.idle.lock().push_back(child);
        }
        debug!(workers = self.size, "worker pool prewarmed");
        Ok(())
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Take a live idle worker, or spawn one if none is ready.
    fn checkout(self: &Arc<Self>) -> io::Result<Child> {
        let warm = loop {
            let Some(mut child) = self.idle.lock().pop_front() else {
                break None;
            };
            match child.try_wait() {
                Ok(None) => break Some(child),
                Ok(Some(status)) => warn!(%status, "discarding idle worker that exited"),
                Err(e) => {
                    warn!(error = %e, "discarding idle worker in unknown state");
                    reap(child);
                }
            }
        };

        self.replenish();
        match warm {
            Some(child) => Ok(child),
            None => {
                debug!("no idle worker, spawning cold");
                self.command.spawn()
            }
        }
    }

    /// Spawn one replacement worker in the background.
    fn replenish(self: &Arc<Self>) {
        if self.size == 0 {
            return;
        }
        let pool = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("worker-prewarm".into())
            .spawn(move || match pool.command.spawn() {
                Ok(child) => {
                    let mut idle = pool.idle.lock();
                    if idle.len() < pool.size {
                        idle.push_back(child);
                    } else {
                        drop(idle);
                        reap(child);
                    }
                }
                Err(e) => warn!(error = %e, "failed to prewarm worker"),
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start prewarm thread");
        }
    }

    pub(crate) fn invoke(self: &Arc<Self>, request: WorkerRequest, deadline: Instant) -> InvocationResult {
        let mut child = match self.checkout() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "failed to start worker process");
                return InvocationResult::dispatch_failure(e);
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(child);
            return InvocationResult::dispatch_failure("worker process has no stdio pipes");
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", child.id()))
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                let _ = tx.send(wire::exchange(stdin, &mut stdout, &request));
            });
        if let Err(e) = spawned {
            reap(child);
            return InvocationResult::dispatch_failure(e);
        }

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(reply)) => {
                reap(child);
                InvocationResult::from_reply(reply)
            }
            Ok(Err(e)) => {
                let status = reap(child);
                debug!(error = %e, "worker exchange failed");
                InvocationResult::from_reply(Err(describe_exit(status)))
            }
            Err(RecvTimeoutError::Timeout) => {
                reap(child);
                InvocationResult::Timeout
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = reap(child);
                InvocationResult::from_reply(Err(describe_exit(status)))
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        for child in self.idle.get_mut().drain(..) {
            reap(child);
        }
    }
}

/// Kill the worker if it is still running and collect its exit status.
fn reap(mut child: Child) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    let _ = child.kill();
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(error = %e, pid = child.id(), "failed to reap worker");
            None
        }
    }
}

fn describe_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("worker process exited without a reply ({status})"),
        None => String::from("worker process exited without a reply"),
    }
}
