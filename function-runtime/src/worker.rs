//! The child side of process isolation
//!
//! A worker writes its protocol frames to a private copy of the original
//! stdout; fd 1 itself is pointed at stderr so that anything the handler
//! prints ends up in the logs instead of corrupting the channel.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process::ExitCode;

use tracing::{debug, error, warn};

use crate::invoker::wire::{self, WorkerFrame, WorkerRequest};
use crate::invoker::{run_handler, WORKER_MODE_ENV};
use crate::trace::TraceScope;
use crate::types::FunctionRegistry;

pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_MODE_ENV).is_some()
}

/// Serve a single invocation over stdio and exit.
pub fn run(function_name: &str, functions: &FunctionRegistry) -> ExitCode {
    let function = match functions.resolve(function_name) {
        Ok(function) => function,
        Err(e) => {
            error!(error = %e, "worker cannot resolve function");
            return ExitCode::FAILURE;
        }
    };

    let mut channel = match protocol_channel() {
        Ok(file) => BufWriter::new(file),
        Err(e) => {
            error!(error = %e, "worker cannot set up its protocol channel");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = wire::write(&mut channel, &WorkerFrame::Ready) {
        debug!(error = %e, "host went away before handshake");
        return ExitCode::FAILURE;
    }

    let request: WorkerRequest = match wire::read(&mut BufReader::new(io::stdin().lock())) {
        Ok(request) => request,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("worker released without an invocation");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!(error = %e, "unreadable invocation request");
            return ExitCode::FAILURE;
        }
    };

    if request.context.memory_limit > 0 {
        if let Err(e) = limit_memory(request.context.memory_limit) {
            warn!(error = %e, limit = request.context.memory_limit, "memory limit not applied");
        }
    }

    let reply = {
        let _scope = TraceScope::attach(&request.trace);
        run_handler(function, request.event, &request.context)
    };

    match wire::write(&mut channel, &WorkerFrame::Reply(reply)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!(error = %e, "host went away before the reply");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
fn protocol_channel() -> io::Result<File> {
    use std::os::fd::{AsRawFd, FromRawFd};

    io::stdout().flush()?;
    let stdout = io::stdout().as_raw_fd();
    // SAFETY: dup/dup2 only operate on descriptors this process owns; the
    // duplicate is handed to exactly one File which closes it on drop.
    unsafe {
        let private = libc::dup(stdout);
        if private < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(libc::STDERR_FILENO, stdout) < 0 {
            let e = io::Error::last_os_error();
            libc::close(private);
            return Err(e);
        }
        Ok(File::from_raw_fd(private))
    }
}

#[cfg(not(unix))]
fn protocol_channel() -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process isolation requires a unix host",
    ))
}

#[cfg(unix)]
fn limit_memory(bytes: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    // SAFETY: setrlimit reads the struct we pass and nothing else.
    if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn limit_memory(_bytes: u64) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "memory limits require a unix host"))
}
