//! Runs the user function behind an isolation boundary under a deadline
//!
//! An invocation moves through `Idle → Dispatched → {Completed | TimedOut |
//! Crashed}`. Whatever the handler does, the caller waits at most until the
//! deadline: each invocation gets its own single-use result channel and the
//! caller only ever blocks in `recv_timeout` on it.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::InvocationFailure;
use crate::trace::TraceCarrier;
use crate::types::{Context, Event, Payload, UserFunction};

mod process;
mod thread;
pub(crate) mod wire;

pub use process::{ProcessPool, WorkerCommand, WORKER_MODE_ENV};

/// The outcome of one invocation, produced exactly once per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationResult {
    Success(Payload),
    Timeout,
    Failure(InvocationFailure),
}

impl InvocationResult {
    /// The terminal state this result leaves the invocation in.
    pub fn state(&self) -> InvocationState {
        match self {
            InvocationResult::Success(_) => InvocationState::Completed,
            InvocationResult::Failure(InvocationFailure::Handler(_)) => InvocationState::Completed,
            InvocationResult::Timeout => InvocationState::TimedOut,
            InvocationResult::Failure(InvocationFailure::Dispatch(_)) => InvocationState::Crashed,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            InvocationResult::Success(_) => "success",
            InvocationResult::Timeout => "timeout",
            InvocationResult::Failure(_) => "failure",
        }
    }

    pub(crate) fn dispatch_failure(reason: impl fmt::Display) -> Self {
        InvocationResult::Failure(InvocationFailure::Dispatch(reason.to_string()))
    }

    pub(crate) fn from_reply(reply: Result<Payload, String>) -> Self {
        match reply {
            Ok(payload) => InvocationResult::Success(payload),
            Err(message) => InvocationResult::Failure(InvocationFailure::Handler(message)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Dispatched,
    Completed,
    TimedOut,
    Crashed,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationState::Idle => "idle",
            InvocationState::Dispatched => "dispatched",
            InvocationState::Completed => "completed",
            InvocationState::TimedOut => "timed_out",
            InvocationState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

enum Isolation {
    Thread(UserFunction),
    Process(Arc<ProcessPool>),
}

/// Executes the configured user function, one isolated unit per call
pub struct Invoker {
    isolation: Isolation,
    context: Arc<Context>,
    timeout: Duration,
}

impl Invoker {
    /// Run the function on a fresh thread per invocation.
    pub fn thread(function: UserFunction, context: Context, timeout: Duration) -> Self {
        Self {
            isolation: Isolation::Thread(function),
            context: Arc::new(context),
            timeout,
        }
    }

    /// Run the function in worker processes taken from `pool`.
    pub fn process(pool: Arc<ProcessPool>, context: Context, timeout: Duration) -> Self {
        Self {
            isolation: Isolation::Process(pool),
            context: Arc::new(context),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke with the configured timeout, measured from now.
    pub fn invoke(&self, event: Event, trace: TraceCarrier) -> InvocationResult {
        self.invoke_until(event, trace, deadline_after(self.timeout))
    }

    pub fn invoke_until(&self, event: Event, trace: TraceCarrier, deadline: Instant) -> InvocationResult {
        let started = Instant::now();
        debug!(
            from = %InvocationState::Idle,
            to = %InvocationState::Dispatched,
            "dispatching invocation"
        );

        let result = match &self.isolation {
            Isolation::Thread(function) => {
                thread::invoke(*function, Arc::clone(&self.context), event, trace, deadline)
            }
            Isolation::Process(pool) => {
                let request = wire::WorkerRequest {
                    event,
                    context: Context::clone(&self.context),
                    trace,
                };
                pool.invoke(request, deadline)
            }
        };

        debug!(
            state = %result.state(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "invocation settled"
        );
        result
    }
}

/// Deadlines past what `Instant` can represent are capped to roughly a century.
fn deadline_after(timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Call the user function, turning errors and panics into a message.
pub(crate) fn run_handler(function: UserFunction, event: Event, context: &Context) -> Result<Payload, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| function(event, context))) {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
