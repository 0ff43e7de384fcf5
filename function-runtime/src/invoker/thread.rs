//! Thread isolation: cheap, but a native crash in the handler is fatal to
//! the host. A thread that outlives its deadline is detached and its late
//! result is dropped.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::warn;

use super::{run_handler, InvocationResult};
use crate::trace::{TraceCarrier, TraceScope};
use crate::types::{Context, Event, UserFunction};

pub(super) fn invoke(
    function: UserFunction,
    context: Arc<Context>,
    event: Event,
    trace: TraceCarrier,
    deadline: Instant,
) -> InvocationResult {
    let (tx, rx) = mpsc::sync_channel(1);

    let spawned = thread::Builder::new()
        .name(format!("fn-{}", context.function_name))
        .spawn(move || {
            let _scope = TraceScope::attach(&trace);
            let reply = run_handler(function, event, &context);
            // The caller is gone once the deadline passed.
            let _ = tx.send(reply);
        });

    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn handler thread");
        return InvocationResult::dispatch_failure(e);
    }

    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(reply) => InvocationResult::from_reply(reply),
        Err(RecvTimeoutError::Timeout) => InvocationResult::Timeout,
        Err(RecvTimeoutError::Disconnected) => InvocationResult::from_reply(Err(String::from(
            "handler thread exited without a result",
        ))),
    }
}
