//! A host for Kubeless-style functions
//!
//! Every HTTP request becomes an [`Event`] that is handed to the selected user
//! function under a wall-clock deadline. The function runs in a separate
//! worker process (the default) or on its own thread, so a runaway or
//! crashing handler costs one request, not the host.
//!
//! ```no_run
//! use function_runtime::{select_function, Context, Event, HandlerError, Payload};
//!
//! fn say_hello(event: Event, ctx: &Context) -> Result<Payload, HandlerError> {
//!     Ok(format!("Hello from {}", ctx.function_name).into())
//! }
//!
//! fn say_goodbye(event: Event, ctx: &Context) -> Result<Payload, HandlerError> {
//!     Ok("Goodbye".into())
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     // Expose say_hello and say_goodbye, FUNC_HANDLER picks one of them
//!     function_runtime::start(select_function!(say_hello, say_goodbye))
//! }
//! ```

use std::process::ExitCode;

use actix_web::web;
use tracing::{error, info};

pub mod config;
pub mod error;
pub mod event;
pub mod invoker;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod trace;
pub mod types;
pub mod worker;

pub use config::{Config, IsolationMode};
pub use error::{ConfigError, InvocationFailure, StartupError};
pub use event::normalize;
pub use invoker::{InvocationResult, InvocationState, Invoker, ProcessPool, WorkerCommand};
pub use types::*;

#[macro_export]
/// Build a [`FunctionRegistry`] exposing each listed function under its own name
///
/// The runtime picks the entry named by the `FUNC_HANDLER` environment variable.
macro_rules! select_function {
    ( $( $x:ident ),* $(,)? ) => {
        {
            let registry = $crate::types::FunctionRegistry::new();
            $(
                let registry = registry.register(stringify!($x), $x);
            )*
            registry
        }
    };
}

/// Start serving the selected function
///
/// In a worker process this serves a single invocation over stdio instead.
/// Configuration errors are reported before anything binds.
pub fn start(functions: FunctionRegistry) -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid function configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if worker::is_worker_process() {
        logging::init(logging::LogTarget::Stderr);
        return worker::run(&config.function_name, &functions);
    }

    logging::init(logging::LogTarget::Stdout);
    match actix_web::rt::System::new().block_on(run(config, functions)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "function runtime stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, functions: FunctionRegistry) -> Result<(), StartupError> {
    let function = functions.resolve(&config.function_name)?;
    let metrics = metrics::Metrics::new()?;

    let invoker = match config.isolation {
        IsolationMode::Thread => Invoker::thread(function, config.context(), config.timeout),
        IsolationMode::Process => {
            let pool = ProcessPool::new(WorkerCommand::current_exe()?, config.prewarm);
            pool.prewarm()?;
            Invoker::process(pool, config.context(), config.timeout)
        }
    };

    let provider = trace::init_tracer_provider(&config);
    let bridge = trace::bridge_for(provider.as_ref());

    info!(
        function = %config.function_name,
        isolation = ?config.isolation,
        timeout = ?config.timeout,
        workers = config.workers,
        tracing = provider.is_some(),
        "starting function runtime"
    );

    let front = server::FrontDoor::new(invoker, bridge, metrics, config.workers)
        .with_max_body_size(config.max_body_size)
        .with_access_log(config.internal_logger);
    let served = server::serve(web::Data::new(front), config.port).await;

    trace::shutdown(provider);
    Ok(served?)
}
