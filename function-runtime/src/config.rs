//! Runtime configuration read from `FUNC_*` environment variables

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::Context;

/// The default timeout for user functions, in seconds
pub const DEFAULT_TIMEOUT: u64 = 180;

/// The default memory limit
///
/// `0` indicates that no limit was provided
pub const DEFAULT_MEMORY_LIMIT: u64 = 0;

pub const DEFAULT_PORT: u16 = 8080;

/// Largest request body buffered for a function, 100 MiB
pub const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

/// Default bound on concurrently running invocations
pub const DEFAULT_WORKERS: usize = 50;

/// Longest accepted timeout, one year in seconds
pub const MAX_TIMEOUT: u64 = 365 * 24 * 60 * 60;

/// How the user function is separated from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// One child process per invocation, taken from a prewarmed pool
    Process,
    /// One thread per invocation; a native crash takes the host down
    Thread,
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(IsolationMode::Process),
            "thread" => Ok(IsolationMode::Thread),
            other => Err(format!(
                "unsupported isolation mode {other:?}, expected \"process\" or \"thread\""
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub function_name: String,
    pub module_name: String,
    pub runtime: String,
    pub namespace: String,
    pub port: u16,
    pub timeout: Duration,
    pub memory_limit: u64,
    pub max_body_size: usize,
    pub isolation: IsolationMode,
    pub workers: usize,
    pub prewarm: usize,
    pub trace_collector_endpoint: Option<String>,
    pub internal_logger: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let function_name = var("FUNC_HANDLER").ok_or(ConfigError::Missing("FUNC_HANDLER"))?;

        let timeout = parse_or("FUNC_TIMEOUT", var("FUNC_TIMEOUT"), DEFAULT_TIMEOUT)?;
        if timeout == 0 {
            return Err(ConfigError::invalid("FUNC_TIMEOUT", "0", "must be greater than 0"));
        }
        if timeout > MAX_TIMEOUT {
            return Err(ConfigError::invalid(
                "FUNC_TIMEOUT",
                &timeout.to_string(),
                format!("must be at most {MAX_TIMEOUT}"),
            ));
        }

        let workers = parse_or("FUNC_WORKERS", var("FUNC_WORKERS"), DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(ConfigError::invalid("FUNC_WORKERS", "0", "must be greater than 0"));
        }

        let prewarm = match var("FUNC_PREWARM") {
            Some(raw) => {
                let prewarm: usize = parse_or("FUNC_PREWARM", Some(raw.clone()), 0)?;
                if prewarm > workers {
                    return Err(ConfigError::invalid(
                        "FUNC_PREWARM",
                        &raw,
                        format!("must not exceed FUNC_WORKERS ({workers})"),
                    ));
                }
                prewarm
            }
            None => num_cpus::get().clamp(1, 8).min(workers),
        };

        let memory_limit = match var("FUNC_MEMORY_LIMIT") {
            Some(raw) => parse_quantity(&raw)
                .ok_or_else(|| ConfigError::invalid("FUNC_MEMORY_LIMIT", &raw, "not a byte quantity"))?,
            None => DEFAULT_MEMORY_LIMIT,
        };

        let isolation = match var("FUNC_ISOLATION") {
            Some(raw) => raw
                .parse::<IsolationMode>()
                .map_err(|reason| ConfigError::invalid("FUNC_ISOLATION", &raw, reason))?,
            None => IsolationMode::Process,
        };

        let internal_logger = match var("KYMA_INTERNAL_LOGGER_ENABLED") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                ConfigError::invalid("KYMA_INTERNAL_LOGGER_ENABLED", &raw, "expected true or false")
            })?,
            None => false,
        };

        Ok(Self {
            function_name,
            module_name: var("MOD_NAME").unwrap_or_else(|| String::from("handler")),
            runtime: var("FUNC_RUNTIME").unwrap_or_else(|| String::from("rust")),
            namespace: var("SERVICE_NAMESPACE").unwrap_or_default(),
            port: parse_or("FUNC_PORT", var("FUNC_PORT"), DEFAULT_PORT)?,
            timeout: Duration::from_secs(timeout),
            memory_limit,
            max_body_size: parse_or("FUNC_MEMFILE_MAX", var("FUNC_MEMFILE_MAX"), DEFAULT_MAX_BODY_SIZE)?,
            isolation,
            workers,
            prewarm,
            trace_collector_endpoint: var("TRACE_COLLECTOR_ENDPOINT"),
            internal_logger,
        })
    }

    /// The read-only context handed to every invocation.
    pub fn context(&self) -> Context {
        Context {
            function_name: self.function_name.clone(),
            module_name: self.module_name.clone(),
            namespace: self.namespace.clone(),
            runtime: self.runtime.clone(),
            timeout: self.timeout.as_secs(),
            memory_limit: self.memory_limit,
        }
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(name, &raw, e)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Parse a Kubernetes-style byte quantity such as `128Mi` or `1G`.
fn parse_quantity(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "K" | "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        _ => return None,
    };
    number.checked_mul(multiplier)
}
