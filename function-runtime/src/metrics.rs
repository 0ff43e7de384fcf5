//! Prometheus instrumentation of function calls

use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

use crate::invoker::InvocationResult;

/// Methods whose series exist from startup, before any call
pub const TRACKED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Label shared by every method outside [`TRACKED_METHODS`]
pub const OTHER_METHOD: &str = "OTHER";

/// Keep label cardinality bounded whatever verb a client sends.
fn method_label(method: &str) -> &str {
    TRACKED_METHODS
        .into_iter()
        .find(|tracked| tracked.eq_ignore_ascii_case(method))
        .unwrap_or(OTHER_METHOD)
}

/// Call, failure and duration metrics, labelled by HTTP method
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    calls: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let calls = IntCounterVec::new(
            Opts::new("function_calls_total", "Number of calls to user function"),
            &["method"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("function_failures_total", "Number of failed calls"),
            &["method"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("function_duration_seconds", "Duration of user function in seconds"),
            &["method"],
        )?;

        registry.register(Box::new(calls.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        for method in TRACKED_METHODS {
            calls.with_label_values(&[method]);
            failures.with_label_values(&[method]);
            duration.with_label_values(&[method]);
        }

        Ok(Self {
            registry,
            calls,
            failures,
            duration,
        })
    }

    /// Count a call and start timing it.
    pub fn start(&self, method: &str) -> CallTimer {
        let method = method_label(method);
        self.calls.with_label_values(&[method]).inc();
        CallTimer {
            failures: self.failures.with_label_values(&[method]),
            timer: self.duration.with_label_values(&[method]).start_timer(),
        }
    }

    pub fn calls(&self, method: &str) -> u64 {
        self.calls.with_label_values(&[method_label(method)]).get()
    }

    pub fn failures(&self, method: &str) -> u64 {
        self.failures.with_label_values(&[method_label(method)]).get()
    }

    pub fn duration_samples(&self, method: &str) -> u64 {
        self.duration
            .with_label_values(&[method_label(method)])
            .get_sample_count()
    }

    /// The text exposition of every series, with its content type.
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_owned(), buffer))
    }
}

/// Observes the duration of one call when finished or dropped
pub struct CallTimer {
    failures: IntCounter,
    timer: HistogramTimer,
}

impl CallTimer {
    /// Record the outcome. Timeouts count as failures.
    pub fn finish(self, result: &InvocationResult) {
        match result {
            InvocationResult::Success(_) => {}
            InvocationResult::Timeout | InvocationResult::Failure(_) => self.failures.inc(),
        }
        self.timer.observe_duration();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvocationFailure;
    use crate::types::Payload;

    #[test]
    fn test_series_exist_at_startup() {
        let metrics = Metrics::new().unwrap();
        let (content_type, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        for method in TRACKED_METHODS {
            assert!(text.contains(&format!("function_calls_total{{method=\"{method}\"}} 0")));
            assert!(text.contains(&format!("function_failures_total{{method=\"{method}\"}} 0")));
            assert!(text.contains(&format!("function_duration_seconds_count{{method=\"{method}\"}} 0")));
        }
    }

    #[test]
    fn test_timeouts_and_failures_count_as_failures() {
        let metrics = Metrics::new().unwrap();

        for _ in 0..3 {
            metrics.start("GET").finish(&InvocationResult::Success(Payload::new("ok")));
        }
        for _ in 0..2 {
            metrics.start("GET").finish(&InvocationResult::Timeout);
        }
        metrics
            .start("POST")
            .finish(&InvocationResult::Failure(InvocationFailure::Handler("bad".into())));

        assert_eq!(metrics.calls("GET"), 5);
        assert_eq!(metrics.failures("GET"), 2);
        assert_eq!(metrics.duration_samples("GET"), 5);
        assert_eq!(metrics.calls("POST"), 1);
        assert_eq!(metrics.failures("POST"), 1);
    }

    #[test]
    fn test_unknown_methods_share_one_series() {
        let metrics = Metrics::new().unwrap();
        metrics.start("PROPFIND").finish(&InvocationResult::Timeout);
        metrics.start("BREW").finish(&InvocationResult::Success(Payload::new("ok")));
        metrics.start("get").finish(&InvocationResult::Success(Payload::new("ok")));

        assert_eq!(metrics.calls(OTHER_METHOD), 2);
        assert_eq!(metrics.failures(OTHER_METHOD), 1);
        assert_eq!(metrics.calls("GET"), 1);

        let (_, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("function_calls_total{method=\"OTHER\"} 2"));
        assert!(!text.contains("PROPFIND"));
        assert!(!text.contains("BREW"));
    }

    #[test]
    fn test_dropped_timer_still_observes_duration() {
        let metrics = Metrics::new().unwrap();
        drop(metrics.start("DELETE"));
        assert_eq!(metrics.calls("DELETE"), 1);
        assert_eq!(metrics.duration_samples("DELETE"), 1);
        assert_eq!(metrics.failures("DELETE"), 0);
    }
}
