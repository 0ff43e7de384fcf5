//! The HTTP front door
//!
//! `/healthz` and `/metrics` are answered directly; every other path and
//! method runs the invocation pipeline: normalize, bridge the trace, invoke
//! under the deadline, record metrics, respond.

use std::sync::Arc;
use std::time::Instant;

use actix_web::http::{header, Method};
use actix_web::{web, HttpRequest, HttpResponse, HttpServer};
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::event::normalize;
use crate::invoker::{InvocationResult, Invoker};
use crate::metrics::Metrics;
use crate::trace::TraceBridge;
use crate::types::{Headers, RawRequest};

pub const TIMEOUT_MESSAGE: &str = "Timeout while processing the function";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Everything a request handler needs, created once at startup
pub struct FrontDoor {
    invoker: Arc<Invoker>,
    bridge: TraceBridge,
    metrics: Metrics,
    permits: Arc<Semaphore>,
    max_body_size: usize,
    access_log: bool,
}

impl FrontDoor {
    /// `workers` bounds how many invocations run at the same time.
    pub fn new(invoker: Invoker, bridge: TraceBridge, metrics: Metrics, workers: usize) -> Self {
        Self {
            invoker: Arc::new(invoker),
            bridge,
            metrics,
            permits: Arc::new(Semaphore::new(workers)),
            max_body_size: crate::config::DEFAULT_MAX_BODY_SIZE,
            access_log: false,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Register the routes. Order matters: the catch-all comes last.
pub fn configure(cfg: &mut web::ServiceConfig, front: web::Data<FrontDoor>) {
    cfg.app_data(front)
        .route("/healthz", web::route().to(healthz))
        .route("/metrics", web::get().to(metrics))
        .route("/{tail:.*}", web::route().to(invoke_function));
}

/// Serve until the server is stopped (SIGINT/SIGTERM).
pub async fn serve(front: web::Data<FrontDoor>, port: u16) -> std::io::Result<()> {
    info!(port, "function runtime listening");
    HttpServer::new(move || {
        let front = front.clone();
        actix_web::App::new().configure(move |cfg| configure(cfg, front))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

/// Handle requests to /healthz
async fn healthz(req: HttpRequest) -> HttpResponse {
    match *req.method() {
        // Accept GET and HEAD requests
        Method::GET | Method::HEAD => HttpResponse::Ok().content_type(TEXT_PLAIN).body("OK"),
        // Reject any other type of request with 400 Bad Request
        _ => HttpResponse::BadRequest().body("Bad Request"),
    }
}

async fn metrics(front: web::Data<FrontDoor>) -> HttpResponse {
    match front.metrics.render() {
        Ok((content_type, body)) => HttpResponse::Ok().content_type(content_type).body(body),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn invoke_function(req: HttpRequest, payload: web::Payload, front: web::Data<FrontDoor>) -> HttpResponse {
    let started = Instant::now();
    // Bodies of queued requests stay in the socket until a permit is free.
    let Ok(_permit) = Arc::clone(&front.permits).acquire_owned().await else {
        return HttpResponse::ServiceUnavailable().finish();
    };

    let body = match read_body(payload, front.max_body_size).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let request = raw_request(&req, body);
    let method = request.method.clone();
    let path = request.path.clone();

    let span = front.bridge.bridge(&request.headers, &method, &path);
    let carrier = span.carrier();
    let event = normalize(request);

    let timer = front.metrics.start(&method);
    let invoker = Arc::clone(&front.invoker);
    let result = match web::block(move || invoker.invoke(event, carrier)).await {
        Ok(result) => result,
        Err(e) => InvocationResult::dispatch_failure(e),
    };
    timer.finish(&result);

    match &result {
        InvocationResult::Success(_) => {}
        InvocationResult::Timeout => {
            warn!(%method, %path, timeout = ?front.invoker.timeout(), "function timed out")
        }
        InvocationResult::Failure(failure) => {
            warn!(%method, %path, error = %failure, "function invocation failed")
        }
    }
    span.finish(&result);

    let response = respond(result);
    if front.access_log {
        info!(
            %method,
            %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request served"
        );
    }
    response
}

async fn read_body(payload: web::Payload, limit: usize) -> Result<Bytes, HttpResponse> {
    match payload.to_bytes_limited(limit).await {
        Ok(Ok(body)) => Ok(body),
        Err(_limit_exceeded) => {
            warn!(limit, "request body too large");
            Err(HttpResponse::PayloadTooLarge().finish())
        }
        Ok(Err(e)) => {
            warn!(error = %e, "failed to read request body");
            Err(HttpResponse::from_error(e))
        }
    }
}

fn raw_request(req: &HttpRequest, body: Bytes) -> RawRequest {
    let mut headers = Headers::default();
    for (name, value) in req.headers() {
        match value.to_str() {
            Ok(value) => headers.insert(name.as_str(), value),
            Err(_) => warn!(header = %name, "ignoring non-ascii header value"),
        }
    }
    RawRequest {
        method: req.method().to_string(),
        path: req.path().to_owned(),
        query: req.query_string().to_owned(),
        headers,
        body,
    }
}

fn respond(result: InvocationResult) -> HttpResponse {
    match result {
        InvocationResult::Success(payload) => {
            let mut response = HttpResponse::Ok();
            if let Some(content_type) = payload.content_type {
                response.insert_header((header::CONTENT_TYPE, content_type));
            }
            response.body(payload.body)
        }
        InvocationResult::Timeout => HttpResponse::RequestTimeout()
            .content_type(TEXT_PLAIN)
            .body(TIMEOUT_MESSAGE),
        InvocationResult::Failure(_) => HttpResponse::InternalServerError()
            .content_type(TEXT_PLAIN)
            .body("Internal Server Error"),
    }
}
