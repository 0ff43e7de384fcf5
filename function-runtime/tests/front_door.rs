use std::thread;
use std::time::{Duration, Instant};

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use function_runtime::metrics::Metrics;
use function_runtime::server::{configure, FrontDoor, TIMEOUT_MESSAGE};
use function_runtime::trace::TraceBridge;
use function_runtime::{Context, Event, EventData, HandlerError, Invoker, Payload, UserFunction};
use serde_json::json;

fn context() -> Context {
    Context {
        function_name: "test".into(),
        module_name: "handler".into(),
        namespace: String::new(),
        runtime: "rust".into(),
        timeout: 1,
        memory_limit: 0,
    }
}

fn front_door(function: UserFunction, timeout: Duration) -> web::Data<FrontDoor> {
    let invoker = Invoker::thread(function, context(), timeout);
    let metrics = Metrics::new().unwrap();
    web::Data::new(FrontDoor::new(invoker, TraceBridge::disabled(), metrics, 10))
}

fn ok_after_100ms(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    thread::sleep(Duration::from_millis(100));
    Ok(json!({"msg": "ok"}).into())
}

fn sleep_5s(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    thread::sleep(Duration::from_secs(5));
    Ok("too late".into())
}

fn fails(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    Err("secret connection string in error".into())
}

/// Panics for "crash" bodies, answers after a short nap otherwise.
fn crash_or_ok(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    if event.data == EventData::Bytes("crash".into()) {
        panic!("handler crashed");
    }
    thread::sleep(Duration::from_millis(200));
    Ok("fine".into())
}

fn describe(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    Ok(json!({
        "cloudevent": event.is_cloud_event(),
        "type": event.event_type,
        "source": event.event_source,
        "data": event.data.as_json(),
        "path": event.extensions.request.path,
    })
    .into())
}

#[actix_web::test]
async fn test_healthz() {
    let front = front_door(ok_after_100ms, Duration::from_secs(5));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(test::read_body(resp).await, "OK");

    let resp = test::call_service(&app, test::TestRequest::post().uri("/healthz").to_request()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_metrics_are_exposed_before_any_call() {
    let front = front_door(ok_after_100ms, Duration::from_secs(5));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    assert!(body.contains("function_calls_total{method=\"GET\"} 0"));
    assert!(body.contains("function_failures_total{method=\"POST\"} 0"));
}

#[actix_web::test]
async fn test_success_returns_handler_body() {
    let front = front_door(ok_after_100ms, Duration::from_secs(5));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let started = Instant::now();
    let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({"msg": "ok"}));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[actix_web::test]
async fn test_timeout_returns_408_near_deadline() {
    let front = front_door(sleep_5s, Duration::from_secs(1));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let started = Instant::now();
    let resp = test::call_service(&app, test::TestRequest::get().uri("/work").to_request()).await;
    let elapsed = started.elapsed();

    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(test::read_body(resp).await, TIMEOUT_MESSAGE);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
}

#[actix_web::test]
async fn test_handler_error_is_not_leaked() {
    let front = front_door(fails, Duration::from_secs(5));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let resp = test::call_service(&app, test::TestRequest::delete().uri("/items/1").to_request()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = test::read_body(resp).await;
    assert_eq!(body, "Internal Server Error");
    assert_eq!(front.metrics().failures("DELETE"), 1);
}

#[actix_web::test]
async fn test_cloudevent_headers_reach_the_handler() {
    let front = front_door(describe, Duration::from_secs(5));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let req = test::TestRequest::post()
        .uri("/orders")
        .insert_header(("ce-type", "order.created"))
        .insert_header(("ce-source", "/shop"))
        .insert_header(("ce-id", "42"))
        .insert_header(("ce-specversion", "1.0"))
        .set_json(json!({"orderId": 7}))
        .to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(
        body,
        json!({
            "cloudevent": true,
            "type": "order.created",
            "source": "/shop",
            "data": {"orderId": 7},
            "path": "/orders",
        })
    );
}

#[actix_web::test]
async fn test_metrics_after_successes_and_timeouts() {
    fn quick_or_stuck(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
        if event.extensions.request.path == "/stuck" {
            thread::sleep(Duration::from_secs(5));
        }
        Ok("done".into())
    }

    let front = front_door(quick_or_stuck, Duration::from_millis(300));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    for _ in 0..3 {
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    for _ in 0..2 {
        let resp = test::call_service(&app, test::TestRequest::get().uri("/stuck").to_request()).await;
        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    }

    let metrics = front.metrics();
    assert_eq!(metrics.calls("GET"), 5);
    assert_eq!(metrics.failures("GET"), 2);
    assert_eq!(metrics.duration_samples("GET"), 5);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    assert!(body.contains("function_calls_total{method=\"GET\"} 5"));
    assert!(body.contains("function_failures_total{method=\"GET\"} 2"));
}

#[actix_web::test]
async fn test_crash_does_not_affect_concurrent_request() {
    let front = front_door(crash_or_ok, Duration::from_secs(5));
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let crash = test::call_service(
        &app,
        test::TestRequest::post().uri("/").set_payload("crash").to_request(),
    );
    let healthy = test::call_service(
        &app,
        test::TestRequest::post().uri("/").set_payload("hello").to_request(),
    );
    let (crash, healthy) = tokio::join!(crash, healthy);

    assert_eq!(crash.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(healthy.status(), StatusCode::OK);
    assert_eq!(test::read_body(healthy).await, "fine");
}

#[actix_web::test]
async fn test_requests_beyond_worker_bound_wait_their_turn() {
    fn nap_300ms(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
        thread::sleep(Duration::from_millis(300));
        Ok(event.data.to_bytes().into())
    }

    let invoker = Invoker::thread(nap_300ms, context(), Duration::from_secs(5));
    let front = web::Data::new(
        FrontDoor::new(invoker, TraceBridge::disabled(), Metrics::new().unwrap(), 1)
            .with_max_body_size(1024),
    );
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let started = Instant::now();
    let first = test::call_service(
        &app,
        test::TestRequest::post().uri("/").set_payload("first").to_request(),
    );
    let second = test::call_service(
        &app,
        test::TestRequest::post().uri("/").set_payload("second").to_request(),
    );
    let (first, second) = tokio::join!(first, second);

    assert_eq!(test::read_body(first).await, "first");
    assert_eq!(test::read_body(second).await, "second");
    assert!(started.elapsed() >= Duration::from_millis(600), "ran in parallel");
    assert_eq!(front.metrics().calls("POST"), 2);
}

#[actix_web::test]
async fn test_oversized_body_is_rejected() {
    let invoker = Invoker::thread(ok_after_100ms, context(), Duration::from_secs(5));
    let front = web::Data::new(
        FrontDoor::new(invoker, TraceBridge::disabled(), Metrics::new().unwrap(), 10)
            .with_max_body_size(16),
    );
    let app = test::init_service(App::new().configure(|cfg| configure(cfg, front.clone()))).await;

    let req = test::TestRequest::post()
        .uri("/")
        .set_payload(vec![b'x'; 64])
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
