use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use function_runtime::{select_function, Context, Event, EventData, HandlerError, Payload};
use serde_json::json;

fn say_hello(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    Ok(match event.data {
        EventData::Empty => String::from("Hello"),
        data => format!("Hello, {}", String::from_utf8_lossy(&data.to_bytes())),
    }
    .into())
}

fn say_goodbye(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    Ok(match event.data {
        EventData::Empty => String::from("Goodbye"),
        data => format!("Goodbye, {}", String::from_utf8_lossy(&data.to_bytes())),
    }
    .into())
}

fn echo_or_panic(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    match event.data {
        EventData::Empty => panic!("nothing to echo"),
        data => Ok(data.to_bytes().into()),
    }
}

/// Describes the event it was called with, including CloudEvents attributes.
fn describe(event: Event, ctx: &Context) -> Result<Payload, HandlerError> {
    Ok(json!({
        "function": ctx.function_name,
        "cloudevent": event.is_cloud_event(),
        "type": event.event_type,
        "source": event.event_source,
        "id": event.event_id,
        "data": event.data.as_json(),
    })
    .into())
}

/// Sleeps for `{"millis": n}` (default 100) and answers `{"msg":"ok"}`.
fn nap(event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    let millis = event
        .data
        .as_json()
        .and_then(|data| data.get("millis"))
        .and_then(|millis| millis.as_u64())
        .unwrap_or(100);
    thread::sleep(Duration::from_millis(millis));
    Ok(json!({"msg": "ok"}).into())
}

fn fail(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    Err("the function failed on purpose".into())
}

/// Takes the whole process down, as a native crash would.
fn abort(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    std::process::abort()
}

/// Allocates until the process runs out of address space.
fn hog(_event: Event, _ctx: &Context) -> Result<Payload, HandlerError> {
    let mut hoard: Vec<Vec<u8>> = Vec::new();
    loop {
        hoard.push(vec![1u8; 16 << 20]);
        std::hint::black_box(&hoard);
    }
}

fn main() -> ExitCode {
    function_runtime::start(select_function!(
        say_hello,
        say_goodbye,
        echo_or_panic,
        describe,
        nap,
        fail,
        abort,
        hog,
    ))
}
