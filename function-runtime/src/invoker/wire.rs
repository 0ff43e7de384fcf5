//! Frames exchanged with a worker process
//!
//! A worker announces itself with [`WorkerFrame::Ready`], reads exactly one
//! [`WorkerRequest`] from stdin and answers with exactly one
//! [`WorkerFrame::Reply`]. Frames are bincode encoded back to back.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::trace::TraceCarrier;
use crate::types::{Context, Event, Payload};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WorkerRequest {
    pub event: Event,
    pub context: Context,
    pub trace: TraceCarrier,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum WorkerFrame {
    Ready,
    Reply(Result<Payload, String>),
}

pub(crate) fn write<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    bincode::serialize_into(&mut *writer, frame).map_err(into_io)?;
    writer.flush()
}

pub(crate) fn read<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
    bincode::deserialize_from(reader).map_err(into_io)
}

fn into_io(e: bincode::Error) -> io::Error {
    match *e {
        bincode::ErrorKind::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Parent side of one invocation: send the request, then wait for the
/// worker's handshake and its reply.
pub(crate) fn exchange<W: Write, R: Read>(
    mut stdin: W,
    stdout: &mut R,
    request: &WorkerRequest,
) -> io::Result<Result<Payload, String>> {
    write(&mut stdin, request)?;
    drop(stdin);

    match read::<_, WorkerFrame>(stdout)? {
        WorkerFrame::Ready => {}
        WorkerFrame::Reply(_) => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "reply before handshake"))
        }
    }
    match read::<_, WorkerFrame>(stdout)? {
        WorkerFrame::Reply(reply) => Ok(reply),
        WorkerFrame::Ready => Err(io::Error::new(io::ErrorKind::InvalidData, "duplicate handshake")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::normalize;
    use crate::types::RawRequest;
    use std::io::Cursor;

    fn request() -> WorkerRequest {
        let event = normalize(
            RawRequest::new("POST", "/orders")
                .header("content-type", "application/json")
                .header("ce-type", "order.created")
                .header("ce-source", "/shop")
                .body(r#"{"id":7}"#),
        );
        WorkerRequest {
            event,
            context: Context {
                function_name: "main".into(),
                module_name: "handler".into(),
                namespace: "default".into(),
                runtime: "rust".into(),
                timeout: 180,
                memory_limit: 0,
            },
            trace: TraceCarrier::from([("traceparent".to_string(), "00-abc-def-01".to_string())]),
        }
    }

    #[test]
    fn test_exchange_reads_handshake_then_reply() {
        let mut worker_output = Vec::new();
        write(&mut worker_output, &WorkerFrame::Ready).unwrap();
        write(&mut worker_output, &WorkerFrame::Reply(Ok(Payload::from("done")))).unwrap();

        let mut sent = Vec::new();
        let reply = exchange(&mut sent, &mut Cursor::new(worker_output), &request()).unwrap();
        assert_eq!(reply, Ok(Payload::from("done")));

        let received: WorkerRequest = read(&mut Cursor::new(sent)).unwrap();
        let original = request();
        assert_eq!(received.event, original.event);
        assert_eq!(received.context, original.context);
        assert_eq!(received.trace, original.trace);
    }

    #[test]
    fn test_exchange_fails_when_worker_dies() {
        let mut worker_output = Vec::new();
        write(&mut worker_output, &WorkerFrame::Ready).unwrap();

        let err = exchange(Vec::new(), &mut Cursor::new(worker_output), &request()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_exchange_rejects_reply_without_handshake() {
        let mut worker_output = Vec::new();
        write(&mut worker_output, &WorkerFrame::Reply(Err("nope".into()))).unwrap();

        let err = exchange(Vec::new(), &mut Cursor::new(worker_output), &request()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
