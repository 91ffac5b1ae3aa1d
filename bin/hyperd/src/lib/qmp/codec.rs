// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for encoding and decoding messages on a QEMU monitor (QMP)
//! socket.
//!
//! The monitor speaks JSON objects back to back on a stream socket. QEMU
//! terminates each object with CRLF, but nothing in the protocol requires
//! it, so the decoder frames on JSON object boundaries rather than on line
//! breaks. Every inbound object is one of three kinds:
//!
//! - `{"return": <any>}`: the result of the command in flight,
//! - `{"error": {"class": .., "desc": ..}}`: the command in flight failed,
//! - `{"event": <name>, "data": <any>, "timestamp": {..}}`: an asynchronous
//!   notification which may arrive at any time.
//!
//! The greeting QEMU sends on connect (`{"QMP": {..}}`) is recognized
//! separately, since it is only valid before capabilities negotiation.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::codec::Decoder;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error on monitor socket: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON from monitor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("monitor message is not an object: {0}")]
    NotAnObject(String),

    #[error("unrecognized monitor message: {0}")]
    Unrecognized(String),
}

/// The body of an `{"error": ..}` reply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct QmpErrorDesc {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

impl std::fmt::Display for QmpErrorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct QmpTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QmpEvent {
    pub event: String,
    pub data: Option<Value>,
    pub timestamp: Option<QmpTimestamp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QmpMessageKind {
    Result,
    Error,
    Event,
}

/// A classified inbound monitor message.
#[derive(Clone, Debug, PartialEq)]
pub enum QmpMessage {
    Result(Value),
    Error(QmpErrorDesc),
    Event(QmpEvent),
}

impl QmpMessage {
    pub fn kind(&self) -> QmpMessageKind {
        match self {
            QmpMessage::Result(_) => QmpMessageKind::Result,
            QmpMessage::Error(_) => QmpMessageKind::Error,
            QmpMessage::Event(_) => QmpMessageKind::Event,
        }
    }

    /// Decodes one complete message from a raw buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(buf)?;
        Self::try_from(value)
    }
}

impl TryFrom<Value> for QmpMessage {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, CodecError> {
        let Value::Object(mut map) = value else {
            return Err(CodecError::NotAnObject(value.to_string()));
        };

        if let Some(ret) = map.remove("return") {
            return Ok(QmpMessage::Result(ret));
        }
        if let Some(err) = map.remove("error") {
            return Ok(QmpMessage::Error(serde_json::from_value(err)?));
        }
        if let Some(Value::String(event)) = map.remove("event") {
            let timestamp = map
                .remove("timestamp")
                .and_then(|ts| serde_json::from_value(ts).ok());
            return Ok(QmpMessage::Event(QmpEvent {
                event,
                data: map.remove("data"),
                timestamp,
            }));
        }

        Err(CodecError::Unrecognized(Value::Object(map).to_string()))
    }
}

/// Returns the greeting payload if `value` is the banner QEMU sends on
/// connect.
pub fn greeting(value: &Value) -> Option<&Value> {
    value.as_object()?.get("QMP")
}

/// A single monitor command.
///
/// A command may carry a file descriptor which travels out of band as
/// `SCM_RIGHTS` ancillary data alongside the command bytes.
#[derive(Clone, Debug, Serialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    #[serde(skip)]
    pub fd: Option<Arc<OwnedFd>>,
}

impl QmpCommand {
    /// Builds a command from its name and an argument object. Anything other
    /// than a JSON object is treated as "no arguments".
    pub fn new(execute: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { execute: execute.into(), arguments, fd: None }
    }

    pub fn with_fd(mut self, fd: Arc<OwnedFd>) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Wraps a human monitor command line.
    pub fn hmp(command_line: impl Into<String>) -> Self {
        Self::new(
            "human-monitor-command",
            serde_json::json!({ "command-line": command_line.into() }),
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }
}

/// Frames monitor output into JSON values.
#[derive(Debug, Default)]
pub struct QmpCodec;

impl Decoder for QmpCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Value>, CodecError> {
        let skip = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(skip);
        if src.is_empty() {
            return Ok(None);
        }

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..])
                .into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            None => Ok(None),
            Some(Ok(value)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_results() {
        let empty = QmpMessage::decode(br#"{"return": {}}"#).unwrap();
        assert_eq!(empty, QmpMessage::Result(json!({})));

        let hmp = QmpMessage::decode(br#"{"return": "OK\r\n"}"#).unwrap();
        assert_eq!(hmp.kind(), QmpMessageKind::Result);
        assert_eq!(hmp, QmpMessage::Result(json!("OK\r\n")));
    }

    #[test]
    fn classify_event() {
        let raw = br#"{"event": "NIC_RX_FILTER_CHANGED",
            "data": {"name": "eth0",
                "path": "/machine/peripheral/eth0/virtio-backend"},
            "timestamp": {"seconds": 1429545058, "microseconds": 283331}}"#;
        let msg = QmpMessage::decode(raw).unwrap();
        let QmpMessage::Event(ev) = msg else {
            panic!("expected an event");
        };
        assert_eq!(ev.event, "NIC_RX_FILTER_CHANGED");
        assert_eq!(
            ev.timestamp,
            Some(QmpTimestamp { seconds: 1429545058, microseconds: 283331 })
        );
        assert_eq!(ev.data.unwrap()["name"], "eth0");
    }

    #[test]
    fn classify_error() {
        let raw = br#"{"error": {"class": "GenericError",
            "desc": "QMP input object member 'id' is unexpected"}}"#;
        let msg = QmpMessage::decode(raw).unwrap();
        assert_eq!(
            msg,
            QmpMessage::Error(QmpErrorDesc {
                class: "GenericError".to_string(),
                desc: "QMP input object member 'id' is unexpected".to_string(),
            })
        );

        // The handshake failure QEMU reports carries no fields at all.
        let bare = QmpMessage::decode(br#"{"error": {}}"#).unwrap();
        assert_eq!(bare, QmpMessage::Error(QmpErrorDesc::default()));
    }

    #[test]
    fn unknown_shapes_are_errors() {
        assert!(matches!(
            QmpMessage::decode(br#"{"status": "running"}"#),
            Err(CodecError::Unrecognized(_))
        ));
        assert!(matches!(
            QmpMessage::decode(br#"[1, 2]"#),
            Err(CodecError::NotAnObject(_))
        ));
    }

    #[test]
    fn decoder_handles_partial_and_packed_input() {
        let mut codec = QmpCodec;
        let mut buf = BytesMut::from(&br#"{"QMP": {"version": {}}}"#[..]);
        buf.extend_from_slice(b"\r\n{\"return\": ");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(greeting(&first).is_some());

        // Second object is incomplete.
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(br#"{}}{"event": "SHUTDOWN"}"#);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, json!({"return": {}}));
        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(third["event"], "SHUTDOWN");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn command_encoding() {
        let cmd = QmpCommand::new("qmp_capabilities", Value::Null);
        assert_eq!(
            cmd.to_bytes().unwrap(),
            b"{\"execute\":\"qmp_capabilities\"}\n"
        );

        let hmp = QmpCommand::hmp("drive_del drive3");
        let decoded: Value =
            serde_json::from_slice(&hmp.to_bytes().unwrap()).unwrap();
        assert_eq!(
            decoded,
            json!({"execute": "human-monitor-command",
                   "arguments": {"command-line": "drive_del drive3"}})
        );
    }
}
