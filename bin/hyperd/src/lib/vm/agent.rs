// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guest agent control channel.
//!
//! Frames are `code: u32 BE`, `length: u32 BE` (the 8-byte header
//! included) and a JSON payload. Everything the agent says is turned into
//! an [`AgentEvent`] on the VM's hub.

use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use super::event::VmEvent;
use super::hub::HubSender;
use super::tty::connect_with_retry;

const HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 10 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AgentCode {
    Version = 0,
    StartPod = 1,
    DestroyPod = 4,
    ExecCmd = 6,
    FinishCmd = 7,
    Ready = 8,
    Ack = 9,
    Error = 10,
    WinSize = 11,
    Ping = 12,
    FinishPod = 13,
    Next = 14,
}

impl AgentCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0 => AgentCode::Version,
            1 => AgentCode::StartPod,
            4 => AgentCode::DestroyPod,
            6 => AgentCode::ExecCmd,
            7 => AgentCode::FinishCmd,
            8 => AgentCode::Ready,
            9 => AgentCode::Ack,
            10 => AgentCode::Error,
            11 => AgentCode::WinSize,
            12 => AgentCode::Ping,
            13 => AgentCode::FinishPod,
            14 => AgentCode::Next,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentMessage {
    pub code: u32,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent channel closed")]
    Closed,

    #[error("cannot encode agent payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct AgentCodec;

impl Decoder for AgentCodec {
    type Item = AgentMessage;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad agent frame length {}", len),
            ));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len);
        let code = frame.get_u32();
        frame.advance(4);
        Ok(Some(AgentMessage { code, payload: frame.freeze() }))
    }
}

impl Encoder<AgentMessage> for AgentCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        item: AgentMessage,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let len = HEADER_LEN + item.payload.len();
        dst.reserve(len);
        dst.put_u32(item.code);
        dst.put_u32(len as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct FinishCmdPayload {
    pub seq: u64,
    pub code: i32,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct WinSizePayload {
    pub seq: u64,
    pub row: u16,
    pub column: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Ready,
    Ack,
    Error { message: String },
    /// The exec or container process on TTY session `session` exited.
    FinishCmd { session: u64, code: i32 },
    /// Every container in the pod exited, with their exit codes in
    /// container order.
    FinishPod { codes: Vec<u8> },
    /// The channel could not be connected or was lost.
    Unreachable(String),
}

impl AgentEvent {
    fn decode(log: &Logger, msg: AgentMessage) -> Option<Self> {
        let code = match AgentCode::from_u32(msg.code) {
            Some(c) => c,
            None => {
                warn!(log, "unknown agent message"; "code" => msg.code);
                return None;
            }
        };
        match code {
            AgentCode::Ready => Some(AgentEvent::Ready),
            AgentCode::Ack => Some(AgentEvent::Ack),
            AgentCode::Error => Some(AgentEvent::Error {
                message: String::from_utf8_lossy(&msg.payload).into_owned(),
            }),
            AgentCode::FinishCmd => {
                match serde_json::from_slice::<FinishCmdPayload>(&msg.payload) {
                    Ok(p) => {
                        Some(AgentEvent::FinishCmd {
                            session: p.seq,
                            code: p.code,
                        })
                    }
                    Err(e) => {
                        warn!(log, "bad finish-cmd payload"; "error" => %e);
                        None
                    }
                }
            }
            AgentCode::FinishPod => {
                match serde_json::from_slice::<Vec<u8>>(&msg.payload) {
                    Ok(codes) => Some(AgentEvent::FinishPod { codes }),
                    Err(e) => {
                        warn!(log, "bad finish-pod payload"; "error" => %e);
                        None
                    }
                }
            }
            AgentCode::Ping | AgentCode::Next | AgentCode::Version => {
                debug!(log, "ignoring agent message"; "code" => ?code);
                None
            }
            other => {
                warn!(log, "host-bound agent message from guest";
                    "code" => ?other);
                None
            }
        }
    }
}

/// Send side of a VM's agent channel.
#[derive(Clone, Debug)]
pub(crate) struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentMessage>,
}

impl AgentHandle {
    pub fn send<T: Serialize + ?Sized>(
        &self,
        code: AgentCode,
        payload: &T,
    ) -> Result<(), AgentError> {
        let payload = Bytes::from(serde_json::to_vec(payload)?);
        self.tx
            .send(AgentMessage { code: code as u32, payload })
            .map_err(|_| AgentError::Closed)
    }

    pub fn send_empty(&self, code: AgentCode) -> Result<(), AgentError> {
        self.tx
            .send(AgentMessage { code: code as u32, payload: Bytes::new() })
            .map_err(|_| AgentError::Closed)
    }
}

/// Connects to the agent socket at `path` in the background. Messages sent
/// through the returned handle are queued until the connection is up.
pub(crate) fn spawn_agent(
    log: &Logger,
    path: PathBuf,
    hub: HubSender,
    connect_timeout: Duration,
) -> AgentHandle {
    let log = log.new(slog::o!("component" => "agent"));
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentMessage>();
    tokio::spawn(async move {
        let stream = match connect_with_retry(&path, connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                warn!(log, "agent unreachable"; "error" => %e);
                hub.send(VmEvent::Agent(AgentEvent::Unreachable(e.to_string())))
                    .await;
                return;
            }
        };
        info!(log, "agent channel connected");
        let (read, write) = stream.into_split();
        let mut frames = FramedRead::new(read, AgentCodec);
        let mut sink = FramedWrite::new(write, AgentCodec);

        let reason = loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(msg) => {
                        debug!(log, "sending agent message";
                            "code" => msg.code);
                        if let Err(e) = sink.send(msg).await {
                            break Some(e.to_string());
                        }
                    }
                    None => break None,
                },
                frame = frames.next() => match frame {
                    Some(Ok(msg)) => {
                        if let Some(ev) = AgentEvent::decode(&log, msg) {
                            if !hub.send(VmEvent::Agent(ev)).await {
                                break None;
                            }
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("agent closed the channel".to_string()),
                },
            }
        };
        if let Some(reason) = reason {
            warn!(log, "agent channel lost"; "reason" => &reason);
            hub.send(VmEvent::Agent(AgentEvent::Unreachable(reason))).await;
        }
    });
    AgentHandle { tx }
}
