// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TTY session multiplexing over the guest's serial stream channel.
//!
//! Every container stdio stream and every exec is a numbered session on a
//! single socket. Frames are `session: u64 BE`, `length: u32 BE` (header
//! included) and the raw payload; an empty payload closes the session.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hyperd_api_types::{ResultCode, VmResponse};
use slog::{debug, info, warn, Logger};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

const HEADER_LEN: usize = 12;
const MAX_FRAME_LEN: usize = 1 << 20;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const CLIENT_BUFFER: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowSize {
    pub row: u16,
    pub column: u16,
}

/// A client's end of a TTY session.
#[derive(Debug)]
pub struct TtyIo {
    /// Identifies the client for later window-size changes.
    pub client_tag: String,
    pub stdin: Option<mpsc::Receiver<Bytes>>,
    pub stdout: mpsc::Sender<Bytes>,
    /// Answered with [`ResultCode::ExecFinished`] and the exit code as the
    /// cause when the session ends.
    pub callback: Option<oneshot::Sender<VmResponse>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtyMessage {
    pub session: u64,
    pub payload: Bytes,
}

impl TtyMessage {
    pub fn close(session: u64) -> Self {
        Self { session, payload: Bytes::new() }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }
}

pub struct TtyCodec;

impl Decoder for TtyCodec {
    type Item = TtyMessage;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad tty frame length {}", len),
            ));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len);
        let session = frame.get_u64();
        frame.advance(4);
        Ok(Some(TtyMessage { session, payload: frame.freeze() }))
    }
}

impl Encoder<TtyMessage> for TtyCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        item: TtyMessage,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let len = HEADER_LEN + item.payload.len();
        dst.reserve(len);
        dst.put_u64(item.session);
        dst.put_u32(len as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

struct Client {
    tag: String,
    stdout: mpsc::Sender<Bytes>,
    callback: Option<oneshot::Sender<VmResponse>>,
}

#[derive(Default)]
struct Routes {
    sessions: BTreeMap<u64, Vec<Client>>,
    tags: BTreeMap<String, u64>,
}

impl Routes {
    fn remove(&mut self, session: u64) -> Vec<Client> {
        let clients = self.sessions.remove(&session).unwrap_or_default();
        self.tags.retain(|_, s| *s != session);
        clients
    }
}

/// The host side of a VM's TTY channel.
pub(crate) struct Pseudoterminals {
    log: Logger,
    vm_id: String,
    routes: Arc<Mutex<Routes>>,
    to_guest: mpsc::UnboundedSender<TtyMessage>,
    outgoing: Option<mpsc::UnboundedReceiver<TtyMessage>>,
}

impl Pseudoterminals {
    pub fn new(log: &Logger, vm_id: &str) -> Self {
        let (to_guest, outgoing) = mpsc::unbounded_channel();
        Self {
            log: log.new(slog::o!("component" => "tty")),
            vm_id: vm_id.to_string(),
            routes: Arc::new(Mutex::new(Routes::default())),
            to_guest,
            outgoing: Some(outgoing),
        }
    }

    /// Connects to the guest's TTY socket in the background. Frames written
    /// before the connection is up are queued.
    pub fn connect(&mut self, path: PathBuf, timeout: Duration) {
        let Some(outgoing) = self.outgoing.take() else {
            warn!(self.log, "tty channel already connected");
            return;
        };
        let log = self.log.clone();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            let stream = match connect_with_retry(&path, timeout).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(log, "tty channel unavailable"; "error" => %e);
                    return;
                }
            };
            info!(log, "tty channel connected");
            let (read, write) = stream.into_split();
            tokio::spawn(pump_to_guest(
                log.clone(),
                outgoing,
                FramedWrite::new(write, TtyCodec),
            ));
            let guest = FramedRead::new(read, TtyCodec);
            route_from_guest(log, routes, guest).await;
        });
    }

    /// Binds a client to `session`. Its stdin, if any, is forwarded into the
    /// guest and an EOF frame follows when the client closes it.
    pub fn attach(&self, session: u64, io: TtyIo) {
        let TtyIo { client_tag, stdin, stdout, callback } = io;
        debug!(self.log, "attaching tty client";
            "session" => session, "client" => &client_tag);
        {
            let mut routes = lock(&self.routes);
            if !client_tag.is_empty() {
                routes.tags.insert(client_tag.clone(), session);
            }
            routes.sessions.entry(session).or_default().push(Client {
                tag: client_tag,
                stdout,
                callback,
            });
        }
        if let Some(mut stdin) = stdin {
            let to_guest = self.to_guest.clone();
            tokio::spawn(async move {
                while let Some(payload) = stdin.recv().await {
                    if payload.is_empty() {
                        continue;
                    }
                    if to_guest.send(TtyMessage { session, payload }).is_err() {
                        return;
                    }
                }
                let _ = to_guest.send(TtyMessage::close(session));
            });
        }
    }

    pub fn session_for_tag(&self, tag: &str) -> Option<u64> {
        lock(&self.routes).tags.get(tag).copied()
    }

    /// Ends `session`, reporting `code` to every client that asked for it.
    pub fn close_session(&self, session: u64, code: i32) {
        let clients = lock(&self.routes).remove(session);
        for client in clients {
            debug!(self.log, "tty session finished";
                "session" => session, "client" => &client.tag, "code" => code);
            if let Some(cb) = client.callback {
                let _ = cb.send(VmResponse::new(
                    &self.vm_id,
                    ResultCode::ExecFinished,
                    code.to_string(),
                ));
            }
        }
    }

    /// Drops every client, closing their output streams.
    pub fn close_all(&self) {
        let mut routes = lock(&self.routes);
        routes.sessions.clear();
        routes.tags.clear();
    }
}

fn lock(routes: &Mutex<Routes>) -> std::sync::MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) async fn connect_with_retry(
    path: &PathBuf,
    timeout: Duration,
) -> std::io::Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(s) => return Ok(s),
            Err(_) if Instant::now() < deadline => {
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn pump_to_guest(
    log: Logger,
    mut outgoing: mpsc::UnboundedReceiver<TtyMessage>,
    mut sink: FramedWrite<tokio::net::unix::OwnedWriteHalf, TtyCodec>,
) {
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = sink.send(msg).await {
            warn!(log, "tty write failed"; "error" => %e);
            return;
        }
    }
}

async fn route_from_guest(
    log: Logger,
    routes: Arc<Mutex<Routes>>,
    mut frames: FramedRead<tokio::net::unix::OwnedReadHalf, TtyCodec>,
) {
    while let Some(frame) = frames.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                warn!(log, "tty read failed"; "error" => %e);
                break;
            }
        };
        if msg.is_close() {
            debug!(log, "guest closed tty session"; "session" => msg.session);
            // Dropping the clients closes their output. Exec callbacks are
            // answered when the agent reports the exit code.
            let clients = lock(&routes).sessions.remove(&msg.session);
            if let Some(clients) = clients {
                let pending: Vec<Client> = clients
                    .into_iter()
                    .filter(|c| c.callback.is_some())
                    .collect();
                if !pending.is_empty() {
                    let (tx, _) = mpsc::channel(1);
                    let mut routes = lock(&routes);
                    routes.sessions.insert(
                        msg.session,
                        pending
                            .into_iter()
                            .map(|c| Client { stdout: tx.clone(), ..c })
                            .collect(),
                    );
                }
            }
            continue;
        }
        let targets: Vec<mpsc::Sender<Bytes>> = lock(&routes)
            .sessions
            .get(&msg.session)
            .map(|clients| clients.iter().map(|c| c.stdout.clone()).collect())
            .unwrap_or_default();
        for stdout in targets {
            // A client that stopped reading is left behind rather than
            // stalling every other session.
            let _ = stdout.try_send(msg.payload.clone());
        }
    }
    debug!(log, "tty channel closed");
}

pub(crate) fn client_buffer() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(CLIENT_BUFFER)
}
