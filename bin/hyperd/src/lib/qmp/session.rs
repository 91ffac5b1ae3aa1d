// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The monitor command session queue.
//!
//! A single task owns the monitor socket for one VM. Callers hand it
//! [`QmpSession`]s, ordered batches of commands that succeed or fail as a
//! whole, through a [`QmpHandle`]. The task runs sessions strictly one at a
//! time in submission order and executes each session's steps in order:
//!
//! - A `return` reply advances to the next step; after the last step the
//!   session completes successfully.
//! - An `error` reply resends the same step. Once a step has failed
//!   `max_step_attempts` times in a row the session completes with an
//!   error and its remaining steps are never sent.
//! - Asynchronous events are forwarded to the hub as soon as they are read,
//!   whether or not a session is in flight.
//!
//! Completion turns a session's outcome into at most one hub event, sent by
//! this task. Because one task sends both completions and forwarded events,
//! the hub observes them in the order the monitor produced them.
//!
//! Failing to connect, failing the capabilities handshake in time, or
//! losing the socket afterwards is reported once as
//! [`VmEvent::InitFailed`]. The in-flight session and anything queued
//! behind it are dropped without completing.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use slog::{debug, error, info, warn, Logger};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use crate::vm::event::{DeviceFailedEvent, HypervisorEvent, VmEvent};
use crate::vm::hub::HubSender;

use super::codec::{self, QmpCodec, QmpCommand, QmpErrorDesc, QmpMessage};
use super::{scm, QmpError};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on how long a close request waits for queued sessions.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(
        "step {step} ({command}) failed after {attempts} attempts: \
         {class}: {desc}"
    )]
    StepFailed {
        step: usize,
        command: String,
        attempts: u32,
        class: String,
        desc: String,
    },
}

pub type SessionResult = Result<(), SessionError>;

type Respond = Box<dyn FnOnce(SessionResult) -> Option<VmEvent> + Send>;

/// An ordered batch of monitor commands plus its completion.
pub struct QmpSession {
    commands: Vec<QmpCommand>,
    respond: Respond,
}

impl QmpSession {
    /// Creates a session whose completion maps the outcome to an optional
    /// hub event.
    pub fn new<F>(commands: Vec<QmpCommand>, respond: F) -> Self
    where
        F: FnOnce(SessionResult) -> Option<VmEvent> + Send + 'static,
    {
        Self { commands, respond: Box::new(respond) }
    }

    /// Creates a session that emits `callback` on success and a
    /// device-failed event carrying `callback` on failure.
    pub fn with_callback(
        commands: Vec<QmpCommand>,
        callback: Option<VmEvent>,
    ) -> Self {
        Self::new(commands, move |result| match result {
            Ok(()) => callback,
            Err(reason) => Some(VmEvent::DeviceFailed(DeviceFailedEvent {
                session: callback.map(Box::new),
                reason,
            })),
        })
    }

    pub fn commands(&self) -> &[QmpCommand] {
        &self.commands
    }
}

impl fmt::Debug for QmpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> =
            self.commands.iter().map(|c| c.execute.as_str()).collect();
        f.debug_struct("QmpSession").field("commands", &names).finish()
    }
}

enum Work {
    Session(QmpSession),
    Query {
        command: QmpCommand,
        reply: oneshot::Sender<Result<Value, QmpError>>,
    },
}

impl Work {
    fn command(&self, step: usize) -> Option<&QmpCommand> {
        match self {
            Work::Session(s) => s.commands.get(step),
            Work::Query { command, .. } if step == 0 => Some(command),
            Work::Query { .. } => None,
        }
    }
}

enum QmpInteraction {
    Work(Work),
    Close(oneshot::Sender<()>),
}

/// Submission side of a VM's session queue.
#[derive(Clone, Debug)]
pub struct QmpHandle {
    tx: mpsc::UnboundedSender<QmpInteraction>,
}

/// Receiving side, handed to [`spawn_handler`] once the monitor socket is
/// expected to exist.
pub struct QmpReceiver {
    rx: mpsc::UnboundedReceiver<QmpInteraction>,
}

impl fmt::Debug for QmpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QmpReceiver").finish_non_exhaustive()
    }
}

pub fn channel() -> (QmpHandle, QmpReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QmpHandle { tx }, QmpReceiver { rx })
}

impl QmpHandle {
    /// Queues a session behind any already submitted.
    pub fn submit(&self, session: QmpSession) -> Result<(), QmpError> {
        self.tx
            .send(QmpInteraction::Work(Work::Session(session)))
            .map_err(|_| QmpError::Closed)
    }

    /// Runs a single command in the queue and returns its raw result.
    pub async fn query(&self, command: QmpCommand) -> Result<Value, QmpError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QmpInteraction::Work(Work::Query { command, reply }))
            .map_err(|_| QmpError::Closed)?;
        rx.await.map_err(|_| QmpError::Closed)?
    }

    /// Lets queued sessions drain, then closes the monitor socket.
    pub async fn close(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(QmpInteraction::Close(ack)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Clone, Debug)]
pub struct QmpParams {
    pub socket: PathBuf,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_step_attempts: u32,
}

impl QmpParams {
    pub fn new(socket: PathBuf, config: &hyperd_config::Qmp) -> Self {
        Self {
            socket,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            max_step_attempts: config.max_step_attempts.max(1),
        }
    }
}

/// Starts the task that owns the monitor socket.
pub fn spawn_handler(
    log: Logger,
    params: QmpParams,
    receiver: QmpReceiver,
    hub: HubSender,
) -> JoinHandle<()> {
    tokio::spawn(run_handler(log, params, receiver, hub))
}

async fn run_handler(
    log: Logger,
    params: QmpParams,
    receiver: QmpReceiver,
    hub: HubSender,
) {
    let negotiated =
        tokio::time::timeout(params.handshake_timeout, connect(&log, &params))
            .await;
    let (reader, writer) = match negotiated {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            error!(log, "monitor initialization failed"; "error" => %e);
            hub.send(VmEvent::InitFailed { reason: e.to_string() }).await;
            return;
        }
        Err(_) => {
            error!(log, "monitor handshake timed out";
                "timeout" => ?params.handshake_timeout);
            hub.send(VmEvent::InitFailed {
                reason: "timed out waiting for monitor handshake".to_string(),
            })
            .await;
            return;
        }
    };
    info!(log, "monitor connected");

    let queue = SessionQueue {
        log,
        reader,
        writer,
        hub,
        max_attempts: params.max_step_attempts,
        pending: VecDeque::new(),
        current: None,
        closing: None,
    };
    queue.run(receiver.rx).await;
}

type MonitorReader = FramedRead<OwnedReadHalf, QmpCodec>;

async fn connect(
    log: &Logger,
    params: &QmpParams,
) -> Result<(MonitorReader, OwnedWriteHalf), QmpError> {
    let deadline = Instant::now() + params.connect_timeout;
    let stream = loop {
        match UnixStream::connect(&params.socket).await {
            Ok(s) => break s,
            Err(e) if Instant::now() < deadline => {
                debug!(log, "monitor socket not ready"; "error" => %e);
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let (read, mut writer) = stream.into_split();
    let mut reader = FramedRead::new(read, QmpCodec);

    loop {
        let value = reader.next().await.ok_or(QmpError::Closed)??;
        if let Some(banner) = codec::greeting(&value) {
            debug!(log, "monitor greeting"; "banner" => %banner);
            break;
        }
        debug!(log, "ignoring message before greeting"; "message" => %value);
    }

    let caps = QmpCommand::new("qmp_capabilities", Value::Null);
    writer.write_all(&caps.to_bytes()?).await?;

    loop {
        let value = reader.next().await.ok_or(QmpError::Closed)??;
        match QmpMessage::try_from(value)? {
            QmpMessage::Result(_) => break,
            QmpMessage::Error(e) => return Err(QmpError::Command(e)),
            QmpMessage::Event(ev) => {
                debug!(log, "event before negotiation"; "event" => ev.event);
            }
        }
    }

    Ok((reader, writer))
}

struct InFlight {
    work: Work,
    step: usize,
    failures: u32,
}

struct SessionQueue {
    log: Logger,
    reader: MonitorReader,
    writer: OwnedWriteHalf,
    hub: HubSender,
    max_attempts: u32,
    pending: VecDeque<Work>,
    current: Option<InFlight>,
    closing: Option<(oneshot::Sender<()>, Instant)>,
}

impl SessionQueue {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QmpInteraction>) {
        let lost = loop {
            if self.current.is_none() {
                if let Some(work) = self.pending.pop_front() {
                    if let Err(e) = self.start(work).await {
                        break Some(e);
                    }
                    continue;
                }
                if self.closing.is_some() {
                    break None;
                }
            }

            let drain_deadline = self.closing.as_ref().map(|(_, d)| *d);
            tokio::select! {
                interaction = rx.recv(), if self.closing.is_none() => {
                    match interaction {
                        Some(QmpInteraction::Work(work)) => {
                            self.pending.push_back(work);
                        }
                        Some(QmpInteraction::Close(ack)) => {
                            debug!(self.log, "monitor close requested";
                                "queued" => self.pending.len());
                            let deadline = Instant::now() + CLOSE_DRAIN_TIMEOUT;
                            self.closing = Some((ack, deadline));
                        }
                        None => {
                            debug!(self.log, "all monitor handles dropped");
                            break None;
                        }
                    }
                }
                msg = self.reader.next() => match msg {
                    Some(Ok(value)) => {
                        if let Err(e) = self.handle_message(value).await {
                            break Some(e);
                        }
                    }
                    Some(Err(e)) => break Some(e.into()),
                    None => break Some(QmpError::Closed),
                },
                _ = sleep_until_opt(drain_deadline) => {
                    warn!(self.log, "monitor close timed out with work queued";
                        "queued" => self.pending.len());
                    break None;
                }
            }
        };

        if let Some((ack, _)) = self.closing.take() {
            if let Some(e) = &lost {
                debug!(self.log, "monitor gone while closing"; "error" => %e);
            }
            info!(self.log, "monitor closed");
            let _ = ack.send(());
            return;
        }

        if let Some(e) = lost {
            error!(self.log, "monitor connection lost"; "error" => %e,
                "aborted_in_flight" => self.current.is_some(),
                "queued" => self.pending.len());
            self.hub
                .send(VmEvent::InitFailed { reason: e.to_string() })
                .await;
        }
    }

    async fn start(&mut self, work: Work) -> Result<(), QmpError> {
        let work = match work {
            Work::Session(session) if session.commands.is_empty() => {
                self.complete(session, Ok(())).await;
                return Ok(());
            }
            work => work,
        };
        self.current = Some(InFlight { work, step: 0, failures: 0 });
        self.send_current().await
    }

    async fn send_current(&mut self) -> Result<(), QmpError> {
        let Some(cmd) = self
            .current
            .as_ref()
            .and_then(|c| c.work.command(c.step))
            .cloned()
        else {
            return Ok(());
        };
        debug!(self.log, "sending monitor command"; "execute" => &cmd.execute);

        let bytes = cmd.to_bytes()?;
        let res = match &cmd.fd {
            Some(fd) => {
                scm::send_with_fd(self.writer.as_ref(), &bytes, fd.as_raw_fd())
                    .await
            }
            None => self.writer.write_all(&bytes).await,
        };
        Ok(res?)
    }

    async fn handle_message(&mut self, value: Value) -> Result<(), QmpError> {
        match QmpMessage::try_from(value) {
            Err(e) => {
                warn!(self.log, "dropping unrecognized monitor message";
                    "error" => %e);
                Ok(())
            }
            Ok(QmpMessage::Event(ev)) => {
                let event = match ev.event.as_str() {
                    "SHUTDOWN" => VmEvent::VmExit,
                    _ => VmEvent::Hypervisor(HypervisorEvent::from(ev)),
                };
                if !self.hub.send(event).await {
                    debug!(self.log, "hub closed; dropped monitor event");
                }
                Ok(())
            }
            Ok(QmpMessage::Result(ret)) => self.step_succeeded(ret).await,
            Ok(QmpMessage::Error(e)) => self.step_failed(e).await,
        }
    }

    async fn step_succeeded(&mut self, ret: Value) -> Result<(), QmpError> {
        let Some(InFlight { work, step, .. }) = self.current.take() else {
            warn!(self.log, "monitor result with nothing in flight";
                "return" => %ret);
            return Ok(());
        };

        match work {
            Work::Query { reply, .. } => {
                let _ = reply.send(Ok(ret));
                Ok(())
            }
            Work::Session(session) => {
                let next = step + 1;
                if next < session.commands.len() {
                    self.current = Some(InFlight {
                        work: Work::Session(session),
                        step: next,
                        failures: 0,
                    });
                    self.send_current().await
                } else {
                    self.complete(session, Ok(())).await;
                    Ok(())
                }
            }
        }
    }

    async fn step_failed(&mut self, err: QmpErrorDesc) -> Result<(), QmpError> {
        let Some(InFlight { work, step, failures }) = self.current.take() else {
            warn!(self.log, "monitor error with nothing in flight";
                "error" => %err);
            return Ok(());
        };
        let failures = failures + 1;

        match work {
            Work::Query { reply, command } => {
                warn!(self.log, "monitor query failed";
                    "execute" => &command.execute, "error" => %err);
                let _ = reply.send(Err(QmpError::Command(err)));
                Ok(())
            }
            Work::Session(session) if failures >= self.max_attempts => {
                let command = session.commands[step].execute.clone();
                error!(self.log, "session step failed permanently";
                    "step" => step, "execute" => &command,
                    "attempts" => failures, "error" => %err);
                let reason = SessionError::StepFailed {
                    step,
                    command,
                    attempts: failures,
                    class: err.class,
                    desc: err.desc,
                };
                self.complete(session, Err(reason)).await;
                Ok(())
            }
            Work::Session(session) => {
                warn!(self.log, "session step failed, retrying";
                    "step" => step, "attempt" => failures, "error" => %err);
                self.current = Some(InFlight {
                    work: Work::Session(session),
                    step,
                    failures,
                });
                self.send_current().await
            }
        }
    }

    async fn complete(&mut self, session: QmpSession, result: SessionResult) {
        if let Some(event) = (session.respond)(result) {
            if !self.hub.send(event).await {
                debug!(self.log, "hub closed; dropped session completion");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::vm::devices::SourceKind;
    use crate::vm::event::BlockdevInsertedEvent;
    use crate::vm::hub::{self, Hub};
    use serde_json::json;
    use tokio::net::UnixListener;

    pub(crate) fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    /// A scripted stand-in for QEMU's monitor. `script` maps each received
    /// command to the replies written back. Returns every command received
    /// once the client hangs up.
    pub(crate) async fn fake_monitor<F>(
        listener: UnixListener,
        mut script: F,
    ) -> Vec<Value>
    where
        F: FnMut(&Value) -> Vec<Value>,
    {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = FramedRead::new(read, QmpCodec);
        let banner = json!({
            "QMP": {"version": {"qemu": {"major": 8}}, "capabilities": []}
        });
        write.write_all(format!("{}\r\n", banner).as_bytes()).await.unwrap();

        let mut received = Vec::new();
        while let Some(Ok(cmd)) = reader.next().await {
            let replies = script(&cmd);
            received.push(cmd);
            for r in replies {
                let line = format!("{}\r\n", r);
                if write.write_all(line.as_bytes()).await.is_err() {
                    return received;
                }
            }
        }
        received
    }

    fn params(dir: &tempfile::TempDir) -> QmpParams {
        QmpParams {
            socket: dir.path().join("qmp.sock"),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            max_step_attempts: 3,
        }
    }

    fn ok() -> Value {
        json!({"return": {}})
    }

    fn generic_error() -> Value {
        json!({"error": {"class": "GenericError", "desc": "device busy"}})
    }

    fn execute_of(v: &Value) -> &str {
        v["execute"].as_str().unwrap()
    }

    fn disk_event(name: &str, scsi_id: usize) -> VmEvent {
        VmEvent::BlockdevInserted(BlockdevInsertedEvent {
            name: name.to_string(),
            source: SourceKind::Volume,
            device_name: format!("sd{}", (b'a' + scsi_id as u8) as char),
            scsi_id,
        })
    }

    struct Harness {
        handle: QmpHandle,
        hub: Hub,
        monitor: JoinHandle<Vec<Value>>,
        _dir: tempfile::TempDir,
    }

    fn start<F>(script: F) -> Harness
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let params = params(&dir);
        let listener = UnixListener::bind(&params.socket).unwrap();
        let monitor = tokio::spawn(fake_monitor(listener, script));
        let (hub_tx, hub) = hub::hub();
        let (handle, receiver) = channel();
        spawn_handler(logger(), params, receiver, hub_tx);
        Harness { handle, hub, monitor, _dir: dir }
    }

    #[tokio::test]
    async fn all_steps_succeed_completes_once() {
        let mut h = start(|_| vec![ok()]);
        let (tx, rx) = oneshot::channel();
        let session = QmpSession::new(
            vec![
                QmpCommand::new("first", Value::Null),
                QmpCommand::new("second", Value::Null),
                QmpCommand::new("third", Value::Null),
            ],
            move |result| {
                tx.send(result).unwrap();
                Some(VmEvent::Timeout)
            },
        );
        h.handle.submit(session).unwrap();

        assert_eq!(rx.await.unwrap(), Ok(()));
        assert!(matches!(h.hub.recv().await, Some(VmEvent::Timeout)));

        h.handle.close().await;
        let received = h.monitor.await.unwrap();
        let names: Vec<&str> = received.iter().map(execute_of).collect();
        assert_eq!(names, ["qmp_capabilities", "first", "second", "third"]);
    }

    #[tokio::test]
    async fn single_failure_is_retried() {
        let mut failed = false;
        let mut h = start(move |cmd| {
            if execute_of(cmd) == "device_add" && !failed {
                failed = true;
                vec![generic_error()]
            } else {
                vec![ok()]
            }
        });
        h.handle
            .submit(QmpSession::with_callback(
                vec![
                    QmpCommand::hmp(
                        "drive_add dummy file=/dev/null,if=none,id=drive0",
                    ),
                    QmpCommand::new("device_add", json!({"driver": "scsi-hd"})),
                ],
                Some(disk_event("vol0", 0)),
            ))
            .unwrap();

        match h.hub.recv().await {
            Some(VmEvent::BlockdevInserted(ev)) => assert_eq!(ev.name, "vol0"),
            other => panic!("unexpected hub event {:?}", other),
        }

        h.handle.close().await;
        let received = h.monitor.await.unwrap();
        let names: Vec<&str> = received.iter().map(execute_of).collect();
        assert_eq!(
            names,
            [
                "qmp_capabilities",
                "human-monitor-command",
                "device_add",
                "device_add"
            ]
        );
    }

    #[tokio::test]
    async fn persistent_failure_fails_session() {
        let mut h = start(|cmd| {
            if execute_of(cmd) == "human-monitor-command" {
                vec![generic_error()]
            } else {
                vec![ok()]
            }
        });
        h.handle
            .submit(QmpSession::with_callback(
                vec![
                    QmpCommand::hmp(
                        "drive_add dummy file=/dev/null,if=none,id=drive0",
                    ),
                    QmpCommand::new("device_add", json!({"driver": "scsi-hd"})),
                ],
                Some(disk_event("vol0", 0)),
            ))
            .unwrap();

        match h.hub.recv().await {
            Some(VmEvent::DeviceFailed(DeviceFailedEvent {
                session,
                reason,
            })) => {
                assert!(matches!(
                    session.as_deref(),
                    Some(VmEvent::BlockdevInserted(ev)) if ev.name == "vol0"
                ));
                assert!(matches!(
                    reason,
                    SessionError::StepFailed { step: 0, attempts: 3, .. }
                ));
            }
            other => panic!("unexpected hub event {:?}", other),
        }

        h.handle.close().await;
        let received = h.monitor.await.unwrap();
        let names: Vec<&str> = received.iter().map(execute_of).collect();
        assert_eq!(
            names,
            [
                "qmp_capabilities",
                "human-monitor-command",
                "human-monitor-command",
                "human-monitor-command",
            ]
        );
    }

    #[tokio::test]
    async fn sessions_complete_in_submission_order() {
        let mut h = start(|_| vec![ok()]);
        h.handle
            .submit(QmpSession::with_callback(
                vec![
                    QmpCommand::new("a1", Value::Null),
                    QmpCommand::new("a2", Value::Null),
                ],
                Some(disk_event("a", 0)),
            ))
            .unwrap();
        h.handle
            .submit(QmpSession::with_callback(
                vec![QmpCommand::new("b1", Value::Null)],
                Some(disk_event("b", 1)),
            ))
            .unwrap();

        for expected in ["a", "b"] {
            match h.hub.recv().await {
                Some(VmEvent::BlockdevInserted(ev)) => {
                    assert_eq!(ev.name, expected)
                }
                other => panic!("unexpected hub event {:?}", other),
            }
        }

        h.handle.close().await;
        let received = h.monitor.await.unwrap();
        let names: Vec<&str> = received.iter().map(execute_of).collect();
        assert_eq!(names, ["qmp_capabilities", "a1", "a2", "b1"]);
    }

    #[tokio::test]
    async fn events_forwarded_while_session_in_flight() {
        let mut h = start(|cmd| {
            if execute_of(cmd) == "device_del" {
                vec![
                    json!({"event": "DEVICE_DELETED",
                           "data": {"device": "scsi-disk0"},
                           "timestamp": {"seconds": 1, "microseconds": 2}}),
                    ok(),
                ]
            } else {
                vec![ok()]
            }
        });
        h.handle
            .submit(QmpSession::with_callback(
                vec![QmpCommand::new(
                    "device_del",
                    json!({"id": "scsi-disk0"}),
                )],
                Some(VmEvent::BlockdevRemoved {
                    name: "vol0".to_string(),
                    success: true,
                }),
            ))
            .unwrap();

        assert!(matches!(
            h.hub.recv().await,
            Some(VmEvent::Hypervisor(HypervisorEvent::DeviceDeleted {
                device: Some(d)
            })) if d == "scsi-disk0"
        ));
        assert!(matches!(
            h.hub.recv().await,
            Some(VmEvent::BlockdevRemoved { success: true, .. })
        ));
        h.handle.close().await;
    }

    #[tokio::test]
    async fn query_returns_raw_result() {
        let h = start(|cmd| {
            if execute_of(cmd) == "query-migrate" {
                vec![json!({"return": {"status": "completed"}})]
            } else {
                vec![ok()]
            }
        });
        let ret = h
            .handle
            .query(QmpCommand::new("query-migrate", Value::Null))
            .await
            .unwrap();
        assert_eq!(ret["status"], "completed");
        h.handle.close().await;
    }

    #[tokio::test]
    async fn rejected_capabilities_fail_init() {
        let mut h = start(|_| vec![json!({"error": {}})]);
        assert!(matches!(h.hub.recv().await, Some(VmEvent::InitFailed { .. })));
    }

    #[tokio::test]
    async fn shutdown_event_maps_to_vm_exit() {
        let mut h = start(|cmd| {
            if execute_of(cmd) == "quit" {
                vec![
                    ok(),
                    json!({"event": "SHUTDOWN", "data": {"guest": false}}),
                ]
            } else {
                vec![ok()]
            }
        });
        h.handle
            .submit(QmpSession::with_callback(
                vec![QmpCommand::new("quit", Value::Null)],
                None,
            ))
            .unwrap();
        assert!(matches!(h.hub.recv().await, Some(VmEvent::VmExit)));
        h.handle.close().await;
    }

    #[tokio::test]
    async fn handshake_timeout_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = params(&dir);
        params.handshake_timeout = Duration::from_millis(200);
        let listener = UnixListener::bind(&params.socket).unwrap();
        // Accept but never greet.
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let (hub_tx, mut hub) = hub::hub();
        let (_handle, receiver) = channel();
        spawn_handler(logger(), params, receiver, hub_tx);

        assert!(matches!(hub.recv().await, Some(VmEvent::InitFailed { .. })));
        let idle =
            tokio::time::timeout(Duration::from_millis(500), hub.recv()).await;
        assert!(matches!(idle, Err(_) | Ok(None)));
        silent.abort();
    }
}
