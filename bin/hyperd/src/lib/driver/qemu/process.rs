// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor process watchdog.
//!
//! One task per VM watches the QEMU process and turns its fate into hub
//! events: [`VmEvent::VmExit`] when it exits on its own,
//! [`VmEvent::VmKilled`] when it was killed on request. A process we
//! spawned is watched through its [`Child`]; one inherited from a previous
//! daemon run is only known by pid and is polled.

use std::time::Duration;

use slog::{info, warn, Logger};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::vm::event::VmEvent;
use crate::vm::hub::HubSender;

const PID_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub(super) enum Target {
    Child(Child),
    Pid(u32),
}

enum Control {
    Kill,
    Quit,
}

pub(super) struct Watchdog {
    tx: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn spawn(log: Logger, target: Target, hub: HubSender) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let event = match target {
                Target::Child(child) => watch_child(&log, child, rx).await,
                Target::Pid(pid) => watch_pid(&log, pid, rx).await,
            };
            if let Some(event) = event {
                hub.send(event).await;
            }
        });
        Self { tx, task }
    }

    /// Kills the process. Returns `false` if the watchdog has already
    /// finished, i.e. the process is gone.
    pub fn kill(&self) -> bool {
        self.tx.send(Control::Kill).is_ok()
    }

    /// Stops watching without touching the process.
    pub async fn quit(self) {
        let _ = self.tx.send(Control::Quit);
        let _ = self.task.await;
    }
}

async fn watch_child(
    log: &Logger,
    mut child: Child,
    mut rx: mpsc::UnboundedReceiver<Control>,
) -> Option<VmEvent> {
    tokio::select! {
        status = child.wait() => {
            info!(log, "hypervisor exited"; "status" => ?status);
            Some(VmEvent::VmExit)
        }
        ctl = rx.recv() => match ctl {
            Some(Control::Kill) => {
                let success = match child.kill().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(log, "cannot kill hypervisor"; "error" => %e);
                        false
                    }
                };
                Some(VmEvent::VmKilled { success })
            }
            Some(Control::Quit) | None => None,
        }
    }
}

fn alive(pid: u32) -> bool {
    // Safety: signal 0 only checks for the process' existence.
    let res = unsafe { libc::kill(pid as libc::pid_t, 0) };
    res == 0
        || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

async fn watch_pid(
    log: &Logger,
    pid: u32,
    mut rx: mpsc::UnboundedReceiver<Control>,
) -> Option<VmEvent> {
    let mut poll = tokio::time::interval(PID_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                if !alive(pid) {
                    info!(log, "hypervisor exited"; "pid" => pid);
                    return Some(VmEvent::VmExit);
                }
            }
            ctl = rx.recv() => match ctl {
                Some(Control::Kill) => {
                    let target = pid as libc::pid_t;
                    // Safety: plain kill(2) on a pid we were told we own.
                    let res = unsafe { libc::kill(target, libc::SIGKILL) };
                    let success = res == 0
                        || std::io::Error::last_os_error().raw_os_error()
                            == Some(libc::ESRCH);
                    if !success {
                        warn!(log, "cannot kill hypervisor"; "pid" => pid,
                            "error" => %std::io::Error::last_os_error());
                    }
                    return Some(VmEvent::VmKilled { success });
                }
                Some(Control::Quit) | None => return None,
            }
        }
    }
}
