// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Events consumed by a VM's state driver.
//!
//! Everything that can change a VM's state arrives as a [`VmEvent`] on the
//! VM's hub: commands from API callers, completions from the monitor
//! session queue, reports from the process watchdog and guest agent, and
//! timer expirations. Commands that expect an answer carry a oneshot
//! sender; the driver answers exactly once or drops the sender when the VM
//! goes away.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use hyperd_api_types::{UserPod, VmResponse};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::qmp::codec::QmpEvent;
use crate::qmp::session::SessionError;

use super::agent::AgentEvent;
use super::devices::{ContainerInfo, SourceKind, VolumeInfo};
use super::tty::{TtyIo, WindowSize};

pub type Reply = oneshot::Sender<VmResponse>;

/// Run (or replace) a pod in the VM.
#[derive(Debug)]
pub struct RunPodCommand {
    pub spec: UserPod,
    pub containers: Vec<ContainerInfo>,
    pub volumes: BTreeMap<String, VolumeInfo>,
    pub reply: Reply,
}

/// Receive a migrating VM on `incoming`.
#[derive(Debug)]
pub struct ListenPodCommand {
    pub spec: UserPod,
    pub containers: Vec<ContainerInfo>,
    pub volumes: BTreeMap<String, VolumeInfo>,
    pub incoming: SocketAddr,
    pub reply: Reply,
}

#[derive(Debug)]
pub struct ExecCommand {
    /// Container id or name.
    pub container: String,
    pub command: Vec<String>,
    pub tty: bool,
    pub streams: TtyIo,
}

#[derive(Debug)]
pub struct AttachCommand {
    /// Container id or name.
    pub container: String,
    pub streams: TtyIo,
    pub size: Option<WindowSize>,
}

#[derive(Debug)]
pub struct WindowSizeCommand {
    pub client_tag: String,
    pub size: WindowSize,
}

#[derive(Debug)]
pub struct MigrateCommand {
    pub dest: SocketAddr,
    pub reply: Reply,
}

#[derive(Debug)]
pub struct AttachVolumeCommand {
    pub volume: VolumeInfo,
    pub reply: Reply,
}

#[derive(Debug)]
pub struct DetachVolumeCommand {
    pub name: String,
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockdevInsertedEvent {
    pub name: String,
    pub source: SourceKind,
    pub device_name: String,
    pub scsi_id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetdevInsertedEvent {
    pub index: usize,
    pub device_name: String,
    pub address: u32,
}

/// A device session exhausted its retries. `session` is the event the
/// session would have produced on success.
#[derive(Debug)]
pub struct DeviceFailedEvent {
    pub session: Option<Box<VmEvent>>,
    pub reason: SessionError,
}

/// Asynchronous notifications from the hypervisor other than shutdown.
#[derive(Debug, Clone, PartialEq)]
pub enum HypervisorEvent {
    DeviceDeleted { device: Option<String> },
    NicRxFilterChanged { name: Option<String> },
    Other { name: String, data: Option<Value> },
}

impl From<QmpEvent> for HypervisorEvent {
    fn from(ev: QmpEvent) -> Self {
        let field = |data: &Option<Value>, key: &str| {
            data.as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match ev.event.as_str() {
            "DEVICE_DELETED" => HypervisorEvent::DeviceDeleted {
                device: field(&ev.data, "device"),
            },
            "NIC_RX_FILTER_CHANGED" => HypervisorEvent::NicRxFilterChanged {
                name: field(&ev.data, "name"),
            },
            _ => HypervisorEvent::Other { name: ev.event, data: ev.data },
        }
    }
}

#[derive(Debug)]
pub enum VmEvent {
    RunPod(RunPodCommand),
    ReplacePod(RunPodCommand),
    ListenPod(ListenPodCommand),
    Exec(ExecCommand),
    Attach(AttachCommand),
    WindowSize(WindowSizeCommand),
    AttachVolume(AttachVolumeCommand),
    DetachVolume(DetachVolumeCommand),
    Migrate(MigrateCommand),
    Shutdown { reply: Reply },
    Release { reply: Reply },
    Kill { reply: Reply },
    Dump { reply: Reply },

    BlockdevInserted(BlockdevInsertedEvent),
    NetdevInserted(NetdevInsertedEvent),
    DeviceFailed(DeviceFailedEvent),
    BlockdevRemoved { name: String, success: bool },
    NetdevRemoved { index: usize, success: bool },
    ContainerUnmounted { index: usize, success: bool },
    VolumeUnmounted { name: String, success: bool },

    /// The monitor connection could not be established, or was lost.
    InitFailed { reason: String },
    VmStartFailed { reason: String },
    VmExit,
    VmKilled { success: bool },
    Timeout,
    MigrationFinished { result: Result<(), String> },
    Hypervisor(HypervisorEvent),
    Agent(AgentEvent),
}

impl VmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VmEvent::RunPod(_) => "run-pod",
            VmEvent::ReplacePod(_) => "replace-pod",
            VmEvent::ListenPod(_) => "listen-pod",
            VmEvent::Exec(_) => "exec",
            VmEvent::Attach(_) => "attach",
            VmEvent::WindowSize(_) => "window-size",
            VmEvent::AttachVolume(_) => "attach-volume",
            VmEvent::DetachVolume(_) => "detach-volume",
            VmEvent::Migrate(_) => "migrate",
            VmEvent::Shutdown { .. } => "shutdown",
            VmEvent::Release { .. } => "release",
            VmEvent::Kill { .. } => "kill",
            VmEvent::Dump { .. } => "dump",
            VmEvent::BlockdevInserted(_) => "blockdev-inserted",
            VmEvent::NetdevInserted(_) => "netdev-inserted",
            VmEvent::DeviceFailed(_) => "device-failed",
            VmEvent::BlockdevRemoved { .. } => "blockdev-removed",
            VmEvent::NetdevRemoved { .. } => "netdev-removed",
            VmEvent::ContainerUnmounted { .. } => "container-unmounted",
            VmEvent::VolumeUnmounted { .. } => "volume-unmounted",
            VmEvent::InitFailed { .. } => "init-failed",
            VmEvent::VmStartFailed { .. } => "vm-start-failed",
            VmEvent::VmExit => "vm-exit",
            VmEvent::VmKilled { .. } => "vm-killed",
            VmEvent::Timeout => "timeout",
            VmEvent::MigrationFinished { .. } => "migration-finished",
            VmEvent::Hypervisor(_) => "hypervisor-event",
            VmEvent::Agent(_) => "agent-event",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn hypervisor_event_mapping() {
        let ev = QmpEvent {
            event: "DEVICE_DELETED".to_string(),
            data: Some(json!({
                "device": "scsi-disk2",
                "path": "/machine/peripheral/scsi-disk2",
            })),
            timestamp: None,
        };
        assert_eq!(
            HypervisorEvent::from(ev),
            HypervisorEvent::DeviceDeleted {
                device: Some("scsi-disk2".to_string())
            }
        );

        let ev = QmpEvent {
            event: "RESUME".to_string(),
            data: None,
            timestamp: None,
        };
        assert!(matches!(
            HypervisorEvent::from(ev),
            HypervisorEvent::Other { name, data: None } if name == "RESUME"
        ));
    }
}
