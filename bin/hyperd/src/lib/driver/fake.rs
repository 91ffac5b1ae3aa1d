// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process driver for exercising the state machine without a
//! hypervisor. Every operation is recorded and answered with the hub event
//! a real hypervisor would eventually produce.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use slog::Logger;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{
    DriverContext, DriverError, DriverInfo, HypervisorDriver,
    LazyDriverContext,
};
use crate::qmp::devices::scsi_id_to_name;
use crate::qmp::session::SessionError;
use crate::vm::agent::{AgentCode, AgentCodec, AgentMessage};
use crate::vm::devices::{BlockDescriptor, InterfaceCreated, SourceKind};
use crate::vm::event::{
    BlockdevInsertedEvent, DeviceFailedEvent, NetdevInsertedEvent, VmEvent,
};
use crate::vm::hub::HubSender;
use crate::vm::{BootConfig, VmSockets};

#[derive(Clone, Debug, Default)]
pub(crate) struct FakeBehavior {
    pub lazy: bool,
    /// Block device whose insertion fails.
    pub fail_disk: Option<String>,
    /// Never report block device insertions.
    pub stall_disks: bool,
    pub fail_migration: bool,
    /// Serve a [`fake_agent`] once the hypervisor is started.
    pub agent: bool,
}

/// A guest agent that acknowledges everything and records message codes.
pub(crate) fn fake_agent(sockets: &VmSockets) -> Arc<Mutex<Vec<u32>>> {
    fake_agent_ignoring(sockets, &[])
}

/// Like [`fake_agent`], but never answers messages with the given codes.
pub(crate) fn fake_agent_ignoring(
    sockets: &VmSockets,
    ignored: &[AgentCode],
) -> Arc<Mutex<Vec<u32>>> {
    let ignored: Vec<u32> = ignored.iter().map(|c| *c as u32).collect();
    std::fs::create_dir_all(&sockets.home_dir).unwrap();
    let listener = UnixListener::bind(&sockets.control).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let (read, write) = stream.into_split();
        let mut rx = FramedRead::new(read, AgentCodec);
        let mut tx = FramedWrite::new(write, AgentCodec);
        while let Some(Ok(msg)) = rx.next().await {
            record.lock().unwrap().push(msg.code);
            if ignored.contains(&msg.code) {
                continue;
            }
            let ack = AgentMessage {
                code: AgentCode::Ack as u32,
                payload: bytes::Bytes::new(),
            };
            if tx.send(ack).await.is_err() {
                return;
            }
        }
    });
    seen
}

#[derive(Clone, Default)]
pub(crate) struct FakeDriver {
    calls: Arc<Mutex<Vec<String>>>,
    behavior: FakeBehavior,
}

impl FakeDriver {
    pub fn with(behavior: FakeBehavior) -> Self {
        Self { calls: Arc::default(), behavior }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn context(&self, hub: HubSender) -> FakeContext {
        // Events go through one task so they reach the hub in the order
        // they were produced.
        let (tx, mut rx) = mpsc::unbounded_channel::<VmEvent>();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if !hub.send(ev).await {
                    return;
                }
            }
        });
        FakeContext {
            calls: self.calls.clone(),
            behavior: self.behavior.clone(),
            events: tx,
            pending: Vec::new(),
        }
    }
}

impl HypervisorDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn init_context(
        &self,
        _log: &Logger,
        _vm_id: &str,
        _sockets: &VmSockets,
        hub: HubSender,
    ) -> Box<dyn DriverContext> {
        Box::new(self.context(hub))
    }

    fn init_lazy_context(
        &self,
        _log: &Logger,
        _vm_id: &str,
        _sockets: &VmSockets,
        hub: HubSender,
    ) -> Option<Box<dyn LazyDriverContext>> {
        if self.behavior.lazy {
            Some(Box::new(self.context(hub)))
        } else {
            None
        }
    }

    fn load_context(
        &self,
        _log: &Logger,
        vm_id: &str,
        info: &DriverInfo,
        _sockets: &VmSockets,
        hub: HubSender,
    ) -> Result<Box<dyn DriverContext>, DriverError> {
        match info.get("hypervisor").and_then(|v| v.as_str()) {
            Some("fake") => {}
            Some(other) => {
                return Err(DriverError::WrongHypervisor(other.to_string()))
            }
            None => return Err(DriverError::MissingField("hypervisor")),
        }
        self.calls.lock().unwrap().push(format!("load_context {}", vm_id));
        Ok(Box::new(self.context(hub)))
    }
}

struct FakeContext {
    calls: Arc<Mutex<Vec<String>>>,
    behavior: FakeBehavior,
    events: mpsc::UnboundedSender<VmEvent>,
    /// Insertions recorded before a lazy launch.
    pending: Vec<VmEvent>,
}

impl FakeContext {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&self, ev: VmEvent) {
        let _ = self.events.send(ev);
    }

    fn disk_outcome(
        &self,
        block: &BlockDescriptor,
        source: SourceKind,
    ) -> Option<VmEvent> {
        let inserted = VmEvent::BlockdevInserted(BlockdevInsertedEvent {
            name: block.name.clone(),
            source,
            device_name: scsi_id_to_name(block.scsi_id),
            scsi_id: block.scsi_id,
        });
        if self.behavior.fail_disk.as_deref() == Some(block.name.as_str()) {
            return Some(VmEvent::DeviceFailed(DeviceFailedEvent {
                session: Some(Box::new(inserted)),
                reason: SessionError::StepFailed {
                    step: 1,
                    command: "device_add".to_string(),
                    attempts: 3,
                    class: "GenericError".to_string(),
                    desc: format!("cannot add {}", block.name),
                },
            }));
        }
        (!self.behavior.stall_disks).then_some(inserted)
    }

    fn nic_outcome(nic: &InterfaceCreated) -> VmEvent {
        VmEvent::NetdevInserted(NetdevInsertedEvent {
            index: nic.index,
            device_name: nic.device_name.clone(),
            address: nic.pci_addr,
        })
    }

    fn start_agent(&self, sockets: &VmSockets) {
        if self.behavior.agent {
            fake_agent(sockets);
        }
    }

    fn replay_pending(&mut self) {
        for ev in std::mem::take(&mut self.pending) {
            self.emit(ev);
        }
    }
}

#[async_trait]
impl DriverContext for FakeContext {
    fn launch(&mut self, _boot: &BootConfig, sockets: &VmSockets) {
        self.record("launch".to_string());
        self.start_agent(sockets);
    }

    fn associate(&mut self) {
        self.record("associate".to_string());
    }

    fn listen(
        &mut self,
        _boot: &BootConfig,
        sockets: &VmSockets,
        incoming: SocketAddr,
    ) {
        self.record(format!("listen {}", incoming));
        self.start_agent(sockets);
        self.replay_pending();
    }

    fn migrate(&mut self, dest: SocketAddr) {
        self.record(format!("migrate {}", dest));
        let result = if self.behavior.fail_migration {
            Err("migration failed".to_string())
        } else {
            Ok(())
        };
        self.emit(VmEvent::MigrationFinished { result });
    }

    fn add_disk(&mut self, block: &BlockDescriptor, source: SourceKind) {
        self.record(format!("add_disk {} {}", block.name, block.scsi_id));
        if let Some(ev) = self.disk_outcome(block, source) {
            self.emit(ev);
        }
    }

    fn remove_disk(&mut self, block: &BlockDescriptor, callback: VmEvent) {
        self.record(format!("remove_disk {}", block.name));
        self.emit(callback);
    }

    fn add_nic(&mut self, nic: &InterfaceCreated) {
        self.record(format!("add_nic {} {}", nic.device_name, nic.pci_addr));
        self.emit(Self::nic_outcome(nic));
    }

    fn remove_nic(&mut self, nic: &InterfaceCreated, callback: VmEvent) {
        self.record(format!("remove_nic {}", nic.device_name));
        self.emit(callback);
    }

    fn shutdown(&mut self) {
        self.record("shutdown".to_string());
        self.emit(VmEvent::VmExit);
    }

    fn kill(&mut self) {
        self.record("kill".to_string());
        self.emit(VmEvent::VmKilled { success: true });
    }

    fn dump(&self) -> Result<DriverInfo, DriverError> {
        match json!({"hypervisor": "fake", "pid": 42}) {
            serde_json::Value::Object(map) => Ok(map),
            _ => unreachable!(),
        }
    }

    async fn close(&mut self) {
        self.record("close".to_string());
    }
}

impl LazyDriverContext for FakeContext {
    fn as_driver(&mut self) -> &mut dyn DriverContext {
        self
    }

    fn init_vm(&mut self, _boot: &BootConfig) -> Result<(), DriverError> {
        self.record("init_vm".to_string());
        Ok(())
    }

    fn lazy_add_disk(&mut self, block: &BlockDescriptor, source: SourceKind) {
        self.record(format!("lazy_add_disk {} {}", block.name, block.scsi_id));
        if let Some(ev) = self.disk_outcome(block, source) {
            self.pending.push(ev);
        }
    }

    fn lazy_add_nic(&mut self, nic: &InterfaceCreated) {
        self.record(format!(
            "lazy_add_nic {} {}",
            nic.device_name, nic.pci_addr
        ));
        self.pending.push(Self::nic_outcome(nic));
    }

    fn lazy_launch(&mut self, _boot: &BootConfig, sockets: &VmSockets) {
        self.record("lazy_launch".to_string());
        self.start_agent(sockets);
        self.replay_pending();
    }
}
