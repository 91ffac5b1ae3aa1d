// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM context: everything the state driver knows about one VM.
//!
//! The context is owned by the state driver task and mutated only while that
//! task handles a single hub event, so nothing in it is locked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hyperd_api_types::{ResultCode, UserPod, VmResponse};
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::driver::DriverHandle;
use crate::network::{NetworkAllocator, NetworkError};
use crate::qmp::devices::scsi_id_to_name;

use super::agent::{AgentCode, AgentHandle, WinSizePayload};
use super::devices::{
    BlockDescriptor, ContainerInfo, DeviceMap, ImageInfo, InterfaceCreated,
    Progress, SourceKind, VolumeInfo, VolumeState, FSTYPE_DIR,
};
use super::event::{
    AttachCommand, BlockdevInsertedEvent, ExecCommand, NetdevInsertedEvent,
    Reply, VmEvent, WindowSizeCommand,
};
use super::hub::HubSender;
use super::pod::{
    VmContainer, VmEnvironmentVar, VmFsmapDescriptor, VmNetworkInterface,
    VmPod, VmVolumeDescriptor,
};
use super::tty::{Pseudoterminals, WindowSize};
use super::{BootConfig, VmSockets, VmState, VmTimeouts};

/// First PCI slot handed to hot-plugged devices; lower slots hold the
/// fixed machine devices.
pub const PCI_ADDR_FROM: u32 = 0x05;

/// Tag the guest mounts the share directory under.
pub const SHARE_DIR_TAG: &str = "share_dir";

/// Monotonic hardware allocation counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HwStatus {
    pub pci_addr: u32,
    pub scsi_id: usize,
    pub attach_id: u64,
}

impl Default for HwStatus {
    fn default() -> Self {
        // Attach id 0 means "no session", so allocation starts at 1.
        Self { pci_addr: PCI_ADDR_FROM, scsi_id: 0, attach_id: 1 }
    }
}

/// Callers waiting on the outcome of something in progress.
#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    pub start: Option<Reply>,
    pub shutdown: Vec<Reply>,
    pub kill: Vec<Reply>,
    pub migrate: Option<Reply>,
    pub attach_volume: BTreeMap<String, Reply>,
    pub detach_volume: BTreeMap<String, Reply>,
}

pub(crate) struct VmContext {
    pub id: String,
    pub log: Logger,
    pub state: VmState,
    pub boot: BootConfig,
    pub sockets: VmSockets,
    pub timeouts: VmTimeouts,
    pub driver: DriverHandle,
    pub hub: HubSender,
    pub network: Arc<dyn NetworkAllocator>,

    pub user_spec: Option<UserPod>,
    pub vm_spec: Option<VmPod>,
    pub devices: DeviceMap,
    pub progress: Progress,
    pub hw: HwStatus,

    /// Attach requests that arrived before the pod's sessions existed.
    pub pending_ttys: Vec<AttachCommand>,
    /// Exec and window-size requests held until the pod is running.
    pub pending_execs: Vec<ExecCommand>,
    pub pending_winsizes: Vec<WindowSizeCommand>,
    pub ptys: Pseudoterminals,
    pub agent: Option<AgentHandle>,
    pub replies: PendingReplies,

    timer: Option<JoinHandle<()>>,
    state_tx: watch::Sender<VmState>,
}

impl VmContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Logger,
        id: String,
        boot: BootConfig,
        sockets: VmSockets,
        timeouts: VmTimeouts,
        driver: DriverHandle,
        hub: HubSender,
        network: Arc<dyn NetworkAllocator>,
        state_tx: watch::Sender<VmState>,
    ) -> Self {
        let ptys = Pseudoterminals::new(&log, &id);
        Self {
            id,
            log,
            state: VmState::Init,
            boot,
            sockets,
            timeouts,
            driver,
            hub,
            network,
            user_spec: None,
            vm_spec: None,
            devices: DeviceMap::default(),
            progress: Progress::default(),
            hw: HwStatus::default(),
            pending_ttys: Vec::new(),
            pending_execs: Vec::new(),
            pending_winsizes: Vec::new(),
            ptys,
            agent: None,
            replies: PendingReplies::default(),
            timer: None,
            state_tx,
        }
    }

    pub fn next_pci_addr(&mut self) -> u32 {
        let addr = self.hw.pci_addr;
        self.hw.pci_addr += 1;
        addr
    }

    pub fn next_scsi_id(&mut self) -> usize {
        let id = self.hw.scsi_id;
        self.hw.scsi_id += 1;
        id
    }

    pub fn next_attach_id(&mut self) -> u64 {
        let id = self.hw.attach_id;
        self.hw.attach_id += 1;
        id
    }

    pub fn become_state(&mut self, state: VmState) {
        if self.state != state {
            info!(self.log, "vm state change";
                "from" => %self.state, "to" => %state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn response(
        &self,
        code: ResultCode,
        cause: impl Into<String>,
    ) -> VmResponse {
        VmResponse::new(&self.id, code, cause)
    }

    pub fn respond(
        &self,
        reply: Reply,
        code: ResultCode,
        cause: impl Into<String>,
    ) {
        let _ = reply.send(self.response(code, cause));
    }

    /// Builds the VM-level pod and the device maps for `spec`, and marks
    /// every device the pod needs as pending insertion. No addresses are
    /// allocated yet.
    pub fn init_device_context(
        &mut self,
        spec: &UserPod,
        containers: &[ContainerInfo],
        volumes: &BTreeMap<String, VolumeInfo>,
    ) {
        let mut vm_spec = VmPod {
            hostname: spec.name.clone(),
            containers: Vec::with_capacity(containers.len()),
            interfaces: Vec::new(),
            share_dir: SHARE_DIR_TAG.to_string(),
        };

        for (idx, (user, info)) in
            spec.containers.iter().zip(containers).enumerate()
        {
            let tty = self.next_attach_id();
            let stderr = if user.tty { 0 } else { self.next_attach_id() };

            let mut envs: BTreeMap<String, String> = info.envs.clone();
            for e in &user.envs {
                envs.insert(e.env.clone(), e.value.clone());
            }

            let mut container = VmContainer {
                id: info.id.clone(),
                rootfs: info.rootfs.clone(),
                fstype: info.fstype.clone(),
                image: String::new(),
                volumes: Vec::new(),
                fsmap: Vec::new(),
                tty,
                stderr,
                workdir: if user.workdir.is_empty() {
                    info.workdir.clone()
                } else {
                    user.workdir.clone()
                },
                entrypoint: if user.entrypoint.is_empty() {
                    info.entrypoint.clone()
                } else {
                    user.entrypoint.clone()
                },
                cmd: if user.command.is_empty() {
                    info.cmd.clone()
                } else {
                    user.command.clone()
                },
                envs: envs
                    .into_iter()
                    .map(|(env, value)| VmEnvironmentVar { env, value })
                    .collect(),
            };

            if info.fstype == FSTYPE_DIR {
                container.image = info.image.clone();
            } else {
                self.devices.images.insert(
                    info.image.clone(),
                    ImageInfo {
                        info: BlockDescriptor {
                            name: info.image.clone(),
                            filename: info.image.clone(),
                            format: info.format.clone(),
                            fstype: info.fstype.clone(),
                            ..Default::default()
                        },
                        pos: idx,
                    },
                );
                self.progress.adding.blockdevs.insert(info.image.clone());
            }

            for vref in &user.volumes {
                let Some(vol) = volumes.get(&vref.volume) else {
                    warn!(self.log, "container references unprepared volume";
                        "container" => &info.id, "volume" => &vref.volume);
                    continue;
                };
                if vol.fstype == FSTYPE_DIR {
                    container.fsmap.push(VmFsmapDescriptor {
                        source: vol.filepath.clone(),
                        path: vref.path.clone(),
                        read_only: vref.read_only,
                    });
                } else {
                    container.volumes.push(VmVolumeDescriptor {
                        device: String::new(),
                        mount: vref.path.clone(),
                        fstype: vol.fstype.clone(),
                        read_only: vref.read_only,
                    });
                    self.progress.adding.blockdevs.insert(vol.name.clone());
                }
                let state = self
                    .devices
                    .volumes
                    .entry(vol.name.clone())
                    .or_insert_with(|| VolumeState {
                        info: block_for_volume(vol),
                        ..Default::default()
                    });
                state.pos.insert(idx, vref.path.clone());
                state.read_only.insert(idx, vref.read_only);
            }

            vm_spec.containers.push(container);
        }

        for index in 0..spec.interface_count() {
            self.progress.adding.networks.insert(index);
        }

        debug!(self.log, "device context initialized";
            "images" => self.devices.images.len(),
            "volumes" => self.devices.volumes.len(),
            "networks" => self.progress.adding.networks.len());
        self.user_spec = Some(spec.clone());
        self.vm_spec = Some(vm_spec);
    }

    /// Allocates the host side of every pending NIC, assigning PCI
    /// addresses in interface order.
    pub async fn allocate_networks(
        &mut self,
    ) -> Result<Vec<InterfaceCreated>, NetworkError> {
        let indexes: Vec<usize> =
            self.progress.adding.networks.iter().copied().collect();
        let mut created = Vec::with_capacity(indexes.len());
        for index in indexes {
            let (bridge, ip) = match self
                .user_spec
                .as_ref()
                .and_then(|s| s.interfaces.get(index))
            {
                Some(i) => (
                    Some(i.bridge.clone()).filter(|b| !b.is_empty()),
                    i.ip.parse().ok(),
                ),
                None => (None, None),
            };
            let pci_addr = self.next_pci_addr();
            let nic = self
                .network
                .allocate(&self.id, index, pci_addr, bridge.as_deref(), ip)
                .await?;
            self.interface_created(nic.clone());
            created.push(nic);
        }
        Ok(created)
    }

    pub fn interface_created(&mut self, nic: InterfaceCreated) {
        if let Some(spec) = self.vm_spec.as_mut() {
            spec.interfaces.push(VmNetworkInterface {
                device: nic.device_name.clone(),
                ip_address: nic.ip_addr.clone(),
                net_mask: nic.net_mask.clone(),
            });
        }
        self.devices.networks.insert(nic.index, nic);
    }

    /// Assigns SCSI ids to every pending block device, in name order, and
    /// returns them for insertion.
    pub fn pending_blockdevs(&mut self) -> Vec<(BlockDescriptor, SourceKind)> {
        let names: Vec<String> =
            self.progress.adding.blockdevs.iter().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if self.devices.images.contains_key(&name) {
                let id = self.next_scsi_id();
                if let Some(img) = self.devices.images.get_mut(&name) {
                    img.info.scsi_id = id;
                    out.push((img.info.clone(), SourceKind::Image));
                }
            } else if self.devices.volumes.contains_key(&name) {
                let id = self.next_scsi_id();
                if let Some(vol) = self.devices.volumes.get_mut(&name) {
                    vol.info.scsi_id = id;
                    out.push((vol.info.clone(), SourceKind::Volume));
                }
            }
        }
        out
    }

    /// Records an inserted block device and fills its guest name into the
    /// pod. Returns false for a device the context never asked for.
    pub fn blockdev_inserted(&mut self, ev: &BlockdevInsertedEvent) -> bool {
        let known = if let Some(img) = self.devices.images.get_mut(&ev.name) {
            img.info.device_name = ev.device_name.clone();
            img.info.scsi_id = ev.scsi_id;
            if let Some(c) = self
                .vm_spec
                .as_mut()
                .and_then(|s| s.containers.get_mut(img.pos))
            {
                c.image = ev.device_name.clone();
            }
            true
        } else if let Some(vol) = self.devices.volumes.get_mut(&ev.name) {
            vol.info.device_name = ev.device_name.clone();
            vol.info.scsi_id = ev.scsi_id;
            if let Some(spec) = self.vm_spec.as_mut() {
                for (idx, mount) in &vol.pos {
                    let Some(c) = spec.containers.get_mut(*idx) else {
                        continue;
                    };
                    let mounted = c.volumes.iter_mut();
                    for v in mounted.filter(|v| &v.mount == mount) {
                        v.device = ev.device_name.clone();
                    }
                }
            }
            true
        } else {
            false
        };
        self.progress.adding.blockdevs.remove(&ev.name);
        known
    }

    pub fn netdev_inserted(&mut self, ev: &NetdevInsertedEvent) {
        self.progress.adding.networks.remove(&ev.index);
    }

    pub fn devices_ready(&self) -> bool {
        self.progress.adding.is_empty()
    }

    /// Registers a hot-attached volume; the caller inserts the returned
    /// descriptor.
    pub fn add_volume(&mut self, vol: &VolumeInfo) -> BlockDescriptor {
        let mut block = block_for_volume(vol);
        block.scsi_id = self.next_scsi_id();
        block.device_name = scsi_id_to_name(block.scsi_id);
        self.devices.volumes.insert(
            vol.name.clone(),
            VolumeState { info: block.clone(), ..Default::default() },
        );
        self.progress.adding.blockdevs.insert(vol.name.clone());
        block
    }

    /// Index of a container by name, then by (prefix of) id.
    pub fn container_index(&self, name_or_id: &str) -> Option<usize> {
        self.user_spec
            .as_ref()
            .and_then(|s| {
                s.containers.iter().position(|c| c.name == name_or_id)
            })
            .or_else(|| self.vm_spec.as_ref()?.container_index(name_or_id))
    }

    /// Binds an attach request to the container's TTY session. Requests
    /// for an unknown container are answered with an error.
    pub fn attach_tty(&mut self, cmd: AttachCommand) {
        let sessions = self.container_index(&cmd.container).and_then(|idx| {
            let c = self.vm_spec.as_ref()?.containers.get(idx)?;
            Some((c.tty, c.stderr))
        });
        let Some((tty, stderr)) = sessions else {
            warn!(self.log, "attach to unknown container";
                "container" => &cmd.container);
            if let Some(cb) = cmd.streams.callback {
                let _ = cb.send(self.response(
                    ResultCode::BadRequest,
                    format!("no container {}", cmd.container),
                ));
            }
            return;
        };
        if stderr != 0 {
            self.ptys.attach(
                stderr,
                super::tty::TtyIo {
                    client_tag: String::new(),
                    stdin: None,
                    stdout: cmd.streams.stdout.clone(),
                    callback: None,
                },
            );
        }
        let tag = cmd.streams.client_tag.clone();
        self.ptys.attach(tty, cmd.streams);
        if let Some(size) = cmd.size {
            self.set_window_size(&tag, size);
        }
    }

    pub fn set_window_size(&self, client_tag: &str, size: WindowSize) {
        let (Some(session), Some(agent)) =
            (self.ptys.session_for_tag(client_tag), self.agent.as_ref())
        else {
            debug!(self.log, "window size for unknown client";
                "client" => client_tag);
            return;
        };
        let payload =
            WinSizePayload { seq: session, row: size.row, column: size.column };
        if let Err(e) = agent.send(AgentCode::WinSize, &payload) {
            warn!(self.log, "cannot send window size"; "error" => %e);
        }
    }

    /// Arms the state timer, replacing any timer already armed.
    pub fn set_timeout(&mut self, after: Duration) {
        self.unset_timeout();
        let hub = self.hub.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            hub.send(VmEvent::Timeout).await;
        }));
    }

    pub fn unset_timeout(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn block_for_volume(vol: &VolumeInfo) -> BlockDescriptor {
    BlockDescriptor {
        name: vol.name.clone(),
        filename: vol.filepath.clone(),
        format: vol.format.clone(),
        fstype: vol.fstype.clone(),
        options: vol.options.clone(),
        ..Default::default()
    }
}
