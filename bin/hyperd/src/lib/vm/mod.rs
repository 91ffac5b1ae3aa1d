// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implements the VM controller: the public interface to a single sandbox
//! VM.
//!
//! Each VM has a single "state driver" task that owns the VM's context and
//! consumes the VM's hub. Commands from callers, completions of monitor
//! sessions, watchdog and agent reports, and timer expirations are all hub
//! events, so the driver handles exactly one of them at a time. That is the
//! only synchronization the context needs: nothing else holds a reference
//! to it.
//!
//! [`Vm`] is the caller-facing handle. Its methods enqueue commands and, for
//! those that expect an answer, wait for the [`VmResponse`] the state driver
//! sends back. If the VM goes away first the wait ends with
//! [`VmError::Gone`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hyperd_api_types::{UserPod, VmResponse};
use hyperd_config::Config;
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::driver::{DriverError, DriverHandle, HypervisorDriver};
use crate::network::NetworkAllocator;

pub mod agent;
mod context;
pub mod devices;
pub mod event;
pub mod hub;
pub mod persist;
pub mod pod;
mod state_driver;
pub mod tty;
mod volume;

pub use context::{HwStatus, PCI_ADDR_FROM, SHARE_DIR_TAG};

use devices::{ContainerInfo, VolumeInfo};
use event::{
    AttachCommand, AttachVolumeCommand, DetachVolumeCommand, ExecCommand,
    ListenPodCommand, MigrateCommand, Reply, RunPodCommand, VmEvent,
    WindowSizeCommand,
};
use hub::HubSender;
use persist::PersistError;
use tty::{TtyIo, WindowSize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    /// Context created; the hypervisor may not be running yet.
    Init,
    /// Waiting for a pod.
    Preparing,
    /// Hypervisor launched; devices being inserted.
    Starting,
    Running,
    Terminating,
    /// The state driver has exited.
    None,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Init => "init",
            VmState::Preparing => "preparing",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Terminating => "terminating",
            VmState::None => "none",
        };
        s.fmt(f)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BootConfig {
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbfs: Option<PathBuf>,
}

impl BootConfig {
    /// Boot settings for a pod, falling back to the daemon's defaults for
    /// unset resources.
    pub fn for_pod(config: &Config, spec: &UserPod) -> Self {
        let cpu = if spec.resource.vcpu == 0 {
            config.vm.cpu
        } else {
            spec.resource.vcpu
        };
        let memory = if spec.resource.memory == 0 {
            config.vm.memory
        } else {
            spec.resource.memory
        };
        Self {
            cpu,
            memory,
            kernel: config.kernel.clone(),
            initrd: config.initrd.clone(),
            bios: config.bios.clone(),
            cbfs: config.cbfs.clone(),
        }
    }
}

/// Paths of a VM's host-side sockets and directories, all under
/// `<vm root>/<vm id>/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSockets {
    pub home_dir: PathBuf,
    /// Guest agent control channel.
    pub control: PathBuf,
    pub tty: PathBuf,
    pub console: PathBuf,
    pub share_dir: PathBuf,
}

impl VmSockets {
    pub fn new(vm_root: &Path, vm_id: &str) -> Self {
        let home_dir = vm_root.join(vm_id);
        Self {
            control: home_dir.join("hyper.sock"),
            tty: home_dir.join("tty.sock"),
            console: home_dir.join("console.sock"),
            share_dir: home_dir.join(context::SHARE_DIR_TAG),
            home_dir,
        }
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.share_dir)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmTimeouts {
    /// From launch until the pod is running.
    pub start: Duration,
    /// From a shutdown request until the hypervisor is force-killed.
    pub shutdown: Duration,
    pub agent_connect: Duration,
}

impl Default for VmTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(60),
            shutdown: Duration::from_secs(10),
            agent_connect: Duration::from_secs(30),
        }
    }
}

impl VmTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            start: config.vm.start_timeout(),
            shutdown: config.vm.shutdown_timeout(),
            agent_connect: config.vm.start_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm {0} is gone")]
    Gone(String),

    #[error("cannot prepare vm directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// How a new VM's hypervisor is brought up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// Launch immediately and hot-plug the pod's devices once it arrives.
    Eager,
    /// Launch once the pod arrives, with its devices on the command line.
    /// Falls back to eager for drivers without lazy support.
    Lazy,
    /// Launch only to receive a migrating guest.
    Incoming,
}

pub struct VmParams {
    pub id: String,
    pub boot: BootConfig,
    pub sockets: VmSockets,
    pub timeouts: VmTimeouts,
    pub mode: LaunchMode,
    pub driver: Arc<dyn HypervisorDriver>,
    pub network: Arc<dyn NetworkAllocator>,
}

/// Caller-facing handle to a VM.
#[derive(Debug)]
pub struct Vm {
    id: String,
    hub: HubSender,
    state: watch::Receiver<VmState>,
}

impl Vm {
    /// Creates a VM and starts its state driver.
    pub fn launch(log: &Logger, params: VmParams) -> Result<Arc<Vm>, VmError> {
        let log = log.new(slog::o!("vm" => params.id.clone()));
        params.sockets.create_dirs()?;

        let (hub_tx, hub) = hub::hub();
        let (state_tx, state_rx) = watch::channel(VmState::Init);
        let wants_lazy = params.mode != LaunchMode::Eager;
        let driver = match wants_lazy
            .then(|| {
                params.driver.init_lazy_context(
                    &log,
                    &params.id,
                    &params.sockets,
                    hub_tx.clone(),
                )
            })
            .flatten()
        {
            Some(lazy) => DriverHandle::Lazy(lazy),
            None => DriverHandle::Eager(params.driver.init_context(
                &log,
                &params.id,
                &params.sockets,
                hub_tx.clone(),
            )),
        };
        info!(log, "creating vm";
            "driver" => params.driver.name(),
            "mode" => ?params.mode,
            "lazy" => driver.is_lazy());

        let ctx = context::VmContext::new(
            log,
            params.id.clone(),
            params.boot,
            params.sockets,
            params.timeouts,
            driver,
            hub_tx.clone(),
            params.network,
            state_tx,
        );
        let launch = params.mode != LaunchMode::Incoming;
        tokio::spawn(state_driver::run_fresh(ctx, hub, launch));

        Ok(Arc::new(Vm { id: params.id, hub: hub_tx, state: state_rx }))
    }

    /// Rebuilds a VM from its persisted record and reattaches to the
    /// hypervisor it describes. The VM starts out running.
    pub fn associate(
        log: &Logger,
        vm_root: &Path,
        record: &[u8],
        timeouts: VmTimeouts,
        driver: &dyn HypervisorDriver,
        network: Arc<dyn NetworkAllocator>,
    ) -> Result<Arc<Vm>, VmError> {
        let (hub_tx, hub) = hub::hub();
        let (state_tx, state_rx) = watch::channel(VmState::Init);
        let ctx = persist::restore(
            log,
            record,
            vm_root,
            timeouts,
            driver,
            network,
            hub_tx.clone(),
            state_tx,
        )?;
        let id = ctx.id.clone();
        tokio::spawn(state_driver::run_associated(ctx, hub));
        Ok(Arc::new(Vm { id, hub: hub_tx, state: state_rx }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> VmState {
        *self.state.borrow()
    }

    /// Returns once the state driver has exited.
    pub async fn wait_for_exit(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == VmState::None).await;
    }

    async fn request<F>(&self, make: F) -> Result<VmResponse, VmError>
    where
        F: FnOnce(Reply) -> VmEvent,
    {
        let (tx, rx) = oneshot::channel();
        if !self.hub.send(make(tx)).await {
            return Err(VmError::Gone(self.id.clone()));
        }
        rx.await.map_err(|_| VmError::Gone(self.id.clone()))
    }

    async fn post(&self, event: VmEvent) -> Result<(), VmError> {
        if self.hub.send(event).await {
            Ok(())
        } else {
            Err(VmError::Gone(self.id.clone()))
        }
    }

    /// Runs a pod and answers once it is running or has failed to start.
    pub async fn start_pod(
        &self,
        spec: UserPod,
        containers: Vec<ContainerInfo>,
        volumes: BTreeMap<String, VolumeInfo>,
    ) -> Result<VmResponse, VmError> {
        self.request(|reply| {
            VmEvent::RunPod(RunPodCommand { spec, containers, volumes, reply })
        })
        .await
    }

    pub async fn replace_pod(
        &self,
        spec: UserPod,
        containers: Vec<ContainerInfo>,
        volumes: BTreeMap<String, VolumeInfo>,
    ) -> Result<VmResponse, VmError> {
        self.request(|reply| {
            VmEvent::ReplacePod(RunPodCommand {
                spec,
                containers,
                volumes,
                reply,
            })
        })
        .await
    }

    /// Prepares the pod's devices and waits for an incoming migration on
    /// `incoming`.
    pub async fn listen_pod(
        &self,
        spec: UserPod,
        containers: Vec<ContainerInfo>,
        volumes: BTreeMap<String, VolumeInfo>,
        incoming: SocketAddr,
    ) -> Result<VmResponse, VmError> {
        self.request(|reply| {
            VmEvent::ListenPod(ListenPodCommand {
                spec,
                containers,
                volumes,
                incoming,
                reply,
            })
        })
        .await
    }

    pub async fn migrate(
        &self,
        dest: SocketAddr,
    ) -> Result<VmResponse, VmError> {
        self.request(|reply| VmEvent::Migrate(MigrateCommand { dest, reply }))
            .await
    }

    pub async fn attach(
        &self,
        container: String,
        streams: TtyIo,
        size: Option<WindowSize>,
    ) -> Result<(), VmError> {
        self.post(VmEvent::Attach(AttachCommand { container, streams, size }))
            .await
    }

    pub async fn exec(
        &self,
        container: String,
        command: Vec<String>,
        tty: bool,
        streams: TtyIo,
    ) -> Result<(), VmError> {
        self.post(VmEvent::Exec(ExecCommand {
            container,
            command,
            tty,
            streams,
        }))
            .await
    }

    pub async fn set_window_size(
        &self,
        client_tag: String,
        size: WindowSize,
    ) -> Result<(), VmError> {
        self.post(VmEvent::WindowSize(WindowSizeCommand { client_tag, size }))
            .await
    }

    pub async fn attach_volume(
        &self,
        volume: VolumeInfo,
    ) -> Result<VmResponse, VmError> {
        self.request(|reply| {
            VmEvent::AttachVolume(AttachVolumeCommand { volume, reply })
        })
        .await
    }

    pub async fn detach_volume(
        &self,
        name: String,
    ) -> Result<VmResponse, VmError> {
        self.request(|reply| {
            VmEvent::DetachVolume(DetachVolumeCommand { name, reply })
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<VmResponse, VmError> {
        self.request(|reply| VmEvent::Shutdown { reply }).await
    }

    /// Detaches from the hypervisor without stopping it. The response
    /// carries the persisted record in `data`.
    pub async fn release(&self) -> Result<VmResponse, VmError> {
        self.request(|reply| VmEvent::Release { reply }).await
    }

    pub async fn kill(&self) -> Result<VmResponse, VmError> {
        self.request(|reply| VmEvent::Kill { reply }).await
    }

    /// Returns the persisted record in the response's `data`.
    pub async fn dump(&self) -> Result<VmResponse, VmError> {
        self.request(|reply| VmEvent::Dump { reply }).await
    }
}
