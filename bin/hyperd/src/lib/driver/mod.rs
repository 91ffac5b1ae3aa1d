// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor backend seam.
//!
//! A [`HypervisorDriver`] creates per-VM [`DriverContext`]s. The state
//! driver only talks to a VM's hypervisor through its context, and a
//! context only talks back through the [`HubSender`] it was created with:
//! outcomes of launches, device operations, kills and migrations arrive as
//! hub events, never as return values.
//!
//! Lazy provisioning is an optional capability. A driver that supports it
//! returns a [`LazyDriverContext`] from
//! [`HypervisorDriver::init_lazy_context`]; the VM decides which kind of
//! context it holds once, at creation, and keeps the answer in a
//! [`DriverHandle`].

use std::net::SocketAddr;

use async_trait::async_trait;
use serde_json::{Map, Value};
use slog::Logger;
use thiserror::Error;

use crate::vm::devices::{BlockDescriptor, InterfaceCreated, SourceKind};
use crate::vm::event::VmEvent;
use crate::vm::hub::HubSender;
use crate::vm::{BootConfig, VmSockets};

pub mod qemu;

#[cfg(test)]
pub(crate) mod fake;

/// Driver-specific state persisted with a VM, opaque to everything but the
/// driver that produced it.
pub type DriverInfo = Map<String, Value>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("persisted driver info belongs to hypervisor {0:?}")]
    WrongHypervisor(String),

    #[error("persisted driver info lacks a valid {0}")]
    MissingField(&'static str),

    #[error("hypervisor executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("operation needs a launched hypervisor")]
    NotLaunched,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait HypervisorDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn init_context(
        &self,
        log: &Logger,
        vm_id: &str,
        sockets: &VmSockets,
        hub: HubSender,
    ) -> Box<dyn DriverContext>;

    /// Returns a lazily-provisioning context if the driver supports it.
    fn init_lazy_context(
        &self,
        _log: &Logger,
        _vm_id: &str,
        _sockets: &VmSockets,
        _hub: HubSender,
    ) -> Option<Box<dyn LazyDriverContext>> {
        None
    }

    /// Rebuilds a context for an already running hypervisor from the output
    /// of [`DriverContext::dump`].
    fn load_context(
        &self,
        log: &Logger,
        vm_id: &str,
        info: &DriverInfo,
        sockets: &VmSockets,
        hub: HubSender,
    ) -> Result<Box<dyn DriverContext>, DriverError>;
}

#[async_trait]
pub trait DriverContext: Send {
    /// Starts the hypervisor. Failure is reported as
    /// [`VmEvent::VmStartFailed`] or [`VmEvent::InitFailed`].
    fn launch(&mut self, boot: &BootConfig, sockets: &VmSockets);

    /// Attaches to the hypervisor a loaded context describes.
    fn associate(&mut self);

    /// Starts the hypervisor waiting for an incoming migration on
    /// `incoming`.
    fn listen(
        &mut self,
        boot: &BootConfig,
        sockets: &VmSockets,
        incoming: SocketAddr,
    );

    /// Migrates the running guest to `dest`. The outcome arrives as a
    /// single [`VmEvent::MigrationFinished`].
    fn migrate(&mut self, dest: SocketAddr);

    fn add_disk(&mut self, block: &BlockDescriptor, source: SourceKind);
    fn remove_disk(&mut self, block: &BlockDescriptor, callback: VmEvent);
    fn add_nic(&mut self, nic: &InterfaceCreated);
    fn remove_nic(&mut self, nic: &InterfaceCreated, callback: VmEvent);

    /// Asks the hypervisor to exit.
    fn shutdown(&mut self);

    /// Kills the hypervisor; the watchdog reports [`VmEvent::VmKilled`].
    fn kill(&mut self);

    fn dump(&self) -> Result<DriverInfo, DriverError>;

    /// Stops watching the hypervisor and releases the context's channels,
    /// leaving the hypervisor process itself alone.
    async fn close(&mut self);
}

pub trait LazyDriverContext: DriverContext {
    fn as_driver(&mut self) -> &mut dyn DriverContext;

    fn init_vm(&mut self, boot: &BootConfig) -> Result<(), DriverError>;

    /// Records a disk for the launch command line. Its inserted event is
    /// replayed once the hypervisor is up.
    fn lazy_add_disk(&mut self, block: &BlockDescriptor, source: SourceKind);
    fn lazy_add_nic(&mut self, nic: &InterfaceCreated);

    fn lazy_launch(&mut self, boot: &BootConfig, sockets: &VmSockets);
}

/// The driver capability a VM resolved at creation time.
pub enum DriverHandle {
    Eager(Box<dyn DriverContext>),
    Lazy(Box<dyn LazyDriverContext>),
}

impl DriverHandle {
    pub fn ctx(&mut self) -> &mut dyn DriverContext {
        match self {
            DriverHandle::Eager(c) => c.as_mut(),
            DriverHandle::Lazy(c) => c.as_driver(),
        }
    }

    pub fn lazy(&mut self) -> Option<&mut dyn LazyDriverContext> {
        match self {
            DriverHandle::Eager(_) => None,
            DriverHandle::Lazy(c) => Some(c.as_mut()),
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, DriverHandle::Lazy(_))
    }

    pub fn dump(&self) -> Result<DriverInfo, DriverError> {
        match self {
            DriverHandle::Eager(c) => c.dump(),
            DriverHandle::Lazy(c) => c.dump(),
        }
    }
}
