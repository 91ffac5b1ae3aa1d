// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialization of a running VM's context, so a restarted daemon can
//! reattach to hypervisors it left running.
//!
//! The record flattens the device maps into lists. A rootfs image appears in
//! the volume list flagged as an image, as a single-container entry mounted
//! at `/`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use hyperd_api_types::UserPod;
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use thiserror::Error;
use tokio::sync::watch;

use crate::driver::{DriverError, DriverHandle, DriverInfo, HypervisorDriver};
use crate::network::NetworkAllocator;

use super::context::{HwStatus, VmContext};
use super::devices::{BlockDescriptor, ImageInfo, InterfaceCreated, VolumeState};
use super::hub::HubSender;
use super::pod::VmPod;
use super::{BootConfig, VmSockets, VmState, VmTimeouts};

const IMAGE_MOUNT_POINT: &str = "/";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistent data corrupt, {0}")]
    Corrupt(&'static str),

    #[error("cannot decode persisted vm: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vm has no pod to persist")]
    NoPod,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PersistVolumeInfo {
    pub name: String,
    pub filename: String,
    pub format: String,
    pub fstype: String,
    pub device_name: String,
    pub scsi_id: usize,
    pub containers: Vec<usize>,
    pub mont_points: Vec<String>,
    #[serde(default)]
    pub read_only: Vec<bool>,
    /// A container's root filesystem rather than a pod volume.
    #[serde(default)]
    pub image: bool,
    /// Backend options, e.g. rbd credentials and monitors.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PersistNetworkInfo {
    pub index: usize,
    pub pci_addr: u32,
    pub device_name: String,
    pub ip_addr: String,
    #[serde(default)]
    pub host_device: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PersistInfo {
    pub id: String,
    pub driver_info: DriverInfo,
    pub user_spec: UserPod,
    pub vm_spec: VmPod,
    pub hw_stat: HwStatus,
    pub volume_list: Vec<PersistVolumeInfo>,
    pub network_list: Vec<PersistNetworkInfo>,
    #[serde(default)]
    pub boot: BootConfig,
}

impl PersistInfo {
    fn validate(&self) -> Result<(), PersistError> {
        for vol in &self.volume_list {
            if vol.containers.len() != vol.mont_points.len() {
                return Err(PersistError::Corrupt("volume info mismatch"));
            }
            if !vol.read_only.is_empty()
                && vol.read_only.len() != vol.containers.len()
            {
                return Err(PersistError::Corrupt("volume info mismatch"));
            }
            if vol.image && vol.containers.len() != 1 {
                return Err(PersistError::Corrupt("image info mismatch"));
            }
            if vol
                .containers
                .iter()
                .any(|idx| *idx >= self.vm_spec.containers.len())
            {
                return Err(PersistError::Corrupt(
                    "container index out of range",
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn dump(ctx: &VmContext) -> Result<PersistInfo, PersistError> {
    let user_spec = ctx.user_spec.clone().ok_or(PersistError::NoPod)?;
    let vm_spec = ctx.vm_spec.clone().ok_or(PersistError::NoPod)?;

    let images = ctx.devices.images.values().map(|img| PersistVolumeInfo {
        name: img.info.name.clone(),
        filename: img.info.filename.clone(),
        format: img.info.format.clone(),
        fstype: img.info.fstype.clone(),
        device_name: img.info.device_name.clone(),
        scsi_id: img.info.scsi_id,
        containers: vec![img.pos],
        mont_points: vec![IMAGE_MOUNT_POINT.to_string()],
        read_only: vec![false],
        image: true,
        options: img.info.options.clone(),
    });
    let volumes = ctx.devices.volumes.values().map(|vol| PersistVolumeInfo {
        name: vol.info.name.clone(),
        filename: vol.info.filename.clone(),
        format: vol.info.format.clone(),
        fstype: vol.info.fstype.clone(),
        device_name: vol.info.device_name.clone(),
        scsi_id: vol.info.scsi_id,
        containers: vol.pos.keys().copied().collect(),
        mont_points: vol.pos.values().cloned().collect(),
        read_only: vol
            .pos
            .keys()
            .map(|idx| vol.read_only.get(idx).copied().unwrap_or(false))
            .collect(),
        image: false,
        options: vol.info.options.clone(),
    });
    let network_list = ctx
        .devices
        .networks
        .values()
        .map(|nic| PersistNetworkInfo {
            index: nic.index,
            pci_addr: nic.pci_addr,
            device_name: nic.device_name.clone(),
            ip_addr: nic.ip_addr.clone(),
            host_device: nic.host_device.clone(),
        })
        .collect();

    Ok(PersistInfo {
        id: ctx.id.clone(),
        driver_info: ctx.driver.dump()?,
        user_spec,
        vm_spec,
        hw_stat: ctx.hw,
        volume_list: images.chain(volumes).collect(),
        network_list,
        boot: ctx.boot.clone(),
    })
}

pub(crate) fn dump_bytes(ctx: &VmContext) -> Result<Vec<u8>, PersistError> {
    Ok(serde_json::to_vec(&dump(ctx)?)?)
}

/// Rebuilds a context from a persisted record. The record is fully
/// validated before the driver context is loaded, so a corrupt record
/// leaves nothing behind.
#[allow(clippy::too_many_arguments)]
pub(crate) fn restore(
    log: &Logger,
    record: &[u8],
    vm_root: &Path,
    timeouts: VmTimeouts,
    driver: &dyn HypervisorDriver,
    network: Arc<dyn NetworkAllocator>,
    hub: HubSender,
    state_tx: watch::Sender<VmState>,
) -> Result<VmContext, PersistError> {
    let info: PersistInfo = serde_json::from_slice(record)?;
    info.validate()?;

    let log = log.new(slog::o!("vm" => info.id.clone()));
    let sockets = VmSockets::new(vm_root, &info.id);
    let driver_ctx = driver.load_context(
        &log,
        &info.id,
        &info.driver_info,
        &sockets,
        hub.clone(),
    )?;

    let mut images = BTreeMap::new();
    let mut volumes = BTreeMap::new();
    for vol in &info.volume_list {
        let block = BlockDescriptor {
            name: vol.name.clone(),
            filename: vol.filename.clone(),
            format: vol.format.clone(),
            fstype: vol.fstype.clone(),
            device_name: vol.device_name.clone(),
            scsi_id: vol.scsi_id,
            options: vol.options.clone(),
        };
        if vol.image {
            images.insert(
                vol.name.clone(),
                ImageInfo { info: block, pos: vol.containers[0] },
            );
            continue;
        }
        let mut state = VolumeState { info: block, ..Default::default() };
        for (i, (idx, mount)) in
            vol.containers.iter().zip(&vol.mont_points).enumerate()
        {
            state.pos.insert(*idx, mount.clone());
            state
                .read_only
                .insert(*idx, vol.read_only.get(i).copied().unwrap_or(false));
        }
        volumes.insert(vol.name.clone(), state);
    }

    let mut networks = BTreeMap::new();
    for nic in &info.network_list {
        network.reserve(&nic.ip_addr);
        let net_mask = info
            .vm_spec
            .interfaces
            .iter()
            .find(|i| i.device == nic.device_name)
            .map(|i| i.net_mask.clone())
            .unwrap_or_default();
        networks.insert(
            nic.index,
            InterfaceCreated {
                index: nic.index,
                pci_addr: nic.pci_addr,
                fd: None,
                bridge: String::new(),
                host_device: nic.host_device.clone(),
                device_name: nic.device_name.clone(),
                mac_addr: String::new(),
                ip_addr: nic.ip_addr.clone(),
                net_mask,
            },
        );
    }

    let mut ctx = VmContext::new(
        log,
        info.id,
        info.boot,
        sockets,
        timeouts,
        DriverHandle::Eager(driver_ctx),
        hub,
        network,
        state_tx,
    );
    ctx.user_spec = Some(info.user_spec);
    ctx.vm_spec = Some(info.vm_spec);
    ctx.hw = info.hw_stat;
    ctx.devices.images = images;
    ctx.devices.volumes = volumes;
    ctx.devices.networks = networks;
    info!(ctx.log, "restored vm context";
        "images" => ctx.devices.images.len(),
        "volumes" => ctx.devices.volumes.len(),
        "networks" => ctx.devices.networks.len());
    Ok(ctx)
}
