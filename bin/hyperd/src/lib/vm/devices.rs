// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device descriptors and the per-VM device bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Filesystem type of storage that is shared into the guest through the
/// share directory instead of being attached as a block device.
pub const FSTYPE_DIR: &str = "dir";

/// Where a block device's contents come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A container root filesystem.
    Image,
    /// A pod volume.
    Volume,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Image => "image".fmt(f),
            SourceKind::Volume => "volume".fmt(f),
        }
    }
}

/// A block device queued for, or confirmed in, the guest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub name: String,
    pub filename: String,
    pub format: String,
    pub fstype: String,
    /// Guest device name, known once the device is inserted.
    pub device_name: String,
    pub scsi_id: usize,
    /// Backend options (e.g. rbd credentials and monitors).
    pub options: BTreeMap<String, String>,
}

/// A container's root filesystem as prepared by the storage backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub mount_id: String,
    pub rootfs: String,
    /// Block device path, or directory name in the share dir when `fstype`
    /// is [`FSTYPE_DIR`].
    pub image: String,
    pub fstype: String,
    pub format: String,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

/// A pod volume as prepared by the storage backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    /// Block device path, or directory name in the share dir when `fstype`
    /// is [`FSTYPE_DIR`].
    pub filepath: String,
    pub fstype: String,
    pub format: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// A guest NIC and the host side backing it.
#[derive(Clone, Debug)]
pub struct InterfaceCreated {
    pub index: usize,
    pub pci_addr: u32,
    /// Open tap descriptor, when the host side was created by us.
    pub fd: Option<Arc<OwnedFd>>,
    pub bridge: String,
    pub host_device: String,
    /// Guest device name, `eth<index>`.
    pub device_name: String,
    pub mac_addr: String,
    pub ip_addr: String,
    pub net_mask: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImageInfo {
    pub info: BlockDescriptor,
    /// Index of the container using the image as its rootfs.
    pub pos: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct VolumeState {
    pub info: BlockDescriptor,
    /// Container index to mount point.
    pub pos: BTreeMap<usize, String>,
    pub read_only: BTreeMap<usize, bool>,
}

impl VolumeState {
    pub fn is_dir(&self) -> bool {
        self.info.fstype == FSTYPE_DIR
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeviceMap {
    pub images: BTreeMap<String, ImageInfo>,
    pub volumes: BTreeMap<String, VolumeState>,
    pub networks: BTreeMap<usize, InterfaceCreated>,
}

/// Devices with an operation outstanding.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ProgressSet {
    pub blockdevs: BTreeSet<String>,
    pub networks: BTreeSet<usize>,
}

impl ProgressSet {
    pub fn is_empty(&self) -> bool {
        self.blockdevs.is_empty() && self.networks.is_empty()
    }
}

/// Share-dir mounts still to be torn down.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct UnmountSet {
    pub containers: BTreeSet<usize>,
    pub volumes: BTreeSet<String>,
}

impl UnmountSet {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.volumes.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub adding: ProgressSet,
    pub deleting: ProgressSet,
    pub unmounting: UnmountSet,
}
