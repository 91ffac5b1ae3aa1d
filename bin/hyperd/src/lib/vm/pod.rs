// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM-level pod description handed to the guest agent.
//!
//! This is the user's pod spec resolved against the VM: device names,
//! session ids and interface addresses are filled in as the VM allocates
//! them.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmVolumeDescriptor {
    pub device: String,
    pub mount: String,
    pub fstype: String,
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmFsmapDescriptor {
    pub source: String,
    pub path: String,
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmEnvironmentVar {
    pub env: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmContainer {
    pub id: String,
    pub rootfs: String,
    pub fstype: String,
    /// Guest block device holding the rootfs, or its directory name in the
    /// share dir for directory-backed containers.
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<VmVolumeDescriptor>,
    #[serde(default)]
    pub fsmap: Vec<VmFsmapDescriptor>,
    /// TTY session carrying stdin/stdout.
    pub tty: u64,
    /// TTY session carrying stderr; zero when stderr shares `tty`.
    #[serde(default)]
    pub stderr: u64,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub envs: Vec<VmEnvironmentVar>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmNetworkInterface {
    pub device: String,
    pub ip_address: String,
    pub net_mask: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPod {
    pub hostname: String,
    pub containers: Vec<VmContainer>,
    #[serde(default)]
    pub interfaces: Vec<VmNetworkInterface>,
    pub share_dir: String,
}

impl VmPod {
    /// Index of the container with id `id`, or of the only container whose
    /// id starts with `id`.
    pub fn container_index(&self, id: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.id == id)
            .or_else(|| {
                let mut hits = self
                    .containers
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !id.is_empty() && c.id.starts_with(id));
                match (hits.next(), hits.next()) {
                    (Some((idx, _)), None) => Some(idx),
                    _ => None,
                }
            })
    }
}
