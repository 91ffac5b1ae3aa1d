// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The user-level pod specification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PodSpecError {
    #[error("cannot parse pod spec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pod spec has no containers")]
    NoContainers,

    #[error("container {0} has no image")]
    MissingImage(usize),

    #[error("container {container} references unknown volume {volume}")]
    UnknownVolume { container: String, volume: String },
}

fn default_vcpu() -> u32 {
    1
}

fn default_memory() -> u32 {
    128
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserResource {
    #[serde(default = "default_vcpu")]
    pub vcpu: u32,
    /// Memory in MiB.
    #[serde(default = "default_memory")]
    pub memory: u32,
}

impl Default for UserResource {
    fn default() -> Self {
        Self { vcpu: default_vcpu(), memory: default_memory() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserEnvironmentVar {
    pub env: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserVolumeReference {
    pub path: String,
    pub volume: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserContainer {
    #[serde(default)]
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub envs: Vec<UserEnvironmentVar>,
    #[serde(default)]
    pub volumes: Vec<UserVolumeReference>,
    #[serde(default)]
    pub tty: bool,
}

/// A volume declared at pod level. An empty `source` asks the storage
/// backend to create one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserVolume {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub driver: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInterface {
    #[serde(default)]
    pub bridge: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ifname: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserPod {
    #[serde(rename = "id", default)]
    pub name: String,
    pub containers: Vec<UserContainer>,
    #[serde(default)]
    pub resource: UserResource,
    #[serde(default)]
    pub volumes: Vec<UserVolume>,
    #[serde(default)]
    pub interfaces: Vec<UserInterface>,
    #[serde(default)]
    pub tty: bool,
}

impl UserPod {
    /// Reconstructs a pod specification from its serialized argument bytes.
    ///
    /// A spec without a name takes `id` as its name.
    pub fn from_bytes(args: &[u8], id: &str) -> Result<Self, PodSpecError> {
        let mut pod: UserPod = serde_json::from_slice(args)?;
        if pod.name.is_empty() {
            pod.name = id.to_string();
        }
        pod.validate()?;
        Ok(pod)
    }

    pub fn validate(&self) -> Result<(), PodSpecError> {
        if self.containers.is_empty() {
            return Err(PodSpecError::NoContainers);
        }
        for (idx, c) in self.containers.iter().enumerate() {
            if c.image.is_empty() {
                return Err(PodSpecError::MissingImage(idx));
            }
            for v in c.volumes.iter() {
                if !self.volumes.iter().any(|pv| pv.name == v.volume) {
                    return Err(PodSpecError::UnknownVolume {
                        container: c.name.clone(),
                        volume: v.volume.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The number of network interfaces the pod's VM carries. A pod that
    /// names none still gets one default interface.
    pub fn interface_count(&self) -> usize {
        self.interfaces.len().max(1)
    }
}
