// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pod operations.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyperd_api_types::{ResultCode, UserPod, VmResponse};
use slog::{error, info, warn};
use tokio::net::TcpListener;

use super::{random_id, Daemon, DaemonError, Pod, MIGRATE_ATTEMPTS};
use crate::migrate::{self, Metadata};
use crate::storage::{inspect_existing_volume, share_volume};
use crate::store::{join_ids, pod_containers_key, pod_key, vm_by_pod_key};
use crate::vm::devices::{ContainerInfo, VolumeInfo};
use crate::vm::{BootConfig, LaunchMode, Vm, VmError, VmParams, VmSockets};

impl Daemon {
    /// Creates a pod and its containers. Returns the pod id, which is
    /// `pod_id` if one was given.
    pub async fn create_pod(
        &self,
        pod_id: Option<&str>,
        args: &[u8],
    ) -> Result<String, DaemonError> {
        let id = pod_id.map(str::to_string).unwrap_or_else(|| random_id("pod"));
        let mut pods = self.pods.lock().await;
        if pods.contains_key(&id) {
            return Err(DaemonError::PodExists(id));
        }
        let spec = UserPod::from_bytes(args, &id)?;

        let mut container_ids = Vec::with_capacity(spec.containers.len());
        for (idx, c) in spec.containers.iter().enumerate() {
            let name = if c.name.is_empty() {
                format!("{}-{}", id, idx)
            } else {
                c.name.clone()
            };
            match self.runtime.create(&name, &c.image).await {
                Ok(config) => container_ids.push(config.id),
                Err(e) => {
                    error!(self.log, "cannot create container";
                        "pod" => &id, "container" => &name, "error" => %e);
                    self.remove_containers(&container_ids).await;
                    return Err(e.into());
                }
            }
        }

        self.store.put(&pod_key(&id), args)?;
        let ids = join_ids(&container_ids);
        self.store.put(&pod_containers_key(&id), ids.as_bytes())?;
        info!(self.log, "created pod";
            "pod" => &id, "containers" => container_ids.len());
        pods.insert(
            id.clone(),
            Pod {
                id: id.clone(),
                args: args.to_vec(),
                spec,
                container_ids,
                vm: None,
            },
        );
        Ok(id)
    }

    /// Starts a VM for the pod and runs the pod in it.
    pub async fn start_pod(
        &self,
        pod_id: &str,
    ) -> Result<VmResponse, DaemonError> {
        let mut pods = self.pods.lock().await;
        let pod = pods
            .get_mut(pod_id)
            .ok_or_else(|| DaemonError::UnknownPod(pod_id.to_string()))?;
        if let Some(vm) = pod.running_vm() {
            return Ok(VmResponse::new(
                vm.id(),
                ResultCode::PodRunning,
                "pod is already running",
            ));
        }
        if let Some(exited) = pod.vm.take() {
            self.forget_vm(&pod.id, exited.id())?;
        }

        let mode = if self.config.hypervisor.lazy {
            LaunchMode::Lazy
        } else {
            LaunchMode::Eager
        };
        let (vm, containers, volumes) = self.new_vm(pod, mode).await?;
        let resp = vm.start_pod(pod.spec.clone(), containers, volumes).await?;
        if resp.is_success() {
            self.register_vm(pod, vm).await?;
        } else {
            warn!(self.log, "pod failed to start";
                "pod" => pod_id, "response" => %resp);
        }
        Ok(resp)
    }

    /// Prepares a pod's containers and volumes and creates a VM to run it.
    async fn new_vm(
        &self,
        pod: &Pod,
        mode: LaunchMode,
    ) -> Result<
        (Arc<Vm>, Vec<ContainerInfo>, BTreeMap<String, VolumeInfo>),
        DaemonError,
    > {
        let vm_id = random_id("vm");
        let sockets = VmSockets::new(&self.vm_root, &vm_id);
        sockets.create_dirs()?;
        let containers =
            self.prepare_containers(pod, &sockets.share_dir).await?;
        let volumes = self.prepare_volumes(pod, &sockets.share_dir).await?;
        info!(self.log, "creating vm for pod";
            "pod" => &pod.id, "vm" => &vm_id, "mode" => ?mode);
        let vm = Vm::launch(
            &self.log,
            VmParams {
                id: vm_id,
                boot: BootConfig::for_pod(&self.config, &pod.spec),
                sockets,
                timeouts: self.timeouts(),
                mode,
                driver: self.driver.clone(),
                network: self.network.clone(),
            },
        )?;
        Ok((vm, containers, volumes))
    }

    async fn prepare_containers(
        &self,
        pod: &Pod,
        share_dir: &Path,
    ) -> Result<Vec<ContainerInfo>, DaemonError> {
        let mut infos = Vec::with_capacity(pod.container_ids.len());
        for id in &pod.container_ids {
            let mut info = self.storage.prepare_container(id, share_dir).await?;
            if let Some(config) = self.runtime.get_container_info(id).await? {
                info.cmd = config.cmd;
                info.entrypoint = config.entrypoint;
                info.workdir = config.workdir;
                info.envs = config.envs;
            }
            infos.push(info);
        }
        Ok(infos)
    }

    /// Volumes without a source are created by the storage backend;
    /// directory volumes are shared with the guest.
    async fn prepare_volumes(
        &self,
        pod: &Pod,
        share_dir: &Path,
    ) -> Result<BTreeMap<String, VolumeInfo>, DaemonError> {
        let mut volumes = BTreeMap::new();
        for vol in &pod.spec.volumes {
            let info = if vol.source.is_empty() {
                self.storage.create_volume(&pod.id, &vol.name).await?
            } else {
                inspect_existing_volume(vol)?
            };
            let info = share_volume(info, share_dir).await?;
            volumes.insert(vol.name.clone(), info);
        }
        Ok(volumes)
    }

    async fn register_vm(
        &self,
        pod: &mut Pod,
        vm: Arc<Vm>,
    ) -> Result<(), DaemonError> {
        self.vms.insert(vm.clone());
        self.store.put(&vm_by_pod_key(&pod.id), vm.id().as_bytes())?;
        pod.vm = Some(vm.clone());
        self.persist_vm(&vm).await
    }

    /// Shuts down the pod's VM. The pod itself remains.
    pub async fn stop_pod(
        &self,
        pod_id: &str,
    ) -> Result<VmResponse, DaemonError> {
        let mut pods = self.pods.lock().await;
        let pod = pods
            .get_mut(pod_id)
            .ok_or_else(|| DaemonError::UnknownPod(pod_id.to_string()))?;
        self.stop_locked(pod).await
    }

    pub(super) async fn stop_locked(
        &self,
        pod: &mut Pod,
    ) -> Result<VmResponse, DaemonError> {
        let Some(vm) = pod.vm.clone() else {
            return Ok(VmResponse::new(
                "",
                ResultCode::VmShutdown,
                "pod is not running",
            ));
        };
        let resp = match vm.shutdown().await {
            Ok(resp) => resp,
            Err(VmError::Gone(id)) => {
                VmResponse::new(id, ResultCode::VmShutdown, "vm already exited")
            }
            Err(e) => return Err(e.into()),
        };
        vm.wait_for_exit().await;
        // The pod keeps its VM until the VM's records are gone, so a failed
        // stop can be retried.
        self.forget_vm(&pod.id, vm.id())?;
        pod.vm = None;
        info!(self.log, "stopped pod"; "pod" => &pod.id, "response" => %resp);
        Ok(resp)
    }

    /// Stops the pod and removes it along with its containers and the
    /// volumes created for it.
    pub async fn remove_pod(&self, pod_id: &str) -> Result<(), DaemonError> {
        let mut pods = self.pods.lock().await;
        let pod = pods
            .get_mut(pod_id)
            .ok_or_else(|| DaemonError::UnknownPod(pod_id.to_string()))?;
        self.stop_locked(pod).await?;
        match pods.remove(pod_id) {
            Some(pod) => self.clean_pod(&pod).await,
            None => Ok(()),
        }
    }

    async fn clean_pod(&self, pod: &Pod) -> Result<(), DaemonError> {
        self.store.delete(&pod_key(&pod.id))?;
        self.store.delete(&pod_containers_key(&pod.id))?;
        self.remove_containers(&pod.container_ids).await;
        for vol in pod.spec.volumes.iter().filter(|v| v.source.is_empty()) {
            if let Err(e) = self.storage.remove_volume(&pod.id, &vol.name).await
            {
                warn!(self.log, "cannot remove volume";
                    "pod" => &pod.id, "volume" => &vol.name, "error" => %e);
            }
        }
        info!(self.log, "removed pod"; "pod" => &pod.id);
        Ok(())
    }

    async fn remove_containers(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.runtime.remove(id).await {
                warn!(self.log, "cannot remove container";
                    "container" => id, "error" => %e);
            }
        }
    }

    /// Moves a running pod to a destination started with `hyperd listen`.
    ///
    /// The VM's migrate answer is definitive. On failure the pod keeps
    /// running here untouched; on success the VM has shut down and the pod
    /// is removed from this host.
    pub async fn migrate_pod(
        &self,
        pod_id: &str,
        dest: SocketAddr,
    ) -> Result<VmResponse, DaemonError> {
        let mut pods = self.pods.lock().await;
        let pod = pods
            .get(pod_id)
            .ok_or_else(|| DaemonError::UnknownPod(pod_id.to_string()))?;
        let Some(vm) = pod.running_vm() else {
            return Ok(VmResponse::new(
                "",
                ResultCode::VmShutdown,
                "pod is not running",
            ));
        };

        let meta = Metadata {
            pod_id: pod.id.clone(),
            pod_args: pod.args.clone(),
            container_ids: pod.container_ids.clone(),
        };
        migrate::send_metadata(&self.log, dest, &meta).await?;

        let mut attempt = 1;
        let resp = loop {
            let resp = vm.migrate(dest).await?;
            if resp.code != ResultCode::Failed || attempt >= MIGRATE_ATTEMPTS {
                break resp;
            }
            warn!(self.log, "migration attempt failed";
                "pod" => pod_id, "attempt" => attempt, "cause" => &resp.cause);
            attempt += 1;
            tokio::time::sleep(self.migrate_retry).await;
        };
        if !resp.is_success() {
            error!(self.log, "migration failed";
                "pod" => pod_id, "response" => %resp);
            return Ok(resp);
        }

        vm.wait_for_exit().await;
        self.forget_vm(pod_id, vm.id())?;
        if let Some(pod) = pods.remove(pod_id) {
            self.clean_pod(&pod).await?;
        }
        info!(self.log, "pod migrated"; "pod" => pod_id, "dest" => %dest);
        Ok(resp)
    }

    /// Receives a migrating pod on `addr`: takes its metadata, makes sure
    /// its containers exist locally and starts a VM waiting for the guest
    /// on the same address.
    pub async fn listen_pod(
        &self,
        addr: SocketAddr,
    ) -> Result<VmResponse, DaemonError> {
        let meta = {
            let listener = TcpListener::bind(addr).await?;
            info!(self.log, "waiting for migrating pod"; "addr" => %addr);
            migrate::receive_metadata(&self.log, &listener).await?
        };

        let mut pods = self.pods.lock().await;
        if pods.contains_key(&meta.pod_id) {
            warn!(self.log, "migrating pod already exists";
                "pod" => &meta.pod_id);
            return Ok(VmResponse::new(
                "",
                ResultCode::BadRequest,
                format!("pod {} already exists", meta.pod_id),
            ));
        }
        let spec = UserPod::from_bytes(&meta.pod_args, &meta.pod_id)?;
        if spec.containers.len() != meta.container_ids.len() {
            return Ok(VmResponse::new(
                "",
                ResultCode::BadRequest,
                format!(
                    "pod has {} containers but {} ids were sent",
                    spec.containers.len(),
                    meta.container_ids.len()
                ),
            ));
        }

        for (c, id) in spec.containers.iter().zip(&meta.container_ids) {
            if self.runtime.get_container_info(id).await?.is_none() {
                info!(self.log, "restoring container";
                    "container" => id, "image" => &c.image);
                self.runtime.restore(&c.name, &c.image, id).await?;
            }
        }
        let mut pod = Pod {
            id: meta.pod_id,
            args: meta.pod_args,
            spec,
            container_ids: meta.container_ids,
            vm: None,
        };
        let (vm, containers, volumes) =
            self.new_vm(&pod, LaunchMode::Incoming).await?;
        let resp =
            vm.listen_pod(pod.spec.clone(), containers, volumes, addr).await?;
        if resp.is_success() {
            self.store.put(&pod_key(&pod.id), &pod.args)?;
            let ids = join_ids(&pod.container_ids);
            self.store.put(&pod_containers_key(&pod.id), ids.as_bytes())?;
            self.register_vm(&mut pod, vm).await?;
            pods.insert(pod.id.clone(), pod);
        } else {
            warn!(self.log, "cannot receive pod";
                "pod" => &pod.id, "response" => %resp);
        }
        Ok(resp)
    }
}
