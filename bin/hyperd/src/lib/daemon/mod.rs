// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon: pods, the VMs running them and the records that let both
//! survive a daemon restart.
//!
//! A pod is created from its arguments (a JSON [`UserPod`]) and gets one
//! container per spec container from the [`ContainerRuntime`]. Starting it
//! prepares those containers and the pod's volumes through [`Storage`] and
//! hands them to a fresh [`Vm`]. Everything the daemon needs to find the
//! pod again later is written to the [`KvStore`].
//!
//! Pod operations hold the pod registry lock from start to finish, so a
//! sweep over every pod never observes a half-created one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyperd_api_types::{PodSpecError, UserPod};
use hyperd_config::Config;
use rand::Rng;
use slog::{error, info, warn, Logger};
use thiserror::Error;

use crate::driver::HypervisorDriver;
use crate::migrate::MigrateError;
use crate::network::NetworkAllocator;
use crate::registry::{PodRegistry, VmRegistry};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::storage::{Storage, StorageError};
use crate::store::{
    pod_containers_key, split_ids, vm_by_pod_key, vm_data_key, KvStore,
    StoreError, POD_CONTAINER_PREFIX, POD_PREFIX,
};
use crate::vm::{Vm, VmError, VmState, VmTimeouts};

mod pod;

const ID_LETTERS: usize = 10;

/// A failed migrate leaves the source running, and the destination may
/// not be accepting guest state yet when the metadata has just arrived.
const MIGRATE_ATTEMPTS: u32 = 10;
const MIGRATE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("invalid pod spec: {0}")]
    Spec(#[from] PodSpecError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such pod {0}")]
    UnknownPod(String),

    #[error("pod {0} already exists")]
    PodExists(String),
}

/// A pod known to the daemon, running or not.
#[derive(Debug)]
pub struct Pod {
    pub id: String,
    /// The arguments the pod was created from.
    pub args: Vec<u8>,
    pub spec: UserPod,
    /// One per spec container, in order.
    pub container_ids: Vec<String>,
    pub vm: Option<Arc<Vm>>,
}

impl Pod {
    /// The pod's VM, unless it has already exited.
    pub fn running_vm(&self) -> Option<Arc<Vm>> {
        self.vm.clone().filter(|vm| vm.state() != VmState::None)
    }
}

/// The collaborators a daemon drives.
pub struct DaemonParams {
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub storage: Arc<dyn Storage>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub driver: Arc<dyn HypervisorDriver>,
    pub network: Arc<dyn NetworkAllocator>,
}

pub struct Daemon {
    log: Logger,
    config: Config,
    vm_root: PathBuf,
    store: Arc<dyn KvStore>,
    storage: Arc<dyn Storage>,
    runtime: Arc<dyn ContainerRuntime>,
    driver: Arc<dyn HypervisorDriver>,
    network: Arc<dyn NetworkAllocator>,
    vms: VmRegistry,
    pods: PodRegistry<Pod>,
    migrate_retry: Duration,
}

fn random_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..ID_LETTERS)
        .map(|_| {
            let c = rng.gen_range(0..52u8);
            if c < 26 {
                (b'a' + c) as char
            } else {
                (b'A' + c - 26) as char
            }
        })
        .collect();
    format!("{}-{}", prefix, letters)
}

impl Daemon {
    pub fn new(log: &Logger, params: DaemonParams) -> Self {
        let log = log.new(slog::o!("component" => "daemon"));
        info!(log, "daemon initialized";
            "driver" => params.driver.name(),
            "storage" => params.storage.kind(),
            "lazy" => params.config.hypervisor.lazy);
        Self {
            log,
            vm_root: params.config.vm_root(),
            config: params.config,
            store: params.store,
            storage: params.storage,
            runtime: params.runtime,
            driver: params.driver,
            network: params.network,
            vms: VmRegistry::default(),
            pods: PodRegistry::default(),
            migrate_retry: MIGRATE_RETRY_INTERVAL,
        }
    }

    fn timeouts(&self) -> VmTimeouts {
        VmTimeouts::from_config(&self.config)
    }

    pub fn vms(&self) -> &VmRegistry {
        &self.vms
    }

    pub async fn pod_ids(&self) -> Vec<String> {
        self.pods.lock().await.keys().cloned().collect()
    }

    /// The VM currently running `pod_id`, if any.
    pub async fn pod_vm(&self, pod_id: &str) -> Option<Arc<Vm>> {
        self.pods.lock().await.get(pod_id).and_then(Pod::running_vm)
    }

    /// Stores the persisted record of a running VM.
    async fn persist_vm(&self, vm: &Vm) -> Result<(), DaemonError> {
        let resp = vm.dump().await?;
        match resp.data {
            Some(data) if resp.is_success() => {
                self.store.put(&vm_data_key(vm.id()), &data)?;
            }
            _ => warn!(self.log, "vm has no record to persist";
                "vm" => vm.id(), "response" => %resp),
        }
        Ok(())
    }

    /// Drops every trace of a VM that no longer runs `pod_id`.
    fn forget_vm(&self, pod_id: &str, vm_id: &str) -> Result<(), DaemonError> {
        self.vms.remove(vm_id);
        self.store.delete(&vm_by_pod_key(pod_id))?;
        self.store.delete(&vm_data_key(vm_id))?;
        Ok(())
    }

    /// Rebuilds the pod registry from the store and reattaches to the VMs
    /// that were left running. Returns the number of pods restored.
    pub async fn restore(&self) -> Result<usize, DaemonError> {
        let mut pods = self.pods.lock().await;
        for (key, args) in self.store.scan(POD_PREFIX)? {
            if key.starts_with(POD_CONTAINER_PREFIX) {
                continue;
            }
            let id = key[POD_PREFIX.len()..].to_string();
            let spec = match UserPod::from_bytes(&args, &id) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(self.log, "skipping unreadable pod";
                        "pod" => &id, "error" => %e);
                    continue;
                }
            };
            let ids = self.store.get(&pod_containers_key(&id))?;
            let container_ids = match ids {
                Some(ids) => split_ids(&String::from_utf8_lossy(&ids)),
                None => Vec::new(),
            };
            let vm = self.associate(&id)?;
            info!(self.log, "restored pod";
                "pod" => &id, "vm" => vm.as_ref().map(|v| v.id()));
            pods.insert(id.clone(), Pod { id, args, spec, container_ids, vm });
        }
        Ok(pods.len())
    }

    fn associate(&self, pod_id: &str) -> Result<Option<Arc<Vm>>, DaemonError> {
        let Some(vm_id) = self.store.get(&vm_by_pod_key(pod_id))? else {
            return Ok(None);
        };
        let vm_id = String::from_utf8_lossy(&vm_id).into_owned();
        let Some(record) = self.store.get(&vm_data_key(&vm_id))? else {
            warn!(self.log, "vm has no persisted record";
                "pod" => pod_id, "vm" => &vm_id);
            self.forget_vm(pod_id, &vm_id)?;
            return Ok(None);
        };
        match Vm::associate(
            &self.log,
            &self.vm_root,
            &record,
            self.timeouts(),
            self.driver.as_ref(),
            self.network.clone(),
        ) {
            Ok(vm) => {
                self.vms.insert(vm.clone());
                Ok(Some(vm))
            }
            Err(e) => {
                error!(self.log, "cannot reattach to vm";
                    "pod" => pod_id, "vm" => &vm_id, "error" => %e);
                self.forget_vm(pod_id, &vm_id)?;
                Ok(None)
            }
        }
    }

    /// Detaches from every VM, leaving the hypervisors running and their
    /// records in the store for the next daemon to [`restore`].
    ///
    /// [`restore`]: Daemon::restore
    pub async fn release_all(&self) -> Result<usize, DaemonError> {
        let mut pods = self.pods.lock().await;
        let mut released = 0;
        for pod in pods.values_mut() {
            let Some(vm) = pod.running_vm() else { continue };
            match vm.release().await {
                Ok(resp) if resp.is_success() => {
                    if let Some(data) = resp.data {
                        self.store.put(&vm_data_key(vm.id()), &data)?;
                    }
                    released += 1;
                }
                Ok(resp) => {
                    warn!(self.log, "vm refused release";
                        "pod" => &pod.id, "response" => %resp);
                }
                Err(e) => {
                    warn!(self.log, "cannot release vm";
                        "pod" => &pod.id, "error" => %e);
                }
            }
            vm.wait_for_exit().await;
            self.vms.remove(vm.id());
            pod.vm = None;
        }
        info!(self.log, "released vms"; "count" => released);
        Ok(released)
    }

    /// Stops the VM of every pod. The registry stays locked for the whole
    /// sweep.
    pub async fn stop_all(&self) -> Result<usize, DaemonError> {
        let mut pods = self.pods.lock().await;
        let mut stopped = 0;
        for pod in pods.values_mut() {
            if pod.running_vm().is_some() {
                self.stop_locked(pod).await?;
                stopped += 1;
            }
        }
        info!(self.log, "stopped all pods"; "count" => stopped);
        Ok(stopped)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hyperd_api_types::ResultCode;
    use tokio::net::TcpListener;

    use crate::driver::fake::{fake_agent, FakeBehavior, FakeDriver};
    use crate::migrate::{receive_metadata, send_metadata, Metadata};
    use crate::network::fake::FakeNetwork;
    use crate::qmp::session::test::logger;
    use crate::runtime::{ContainerConfig, MockContainerRuntime};
    use crate::store::{pod_key, MemoryStore};
    use crate::vm::devices::{ContainerInfo, VolumeInfo};
    use crate::vm::VmSockets;

    const WEB_POD: &[u8] =
        br#"{"containers":[{"name":"web","image":"image:latest"}]}"#;

    /// Hands out block-backed root filesystems without touching the host.
    #[derive(Default)]
    struct TestStorage {
        prepared: Mutex<Vec<String>>,
        removed_volumes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Storage for TestStorage {
        fn kind(&self) -> &'static str {
            "test"
        }

        fn root_path(&self) -> &Path {
            Path::new("/nonexistent")
        }

        async fn prepare_container(
            &self,
            id: &str,
            _share_dir: &Path,
        ) -> Result<ContainerInfo, StorageError> {
            self.prepared.lock().unwrap().push(id.to_string());
            Ok(ContainerInfo {
                id: id.to_string(),
                mount_id: id.to_string(),
                rootfs: "/rootfs".to_string(),
                image: format!("/dev/mapper/{}", id),
                fstype: "ext4".to_string(),
                format: "raw".to_string(),
                ..Default::default()
            })
        }

        async fn create_volume(
            &self,
            _pod_id: &str,
            name: &str,
        ) -> Result<VolumeInfo, StorageError> {
            Ok(VolumeInfo {
                name: name.to_string(),
                filepath: format!("/dev/mapper/vol-{}", name),
                fstype: "ext4".to_string(),
                format: "raw".to_string(),
                ..Default::default()
            })
        }

        async fn remove_volume(
            &self,
            _pod_id: &str,
            name: &str,
        ) -> Result<(), StorageError> {
            self.removed_volumes.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn inject_file(
            &self,
            _container_id: &str,
            _target: &str,
            _data: &[u8],
            _mode: u32,
        ) -> Result<(), StorageError> {
            Ok(())
        }
    }

    struct Harness {
        daemon: Arc<Daemon>,
        store: Arc<MemoryStore>,
        storage: Arc<TestStorage>,
        driver: FakeDriver,
        dir: Arc<tempfile::TempDir>,
    }

    fn fake_driver(behavior: FakeBehavior) -> FakeDriver {
        FakeDriver::with(FakeBehavior { agent: true, ..behavior })
    }

    /// A runtime that creates `c-<name>` containers and removes anything.
    fn runtime() -> MockContainerRuntime {
        let mut rt = MockContainerRuntime::new();
        rt.expect_create().returning(|name, image| {
            Ok(ContainerConfig {
                id: format!("c-{}", name),
                name: name.to_string(),
                image: image.to_string(),
                cmd: vec!["/bin/server".to_string()],
                ..Default::default()
            })
        });
        rt.expect_get_container_info().returning(|_| Ok(None));
        rt.expect_remove().returning(|_| Ok(()));
        rt
    }

    fn daemon_on(
        dir: &Path,
        store: Arc<dyn KvStore>,
        storage: Arc<TestStorage>,
        driver: &FakeDriver,
        runtime: MockContainerRuntime,
    ) -> Daemon {
        let config = Config::new(
            dir.to_path_buf(),
            PathBuf::from("/kernel"),
            PathBuf::from("/initrd"),
        );
        let mut daemon = Daemon::new(
            &logger(),
            DaemonParams {
                config,
                store,
                storage,
                runtime: Arc::new(runtime),
                driver: Arc::new(driver.clone()),
                network: Arc::new(FakeNetwork::default()),
            },
        );
        daemon.migrate_retry = Duration::from_millis(10);
        daemon
    }

    fn harness_on(
        dir: Arc<tempfile::TempDir>,
        store: Arc<MemoryStore>,
        driver: FakeDriver,
        runtime: MockContainerRuntime,
    ) -> Harness {
        let storage = Arc::new(TestStorage::default());
        let daemon = daemon_on(
            dir.path(),
            store.clone(),
            storage.clone(),
            &driver,
            runtime,
        );
        Harness { daemon: Arc::new(daemon), store, storage, driver, dir }
    }

    /// A store whose deletes fail while `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), StoreError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                let err =
                    std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
                return Err(StoreError::Io(err));
            }
            self.inner.delete(key)
        }

        fn scan(
            &self,
            prefix: &str,
        ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.scan(prefix)
        }
    }

    fn harness(driver: FakeDriver, runtime: MockContainerRuntime) -> Harness {
        harness_on(
            Arc::new(tempfile::tempdir().unwrap()),
            Arc::default(),
            driver,
            runtime,
        )
    }

    fn unused_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn ids_are_prefixed_letters() {
        let id = random_id("vm");
        assert_eq!(id.len(), 13);
        assert!(id.starts_with("vm-"));
        assert!(id[3..].chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(random_id("pod"), random_id("pod"));
    }

    #[tokio::test]
    async fn pod_start_and_stop() {
        let h = harness(fake_driver(FakeBehavior::default()), runtime());
        let pod_id = h.daemon.create_pod(None, WEB_POD).await.unwrap();
        assert!(pod_id.starts_with("pod-"));
        assert_eq!(
            h.store.get(&pod_key(&pod_id)).unwrap().as_deref(),
            Some(WEB_POD)
        );
        assert_eq!(
            h.store.get(&pod_containers_key(&pod_id)).unwrap().as_deref(),
            Some(&b"c-web"[..])
        );

        let resp = h.daemon.start_pod(&pod_id).await.unwrap();
        assert_eq!(resp.code, ResultCode::PodRunning);
        assert_eq!(*h.storage.prepared.lock().unwrap(), ["c-web"]);
        let vm_id = String::from_utf8(
            h.store.get(&vm_by_pod_key(&pod_id)).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(vm_id, resp.vm_id);
        assert!(h.store.get(&vm_data_key(&vm_id)).unwrap().is_some());
        assert!(h.daemon.vms().contains(&vm_id));

        // Starting again is answered without a second VM.
        let again = h.daemon.start_pod(&pod_id).await.unwrap();
        assert_eq!(
            (again.code, again.vm_id.as_str()),
            (ResultCode::PodRunning, vm_id.as_str())
        );

        let resp = h.daemon.stop_pod(&pod_id).await.unwrap();
        assert!(resp.is_success(), "{}", resp);
        assert!(h.daemon.vms().is_empty());
        assert!(h.store.get(&vm_by_pod_key(&pod_id)).unwrap().is_none());
        assert!(h.store.get(&vm_data_key(&vm_id)).unwrap().is_none());
        // The pod itself survives.
        assert_eq!(h.daemon.pod_ids().await, [pod_id.clone()]);

        let resp = h.daemon.stop_pod(&pod_id).await.unwrap();
        assert_eq!(resp.code, ResultCode::VmShutdown);
    }

    #[tokio::test]
    async fn lazy_config_launches_with_devices() {
        let h = harness(
            fake_driver(FakeBehavior { lazy: true, ..Default::default() }),
            runtime(),
        );
        let mut daemon = Arc::try_unwrap(h.daemon).ok().unwrap();
        daemon.config.hypervisor.lazy = true;

        let pod_id =
            daemon.create_pod(Some("lazy-pod"), WEB_POD).await.unwrap();
        assert_eq!(pod_id, "lazy-pod");
        let resp = daemon.start_pod(&pod_id).await.unwrap();
        assert_eq!(resp.code, ResultCode::PodRunning);
        let calls = h.driver.calls();
        assert!(
            calls.iter().any(|c| c == "lazy_add_disk /dev/mapper/c-web 0"),
            "{:?}",
            calls
        );
        assert!(calls.iter().any(|c| c == "lazy_launch"), "{:?}", calls);
        assert_eq!(daemon.stop_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_pods() {
        let h = harness(fake_driver(FakeBehavior::default()), runtime());
        h.daemon.create_pod(Some("p1"), WEB_POD).await.unwrap();
        assert!(matches!(
            h.daemon.create_pod(Some("p1"), WEB_POD).await,
            Err(DaemonError::PodExists(_))
        ));
        assert!(matches!(
            h.daemon.start_pod("p2").await,
            Err(DaemonError::UnknownPod(_))
        ));
        assert!(matches!(
            h.daemon.create_pod(None, br#"{"containers":[]}"#).await,
            Err(DaemonError::Spec(_))
        ));
    }

    #[tokio::test]
    async fn failed_container_creation_rolls_back() {
        let mut rt = MockContainerRuntime::new();
        rt.expect_create().returning(|name, image| {
            if name == "db" {
                return Err(RuntimeError::BadId(image.to_string()));
            }
            Ok(ContainerConfig {
                id: format!("c-{}", name),
                ..Default::default()
            })
        });
        rt.expect_remove()
            .withf(|id| id == "c-web")
            .times(1)
            .returning(|_| Ok(()));
        let h = harness(fake_driver(FakeBehavior::default()), rt);

        let args = br#"{"containers":[
            {"name":"web","image":"a"},{"name":"db","image":"b"}]}"#;
        assert!(matches!(
            h.daemon.create_pod(Some("p1"), args).await,
            Err(DaemonError::Runtime(_))
        ));
        assert!(h.daemon.pod_ids().await.is_empty());
        assert!(h.store.get(&pod_key("p1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn listen_restores_unknown_containers_once() {
        let mut rt = MockContainerRuntime::new();
        rt.expect_get_container_info().returning(|_| Ok(None));
        rt.expect_restore()
            .withf(|name, image, id| {
                (name, image, id) == ("web", "image:latest", "c1")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let h = harness(fake_driver(FakeBehavior::default()), rt);

        let addr = unused_addr();
        let listen = {
            let daemon = h.daemon.clone();
            tokio::spawn(async move { daemon.listen_pod(addr).await })
        };
        let meta = Metadata {
            pod_id: "pod-7".to_string(),
            pod_args: WEB_POD.to_vec(),
            container_ids: vec!["c1".to_string()],
        };
        send_metadata(&logger(), addr, &meta).await.unwrap();

        let resp = listen.await.unwrap().unwrap();
        assert_eq!(resp.code, ResultCode::PodRunning);
        let vm = h.daemon.pod_vm("pod-7").await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert_eq!(
            h.store.get(&pod_key("pod-7")).unwrap().as_deref(),
            Some(WEB_POD)
        );
        assert_eq!(
            h.store.get(&pod_containers_key("pod-7")).unwrap().as_deref(),
            Some(&b"c1"[..])
        );
        assert!(h
            .driver
            .calls()
            .contains(&format!("listen {}", addr)));
    }

    #[tokio::test]
    async fn listen_rejects_known_pods() {
        let mut rt = runtime();
        rt.expect_restore().never();
        let h = harness(fake_driver(FakeBehavior::default()), rt);
        h.daemon.create_pod(Some("pod-7"), WEB_POD).await.unwrap();

        let addr = unused_addr();
        let listen = {
            let daemon = h.daemon.clone();
            tokio::spawn(async move { daemon.listen_pod(addr).await })
        };
        let meta = Metadata {
            pod_id: "pod-7".to_string(),
            pod_args: WEB_POD.to_vec(),
            container_ids: vec!["c-web".to_string()],
        };
        send_metadata(&logger(), addr, &meta).await.unwrap();
        let resp = listen.await.unwrap().unwrap();
        assert_eq!(resp.code, ResultCode::BadRequest);
        assert!(h.daemon.vms().is_empty());
    }

    #[tokio::test]
    async fn migration_hands_off_and_cleans_up() {
        let h = harness(fake_driver(FakeBehavior::default()), runtime());
        let pod_id = h.daemon.create_pod(None, WEB_POD).await.unwrap();
        let vm_id = h.daemon.start_pod(&pod_id).await.unwrap().vm_id;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver = tokio::spawn(async move {
            receive_metadata(&logger(), &listener).await
        });

        let resp = h.daemon.migrate_pod(&pod_id, addr).await.unwrap();
        assert_eq!(resp.code, ResultCode::Ok);
        let meta = receiver.await.unwrap().unwrap();
        assert_eq!(meta.pod_id, pod_id);
        assert_eq!(meta.pod_args, WEB_POD);
        assert_eq!(meta.container_ids, ["c-web"]);

        assert!(h.daemon.pod_ids().await.is_empty());
        assert!(h.daemon.vms().is_empty());
        for key in [
            pod_key(&pod_id),
            pod_containers_key(&pod_id),
            vm_by_pod_key(&pod_id),
            vm_data_key(&vm_id),
        ] {
            assert!(
                h.store.get(&key).unwrap().is_none(),
                "{} left behind",
                key
            );
        }
    }

    #[tokio::test]
    async fn failed_migration_keeps_pod() {
        let h = harness(
            fake_driver(FakeBehavior {
                fail_migration: true,
                ..Default::default()
            }),
            runtime(),
        );
        let pod_id = h.daemon.create_pod(None, WEB_POD).await.unwrap();
        h.daemon.start_pod(&pod_id).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver = tokio::spawn(async move {
            receive_metadata(&logger(), &listener).await
        });

        let resp = h.daemon.migrate_pod(&pod_id, addr).await.unwrap();
        assert_eq!(resp.code, ResultCode::Failed);
        receiver.await.unwrap().unwrap();
        let migrations = h
            .driver
            .calls()
            .iter()
            .filter(|c| c.starts_with("migrate "))
            .count();
        assert_eq!(migrations, MIGRATE_ATTEMPTS as usize);

        let vm = h.daemon.pod_vm(&pod_id).await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert!(h.store.get(&vm_by_pod_key(&pod_id)).unwrap().is_some());
    }

    #[tokio::test]
    async fn migrating_a_stopped_pod() {
        let h = harness(fake_driver(FakeBehavior::default()), runtime());
        let pod_id = h.daemon.create_pod(None, WEB_POD).await.unwrap();
        let resp = h.daemon.migrate_pod(&pod_id, unused_addr()).await.unwrap();
        assert_eq!(resp.code, ResultCode::VmShutdown);
    }

    #[tokio::test]
    async fn released_vms_are_restored() {
        let driver = fake_driver(FakeBehavior::default());
        let h = harness(driver.clone(), runtime());
        let pod_id = h.daemon.create_pod(None, WEB_POD).await.unwrap();
        let vm_id = h.daemon.start_pod(&pod_id).await.unwrap().vm_id;

        assert_eq!(h.daemon.release_all().await.unwrap(), 1);
        assert!(h.daemon.vms().is_empty());
        assert!(h.store.get(&vm_data_key(&vm_id)).unwrap().is_some());
        assert!(!driver.calls().contains(&"shutdown".to_string()));

        // The next daemon finds the pod and the still-running VM. The
        // restored VM reconnects to its guest agent.
        let sockets = VmSockets::new(&h.dir.path().join("vm"), &vm_id);
        std::fs::remove_file(&sockets.control).unwrap();
        let _agent = fake_agent(&sockets);
        let next = harness_on(
            h.dir.clone(),
            h.store.clone(),
            driver.clone(),
            runtime(),
        );
        assert_eq!(next.daemon.restore().await.unwrap(), 1);
        assert!(driver.calls().contains(&format!("load_context {}", vm_id)));
        let vm = next.daemon.pod_vm(&pod_id).await.unwrap();
        assert_eq!((vm.id(), vm.state()), (vm_id.as_str(), VmState::Running));

        let resp = next.daemon.stop_pod(&pod_id).await.unwrap();
        assert!(resp.is_success(), "{}", resp);
    }

    #[tokio::test]
    async fn restore_drops_vms_without_records() {
        let h = harness(fake_driver(FakeBehavior::default()), runtime());
        h.store.put(&pod_key("p1"), WEB_POD).unwrap();
        h.store.put(&pod_containers_key("p1"), b"c-web").unwrap();
        h.store.put(&vm_by_pod_key("p1"), b"vm-gone").unwrap();
        h.store.put(&pod_key("broken"), b"not json").unwrap();

        assert_eq!(h.daemon.restore().await.unwrap(), 1);
        assert!(h.daemon.pod_vm("p1").await.is_none());
        assert!(h.store.get(&vm_by_pod_key("p1")).unwrap().is_none());
        assert_eq!(h.daemon.pod_ids().await, ["p1"]);
    }

    #[tokio::test]
    async fn removing_a_pod_removes_its_resources() {
        let h = harness(fake_driver(FakeBehavior::default()), runtime());
        let args = br#"{"containers":[{"name":"web","image":"a",
            "volumes":[{"path":"/data","volume":"data"}]}],
            "volumes":[{"name":"data"}]}"#;
        let pod_id = h.daemon.create_pod(None, args).await.unwrap();
        h.daemon.start_pod(&pod_id).await.unwrap();

        h.daemon.remove_pod(&pod_id).await.unwrap();
        assert!(h.daemon.pod_ids().await.is_empty());
        assert!(h.daemon.vms().is_empty());
        assert_eq!(*h.storage.removed_volumes.lock().unwrap(), ["data"]);
        assert!(h.store.scan("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_removal_keeps_the_pod() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::default());
        let storage = Arc::new(TestStorage::default());
        let driver = fake_driver(FakeBehavior::default());
        let daemon =
            daemon_on(dir.path(), store.clone(), storage, &driver, runtime());
        let pod_id = daemon.create_pod(None, WEB_POD).await.unwrap();
        let vm_id = daemon.start_pod(&pod_id).await.unwrap().vm_id;

        store.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = daemon.remove_pod(&pod_id).await.unwrap_err();
        assert!(matches!(err, DaemonError::Store(_)), "{}", err);
        assert_eq!(daemon.pod_ids().await, [pod_id.clone()]);
        assert_eq!(
            store.get(&vm_by_pod_key(&pod_id)).unwrap(),
            Some(vm_id.clone().into_bytes())
        );

        // Once the store recovers the removal goes through.
        store.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        daemon.remove_pod(&pod_id).await.unwrap();
        assert!(daemon.pod_ids().await.is_empty());
        assert!(store.get(&vm_data_key(&vm_id)).unwrap().is_none());
        assert!(store.scan("").unwrap().is_empty());
    }
}
