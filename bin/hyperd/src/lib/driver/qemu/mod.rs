// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The QEMU driver.
//!
//! A [`QemuContext`] owns three things for its VM: the monitor session
//! queue, the process watchdog, and (in lazy mode) the devices collected
//! for the command line. Monitor sessions may be submitted before the
//! process exists; they wait in the queue until the handler connects.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hyperd_config::Config;
use serde_json::{json, Value};
use slog::{error, info, o, warn, Logger};
use tokio::process::{Child, Command};

use super::{
    DriverContext, DriverError, DriverInfo, HypervisorDriver, LazyDriverContext,
};
use crate::qmp::devices::{
    disk_add_session, disk_del_session, migrate_command, nic_add_session,
    nic_del_session, query_migrate_command, quit_session, scsi_id_to_name,
};
use crate::qmp::session::{self, QmpHandle, QmpParams, QmpReceiver, QmpSession};
use crate::vm::devices::{BlockDescriptor, InterfaceCreated, SourceKind};
use crate::vm::event::{BlockdevInsertedEvent, NetdevInsertedEvent, VmEvent};
use crate::vm::hub::HubSender;
use crate::vm::{BootConfig, VmSockets};

mod args;
mod process;

use args::{LaunchArgs, NicArg};
use process::{Target, Watchdog};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";
const DRIVER_NAME: &str = "qemu";
const QMP_SOCKET: &str = "qmp.sock";
const LOG_FILE: &str = "qemu.log";
const KVM_DEVICE: &str = "/dev/kvm";
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct QemuDriver {
    executable: Option<PathBuf>,
    qmp: QmpParams,
}

impl QemuDriver {
    pub fn new(config: &Config) -> Self {
        let executable = config
            .hypervisor
            .executable
            .clone()
            .or_else(|| which::which(QEMU_BINARY).ok());
        Self { executable, qmp: QmpParams::new(PathBuf::new(), &config.qmp) }
    }

    fn context(
        &self,
        log: &Logger,
        vm_id: &str,
        qmp_sock: PathBuf,
        hub: HubSender,
    ) -> QemuContext {
        let (qmp, qmp_rx) = session::channel();
        let mut qmp_params = self.qmp.clone();
        qmp_params.socket = qmp_sock;
        QemuContext {
            log: log
                .new(o!("driver" => DRIVER_NAME, "vm" => vm_id.to_string())),
            hub,
            executable: self.executable.clone(),
            qmp_params,
            qmp,
            qmp_rx: Some(qmp_rx),
            watchdog: None,
            pid: None,
            pending: PendingDevices::default(),
        }
    }
}

impl HypervisorDriver for QemuDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn init_context(
        &self,
        log: &Logger,
        vm_id: &str,
        sockets: &VmSockets,
        hub: HubSender,
    ) -> Box<dyn DriverContext> {
        let qmp_sock = sockets.home_dir.join(QMP_SOCKET);
        Box::new(self.context(log, vm_id, qmp_sock, hub))
    }

    fn init_lazy_context(
        &self,
        log: &Logger,
        vm_id: &str,
        sockets: &VmSockets,
        hub: HubSender,
    ) -> Option<Box<dyn LazyDriverContext>> {
        Some(Box::new(self.context(
            log,
            vm_id,
            sockets.home_dir.join(QMP_SOCKET),
            hub,
        )))
    }

    fn load_context(
        &self,
        log: &Logger,
        vm_id: &str,
        info: &DriverInfo,
        _sockets: &VmSockets,
        hub: HubSender,
    ) -> Result<Box<dyn DriverContext>, DriverError> {
        match info.get("hypervisor").and_then(Value::as_str) {
            Some(DRIVER_NAME) => {}
            Some(other) => {
                return Err(DriverError::WrongHypervisor(other.to_string()))
            }
            None => return Err(DriverError::MissingField("hypervisor")),
        }
        let qmp_sock = info
            .get("qmpSock")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(DriverError::MissingField("qmpSock"))?;
        let pid = info
            .get("pid")
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or(DriverError::MissingField("pid"))?;

        let mut ctx = self.context(log, vm_id, PathBuf::from(qmp_sock), hub);
        ctx.pid = Some(pid);
        Ok(Box::new(ctx))
    }
}

/// Devices collected for a lazy launch, and the events their insertion
/// would have produced.
#[derive(Default)]
struct PendingDevices {
    nics: Vec<InterfaceCreated>,
    drives: Vec<BlockDescriptor>,
    callbacks: Vec<VmEvent>,
}

pub struct QemuContext {
    log: Logger,
    hub: HubSender,
    executable: Option<PathBuf>,
    qmp_params: QmpParams,
    qmp: QmpHandle,
    /// Present until the monitor handler is started.
    qmp_rx: Option<QmpReceiver>,
    watchdog: Option<Watchdog>,
    pid: Option<u32>,
    pending: PendingDevices,
}

impl QemuContext {
    fn executable(&self) -> Result<&PathBuf, DriverError> {
        match &self.executable {
            Some(path) if path.exists() => Ok(path),
            Some(path) => {
                Err(DriverError::ExecutableNotFound(path.display().to_string()))
            }
            None => {
                Err(DriverError::ExecutableNotFound(QEMU_BINARY.to_string()))
            }
        }
    }

    fn spawn_process(
        &self,
        boot: &BootConfig,
        sockets: &VmSockets,
        incoming: Option<SocketAddr>,
    ) -> Result<Child, DriverError> {
        let executable = self.executable()?;
        let nics: Vec<NicArg> = self
            .pending
            .nics
            .iter()
            .map(|nic| NicArg {
                fd: nic.fd.as_ref().map(|fd| fd.as_raw_fd()),
                host_device: nic.host_device.clone(),
                device_name: nic.device_name.clone(),
                mac_addr: nic.mac_addr.clone(),
                pci_addr: nic.pci_addr,
            })
            .collect();
        let extra = LaunchArgs {
            kvm: std::path::Path::new(KVM_DEVICE).exists(),
            nics: &nics,
            drives: &self.pending.drives,
            incoming,
        };
        let args =
            args::arguments(boot, sockets, &self.qmp_params.socket, &extra);
        info!(self.log, "launching hypervisor";
            "executable" => %executable.display(),
            "args" => args.join(" "));

        let log_file = sockets.home_dir.join(LOG_FILE);
        let stderr = match std::fs::File::create(log_file) {
            Ok(f) => Stdio::from(f),
            Err(e) => {
                warn!(self.log, "cannot create hypervisor log"; "error" => %e);
                Stdio::null()
            }
        };
        let mut cmd = Command::new(executable);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);

        let inherited: Vec<i32> = nics.iter().filter_map(|n| n.fd).collect();
        if !inherited.is_empty() {
            // Safety: the closure only calls fcntl(2), which is
            // async-signal-safe, between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    for fd in &inherited {
                        if libc::fcntl(*fd, libc::F_SETFD, 0) < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }
        Ok(cmd.spawn()?)
    }

    fn start(
        &mut self,
        boot: &BootConfig,
        sockets: &VmSockets,
        incoming: Option<SocketAddr>,
    ) {
        let child = match self.spawn_process(boot, sockets, incoming) {
            Ok(child) => child,
            Err(e) => {
                error!(self.log, "cannot launch hypervisor"; "error" => %e);
                let reason = e.to_string();
                self.hub.send_detached(VmEvent::VmStartFailed { reason });
                return;
            }
        };
        self.pid = child.id();
        info!(self.log, "hypervisor launched"; "pid" => ?self.pid);
        self.watchdog = Some(Watchdog::spawn(
            self.log.clone(),
            Target::Child(child),
            self.hub.clone(),
        ));
        self.start_monitor();
        self.replay_pending();
    }

    fn start_monitor(&mut self) {
        if let Some(receiver) = self.qmp_rx.take() {
            session::spawn_handler(
                self.log.new(o!("component" => "qmp")),
                self.qmp_params.clone(),
                receiver,
                self.hub.clone(),
            );
        }
    }

    /// Delivers the inserted-events of devices that were on the command
    /// line, in the order they were recorded.
    fn replay_pending(&mut self) {
        let callbacks = std::mem::take(&mut self.pending.callbacks);
        if callbacks.is_empty() {
            return;
        }
        let hub = self.hub.clone();
        tokio::spawn(async move {
            for ev in callbacks {
                if !hub.send(ev).await {
                    return;
                }
            }
        });
    }

    fn submit(&self, session: QmpSession) {
        if let Err(e) = self.qmp.submit(session) {
            warn!(self.log, "cannot queue monitor session"; "error" => %e);
        }
    }
}

async fn run_migration(
    qmp: &QmpHandle,
    dest: SocketAddr,
) -> Result<(), String> {
    qmp.query(migrate_command(dest)).await.map_err(|e| e.to_string())?;
    loop {
        tokio::time::sleep(MIGRATION_POLL_INTERVAL).await;
        let info = qmp
            .query(query_migrate_command())
            .await
            .map_err(|e| e.to_string())?;
        match info.get("status").and_then(Value::as_str) {
            Some("completed") => return Ok(()),
            Some(status @ ("failed" | "cancelled")) => {
                return Err(info
                    .get("error-desc")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("migration {}", status)));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl DriverContext for QemuContext {
    fn launch(&mut self, boot: &BootConfig, sockets: &VmSockets) {
        self.start(boot, sockets, None);
    }

    fn associate(&mut self) {
        let Some(pid) = self.pid else {
            self.hub.send_detached(VmEvent::VmStartFailed {
                reason: DriverError::NotLaunched.to_string(),
            });
            return;
        };
        info!(self.log, "associating with hypervisor"; "pid" => pid);
        self.watchdog = Some(Watchdog::spawn(
            self.log.clone(),
            Target::Pid(pid),
            self.hub.clone(),
        ));
        self.start_monitor();
    }

    fn listen(
        &mut self,
        boot: &BootConfig,
        sockets: &VmSockets,
        incoming: SocketAddr,
    ) {
        self.start(boot, sockets, Some(incoming));
    }

    fn migrate(&mut self, dest: SocketAddr) {
        let qmp = self.qmp.clone();
        let hub = self.hub.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let result = run_migration(&qmp, dest).await;
            info!(log, "migration finished";
                "dest" => %dest, "result" => ?result);
            hub.send(VmEvent::MigrationFinished { result }).await;
        });
    }

    fn add_disk(&mut self, block: &BlockDescriptor, source: SourceKind) {
        self.submit(disk_add_session(block, source));
    }

    fn remove_disk(&mut self, block: &BlockDescriptor, callback: VmEvent) {
        self.submit(disk_del_session(block, callback));
    }

    fn add_nic(&mut self, nic: &InterfaceCreated) {
        self.submit(nic_add_session(nic));
    }

    fn remove_nic(&mut self, nic: &InterfaceCreated, callback: VmEvent) {
        self.submit(nic_del_session(nic, callback));
    }

    fn shutdown(&mut self) {
        self.submit(quit_session());
    }

    fn kill(&mut self) {
        let signalled =
            self.watchdog.as_ref().map(|w| w.kill()).unwrap_or(false);
        if !signalled {
            // Nothing left to kill.
            self.hub.send_detached(VmEvent::VmKilled { success: true });
        }
    }

    fn dump(&self) -> Result<DriverInfo, DriverError> {
        let pid = self.pid.ok_or(DriverError::NotLaunched)?;
        let mut info = DriverInfo::new();
        info.insert("hypervisor".to_string(), json!(DRIVER_NAME));
        info.insert(
            "qmpSock".to_string(),
            json!(self.qmp_params.socket.display().to_string()),
        );
        info.insert("pid".to_string(), json!(pid));
        Ok(info)
    }

    async fn close(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.quit().await;
        }
        // A handler that never started cannot acknowledge the close.
        self.qmp_rx.take();
        self.qmp.close().await;
    }
}

impl LazyDriverContext for QemuContext {
    fn as_driver(&mut self) -> &mut dyn DriverContext {
        self
    }

    fn init_vm(&mut self, _boot: &BootConfig) -> Result<(), DriverError> {
        self.executable().map(|_| ())
    }

    fn lazy_add_disk(&mut self, block: &BlockDescriptor, source: SourceKind) {
        self.pending.drives.push(block.clone());
        let inserted = BlockdevInsertedEvent {
            name: block.name.clone(),
            source,
            device_name: scsi_id_to_name(block.scsi_id),
            scsi_id: block.scsi_id,
        };
        self.pending.callbacks.push(VmEvent::BlockdevInserted(inserted));
    }

    fn lazy_add_nic(&mut self, nic: &InterfaceCreated) {
        self.pending.nics.push(nic.clone());
        let inserted = NetdevInsertedEvent {
            index: nic.index,
            device_name: nic.device_name.clone(),
            address: nic.pci_addr,
        };
        self.pending.callbacks.push(VmEvent::NetdevInserted(inserted));
    }

    fn lazy_launch(&mut self, boot: &BootConfig, sockets: &VmSockets) {
        self.start(boot, sockets, None);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::qmp::session::test::{fake_monitor, logger};
    use crate::vm::hub::{self, Hub};
    use std::path::Path;
    use tokio::net::UnixListener;

    fn driver(executable: Option<PathBuf>) -> QemuDriver {
        QemuDriver {
            executable,
            qmp: QmpParams {
                socket: PathBuf::new(),
                connect_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                max_step_attempts: 3,
            },
        }
    }

    fn info(v: Value) -> DriverInfo {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn sockets() -> VmSockets {
        VmSockets::new(Path::new("/nonexistent"), "vm-test")
    }

    #[tokio::test]
    async fn load_context_validates_fields() {
        let (tx, _hub) = hub::hub();
        let d = driver(None);
        let load = |v: Value| {
            d.load_context(&logger(), "vm-a", &info(v), &sockets(), tx.clone())
                .map(|_| ())
        };

        assert!(matches!(
            load(json!({"hypervisor": "kvmtool", "qmpSock": "/q", "pid": 3})),
            Err(DriverError::WrongHypervisor(h)) if h == "kvmtool"
        ));
        assert!(matches!(
            load(json!({"qmpSock": "/q", "pid": 3})),
            Err(DriverError::MissingField("hypervisor"))
        ));
        assert!(matches!(
            load(json!({"hypervisor": "qemu", "pid": 3})),
            Err(DriverError::MissingField("qmpSock"))
        ));
        assert!(matches!(
            load(json!({"hypervisor": "qemu", "qmpSock": "/q", "pid": "3"})),
            Err(DriverError::MissingField("pid"))
        ));
        let valid = json!({"hypervisor": "qemu", "qmpSock": "/q", "pid": 3});
        assert!(load(valid).is_ok());
    }

    #[tokio::test]
    async fn dump_round_trips_through_load() {
        let (tx, _hub) = hub::hub();
        let d = driver(None);
        let saved = info(json!({
            "hypervisor": "qemu",
            "qmpSock": "/run/q.sock",
            "pid": 1234,
        }));
        let ctx = d
            .load_context(&logger(), "vm-a", &saved, &sockets(), tx.clone())
            .unwrap();
        assert_eq!(ctx.dump().unwrap(), saved);

        let fresh = d.init_context(&logger(), "vm-b", &sockets(), tx);
        assert!(matches!(fresh.dump(), Err(DriverError::NotLaunched)));
    }

    #[tokio::test]
    async fn missing_executable() {
        let (tx, mut hub) = hub::hub();
        let d = driver(Some("/nonexistent/qemu".into()));
        let mut ctx = d
            .init_lazy_context(&logger(), "vm-a", &sockets(), tx)
            .unwrap();
        assert!(matches!(
            ctx.init_vm(&BootConfig::default()),
            Err(DriverError::ExecutableNotFound(_))
        ));

        ctx.launch(&BootConfig::default(), &sockets());
        assert!(matches!(
            hub.recv().await,
            Some(VmEvent::VmStartFailed { .. })
        ));
        ctx.close().await;
    }

    #[tokio::test]
    async fn kill_without_process_succeeds() {
        let (tx, mut hub) = hub::hub();
        let mut ctx =
            driver(None).init_context(&logger(), "vm-a", &sockets(), tx);
        ctx.kill();
        assert!(matches!(
            hub.recv().await,
            Some(VmEvent::VmKilled { success: true })
        ));
        ctx.close().await;
    }

    /// Associates a context with a stand-in process whose monitor is
    /// scripted by `script`.
    async fn associated<F>(
        dir: &tempfile::TempDir,
        script: F,
    ) -> (Box<dyn DriverContext>, Hub, Child)
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        let qmp_sock = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&qmp_sock).unwrap();
        tokio::spawn(fake_monitor(listener, script));

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let saved = info(json!({
            "hypervisor": "qemu",
            "qmpSock": qmp_sock.display().to_string(),
            "pid": child.id().unwrap(),
        }));
        let (tx, hub) = hub::hub();
        let mut ctx = driver(None)
            .load_context(&logger(), "vm-a", &saved, &sockets(), tx)
            .unwrap();
        ctx.associate();
        (ctx, hub, child)
    }

    fn migration_script(
        final_status: Value,
    ) -> impl FnMut(&Value) -> Vec<Value> {
        let mut polls = 0;
        move |cmd| match cmd["execute"].as_str() {
            Some("query-migrate") => {
                polls += 1;
                if polls < 2 {
                    vec![json!({"return": {"status": "active"}})]
                } else {
                    vec![json!({"return": final_status.clone()})]
                }
            }
            _ => vec![json!({"return": {}})],
        }
    }

    #[tokio::test]
    async fn migration_completes() {
        let dir = tempfile::tempdir().unwrap();
        let script = migration_script(json!({"status": "completed"}));
        let (mut ctx, mut hub, mut child) = associated(&dir, script).await;

        ctx.migrate("10.0.0.2:4444".parse().unwrap());
        assert!(matches!(
            hub.recv().await,
            Some(VmEvent::MigrationFinished { result: Ok(()) })
        ));
        ctx.close().await;
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn migration_failure_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let script = migration_script(json!({
            "status": "failed",
            "error-desc": "peer hung up",
        }));
        let (mut ctx, mut hub, mut child) = associated(&dir, script).await;

        ctx.migrate("10.0.0.2:4444".parse().unwrap());
        match hub.recv().await {
            Some(VmEvent::MigrationFinished { result: Err(reason) }) => {
                assert_eq!(reason, "peer hung up");
            }
            other => panic!("unexpected event {:?}", other),
        }
        ctx.close().await;
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn lazy_launch_replays_inserted_devices() {
        // `true` stands in for QEMU: it accepts any arguments and exits.
        let dir = tempfile::tempdir().unwrap();
        let sockets = VmSockets::new(dir.path(), "vm-a");
        sockets.create_dirs().unwrap();
        let (tx, mut hub) = hub::hub();
        let d = driver(which::which("true").ok());
        let mut ctx =
            d.init_lazy_context(&logger(), "vm-a", &sockets, tx).unwrap();

        ctx.init_vm(&BootConfig::default()).unwrap();
        ctx.lazy_add_disk(
            &BlockDescriptor {
                name: "root".to_string(),
                scsi_id: 0,
                ..Default::default()
            },
            SourceKind::Image,
        );
        ctx.lazy_add_nic(&InterfaceCreated {
            index: 0,
            pci_addr: 5,
            fd: None,
            bridge: "hyper0".to_string(),
            host_device: "tap0".to_string(),
            device_name: "eth0".to_string(),
            mac_addr: "52:54:00:00:00:01".to_string(),
            ip_addr: "192.168.123.2".to_string(),
            net_mask: "255.255.255.0".to_string(),
        });
        ctx.lazy_launch(&BootConfig::default(), &sockets);

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match hub.recv().await.unwrap() {
                VmEvent::BlockdevInserted(ev) => {
                    seen.push(format!("disk {}", ev.device_name))
                }
                VmEvent::NetdevInserted(ev) => {
                    seen.push(format!("nic {}", ev.device_name))
                }
                VmEvent::VmExit => seen.push("exit".to_string()),
                // The stand-in never opens a monitor.
                VmEvent::InitFailed { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(seen.contains(&"disk sda".to_string()));
        assert!(seen.contains(&"nic eth0".to_string()));
        assert!(seen.contains(&"exit".to_string()));
        let disk = seen.iter().position(|s| s == "disk sda").unwrap();
        let nic = seen.iter().position(|s| s == "nic eth0").unwrap();
        assert!(disk < nic);
        assert!(dir.path().join("vm-a").join(LOG_FILE).exists());
        ctx.close().await;
    }
}
