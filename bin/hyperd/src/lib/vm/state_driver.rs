// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM state driver.
//!
//! One task per VM consumes the hub and moves the VM through its states:
//!
//! ```text
//! Init -> Preparing -> Starting -> Running -> Terminating -> None
//!             |                      ^  |
//!             +---- (listen) --------+  +-- (release) --> None
//! ```
//!
//! Every handler runs to completion before the next event is read, and the
//! handlers are the only code that touches the [`VmContext`]. Device
//! operations, kills and migrations are started here and finish later as
//! hub events; handlers never wait on them.

use std::collections::BTreeMap;

use hyperd_api_types::ResultCode;
use serde_json::json;
use slog::{debug, error, info, warn};

use super::agent::{AgentCode, AgentEvent};
use super::context::VmContext;
use super::devices::{ContainerInfo, SourceKind, VolumeInfo, FSTYPE_DIR};
use super::event::{
    AttachVolumeCommand, DetachVolumeCommand, ExecCommand, ListenPodCommand,
    MigrateCommand, Reply, RunPodCommand, VmEvent,
};
use super::hub::Hub;
use super::tty::TtyIo;
use super::{persist, volume, VmState};

#[derive(Debug, PartialEq, Eq)]
enum HandleEventOutcome {
    Continue,
    Exit,
}

/// How a VM leaves the running state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Teardown {
    /// Ask the agent to destroy the pod, then quit the hypervisor.
    Graceful,
    /// The guest lives on elsewhere; just quit the hypervisor.
    Migrated,
}

struct StateDriver {
    ctx: VmContext,
    hub: Hub,
    /// The hypervisor has been launched (or associated).
    launched: bool,
    /// StartPod has been sent and its acknowledgement is outstanding.
    start_sent: bool,
    /// DestroyPod has been sent and quit is deferred until it is answered.
    destroying: bool,
    kill_sent: bool,
    /// The hypervisor process is known to be gone.
    gone: bool,
}

/// Runs a newly created VM. With `launch` set, an eager context launches
/// the hypervisor right away.
pub(super) async fn run_fresh(mut ctx: VmContext, hub: Hub, launch: bool) {
    info!(ctx.log, "state driver launched");
    let mut launched = false;
    if let Some(lazy) = ctx.driver.lazy() {
        if let Err(e) = lazy.init_vm(&ctx.boot) {
            error!(ctx.log, "cannot initialize lazy vm"; "error" => %e);
            let mut driver = StateDriver::new(ctx, hub, false);
            driver.gone = true;
            driver.finish(false).await;
            return;
        }
    } else if launch {
        info!(ctx.log, "launching hypervisor");
        ctx.driver.ctx().launch(&ctx.boot, &ctx.sockets);
        launched = true;
    }
    ctx.become_state(VmState::Preparing);
    StateDriver::new(ctx, hub, launched).run().await;
}

/// Runs a VM restored from a persisted record.
pub(super) async fn run_associated(mut ctx: VmContext, hub: Hub) {
    info!(ctx.log, "state driver launched for associated vm");
    ctx.driver.ctx().associate();
    let mut driver = StateDriver::new(ctx, hub, true);
    driver.start_guest_channels();
    driver.ctx.become_state(VmState::Running);
    driver.run().await;
}

impl StateDriver {
    fn new(ctx: VmContext, hub: Hub, launched: bool) -> Self {
        Self {
            ctx,
            hub,
            launched,
            start_sent: false,
            destroying: false,
            kill_sent: false,
            gone: false,
        }
    }

    async fn run(mut self) {
        info!(self.ctx.log, "state driver entered main loop");
        let keep_running = loop {
            let Some(event) = self.hub.recv().await else {
                break false;
            };
            debug!(self.ctx.log, "state driver handling event";
                "event" => event.name(), "state" => %self.ctx.state);

            let outcome = match event {
                // Kill and its outcome are honored in every state.
                VmEvent::Kill { reply } => self.kill(Some(reply)),
                VmEvent::VmKilled { success } => self.vm_killed(success),
                VmEvent::Release { reply }
                    if self.ctx.state == VmState::Running =>
                {
                    if self.release(reply) {
                        break true;
                    }
                    HandleEventOutcome::Continue
                }
                event => match self.ctx.state {
                    VmState::Preparing => self.handle_preparing(event).await,
                    VmState::Starting => self.handle_starting(event),
                    VmState::Running => self.handle_running(event),
                    VmState::Terminating => self.handle_terminating(event),
                    VmState::Init | VmState::None => {
                        self.reject(event);
                        HandleEventOutcome::Continue
                    }
                },
            };
            if outcome == HandleEventOutcome::Exit {
                break false;
            }
        };
        self.finish(keep_running).await;
    }

    async fn handle_preparing(&mut self, event: VmEvent) -> HandleEventOutcome {
        match event {
            VmEvent::RunPod(cmd) | VmEvent::ReplacePod(cmd) => {
                self.prepare_pod(cmd).await
            }
            VmEvent::ListenPod(cmd) => self.listen_pod(cmd).await,
            VmEvent::Attach(cmd) => {
                debug!(self.ctx.log, "queueing attach until the pod exists";
                    "container" => &cmd.container);
                self.ctx.pending_ttys.push(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::Exec(cmd) => {
                debug!(self.ctx.log, "queueing exec until the pod runs";
                    "container" => &cmd.container);
                self.ctx.pending_execs.push(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::WindowSize(cmd) => {
                self.ctx.pending_winsizes.push(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::Shutdown { reply } | VmEvent::Release { reply } => {
                self.ctx.replies.shutdown.push(reply);
                self.kill(None)
            }
            VmEvent::VmStartFailed { reason } => {
                error!(self.ctx.log, "hypervisor failed to start";
                    "reason" => reason);
                self.hypervisor_gone()
            }
            VmEvent::VmExit => {
                warn!(self.ctx.log, "hypervisor exited before a pod arrived");
                self.hypervisor_gone()
            }
            VmEvent::InitFailed { reason } => {
                error!(self.ctx.log, "hypervisor monitor unavailable";
                    "reason" => reason);
                self.kill(None)
            }
            VmEvent::Hypervisor(ev) => {
                debug!(self.ctx.log, "hypervisor event"; "event" => ?ev);
                HandleEventOutcome::Continue
            }
            event => {
                self.reject(event);
                HandleEventOutcome::Continue
            }
        }
    }

    /// Checks a pod against the runtime's container list and builds the
    /// device context for it. On mismatch the caller has been answered and
    /// the VM is on its way down.
    fn init_pod(
        &mut self,
        spec: &hyperd_api_types::UserPod,
        containers: &[ContainerInfo],
        volumes: &BTreeMap<String, VolumeInfo>,
        reply: Reply,
    ) -> Result<Reply, HandleEventOutcome> {
        if spec.containers.len() != containers.len() {
            warn!(self.ctx.log, "pod spec does not match prepared containers";
                "spec" => spec.containers.len(),
                "prepared" => containers.len());
            let cause = format!(
                "pod has {} containers but {} were prepared",
                spec.containers.len(),
                containers.len()
            );
            self.ctx.respond(reply, ResultCode::BadRequest, cause);
            return Err(self.kill(None));
        }
        self.ctx.init_device_context(spec, containers, volumes);
        for attach in std::mem::take(&mut self.ctx.pending_ttys) {
            self.ctx.attach_tty(attach);
        }
        Ok(reply)
    }

    async fn prepare_pod(&mut self, cmd: RunPodCommand) -> HandleEventOutcome {
        let RunPodCommand { spec, containers, volumes, reply } = cmd;
        info!(self.ctx.log, "preparing pod"; "pod" => &spec.name,
            "containers" => spec.containers.len());
        let reply = match self.init_pod(&spec, &containers, &volumes, reply) {
            Ok(r) => r,
            Err(outcome) => return outcome,
        };

        // NICs take PCI addresses first, then disks take SCSI ids.
        let nics = match self.ctx.allocate_networks().await {
            Ok(n) => n,
            Err(e) => {
                error!(self.ctx.log, "network allocation failed";
                    "error" => %e);
                self.ctx.respond(reply, ResultCode::Failed, e.to_string());
                return self.kill(None);
            }
        };
        let blocks = self.ctx.pending_blockdevs();
        self.ctx.replies.start = Some(reply);

        let ctx = &mut self.ctx;
        match ctx.driver.lazy() {
            Some(lazy) => {
                for nic in &nics {
                    lazy.lazy_add_nic(nic);
                }
                for (block, source) in &blocks {
                    lazy.lazy_add_disk(block, *source);
                }
                info!(ctx.log, "launching hypervisor with pod devices";
                    "nics" => nics.len(), "disks" => blocks.len());
                lazy.lazy_launch(&ctx.boot, &ctx.sockets);
            }
            None => {
                let driver = ctx.driver.ctx();
                for nic in &nics {
                    driver.add_nic(nic);
                }
                for (block, source) in &blocks {
                    driver.add_disk(block, *source);
                }
            }
        }
        self.launched = true;
        self.start_guest_channels();
        self.ctx.set_timeout(self.ctx.timeouts.start);
        self.ctx.become_state(VmState::Starting);
        self.check_devices_ready()
    }

    async fn listen_pod(
        &mut self,
        cmd: ListenPodCommand,
    ) -> HandleEventOutcome {
        let ListenPodCommand { spec, containers, volumes, incoming, reply } =
            cmd;
        info!(self.ctx.log, "preparing pod for incoming migration";
            "pod" => &spec.name, "incoming" => %incoming);
        let reply = match self.init_pod(&spec, &containers, &volumes, reply) {
            Ok(r) => r,
            Err(outcome) => return outcome,
        };
        let nics = match self.ctx.allocate_networks().await {
            Ok(n) => n,
            Err(e) => {
                error!(self.ctx.log, "network allocation failed";
                    "error" => %e);
                self.ctx.respond(reply, ResultCode::Failed, e.to_string());
                return self.kill(None);
            }
        };
        let blocks = self.ctx.pending_blockdevs();

        let ctx = &mut self.ctx;
        match ctx.driver.lazy() {
            Some(lazy) => {
                for nic in &nics {
                    lazy.lazy_add_nic(nic);
                }
                for (block, source) in &blocks {
                    lazy.lazy_add_disk(block, *source);
                }
                lazy.as_driver().listen(&ctx.boot, &ctx.sockets, incoming);
            }
            None => {
                let driver = ctx.driver.ctx();
                driver.listen(&ctx.boot, &ctx.sockets, incoming);
                for nic in &nics {
                    driver.add_nic(nic);
                }
                for (block, source) in &blocks {
                    driver.add_disk(block, *source);
                }
            }
        }
        self.launched = true;
        self.start_guest_channels();
        self.ctx.become_state(VmState::Running);
        self.ctx.respond(
            reply,
            ResultCode::PodRunning,
            "waiting for migration",
        );
        self.replay_pending();
        HandleEventOutcome::Continue
    }

    fn start_guest_channels(&mut self) {
        let ctx = &mut self.ctx;
        ctx.agent = Some(super::agent::spawn_agent(
            &ctx.log,
            ctx.sockets.control.clone(),
            ctx.hub.clone(),
            ctx.timeouts.agent_connect,
        ));
        ctx.ptys
            .connect(ctx.sockets.tty.clone(), ctx.timeouts.agent_connect);
    }

    fn handle_starting(&mut self, event: VmEvent) -> HandleEventOutcome {
        match event {
            VmEvent::BlockdevInserted(ev) => {
                if !self.ctx.blockdev_inserted(&ev) {
                    warn!(self.ctx.log, "unexpected block device";
                        "name" => &ev.name);
                }
                self.check_devices_ready()
            }
            VmEvent::NetdevInserted(ev) => {
                self.ctx.netdev_inserted(&ev);
                self.check_devices_ready()
            }
            VmEvent::DeviceFailed(ev) => {
                let what =
                    ev.session.as_ref().map(|s| s.name()).unwrap_or("device");
                self.fail_start(format!("{} failed: {}", what, ev.reason));
                self.kill(None)
            }
            VmEvent::Agent(AgentEvent::Ack) if self.start_sent => {
                self.pod_started()
            }
            VmEvent::Agent(AgentEvent::Error { message })
                if self.start_sent =>
            {
                self.fail_start(format!("agent rejected the pod: {}", message));
                self.kill(None)
            }
            VmEvent::Agent(AgentEvent::Unreachable(reason)) => {
                self.fail_start(format!("agent unreachable: {}", reason));
                self.kill(None)
            }
            VmEvent::Agent(ev) => {
                debug!(self.ctx.log, "agent event while starting";
                    "event" => ?ev);
                HandleEventOutcome::Continue
            }
            VmEvent::Timeout => {
                self.fail_start(
                    "timed out waiting for the pod to start".to_string(),
                );
                self.kill(None)
            }
            VmEvent::InitFailed { reason } => {
                self.fail_start(format!(
                    "hypervisor monitor unavailable: {}",
                    reason
                ));
                self.kill(None)
            }
            VmEvent::VmStartFailed { reason } => {
                self.fail_start(format!(
                    "hypervisor failed to start: {}",
                    reason
                ));
                self.hypervisor_gone()
            }
            VmEvent::VmExit => {
                self.fail_start("hypervisor exited while starting".to_string());
                self.hypervisor_gone()
            }
            VmEvent::Attach(cmd) => {
                self.ctx.attach_tty(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::Exec(cmd) => {
                self.ctx.pending_execs.push(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::WindowSize(cmd) => {
                self.ctx.set_window_size(&cmd.client_tag, cmd.size);
                HandleEventOutcome::Continue
            }
            VmEvent::Shutdown { reply } => {
                self.ctx.replies.shutdown.push(reply);
                self.fail_start("shut down while starting".to_string());
                self.kill(None)
            }
            VmEvent::Hypervisor(ev) => {
                debug!(self.ctx.log, "hypervisor event"; "event" => ?ev);
                HandleEventOutcome::Continue
            }
            event => {
                self.reject(event);
                HandleEventOutcome::Continue
            }
        }
    }

    fn check_devices_ready(&mut self) -> HandleEventOutcome {
        if self.start_sent || !self.ctx.devices_ready() {
            return HandleEventOutcome::Continue;
        }
        info!(self.ctx.log, "all devices inserted; starting pod");
        let sent = match (self.ctx.agent.as_ref(), self.ctx.vm_spec.as_ref()) {
            (Some(agent), Some(spec)) => agent
                .send(AgentCode::StartPod, spec)
                .map_err(|e| e.to_string()),
            _ => Err("no agent channel".to_string()),
        };
        match sent {
            Ok(()) => {
                self.start_sent = true;
                HandleEventOutcome::Continue
            }
            Err(e) => {
                self.fail_start(format!("cannot start pod: {}", e));
                self.kill(None)
            }
        }
    }

    fn pod_started(&mut self) -> HandleEventOutcome {
        self.ctx.unset_timeout();
        self.ctx.become_state(VmState::Running);
        info!(self.ctx.log, "pod running");
        if let Some(reply) = self.ctx.replies.start.take() {
            let mut resp =
                self.ctx.response(ResultCode::PodRunning, "pod running");
            match persist::dump_bytes(&self.ctx) {
                Ok(data) => resp = resp.with_data(data),
                Err(e) => {
                    warn!(self.ctx.log, "cannot persist vm"; "error" => %e)
                }
            }
            let _ = reply.send(resp);
        }
        self.replay_pending();
        HandleEventOutcome::Continue
    }

    /// Runs the exec and window-size requests queued before the pod was
    /// running. Execs go first so their clients are known when sizes land.
    fn replay_pending(&mut self) {
        for cmd in std::mem::take(&mut self.ctx.pending_execs) {
            self.exec(cmd);
        }
        for cmd in std::mem::take(&mut self.ctx.pending_winsizes) {
            self.ctx.set_window_size(&cmd.client_tag, cmd.size);
        }
    }

    fn fail_start(&mut self, reason: String) {
        error!(self.ctx.log, "pod failed to start"; "reason" => &reason);
        self.ctx.unset_timeout();
        if let Some(reply) = self.ctx.replies.start.take() {
            self.ctx.respond(reply, ResultCode::Failed, reason);
        }
    }

    fn handle_running(&mut self, event: VmEvent) -> HandleEventOutcome {
        match event {
            VmEvent::Exec(cmd) => {
                self.exec(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::Attach(cmd) => {
                self.ctx.attach_tty(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::WindowSize(cmd) => {
                self.ctx.set_window_size(&cmd.client_tag, cmd.size);
                HandleEventOutcome::Continue
            }
            VmEvent::AttachVolume(cmd) => {
                self.attach_volume(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::DetachVolume(cmd) => {
                self.detach_volume(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::BlockdevInserted(ev) => {
                if !self.ctx.blockdev_inserted(&ev) {
                    warn!(self.ctx.log, "unexpected block device";
                        "name" => &ev.name);
                }
                if let Some(reply) =
                    self.ctx.replies.attach_volume.remove(&ev.name)
                {
                    self.ctx.respond(reply, ResultCode::Ok, ev.device_name);
                }
                HandleEventOutcome::Continue
            }
            VmEvent::NetdevInserted(ev) => {
                self.ctx.netdev_inserted(&ev);
                HandleEventOutcome::Continue
            }
            VmEvent::BlockdevRemoved { name, success } => {
                self.ctx.progress.deleting.blockdevs.remove(&name);
                self.ctx.devices.volumes.remove(&name);
                if let Some(reply) =
                    self.ctx.replies.detach_volume.remove(&name)
                {
                    let code = if success {
                        ResultCode::Ok
                    } else {
                        ResultCode::Failed
                    };
                    self.ctx.respond(reply, code, name);
                }
                HandleEventOutcome::Continue
            }
            VmEvent::NetdevRemoved { index, success } => {
                self.ctx.progress.deleting.networks.remove(&index);
                debug!(self.ctx.log, "network device removed";
                    "index" => index, "success" => success);
                HandleEventOutcome::Continue
            }
            VmEvent::DeviceFailed(ev) => {
                self.device_failed(ev);
                HandleEventOutcome::Continue
            }
            VmEvent::Migrate(cmd) => {
                self.migrate(cmd);
                HandleEventOutcome::Continue
            }
            VmEvent::MigrationFinished { result } => {
                self.migration_finished(result)
            }
            VmEvent::Shutdown { reply } => {
                self.ctx.replies.shutdown.push(reply);
                self.begin_teardown(Teardown::Graceful)
            }
            VmEvent::Dump { reply } => {
                match persist::dump_bytes(&self.ctx) {
                    Ok(data) => {
                        let resp = self.ctx.response(ResultCode::Ok, "");
                        let _ = reply.send(resp.with_data(data));
                    }
                    Err(e) => {
                        let cause = e.to_string();
                        self.ctx.respond(reply, ResultCode::Failed, cause)
                    }
                }
                HandleEventOutcome::Continue
            }
            VmEvent::Agent(AgentEvent::FinishCmd { session, code }) => {
                self.ctx.ptys.close_session(session, code);
                HandleEventOutcome::Continue
            }
            VmEvent::Agent(AgentEvent::FinishPod { codes }) => {
                info!(self.ctx.log, "pod finished"; "codes" => ?codes);
                self.begin_teardown(Teardown::Graceful)
            }
            VmEvent::Agent(ev) => {
                debug!(self.ctx.log, "agent event"; "event" => ?ev);
                HandleEventOutcome::Continue
            }
            VmEvent::VmExit | VmEvent::VmStartFailed { .. } => {
                warn!(self.ctx.log, "hypervisor exited unexpectedly");
                self.hypervisor_gone()
            }
            VmEvent::InitFailed { reason } => {
                warn!(self.ctx.log, "lost hypervisor monitor";
                    "reason" => reason);
                self.kill(None)
            }
            VmEvent::Hypervisor(ev) => {
                debug!(self.ctx.log, "hypervisor event"; "event" => ?ev);
                HandleEventOutcome::Continue
            }
            VmEvent::Timeout => {
                debug!(self.ctx.log, "stale timer expired");
                HandleEventOutcome::Continue
            }
            event => {
                self.reject(event);
                HandleEventOutcome::Continue
            }
        }
    }

    fn exec(&mut self, cmd: ExecCommand) {
        let ExecCommand { container, command, tty, streams } = cmd;
        let id = self.ctx.container_index(&container).and_then(|idx| {
            self.ctx.vm_spec.as_ref().map(|s| s.containers[idx].id.clone())
        });
        let Some(id) = id else {
            if let Some(cb) = streams.callback {
                let _ = cb.send(self.ctx.response(
                    ResultCode::BadRequest,
                    format!("no container {}", container),
                ));
            }
            return;
        };
        let Some(agent) = self.ctx.agent.clone() else {
            if let Some(cb) = streams.callback {
                let _ = cb.send(
                    self.ctx.response(ResultCode::Failed, "no agent channel"),
                );
            }
            return;
        };

        let session = self.ctx.next_attach_id();
        let stderr = if tty {
            0
        } else {
            let s = self.ctx.next_attach_id();
            self.ctx.ptys.attach(
                s,
                TtyIo {
                    client_tag: String::new(),
                    stdin: None,
                    stdout: streams.stdout.clone(),
                    callback: None,
                },
            );
            s
        };
        self.ctx.ptys.attach(session, streams);
        info!(self.ctx.log, "exec in container";
            "container" => &id, "session" => session, "tty" => tty);
        let payload = json!({
            "container": id,
            "process": {
                "terminal": tty,
                "stdio": session,
                "stderr": stderr,
                "args": command,
            },
        });
        if let Err(e) = agent.send(AgentCode::ExecCmd, &payload) {
            warn!(self.ctx.log, "cannot send exec"; "error" => %e);
            self.ctx.ptys.close_session(session, -1);
        }
    }

    fn attach_volume(&mut self, cmd: AttachVolumeCommand) {
        let AttachVolumeCommand { volume, reply } = cmd;
        if self.ctx.devices.volumes.contains_key(&volume.name) {
            let cause = format!("volume {} already attached", volume.name);
            self.ctx.respond(reply, ResultCode::BadRequest, cause);
            return;
        }
        if volume.fstype == FSTYPE_DIR {
            let cause = "directory volumes cannot be hot-attached";
            self.ctx.respond(reply, ResultCode::BadRequest, cause);
            return;
        }
        let block = self.ctx.add_volume(&volume);
        info!(self.ctx.log, "hot-attaching volume";
            "volume" => &volume.name, "scsi_id" => block.scsi_id);
        self.ctx.replies.attach_volume.insert(volume.name.clone(), reply);
        self.ctx.driver.ctx().add_disk(&block, SourceKind::Volume);
    }

    fn detach_volume(&mut self, cmd: DetachVolumeCommand) {
        let DetachVolumeCommand { name, reply } = cmd;
        let block = match self.ctx.devices.volumes.get(&name) {
            None => {
                let cause = format!("no volume {}", name);
                self.ctx.respond(reply, ResultCode::BadRequest, cause);
                return;
            }
            Some(vol) if !vol.pos.is_empty() => {
                let cause =
                    format!("volume {} is mounted by a container", name);
                self.ctx.respond(reply, ResultCode::BadRequest, cause);
                return;
            }
            Some(vol) => vol.info.clone(),
        };
        info!(self.ctx.log, "detaching volume"; "volume" => &name);
        self.ctx.progress.deleting.blockdevs.insert(name.clone());
        self.ctx.replies.detach_volume.insert(name.clone(), reply);
        let removed = VmEvent::BlockdevRemoved { name, success: true };
        self.ctx.driver.ctx().remove_disk(&block, removed);
    }

    fn device_failed(&mut self, ev: super::event::DeviceFailedEvent) {
        warn!(self.ctx.log, "device session failed"; "reason" => %ev.reason);
        match ev.session.map(|s| *s) {
            Some(VmEvent::BlockdevInserted(ins)) => {
                self.ctx.progress.adding.blockdevs.remove(&ins.name);
                if let Some(reply) =
                    self.ctx.replies.attach_volume.remove(&ins.name)
                {
                    self.ctx.devices.volumes.remove(&ins.name);
                    let cause = ev.reason.to_string();
                    self.ctx.respond(reply, ResultCode::Failed, cause);
                }
            }
            Some(VmEvent::BlockdevRemoved { name, .. }) => {
                self.ctx.progress.deleting.blockdevs.remove(&name);
                if let Some(reply) =
                    self.ctx.replies.detach_volume.remove(&name)
                {
                    let cause = ev.reason.to_string();
                    self.ctx.respond(reply, ResultCode::Failed, cause);
                }
            }
            Some(VmEvent::NetdevRemoved { index, .. }) => {
                self.ctx.progress.deleting.networks.remove(&index);
            }
            _ => {}
        }
    }

    fn migrate(&mut self, cmd: MigrateCommand) {
        let MigrateCommand { dest, reply } = cmd;
        if self.ctx.replies.migrate.is_some() {
            let cause = "migration already in progress";
            self.ctx.respond(reply, ResultCode::Busy, cause);
            return;
        }
        info!(self.ctx.log, "migrating vm"; "dest" => %dest);
        self.ctx.replies.migrate = Some(reply);
        self.ctx.driver.ctx().migrate(dest);
    }

    fn migration_finished(
        &mut self,
        result: Result<(), String>,
    ) -> HandleEventOutcome {
        let reply = self.ctx.replies.migrate.take();
        match result {
            Ok(()) => {
                info!(self.ctx.log, "migration completed; stopping source");
                if let Some(reply) = reply {
                    self.ctx.respond(reply, ResultCode::Ok, "migrated");
                }
                self.begin_teardown(Teardown::Migrated)
            }
            Err(e) => {
                // Nothing to undo: the guest keeps running here.
                error!(self.ctx.log, "migration failed"; "error" => &e);
                if let Some(reply) = reply {
                    self.ctx.respond(reply, ResultCode::Failed, e);
                }
                HandleEventOutcome::Continue
            }
        }
    }

    /// Answers a release request. Returns true if the VM should detach and
    /// leave the hypervisor running.
    fn release(&mut self, reply: Reply) -> bool {
        match persist::dump_bytes(&self.ctx) {
            Ok(data) => {
                info!(self.ctx.log, "releasing vm");
                let resp = self.ctx.response(ResultCode::Ok, "released");
                let _ = reply.send(resp.with_data(data));
                true
            }
            Err(e) => {
                error!(self.ctx.log, "cannot release vm"; "error" => %e);
                self.ctx.respond(reply, ResultCode::Failed, e.to_string());
                false
            }
        }
    }

    fn begin_teardown(&mut self, kind: Teardown) -> HandleEventOutcome {
        info!(self.ctx.log, "tearing down vm"; "kind" => ?kind);
        self.ctx.become_state(VmState::Terminating);
        self.ctx.set_timeout(self.ctx.timeouts.shutdown);
        let agent = self.ctx.agent.clone();
        match (kind, agent) {
            (Teardown::Graceful, Some(agent)) => {
                match agent.send_empty(AgentCode::DestroyPod) {
                    Ok(()) => self.destroying = true,
                    Err(e) => {
                        warn!(self.ctx.log, "cannot destroy pod";
                            "error" => %e);
                        self.ctx.driver.ctx().shutdown();
                    }
                }
            }
            _ => self.ctx.driver.ctx().shutdown(),
        }
        HandleEventOutcome::Continue
    }

    fn handle_terminating(&mut self, event: VmEvent) -> HandleEventOutcome {
        match event {
            VmEvent::VmExit | VmEvent::VmStartFailed { .. } => {
                self.hypervisor_gone()
            }
            VmEvent::Agent(
                ev @ (AgentEvent::Ack | AgentEvent::FinishPod { .. }),
            ) if self.destroying => {
                debug!(self.ctx.log, "pod destroyed"; "event" => ?ev);
                self.destroying = false;
                self.ctx.driver.ctx().shutdown();
                HandleEventOutcome::Continue
            }
            event @ VmEvent::Agent(_) if self.destroying => {
                self.reject(event);
                HandleEventOutcome::Continue
            }
            VmEvent::Timeout if self.gone => {
                warn!(self.ctx.log, "timed out unmounting shared storage");
                HandleEventOutcome::Exit
            }
            VmEvent::Timeout if !self.kill_sent => {
                warn!(self.ctx.log, "hypervisor did not stop in time; killing");
                self.kill(None)
            }
            VmEvent::Timeout => {
                error!(self.ctx.log, "hypervisor did not die; giving up on it");
                self.hypervisor_gone()
            }
            VmEvent::ContainerUnmounted { index, success } => {
                if !success {
                    warn!(self.ctx.log, "container rootfs left mounted";
                        "index" => index);
                }
                self.ctx.progress.unmounting.containers.remove(&index);
                self.check_unmounted()
            }
            VmEvent::VolumeUnmounted { name, success } => {
                if !success {
                    warn!(self.ctx.log, "volume left mounted";
                        "volume" => &name);
                }
                self.ctx.progress.unmounting.volumes.remove(&name);
                self.check_unmounted()
            }
            VmEvent::Shutdown { reply } => {
                self.ctx.replies.shutdown.push(reply);
                HandleEventOutcome::Continue
            }
            VmEvent::MigrationFinished { .. }
            | VmEvent::InitFailed { .. }
            | VmEvent::Hypervisor(_)
            | VmEvent::Agent(_)
            | VmEvent::BlockdevInserted(_)
            | VmEvent::NetdevInserted(_)
            | VmEvent::DeviceFailed(_)
            | VmEvent::BlockdevRemoved { .. }
            | VmEvent::NetdevRemoved { .. } => {
                debug!(self.ctx.log, "ignoring event while terminating";
                    "event" => event.name());
                HandleEventOutcome::Continue
            }
            event => {
                self.reject(event);
                HandleEventOutcome::Continue
            }
        }
    }

    fn check_unmounted(&self) -> HandleEventOutcome {
        if self.gone && self.ctx.progress.unmounting.is_empty() {
            HandleEventOutcome::Exit
        } else {
            HandleEventOutcome::Continue
        }
    }

    fn kill(&mut self, reply: Option<Reply>) -> HandleEventOutcome {
        if let Some(reply) = reply {
            if self.gone {
                let cause = "vm already stopped";
                self.ctx.respond(reply, ResultCode::VmShutdown, cause);
                return HandleEventOutcome::Continue;
            }
            self.ctx.replies.kill.push(reply);
        }
        if self.gone {
            return self.check_unmounted();
        }
        if !self.launched {
            info!(self.ctx.log, "no hypervisor to kill");
            return self.hypervisor_gone();
        }
        info!(self.ctx.log, "killing hypervisor");
        self.ctx.become_state(VmState::Terminating);
        self.kill_sent = true;
        self.destroying = false;
        self.ctx.driver.ctx().kill();
        self.ctx.set_timeout(self.ctx.timeouts.shutdown);
        HandleEventOutcome::Continue
    }

    fn vm_killed(&mut self, success: bool) -> HandleEventOutcome {
        let (code, cause) = if success {
            (ResultCode::VmShutdown, "vm killed")
        } else {
            (ResultCode::Failed, "kill failed")
        };
        for reply in std::mem::take(&mut self.ctx.replies.kill) {
            self.ctx.respond(reply, code, cause);
        }
        if success {
            self.hypervisor_gone()
        } else {
            HandleEventOutcome::Continue
        }
    }

    /// The hypervisor is no longer running: unmount shared storage and
    /// exit once that completes.
    fn hypervisor_gone(&mut self) -> HandleEventOutcome {
        if self.gone {
            return self.check_unmounted();
        }
        self.gone = true;
        self.ctx.unset_timeout();
        self.ctx.become_state(VmState::Terminating);
        if volume::unmount_shared(&mut self.ctx) {
            self.ctx.set_timeout(self.ctx.timeouts.shutdown);
            HandleEventOutcome::Continue
        } else {
            HandleEventOutcome::Exit
        }
    }

    /// Answers a command that is not valid in the current state.
    fn reject(&self, event: VmEvent) {
        let cause = format!(
            "{} not allowed while vm is {}",
            event.name(),
            self.ctx.state
        );
        let reply = match event {
            VmEvent::RunPod(c) | VmEvent::ReplacePod(c) => Some(c.reply),
            VmEvent::ListenPod(c) => Some(c.reply),
            VmEvent::Migrate(c) => Some(c.reply),
            VmEvent::AttachVolume(c) => Some(c.reply),
            VmEvent::DetachVolume(c) => Some(c.reply),
            VmEvent::Shutdown { reply }
            | VmEvent::Release { reply }
            | VmEvent::Kill { reply }
            | VmEvent::Dump { reply } => Some(reply),
            VmEvent::Exec(c) => c.streams.callback,
            VmEvent::Attach(c) => c.streams.callback,
            other => {
                warn!(self.ctx.log, "unexpected event in state";
                    "event" => other.name(), "state" => %self.ctx.state);
                None
            }
        };
        if let Some(reply) = reply {
            debug!(self.ctx.log, "rejecting command"; "cause" => &cause);
            self.ctx.respond(reply, ResultCode::BadRequest, cause);
        }
    }

    async fn finish(&mut self, keep_running: bool) {
        let ctx = &mut self.ctx;
        ctx.unset_timeout();
        if !keep_running {
            for nic in ctx.devices.networks.values() {
                if let Err(e) = ctx.network.release(&ctx.id, nic).await {
                    warn!(ctx.log, "cannot release network";
                        "device" => &nic.device_name, "error" => %e);
                }
            }
        }
        ctx.ptys.close_all();

        let replies = std::mem::take(&mut ctx.replies);
        if let Some(reply) = replies.start {
            let cause = "vm shut down before the pod started";
            ctx.respond(reply, ResultCode::Failed, cause);
        }
        for reply in replies.shutdown {
            ctx.respond(reply, ResultCode::VmShutdown, "vm shut down");
        }
        for reply in replies.kill {
            ctx.respond(reply, ResultCode::VmShutdown, "vm shut down");
        }
        if let Some(reply) = replies.migrate {
            ctx.respond(reply, ResultCode::Failed, "vm shut down");
        }
        for reply in replies
            .attach_volume
            .into_values()
            .chain(replies.detach_volume.into_values())
        {
            ctx.respond(reply, ResultCode::Failed, "vm shut down");
        }
        ctx.pending_winsizes.clear();
        for cmd in std::mem::take(&mut ctx.pending_execs) {
            if let Some(cb) = cmd.streams.callback {
                let resp = ctx.response(ResultCode::Failed, "vm shut down");
                let _ = cb.send(resp);
            }
        }

        ctx.driver.ctx().close().await;
        self.hub.close();
        ctx.become_state(VmState::None);
        info!(ctx.log, "state driver exiting"; "released" => keep_running);
    }
}
