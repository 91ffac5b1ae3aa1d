// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Teardown of directory-backed storage mounted into the share directory.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use slog::{debug, warn, Logger};

use super::context::VmContext;
use super::event::VmEvent;

/// Lazily detaches the mount at `path`. A path that is not (or no longer)
/// a mount point counts as unmounted.
fn umount(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // Safety: `c_path` is a valid NUL-terminated string that outlives the
    // call.
    let res = unsafe { libc::umount2(c_path.as_ptr(), libc::MNT_DETACH) };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ENOENT) => Ok(()),
        _ => Err(err),
    }
}

fn spawn_umount(
    log: &Logger,
    path: PathBuf,
    done: VmEvent,
    failed: VmEvent,
    ctx: &VmContext,
) {
    let log = log.clone();
    let hub = ctx.hub.clone();
    tokio::spawn(async move {
        let target = path.clone();
        let res = tokio::task::spawn_blocking(move || umount(&target)).await;
        let event = match res {
            Ok(Ok(())) => {
                debug!(log, "unmounted shared storage";
                    "path" => %path.display());
                done
            }
            Ok(Err(e)) => {
                warn!(log, "unmount failed";
                    "path" => %path.display(), "error" => %e);
                failed
            }
            Err(e) => {
                warn!(log, "unmount task failed"; "error" => %e);
                failed
            }
        };
        hub.send(event).await;
    });
}

/// Starts unmounting every directory-backed rootfs and volume of the pod.
/// Completion arrives as `ContainerUnmounted` and `VolumeUnmounted` events.
/// Returns false if there was nothing to unmount.
pub(crate) fn unmount_shared(ctx: &mut VmContext) -> bool {
    let Some(spec) = ctx.vm_spec.as_ref() else {
        return false;
    };
    let share_dir = ctx.sockets.share_dir.clone();

    let containers: Vec<(usize, PathBuf)> = spec
        .containers
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            c.fstype == super::devices::FSTYPE_DIR && !c.image.is_empty()
        })
        .map(|(idx, c)| (idx, share_dir.join(&c.image).join(&c.rootfs)))
        .collect();
    let volumes: Vec<(String, PathBuf)> = ctx
        .devices
        .volumes
        .values()
        .filter(|v| v.is_dir())
        .map(|v| (v.info.name.clone(), share_dir.join(&v.info.filename)))
        .collect();

    for (index, path) in containers {
        ctx.progress.unmounting.containers.insert(index);
        spawn_umount(
            &ctx.log,
            path,
            VmEvent::ContainerUnmounted { index, success: true },
            VmEvent::ContainerUnmounted { index, success: false },
            ctx,
        );
    }
    for (name, path) in volumes {
        ctx.progress.unmounting.volumes.insert(name.clone());
        spawn_umount(
            &ctx.log,
            path,
            VmEvent::VolumeUnmounted { name: name.clone(), success: true },
            VmEvent::VolumeUnmounted { name, success: false },
            ctx,
        );
    }
    !ctx.progress.unmounting.is_empty()
}
