// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! QEMU command line construction.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;

use crate::qmp::devices::{drive_id, rbd_filename, scsi_device_id, SCSI_BUS};
use crate::vm::SHARE_DIR_TAG;
use crate::vm::devices::BlockDescriptor;
use crate::vm::{BootConfig, VmSockets};

const KERNEL_PARAMS: &str = "console=ttyS0 panic=1 no_timer_check";
const AGENT_CHANNEL: &str = "sh.hyper.channel.0";
const TTY_CHANNEL: &str = "sh.hyper.channel.1";

/// A NIC placed on the command line. `fd` is the tap descriptor number the
/// child inherits; without one QEMU opens `host_device` itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct NicArg {
    pub fd: Option<RawFd>,
    pub host_device: String,
    pub device_name: String,
    pub mac_addr: String,
    pub pci_addr: u32,
}

/// Everything beyond boot config and sockets that shapes a command line.
#[derive(Debug, Default)]
pub(super) struct LaunchArgs<'a> {
    pub kvm: bool,
    pub nics: &'a [NicArg],
    pub drives: &'a [BlockDescriptor],
    pub incoming: Option<SocketAddr>,
}

fn push(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

fn unix_server(path: &Path) -> String {
    format!("{},server=on,wait=off", path.display())
}

pub(super) fn arguments(
    boot: &BootConfig,
    sockets: &VmSockets,
    qmp_sock: &Path,
    extra: &LaunchArgs<'_>,
) -> Vec<String> {
    let mut args = Vec::new();
    if extra.kvm {
        push(&mut args, "-machine", "pc,accel=kvm,usb=off");
        push(&mut args, "-global", "kvm-pit.lost_tick_policy=discard");
        push(&mut args, "-cpu", "host");
    } else {
        push(&mut args, "-machine", "pc,accel=tcg,usb=off");
        push(&mut args, "-cpu", "core2duo");
    }

    let pflash =
        |p: &Path| format!("if=pflash,file={},readonly=on", p.display());
    let direct_kernel = |args: &mut Vec<String>| {
        push(args, "-kernel", boot.kernel.display().to_string());
        push(args, "-initrd", boot.initrd.display().to_string());
        push(args, "-append", KERNEL_PARAMS);
    };
    match (&boot.bios, &boot.cbfs) {
        (Some(bios), Some(cbfs)) => {
            push(&mut args, "-drive", pflash(bios));
            push(&mut args, "-drive", pflash(cbfs));
        }
        (Some(bios), None) => {
            push(&mut args, "-bios", bios.display().to_string());
            direct_kernel(&mut args);
        }
        (None, Some(cbfs)) => push(&mut args, "-drive", pflash(cbfs)),
        (None, None) => direct_kernel(&mut args),
    }

    args.extend(
        [
            "-overcommit", "mem-lock=off", "-no-user-config", "-nodefaults",
            "-no-hpet", "-rtc", "base=utc,driftfix=slew", "-no-reboot",
            "-display", "none", "-boot", "strict=on",
        ]
        .map(String::from),
    );
    push(&mut args, "-m", boot.memory.to_string());
    push(&mut args, "-smp", boot.cpu.to_string());
    push(&mut args, "-qmp", format!("unix:{}", unix_server(qmp_sock)));
    let serial = format!("unix:{}", unix_server(&sockets.console));
    push(&mut args, "-serial", serial);

    push(
        &mut args,
        "-device",
        "virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr=0x2",
    );
    push(&mut args, "-device", "virtio-scsi-pci,id=scsi0,bus=pci.0,addr=0x3");
    for (nr, (id, path, name)) in [
        ("charch0", &sockets.control, AGENT_CHANNEL),
        ("charch1", &sockets.tty, TTY_CHANNEL),
    ]
    .into_iter()
    .enumerate()
    {
        let chardev = format!("socket,id={},path={}", id, unix_server(path));
        push(&mut args, "-chardev", chardev);
        push(
            &mut args,
            "-device",
            format!(
                "virtserialport,bus=virtio-serial0.0,nr={},chardev={},\
                 id=channel{},name={}",
                nr + 1,
                id,
                nr,
                name
            ),
        );
    }
    push(
        &mut args,
        "-fsdev",
        format!(
            "local,id=virtio9p,path={},security_model=none",
            sockets.share_dir.display()
        ),
    );
    push(
        &mut args,
        "-device",
        format!("virtio-9p-pci,fsdev=virtio9p,mount_tag={}", SHARE_DIR_TAG),
    );

    for nic in extra.nics {
        let backend = match nic.fd {
            Some(fd) => format!("tap,fd={},id={}", fd, nic.device_name),
            None => format!(
                "tap,ifname={},script=no,downscript=no,id={}",
                nic.host_device, nic.device_name
            ),
        };
        push(&mut args, "-netdev", backend);
        push(
            &mut args,
            "-device",
            format!(
                "virtio-net-pci,netdev={0},id={0},mac={1},\
                 bus=pci.0,addr=0x{2:x}",
                nic.device_name, nic.mac_addr, nic.pci_addr
            ),
        );
    }
    for drive in extra.drives {
        let file = rbd_filename(&drive.filename, &drive.format, &drive.options);
        push(
            &mut args,
            "-drive",
            format!(
                "file={},if=none,id={},format={},cache=writeback",
                file,
                drive_id(drive.scsi_id),
                drive.format
            ),
        );
        push(
            &mut args,
            "-device",
            format!(
                "scsi-hd,bus={},drive={},id={},scsi-id={}",
                SCSI_BUS,
                drive_id(drive.scsi_id),
                scsi_device_id(drive.scsi_id),
                drive.scsi_id
            ),
        );
    }

    if let Some(incoming) = extra.incoming {
        push(&mut args, "-incoming", format!("tcp:{}", incoming));
    }
    args
}
