// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor sessions that hot-plug and unplug guest devices.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde_json::{json, Value};

use crate::vm::devices::{BlockDescriptor, InterfaceCreated, SourceKind};
use crate::vm::event::{BlockdevInsertedEvent, NetdevInsertedEvent, VmEvent};

use super::codec::QmpCommand;
use super::session::QmpSession;

pub const SCSI_BUS: &str = "scsi0.0";
pub const PCI_BUS: &str = "pci.0";

/// Guest block device name for a SCSI id: 0 is `sda`, 25 is `sdz`, 26 is
/// `sdaa`, and so on.
pub fn scsi_id_to_name(id: usize) -> String {
    let mut n = id + 1;
    let mut suffix = Vec::new();
    while n > 0 {
        n -= 1;
        suffix.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    suffix.reverse();
    format!("sd{}", String::from_utf8_lossy(&suffix))
}

pub fn drive_id(scsi_id: usize) -> String {
    format!("drive{}", scsi_id)
}

pub fn scsi_device_id(scsi_id: usize) -> String {
    format!("scsi-disk{}", scsi_id)
}

/// Filename for a drive, with Ceph credentials and monitors appended for
/// `rbd` images.
pub fn rbd_filename(
    filename: &str,
    format: &str,
    options: &BTreeMap<String, String>,
) -> String {
    if format != "rbd" {
        return filename.to_string();
    }
    let mut out = filename.to_string();
    if let (Some(user), Some(keyring)) =
        (options.get("user"), options.get("keyring"))
    {
        out.push_str(&format!(":id={}:key={}", user, keyring));
    }
    if let Some(monitors) = options.get("monitors") {
        let escaped: Vec<String> = monitors
            .split(';')
            .filter(|m| !m.is_empty())
            .map(|m| m.replace(':', "\\:"))
            .collect();
        if !escaped.is_empty() {
            out.push_str(":mon_host=");
            out.push_str(&escaped.join(";"));
        }
    }
    out
}

pub fn disk_add_session(
    block: &BlockDescriptor,
    source: SourceKind,
) -> QmpSession {
    let id = block.scsi_id;
    let file = rbd_filename(&block.filename, &block.format, &block.options);
    let commands = vec![
        QmpCommand::hmp(format!(
            "drive_add dummy file={},if=none,id={},format={},cache=writeback",
            file,
            drive_id(id),
            block.format
        )),
        QmpCommand::new(
            "device_add",
            json!({
                "driver": "scsi-hd",
                "bus": SCSI_BUS,
                "scsi-id": id.to_string(),
                "drive": drive_id(id),
                "id": scsi_device_id(id),
            }),
        ),
    ];
    let inserted = VmEvent::BlockdevInserted(BlockdevInsertedEvent {
        name: block.name.clone(),
        source,
        device_name: scsi_id_to_name(id),
        scsi_id: id,
    });
    QmpSession::with_callback(commands, Some(inserted))
}

pub fn disk_del_session(
    block: &BlockDescriptor,
    callback: VmEvent,
) -> QmpSession {
    let id = block.scsi_id;
    let commands = vec![
        QmpCommand::new("device_del", json!({ "id": scsi_device_id(id) })),
        QmpCommand::hmp(format!("drive_del {}", drive_id(id))),
    ];
    QmpSession::with_callback(commands, Some(callback))
}

pub fn nic_add_session(nic: &InterfaceCreated) -> QmpSession {
    let dev = nic.device_name.clone();
    let mut commands = Vec::with_capacity(3);
    let backend = match &nic.fd {
        Some(fd) => {
            let fdname = format!("fd{}", dev);
            commands.push(
                QmpCommand::new("getfd", json!({ "fdname": fdname }))
                    .with_fd(fd.clone()),
            );
            json!({ "type": "tap", "id": dev, "fd": fdname })
        }
        // Without a descriptor in hand, let QEMU open the tap by name.
        None => json!({
            "type": "tap",
            "id": dev,
            "ifname": nic.host_device,
            "script": "no",
            "downscript": "no",
        }),
    };
    commands.push(QmpCommand::new("netdev_add", backend));
    commands.push(QmpCommand::new(
        "device_add",
        json!({
            "driver": "virtio-net-pci",
            "netdev": dev,
            "mac": nic.mac_addr,
            "bus": PCI_BUS,
            "addr": format!("0x{:x}", nic.pci_addr),
            "id": dev,
        }),
    ));

    let inserted = VmEvent::NetdevInserted(NetdevInsertedEvent {
        index: nic.index,
        device_name: dev,
        address: nic.pci_addr,
    });
    QmpSession::with_callback(commands, Some(inserted))
}

pub fn nic_del_session(
    nic: &InterfaceCreated,
    callback: VmEvent,
) -> QmpSession {
    let commands = vec![
        QmpCommand::new("device_del", json!({ "id": nic.device_name })),
        QmpCommand::new("netdev_del", json!({ "id": nic.device_name })),
    ];
    QmpSession::with_callback(commands, Some(callback))
}

pub fn quit_session() -> QmpSession {
    QmpSession::with_callback(vec![QmpCommand::new("quit", Value::Null)], None)
}

pub fn migrate_command(dest: SocketAddr) -> QmpCommand {
    QmpCommand::new("migrate", json!({ "uri": format!("tcp:{}", dest) }))
}

pub fn query_migrate_command() -> QmpCommand {
    QmpCommand::new("query-migrate", Value::Null)
}
