// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side networking for guest NICs.
//!
//! [`BridgeNetwork`] gives every guest interface a TAP device attached to a
//! host bridge and an IPv4 address from the bridge's subnet. The TAP is
//! opened here and its descriptor handed to the hypervisor, so the device
//! disappears once both sides have closed it.

use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use slog::{debug, info, warn, Logger};
use thiserror::Error;
use tokio::process::Command;

use crate::vm::devices::InterfaceCreated;

pub mod ipalloc;

#[cfg(test)]
pub(crate) mod fake;

use ipalloc::IpAllocator;

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: u64 = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid subnet {0:?}")]
    BadSubnet(String),

    #[error("no available ip addresses on network")]
    Exhausted,

    #[error("ip {0} already allocated")]
    AlreadyAllocated(Ipv4Addr),

    #[error("requested ip {0} is out of range")]
    OutOfRange(Ipv4Addr),

    #[error("cannot create tap device: {0}")]
    Tap(std::io::Error),

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },
}

/// Provides and reclaims the host side of guest NICs.
#[async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Creates the host side of interface `index` for `vm_id`. `bridge`
    /// and `requested_ip` override the allocator's defaults.
    async fn allocate(
        &self,
        vm_id: &str,
        index: usize,
        pci_addr: u32,
        bridge: Option<&str>,
        requested_ip: Option<Ipv4Addr>,
    ) -> Result<InterfaceCreated, NetworkError>;

    async fn release(
        &self,
        vm_id: &str,
        nic: &InterfaceCreated,
    ) -> Result<(), NetworkError>;

    /// Marks an address held by a VM from a previous daemon run as in use.
    fn reserve(&self, ip: &str);
}

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Opens a new non-persistent TAP device called `name`.
fn open_tap(name: &str) -> std::io::Result<OwnedFd> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    let file = OpenOptions::new().read(true).write(true).open(TUN_DEVICE)?;
    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    // Safety: `req` is a properly sized ifreq that outlives the call.
    let res = unsafe {
        libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq)
    };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(OwnedFd::from(file))
}

/// A random locally administered unicast MAC in the 52:54:00 range.
pub fn random_mac() -> String {
    let tail: [u8; 3] = rand::thread_rng().gen();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

async fn ip_link(args: &[&str]) -> Result<(), NetworkError> {
    let command = format!("ip link {}", args.join(" "));
    let out = Command::new("ip")
        .arg("link")
        .args(args)
        .output()
        .await
        .map_err(|e| NetworkError::Command {
            command: command.clone(),
            detail: e.to_string(),
        })?;
    if !out.status.success() {
        return Err(NetworkError::Command {
            command,
            detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(())
}

pub struct BridgeNetwork {
    log: Logger,
    bridge: String,
    ips: Mutex<IpAllocator>,
}

impl BridgeNetwork {
    pub fn new(
        log: &Logger,
        config: &hyperd_config::Network,
    ) -> Result<Self, NetworkError> {
        let ips = IpAllocator::new(&config.subnet)?;
        Ok(Self {
            log: log.new(slog::o!("component" => "network")),
            bridge: config.bridge.clone(),
            ips: Mutex::new(ips),
        })
    }

    fn request_ip(
        &self,
        requested: Option<Ipv4Addr>,
    ) -> Result<(Ipv4Addr, Ipv4Addr), NetworkError> {
        let mut ips = self.ips.lock().unwrap();
        let ip = ips.request(requested)?;
        Ok((ip, ips.netmask()))
    }

    fn release_ip(&self, ip: &str) {
        if let Ok(ip) = ip.parse() {
            self.ips.lock().unwrap().release(ip);
        }
    }

    async fn create_tap(
        &self,
        name: &str,
        bridge: &str,
    ) -> Result<OwnedFd, NetworkError> {
        let tap = name.to_string();
        let fd = tokio::task::spawn_blocking(move || open_tap(&tap))
            .await
            .map_err(|e| NetworkError::Tap(std::io::Error::other(e)))?
            .map_err(NetworkError::Tap)?;
        ip_link(&["set", name, "master", bridge]).await?;
        ip_link(&["set", name, "up"]).await?;
        Ok(fd)
    }
}

#[async_trait]
impl NetworkAllocator for BridgeNetwork {
    async fn allocate(
        &self,
        vm_id: &str,
        index: usize,
        pci_addr: u32,
        bridge: Option<&str>,
        requested_ip: Option<Ipv4Addr>,
    ) -> Result<InterfaceCreated, NetworkError> {
        let bridge = bridge.unwrap_or(&self.bridge).to_string();
        let (ip, mask) = self.request_ip(requested_ip)?;
        let suffix: [u8; 4] = rand::thread_rng().gen();
        let host_device = format!("tap{}", hex::encode(suffix));

        let fd = match self.create_tap(&host_device, &bridge).await {
            Ok(fd) => fd,
            Err(e) => {
                self.ips.lock().unwrap().release(ip);
                return Err(e);
            }
        };
        info!(self.log, "created guest interface";
            "vm" => vm_id, "index" => index, "tap" => &host_device,
            "bridge" => &bridge, "ip" => %ip);
        Ok(InterfaceCreated {
            index,
            pci_addr,
            fd: Some(Arc::new(fd)),
            bridge,
            host_device,
            device_name: format!("eth{}", index),
            mac_addr: random_mac(),
            ip_addr: ip.to_string(),
            net_mask: mask.to_string(),
        })
    }

    async fn release(
        &self,
        vm_id: &str,
        nic: &InterfaceCreated,
    ) -> Result<(), NetworkError> {
        debug!(self.log, "releasing guest interface";
            "vm" => vm_id, "tap" => &nic.host_device, "ip" => &nic.ip_addr);
        self.release_ip(&nic.ip_addr);
        if nic.fd.is_none() && !nic.host_device.is_empty() {
            // Reattached interfaces are not backed by our descriptor; remove
            // the device explicitly.
            if let Err(e) = ip_link(&["delete", &nic.host_device]).await {
                warn!(self.log, "cannot remove tap device"; "error" => %e);
            }
        }
        Ok(())
    }

    fn reserve(&self, ip: &str) {
        let res = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| NetworkError::BadSubnet(ip.to_string()))
            .and_then(|ip| self.ips.lock().unwrap().reserve(ip));
        if let Err(e) = res {
            warn!(self.log, "cannot reserve address";
                "ip" => ip, "error" => %e);
        }
    }
}
