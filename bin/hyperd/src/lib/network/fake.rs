// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{NetworkAllocator, NetworkError};
use crate::vm::devices::InterfaceCreated;

/// Hands out interfaces without touching the host.
#[derive(Debug, Default)]
pub(crate) struct FakeNetwork {
    released: Mutex<Vec<String>>,
    reserved: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn reserved(&self) -> Vec<String> {
        self.reserved.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkAllocator for FakeNetwork {
    async fn allocate(
        &self,
        _vm_id: &str,
        index: usize,
        pci_addr: u32,
        bridge: Option<&str>,
        requested_ip: Option<Ipv4Addr>,
    ) -> Result<InterfaceCreated, NetworkError> {
        let ip = requested_ip
            .unwrap_or_else(|| Ipv4Addr::new(192, 168, 123, 2 + index as u8));
        Ok(InterfaceCreated {
            index,
            pci_addr,
            fd: None,
            bridge: bridge.unwrap_or("hyper0").to_string(),
            host_device: format!("tap{}", index),
            device_name: format!("eth{}", index),
            mac_addr: format!("52:54:00:00:00:{:02x}", index),
            ip_addr: ip.to_string(),
            net_mask: "255.255.255.0".to_string(),
        })
    }

    async fn release(
        &self,
        _vm_id: &str,
        nic: &InterfaceCreated,
    ) -> Result<(), NetworkError> {
        self.released.lock().unwrap().push(nic.device_name.clone());
        Ok(())
    }

    fn reserve(&self, ip: &str) {
        self.reserved.lock().unwrap().push(ip.to_string());
    }
}
