// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-VM event hub: a bounded many-producer, single-consumer channel.
//!
//! Producers only ever see a [`HubSender`]; the [`Hub`] itself is owned by
//! the VM's state driver, which is therefore the only task that observes
//! events and the only task that mutates the VM context.

use tokio::sync::mpsc;

use super::event::VmEvent;

pub const HUB_CAPACITY: usize = 128;

/// Send-only handle to a VM's hub.
#[derive(Clone, Debug)]
pub struct HubSender {
    tx: mpsc::Sender<VmEvent>,
}

impl HubSender {
    /// Queues an event. Returns `false` if the VM's state driver has exited
    /// and the event was discarded.
    pub async fn send(&self, event: VmEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Sends from a detached task, for callers that must not wait on the
    /// hub (the state driver itself, or synchronous driver entry points).
    pub fn send_detached(&self, event: VmEvent) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct Hub {
    rx: mpsc::Receiver<VmEvent>,
}

impl Hub {
    pub async fn recv(&mut self) -> Option<VmEvent> {
        self.rx.recv().await
    }

    /// Closes the hub. Senders fail from here on; events already queued
    /// are dropped along with the hub.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

pub fn hub() -> (HubSender, Hub) {
    let (tx, rx) = mpsc::channel(HUB_CAPACITY);
    (HubSender { tx }, Hub { rx })
}
