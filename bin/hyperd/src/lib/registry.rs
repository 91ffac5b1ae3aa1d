// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Daemon-wide registries of VMs and pods.
//!
//! VM lookups are short and never span an await, so [`VmRegistry`] is a
//! plain read/write lock. Pod operations are multi-step and wait on VMs in
//! between; [`PodRegistry`] hands out an async guard that callers hold for
//! the whole operation, so that e.g. stopping every pod cannot interleave
//! with a pod being created.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, MutexGuard};

use crate::vm::Vm;

#[derive(Debug, Default)]
pub struct VmRegistry {
    vms: RwLock<BTreeMap<String, Arc<Vm>>>,
}

impl VmRegistry {
    pub fn insert(&self, vm: Arc<Vm>) {
        self.vms.write().unwrap().insert(vm.id().to_string(), vm);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Vm>> {
        self.vms.write().unwrap().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Vm>> {
        self.vms.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vms.read().unwrap().contains_key(id)
    }

    /// A snapshot of every registered VM.
    pub fn all(&self) -> Vec<Arc<Vm>> {
        self.vms.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vms.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type PodMap<P> = BTreeMap<String, P>;

#[derive(Debug)]
pub struct PodRegistry<P> {
    pods: Mutex<PodMap<P>>,
}

impl<P> Default for PodRegistry<P> {
    fn default() -> Self {
        Self { pods: Mutex::new(BTreeMap::new()) }
    }
}

impl<P> PodRegistry<P> {
    pub async fn lock(&self) -> MutexGuard<'_, PodMap<P>> {
        self.pods.lock().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pod_sweeps_exclude_concurrent_inserts() {
        let pods: Arc<PodRegistry<u32>> = Arc::default();
        pods.lock().await.insert("pod-a".to_string(), 1);

        let sweep = {
            let pods = pods.clone();
            tokio::spawn(async move {
                let mut guard = pods.lock().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let seen: Vec<String> = guard.keys().cloned().collect();
                guard.clear();
                seen
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        pods.lock().await.insert("pod-b".to_string(), 2);

        assert_eq!(sweep.await.unwrap(), ["pod-a"]);
        let guard = pods.lock().await;
        assert_eq!(guard.keys().collect::<Vec<_>>(), ["pod-b"]);
    }

    #[test]
    fn empty_vm_registry() {
        let vms = VmRegistry::default();
        assert!(vms.is_empty());
        assert!(vms.get("vm-x").is_none());
        assert!(vms.remove("vm-x").is_none());
        assert!(!vms.contains("vm-x"));
    }
}
