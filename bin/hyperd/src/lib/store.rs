// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon's ordered key-value store.
//!
//! Keys are strings, values opaque bytes. Pods, their container lists,
//! the VM each pod runs in and that VM's persisted record all live here so
//! a restarted daemon can find them again.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store entry {0:?}")]
    BadEntry(String),
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

pub const POD_PREFIX: &str = "pod-";
pub const POD_CONTAINER_PREFIX: &str = "pod-container-";

pub fn pod_key(pod_id: &str) -> String {
    format!("{}{}", POD_PREFIX, pod_id)
}

pub fn pod_containers_key(pod_id: &str) -> String {
    format!("{}{}", POD_CONTAINER_PREFIX, pod_id)
}

/// Container ids are stored, and migrated, as one `:`-joined string.
pub fn join_ids(ids: &[String]) -> String {
    ids.join(":")
}

pub fn split_ids(joined: &str) -> Vec<String> {
    joined
        .split(':')
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn vm_by_pod_key(pod_id: &str) -> String {
    format!("vm-pod-{}", pod_id)
}

pub fn vm_data_key(vm_id: &str) -> String {
    format!("vmdata-{}", vm_id)
}

/// One file per key under a directory. File names are the hex-encoded
/// keys, so any key is a valid name and directory order is key order.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(key)) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out = BTreeMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Leftovers of interrupted writes.
            if name.ends_with(".tmp") {
                continue;
            }
            let key = hex::decode(name)
                .ok()
                .and_then(|k| String::from_utf8(k).ok())
                .ok_or_else(|| StoreError::BadEntry(name.to_string()))?;
            if key.starts_with(prefix) {
                out.insert(key, std::fs::read(entry.path())?);
            }
        }
        Ok(out.into_iter().collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.map.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let map = self.map.lock().unwrap();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
