// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container root filesystems and pod volumes.
//!
//! A [`Storage`] backend turns container ids and volume declarations into
//! the [`ContainerInfo`] and [`VolumeInfo`] a VM consumes. [`DirStorage`]
//! keeps everything as host directories and exposes them to the guest by
//! bind-mounting them under the VM's share directory.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use hyperd_api_types::UserVolume;
use thiserror::Error;

use crate::vm::devices::{ContainerInfo, VolumeInfo, FSTYPE_DIR};

const CONTAINERS_DIR: &str = "containers";
const VOLUMES_DIR: &str = "volumes";
const ROOTFS_DIR: &str = "rootfs";
const DEFAULT_VOLUME_FSTYPE: &str = "ext4";
const VFS_DRIVER: &str = "vfs";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown container {0}")]
    UnknownContainer(String),

    #[error("cannot mount {src} at {dst}: {err}")]
    Mount { src: PathBuf, dst: PathBuf, err: std::io::Error },

    #[error("invalid path {0:?}")]
    InvalidPath(String),

    #[error("volume {0} has no source")]
    NoSource(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn kind(&self) -> &'static str;
    fn root_path(&self) -> &Path;

    /// Makes container `id`'s root filesystem available to a VM whose
    /// share directory is `share_dir`.
    async fn prepare_container(
        &self,
        id: &str,
        share_dir: &Path,
    ) -> Result<ContainerInfo, StorageError>;

    /// Creates an empty volume for a pod volume declared without a source.
    async fn create_volume(
        &self,
        pod_id: &str,
        name: &str,
    ) -> Result<VolumeInfo, StorageError>;

    async fn remove_volume(
        &self,
        pod_id: &str,
        name: &str,
    ) -> Result<(), StorageError>;

    /// Writes `data` to `target` inside container `container_id`'s root
    /// filesystem.
    async fn inject_file(
        &self,
        container_id: &str,
        target: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), StorageError>;
}

fn bind_mount(src: &Path, dst: &Path) -> Result<(), StorageError> {
    let mount_err = |err| StorageError::Mount {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        err,
    };
    let c_src = CString::new(src.as_os_str().as_bytes())
        .map_err(|_| StorageError::InvalidPath(src.display().to_string()))?;
    let c_dst = CString::new(dst.as_os_str().as_bytes())
        .map_err(|_| StorageError::InvalidPath(dst.display().to_string()))?;
    // Safety: both paths are valid NUL-terminated strings that outlive the
    // call; a bind mount ignores the fstype and data arguments.
    let res = unsafe {
        libc::mount(
            c_src.as_ptr(),
            c_dst.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if res < 0 {
        return Err(mount_err(std::io::Error::last_os_error()));
    }
    Ok(())
}

async fn bind_mount_dir(
    src: PathBuf,
    dst: PathBuf,
) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(&dst).await?;
    tokio::task::spawn_blocking(move || bind_mount(&src, &dst))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

/// Name of a directory volume inside the share directory.
fn shared_volume_name(name: &str) -> String {
    format!("vol-{}", name)
}

/// Rejects paths that would escape the directory they are joined to.
fn relative(target: &str) -> Result<PathBuf, StorageError> {
    let path = Path::new(target.trim_start_matches('/'));
    if path.as_os_str().is_empty()
        || path.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidPath(target.to_string()));
    }
    Ok(path.to_path_buf())
}

/// Describes a pod volume that names an existing source.
pub fn inspect_existing_volume(
    vol: &UserVolume,
) -> Result<VolumeInfo, StorageError> {
    if vol.source.is_empty() {
        return Err(StorageError::NoSource(vol.name.clone()));
    }
    let info = if vol.driver == VFS_DRIVER {
        VolumeInfo {
            name: vol.name.clone(),
            filepath: vol.source.clone(),
            fstype: FSTYPE_DIR.to_string(),
            ..Default::default()
        }
    } else {
        VolumeInfo {
            name: vol.name.clone(),
            filepath: vol.source.clone(),
            fstype: DEFAULT_VOLUME_FSTYPE.to_string(),
            format: if vol.driver.is_empty() {
                "raw".to_string()
            } else {
                vol.driver.clone()
            },
            ..Default::default()
        }
    };
    Ok(info)
}

/// Exposes a directory volume under `share_dir`, rewriting its path to the
/// share-relative name the guest mounts. Block volumes pass through.
pub async fn share_volume(
    mut vol: VolumeInfo,
    share_dir: &Path,
) -> Result<VolumeInfo, StorageError> {
    if vol.fstype != FSTYPE_DIR {
        return Ok(vol);
    }
    let name = shared_volume_name(&vol.name);
    bind_mount_dir(PathBuf::from(&vol.filepath), share_dir.join(&name)).await?;
    vol.filepath = name;
    Ok(vol)
}

/// Directory-backed storage rooted at `<root>`:
///
/// ```text
/// <root>/containers/<id>/rootfs
/// <root>/volumes/<pod id>/<volume>
/// ```
#[derive(Debug)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root.join(CONTAINERS_DIR))?;
        std::fs::create_dir_all(root.join(VOLUMES_DIR))?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn rootfs(&self, id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(CONTAINERS_DIR).join(relative(id)?).join(ROOTFS_DIR))
    }

    fn volume_dir(
        &self,
        pod_id: &str,
        name: &str,
    ) -> Result<PathBuf, StorageError> {
        Ok(self
            .root
            .join(VOLUMES_DIR)
            .join(relative(pod_id)?)
            .join(relative(name)?))
    }
}

#[async_trait]
impl Storage for DirStorage {
    fn kind(&self) -> &'static str {
        "dir"
    }

    fn root_path(&self) -> &Path {
        &self.root
    }

    async fn prepare_container(
        &self,
        id: &str,
        share_dir: &Path,
    ) -> Result<ContainerInfo, StorageError> {
        let rootfs = self.rootfs(id)?;
        if !tokio::fs::try_exists(&rootfs).await? {
            return Err(StorageError::UnknownContainer(id.to_string()));
        }
        bind_mount_dir(rootfs, share_dir.join(id).join(ROOTFS_DIR)).await?;
        Ok(ContainerInfo {
            id: id.to_string(),
            mount_id: id.to_string(),
            rootfs: ROOTFS_DIR.to_string(),
            image: id.to_string(),
            fstype: FSTYPE_DIR.to_string(),
            ..Default::default()
        })
    }

    async fn create_volume(
        &self,
        pod_id: &str,
        name: &str,
    ) -> Result<VolumeInfo, StorageError> {
        let dir = self.volume_dir(pod_id, name)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(VolumeInfo {
            name: name.to_string(),
            filepath: dir.display().to_string(),
            fstype: FSTYPE_DIR.to_string(),
            ..Default::default()
        })
    }

    async fn remove_volume(
        &self,
        pod_id: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.volume_dir(pod_id, name)?).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn inject_file(
        &self,
        container_id: &str,
        target: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), StorageError> {
        let rootfs = self.rootfs(container_id)?;
        if !tokio::fs::try_exists(&rootfs).await? {
            return Err(StorageError::UnknownContainer(
                container_id.to_string(),
            ));
        }
        let path = rootfs.join(relative(target)?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(&path, perms).await?;
        Ok(())
    }
}
