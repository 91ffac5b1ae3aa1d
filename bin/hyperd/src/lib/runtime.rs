// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The container registry pods are built from.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad container record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid container id {0:?}")]
    BadId(String),
}

/// What the registry knows about a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContainerConfig {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn get_container_info(
        &self,
        id: &str,
    ) -> Result<Option<ContainerConfig>, RuntimeError>;

    /// Creates a new container from `image`.
    async fn create(
        &self,
        name: &str,
        image: &str,
    ) -> Result<ContainerConfig, RuntimeError>;

    /// Recreates a container that exists elsewhere, keeping its id.
    async fn restore(
        &self,
        name: &str,
        image: &str,
        id: &str,
    ) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Containers recorded as directories next to their root filesystems:
/// `<root>/<id>/config.json` and `<root>/<id>/rootfs`. Images are not
/// unpacked; a new container starts with an empty root filesystem.
#[derive(Debug)]
pub struct LocalRuntime {
    root: PathBuf,
}

impl LocalRuntime {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    fn dir(&self, id: &str) -> Result<PathBuf, RuntimeError> {
        if id.is_empty()
            || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(RuntimeError::BadId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    async fn write(
        &self,
        config: &ContainerConfig,
    ) -> Result<(), RuntimeError> {
        let dir = self.dir(&config.id)?;
        tokio::fs::create_dir_all(dir.join("rootfs")).await?;
        let raw = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(dir.join(CONFIG_FILE), raw).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    async fn get_container_info(
        &self,
        id: &str,
    ) -> Result<Option<ContainerConfig>, RuntimeError> {
        match tokio::fs::read(self.dir(id)?.join(CONFIG_FILE)).await {
            Ok(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
    ) -> Result<ContainerConfig, RuntimeError> {
        let config = ContainerConfig {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        };
        self.write(&config).await?;
        Ok(config)
    }

    async fn restore(
        &self,
        name: &str,
        image: &str,
        id: &str,
    ) -> Result<(), RuntimeError> {
        if self.get_container_info(id).await?.is_some() {
            return Ok(());
        }
        self.write(&ContainerConfig {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        match tokio::fs::remove_dir_all(self.dir(id)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
