// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pod metadata hand-off between a migration source and destination.
//!
//! Before the hypervisors exchange guest state, the source tells the
//! destination which pod is coming. The metadata is three blobs, each sent
//! over its own TCP connection and terminated by the sender closing it:
//!
//! 1. the pod id,
//! 2. the pod's arguments (its JSON specification),
//! 3. the pod's container ids, joined with `:`.
//!
//! The destination accepts the three connections strictly in that order on
//! the same address it will later hand to the hypervisor for the incoming
//! guest.

use std::net::SocketAddr;
use std::time::Duration;

use slog::{debug, info, Logger};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::store::{join_ids, split_ids};

/// The destination may not be listening yet when the source starts.
const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

const MAX_BLOB_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migration transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot connect to migration destination {addr}: {err}")]
    Connect { addr: SocketAddr, err: std::io::Error },

    #[error("migration {0} is not valid UTF-8")]
    Utf8(&'static str),

    #[error("migration {0} exceeds 16 MiB")]
    TooLarge(&'static str),

    #[error("migration metadata carries no pod id")]
    EmptyPodId,
}

/// What the destination needs to know to recreate a migrating pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub pod_id: String,
    pub pod_args: Vec<u8>,
    pub container_ids: Vec<String>,
}

async fn connect(dest: SocketAddr) -> Result<TcpStream, MigrateError> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(dest).await {
            Ok(conn) => return Ok(conn),
            Err(err) if attempt >= CONNECT_ATTEMPTS => {
                return Err(MigrateError::Connect { addr: dest, err });
            }
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

async fn send_blob(dest: SocketAddr, data: &[u8]) -> Result<(), MigrateError> {
    let mut conn = connect(dest).await?;
    conn.write_all(data).await?;
    conn.shutdown().await?;
    Ok(())
}

async fn receive_blob(
    listener: &TcpListener,
    what: &'static str,
) -> Result<Vec<u8>, MigrateError> {
    let (conn, _) = listener.accept().await?;
    let mut buf = Vec::new();
    conn.take(MAX_BLOB_LEN + 1).read_to_end(&mut buf).await?;
    if buf.len() as u64 > MAX_BLOB_LEN {
        return Err(MigrateError::TooLarge(what));
    }
    Ok(buf)
}

/// Sends a pod's metadata to a destination started with `hyperd listen`.
pub async fn send_metadata(
    log: &Logger,
    dest: SocketAddr,
    meta: &Metadata,
) -> Result<(), MigrateError> {
    info!(log, "sending pod metadata"; "dest" => %dest, "pod" => &meta.pod_id);
    send_blob(dest, meta.pod_id.as_bytes()).await?;
    send_blob(dest, &meta.pod_args).await?;
    send_blob(dest, join_ids(&meta.container_ids).as_bytes()).await?;
    Ok(())
}

/// Receives a pod's metadata from a migration source.
pub async fn receive_metadata(
    log: &Logger,
    listener: &TcpListener,
) -> Result<Metadata, MigrateError> {
    let pod_id = String::from_utf8(receive_blob(listener, "pod id").await?)
        .map_err(|_| MigrateError::Utf8("pod id"))?;
    if pod_id.is_empty() {
        return Err(MigrateError::EmptyPodId);
    }
    debug!(log, "received pod id"; "pod" => &pod_id);
    let pod_args = receive_blob(listener, "pod arguments").await?;
    let ids = String::from_utf8(receive_blob(listener, "container ids").await?)
        .map_err(|_| MigrateError::Utf8("container ids"))?;
    let meta = Metadata { pod_id, pod_args, container_ids: split_ids(&ids) };
    info!(log, "received pod metadata";
        "pod" => &meta.pod_id,
        "containers" => meta.container_ids.len());
    Ok(meta)
}
