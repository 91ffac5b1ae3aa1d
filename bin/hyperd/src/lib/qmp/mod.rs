// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane plumbing for a QEMU monitor (QMP) socket.
//!
//! - [`codec`] frames and classifies monitor traffic.
//! - [`session`] owns the socket and runs multi-step command sessions, one
//!   at a time, converting their outcomes into hub events.
//! - [`devices`] builds the sessions that hot-plug and unplug disks and
//!   NICs.

use thiserror::Error;

pub mod codec;
pub mod devices;
mod scm;
pub mod session;

pub use codec::{QmpCommand, QmpErrorDesc, QmpEvent, QmpMessage};
pub use session::{
    QmpHandle, QmpParams, QmpReceiver, QmpSession, SessionError, SessionResult,
};

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("monitor command failed: {0}")]
    Command(QmpErrorDesc),

    #[error("monitor connection closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error("I/O error on monitor socket: {0}")]
    Io(#[from] std::io::Error),
}
