// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exchanged with hyperd callers: the user-level pod
//! specification and the structured result every VM operation reports.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod pod;

pub use pod::{
    PodSpecError, UserContainer, UserEnvironmentVar, UserInterface, UserPod,
    UserResource, UserVolume, UserVolumeReference,
};

/// Numeric outcome of a VM operation.
///
/// Callers branch on these codes; in particular `VmShutdown` ("the VM was
/// already gone") is distinct from `Failed` ("the operation did not work").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    VmRunning = 1,
    VmShutdown = 2,
    PodRunning = 3,
    PodFinished = 4,
    BadRequest = 5,
    Failed = 6,
    ExecFinished = 7,
    Unexpected = 8,
    Busy = 9,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the code represents a successful outcome for the request that
    /// produced it.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultCode::Ok
                | ResultCode::VmRunning
                | ResultCode::VmShutdown
                | ResultCode::PodRunning
                | ResultCode::PodFinished
                | ResultCode::ExecFinished
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Ok => "ok",
            ResultCode::VmRunning => "vm running",
            ResultCode::VmShutdown => "vm shut down",
            ResultCode::PodRunning => "pod running",
            ResultCode::PodFinished => "pod finished",
            ResultCode::BadRequest => "bad request",
            ResultCode::Failed => "failed",
            ResultCode::ExecFinished => "exec finished",
            ResultCode::Unexpected => "unexpected",
            ResultCode::Busy => "busy",
        };
        write!(f, "{} ({})", s, self.code())
    }
}

/// The structured result of a VM operation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmResponse {
    pub vm_id: String,
    pub code: ResultCode,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl VmResponse {
    pub fn new(
        vm_id: impl Into<String>,
        code: ResultCode,
        cause: impl Into<String>,
    ) -> Self {
        Self { vm_id: vm_id.into(), code, cause: cause.into(), data: None }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

impl fmt::Display for VmResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm {}: {}", self.vm_id, self.code)?;
        if !self.cause.is_empty() {
            write!(f, ": {}", self.cause)?;
        }
        Ok(())
    }
}
