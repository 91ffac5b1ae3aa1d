// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod daemon;
pub mod driver;
pub mod migrate;
pub mod network;
pub mod qmp;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod vm;
