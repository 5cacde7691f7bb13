// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the connection tracker and the flow-offload
//! engine.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cmd;
pub mod ct;
pub mod error;
pub mod ip;

pub use cmd::*;
pub use ct::*;
pub use error::*;
pub use ip::*;

/// The overall version of the API. Anytime an API is added, removed,
/// or modified, this number should increment.
pub const API_VERSION: u64 = 1;
