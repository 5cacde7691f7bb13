// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow-offload engine.
pub mod counter;
pub mod ct;
pub mod hw;
pub mod mapping;
pub mod modhdr;
pub mod offload;
pub mod pre_ct;
#[cfg(any(feature = "test-help", test))]
pub mod sim;
pub mod tracker;
pub mod tuple;
pub mod zone;

use ctoff_api::OffloadError;

pub type Result<T> = core::result::Result<T, OffloadError>;
