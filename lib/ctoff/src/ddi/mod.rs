// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Kernel-style service abstractions: locks, stats, time, and a
//! deferred work queue.
pub mod kstat;
pub mod sync;
pub mod taskq;
pub mod time;
