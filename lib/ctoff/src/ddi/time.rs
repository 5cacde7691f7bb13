// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments.

use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
#[derive(Clone, Copy, Debug)]
pub struct Moment {
    inner: Instant,
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. A moment before `earlier` yields zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}
