// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The interface to the software connection tracker.
//!
//! The tracker pushes events for the connections of a zone to the
//! listener registered for that zone. Each zone's [`CtCache`] is such
//! a listener.
//!
//! [`CtCache`]: super::ct::CtCache

use super::Result;
use ctoff_api::CtCookie;
use ctoff_api::CtFlowReq;
use ctoff_api::CtStats;
use std::sync::Arc;

/// Receives offload events for the connections of one zone.
pub trait CtEventListener: Send + Sync {
    /// A connection was created or its state changed.
    fn flow_add(&self, req: &CtFlowReq) -> Result<()>;

    /// The connection is gone.
    fn flow_del(&self, cookie: CtCookie) -> Result<()>;

    /// Report the traffic hardware has seen for the connection.
    fn flow_stats(&self, cookie: CtCookie) -> Result<CtStats>;
}

/// The tracker's registration surface.
pub trait CtTracker: Send + Sync {
    fn register(
        &self,
        zone: u16,
        listener: Arc<dyn CtEventListener>,
    ) -> Result<()>;

    /// Remove `listener` from `zone`. Only the exact listener passed
    /// in is removed.
    fn unregister(&self, zone: u16, listener: &Arc<dyn CtEventListener>);
}

/// Do two listener handles refer to the same object?
pub fn same_listener(
    a: &Arc<dyn CtEventListener>,
    b: &Arc<dyn CtEventListener>,
) -> bool {
    core::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
