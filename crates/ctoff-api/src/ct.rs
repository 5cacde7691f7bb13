// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection-tracker facing types.

use super::ip::NatRewrite;
use super::ip::Tuple;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The connection tracker's opaque identity of one direction of a
/// connection.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct CtCookie(pub u64);

impl Display for CtCookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque value handed back to the tracker so software can resume
/// processing after a partial hardware pass.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct RestoreCookie(pub u64);

impl Display for RestoreCookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The 128-bit label set on a connection by policy.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct CtLabels(pub [u32; 4]);

impl CtLabels {
    pub const ZERO: Self = Self([0; 4]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }
}

/// How a connection's traffic is counted in hardware.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum AccountingMode {
    /// Each direction gets its own counter.
    PerConnection,

    /// Both directions of a connection share one counter.
    #[default]
    Shared,
}

/// A request from the tracker to offload one connection direction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CtFlowReq {
    pub cookie: CtCookie,
    pub tuple: Tuple,
    /// Rewrites for a NAT'd direction. When present the entry is
    /// matched on the post-NAT side of the pipeline.
    pub nat: Option<NatRewrite>,
    pub restore_cookie: RestoreCookie,
    pub established: bool,
    pub reply: bool,
    pub mark: u32,
    pub labels: CtLabels,
    /// Force per-direction accounting for this entry regardless of
    /// the configured mode.
    pub accounting: Option<AccountingMode>,
}

impl CtFlowReq {
    pub fn new(cookie: CtCookie, tuple: Tuple, restore: RestoreCookie) -> Self {
        Self {
            cookie,
            tuple,
            nat: None,
            restore_cookie: restore,
            established: true,
            reply: false,
            mark: 0,
            labels: CtLabels::ZERO,
            accounting: None,
        }
    }

    pub fn has_nat(&self) -> bool {
        self.nat.is_some_and(|n| !n.is_empty())
    }
}

/// Traffic seen by hardware for one entry.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct CtStats {
    pub bytes: u64,
    pub packets: u64,
    /// Milliseconds since an arbitrary epoch of the last hit.
    pub last_used: u64,
}

/// Result code reported to the tracker for each request.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CtStatus {
    Ok,
    Duplicate,
    NotFound,
    Unsupported,
    Failed,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ip::Protocol;

    #[test]
    fn empty_nat_is_not_nat() {
        let t = Tuple::new_v4(
            Protocol::TCP,
            ("10.0.0.1".parse().unwrap(), 1),
            ("10.0.0.2".parse().unwrap(), 2),
            0,
        );
        let mut req = CtFlowReq::new(CtCookie(1), t, RestoreCookie(9));
        assert!(!req.has_nat());
        req.nat = Some(NatRewrite::default());
        assert!(!req.has_nat());
        req.nat = Some(NatRewrite {
            src_port: Some(4000),
            ..Default::default()
        });
        assert!(req.has_nat());
    }
}
