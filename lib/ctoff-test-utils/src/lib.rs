// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod pkt;

// Let's make our lives easier and pub use a bunch of stuff.
pub use ctoff::ExecCtx;
pub use ctoff::SlogLog;
pub use ctoff::api::AccountingMode;
pub use ctoff::api::CtAction;
pub use ctoff::api::CtCookie;
pub use ctoff::api::CtFlowReq;
pub use ctoff::api::CtLabels;
pub use ctoff::api::FlowRuleAttr;
pub use ctoff::api::NatRewrite;
pub use ctoff::api::OffloadError;
pub use ctoff::api::Protocol;
pub use ctoff::api::RestoreCookie;
pub use ctoff::api::Tuple;
pub use ctoff::engine::ct::CtCache;
pub use ctoff::engine::hw::Reg;
pub use ctoff::engine::modhdr::ModHdrAction;
pub use ctoff::engine::modhdr::reg_value;
pub use ctoff::engine::offload::CtOffload;
pub use ctoff::engine::offload::CtOffloadCfg;
pub use ctoff::engine::offload::CtRedirect;
pub use ctoff::engine::sim::SimHw;
pub use ctoff::engine::sim::SimLimits;
pub use ctoff::engine::sim::SimTracker;
pub use pkt::packet_for;

use slog::Drain;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// A logger printing to the test's stdout, filtered by `RUST_LOG`.
pub fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("unit" => "test"))
}

pub fn test_ectx() -> Arc<ExecCtx> {
    Arc::new(ExecCtx::new(Box::new(SlogLog::new(test_logger()))))
}

/// An offload engine bound to a simulated device and tracker.
pub struct Harness {
    pub sim: Arc<SimHw>,
    pub tracker: Arc<SimTracker>,
    pub ct: CtOffload,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cfg(CtOffloadCfg::default())
    }

    pub fn with_cfg(cfg: CtOffloadCfg) -> Self {
        Self::with_hw(cfg, SimHw::new())
    }

    pub fn with_hw(cfg: CtOffloadCfg, sim: SimHw) -> Self {
        let sim = Arc::new(sim);
        let tracker = Arc::new(SimTracker::new());
        let ct = CtOffload::new(cfg, sim.clone(), tracker.clone(), test_ectx())
            .expect("failed to create offload engine");
        Self { sim, tracker, ct }
    }

    /// Offload a rule on chain 1 sending traffic into `zone`.
    pub fn offload_zone(&self, rule_id: u64, zone: u16, nat: bool) -> CtRedirect {
        let attr = FlowRuleAttr::new(rule_id, 1, CtAction { zone, nat });
        self.ct.offload(&attr).expect("offload failed")
    }

    pub fn cache(&self, zone: u16) -> Arc<CtCache> {
        self.ct.zone_cache(zone).expect("zone has no context")
    }

    /// The zone-restore register value of `zone`.
    pub fn zone_id(&self, zone: u16) -> u32 {
        self.cache(zone).zone_id()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ip4(s: &str) -> Ipv4Addr {
    s.parse().expect("bad IPv4 address")
}

pub fn tcp4(src: (&str, u16), dst: (&str, u16), zone: u16) -> Tuple {
    Tuple::new_v4(Protocol::TCP, (ip4(src.0), src.1), (ip4(dst.0), dst.1), zone)
}

pub fn udp4(src: (&str, u16), dst: (&str, u16), zone: u16) -> Tuple {
    Tuple::new_v4(Protocol::UDP, (ip4(src.0), src.1), (ip4(dst.0), dst.1), zone)
}

/// A request for `tuple` with the restore cookie derived from the
/// cookie.
pub fn req(cookie: u64, tuple: Tuple) -> CtFlowReq {
    CtFlowReq::new(CtCookie(cookie), tuple, RestoreCookie(cookie << 8))
}

/// The client side of the canonical NAT'd connection in zone 1:
/// 10.0.0.1:5000 -> 10.0.0.2:80, source rewritten to 192.168.1.1:6000.
pub fn snat_req(cookie: u64) -> CtFlowReq {
    let mut r = req(cookie, tcp4(("10.0.0.1", 5000), ("10.0.0.2", 80), 1));
    r.nat = Some(NatRewrite {
        src_ip: Some("192.168.1.1".parse().expect("bad address")),
        src_port: Some(6000),
        ..Default::default()
    });
    r
}
