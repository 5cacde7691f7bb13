// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload orchestrator.
//!
//! [`CtOffload`] owns the shared CT tables and the zone registry. The
//! rule compiler asks it to offload rules carrying a CT action: the
//! first such request for a rule resolves the rule's zone context and
//! returns the redirect the rule should use in place of its CT
//! action. Every control request is serialized on one mutex, which is
//! never taken by [`CtOffload::restore`].

use super::Result;
use super::counter::CounterPool;
use super::ct::CtCache;
use super::ct::CtShared;
use super::ct::TupleIndex;
use super::hw::HwBackend;
use super::hw::HwCtx;
use super::hw::HwTable;
use super::hw::Reg;
use super::hw::TableAttr;
use super::hw::TableId;
use super::mapping::IdMapping;
use super::mapping::MappedId;
use super::modhdr::ModHdrBuilder;
use super::modhdr::ModHdrProgram;
use super::tracker::CtTracker;
use super::tuple;
use super::zone::ZoneCtx;
use super::zone::ZoneRegistry;
use crate::ExecCtx;
use crate::LogLevel;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::kstat::KStatU64;
use crate::ddi::sync::KMutex;
use crate::ddi::taskq::TaskQ;
use ctoff_api::AccountingMode;
use ctoff_api::DumpCtEntriesResp;
use ctoff_api::FlowRuleAttr;
use ctoff_api::OffloadError;
use ctoff_api::RestoreCookie;
use itertools::Itertools;
use kstat_macro::KStatProvider;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

/// The pipeline level of the shared CT and CT NAT tables.
pub const CT_LEVEL: u32 = 2;

/// The pipeline level of the post-action table.
pub const POST_ACT_LEVEL: u32 = 3;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CtOffloadCfg {
    pub accounting: AccountingMode,
    /// The largest compressed zone id. Bounded by the zone-restore
    /// register.
    pub zone_id_max: u32,
    pub label_id_max: u32,
    /// The largest action-miss id. Bounded by its register.
    pub miss_id_max: u32,
    /// The number of entries, pending or valid, across all zones.
    pub max_entries: u32,
}

impl Default for CtOffloadCfg {
    fn default() -> Self {
        Self {
            accounting: AccountingMode::Shared,
            zone_id_max: Reg::ZoneRestore.max_val(),
            label_id_max: u32::from(u16::MAX),
            miss_id_max: Reg::ActMiss.max_val(),
            max_entries: 65536,
        }
    }
}

impl CtOffloadCfg {
    fn check_reg(name: &str, val: u32, reg: Reg) -> Result<()> {
        if val == 0 || val > reg.max_val() {
            return Err(OffloadError::BadConfig(format!(
                "{name} must be in 1..={} ({reg:?} register)",
                reg.max_val()
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Self::check_reg("zone_id_max", self.zone_id_max, Reg::ZoneRestore)?;
        Self::check_reg("label_id_max", self.label_id_max, Reg::Labels)?;
        Self::check_reg("miss_id_max", self.miss_id_max, Reg::ActMiss)?;
        if self.max_entries == 0 {
            return Err(OffloadError::BadConfig(
                "max_entries must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(KStatProvider)]
pub struct CtOffloadStats {
    /// Entries currently valid.
    pub offloaded: KStatU64,
    pub add_ok: KStatU64,
    /// Repeated adds and tuple collisions.
    pub add_dup: KStatU64,
    pub add_err: KStatU64,
    pub update_ok: KStatU64,
    pub update_err: KStatU64,
    pub del: KStatU64,
    pub stats_query: KStatU64,
    pub restore_hit: KStatU64,
    pub restore_drop: KStatU64,
    pub zones: KStatU64,
    /// Entries which took a reference on their reverse direction's
    /// counter.
    pub counters_shared: KStatU64,
}

/// The rule and chain to resume when a packet misses in the CT
/// tables.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ActMiss {
    pub chain: u32,
    pub rule_id: u64,
}

/// What an offloaded rule does in place of its CT action: write
/// `actions` and forward to `dest`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CtRedirect {
    pub dest: TableId,
    pub actions: ModHdrProgram,
}

struct CtFlow {
    redirect: CtRedirect,
    miss: MappedId<ActMiss>,
    zone: Arc<ZoneCtx>,
}

pub struct CtOffload {
    control: KMutex<BTreeMap<u64, CtFlow>>,
    zones: ZoneRegistry,
    miss_map: Arc<IdMapping<ActMiss>>,
    shared: Arc<CtShared>,
    taskq: TaskQ,
}

impl CtOffload {
    /// Create the shared tables and bind to `hw` and `tracker`.
    pub fn new(
        cfg: CtOffloadCfg,
        hw: Arc<dyn HwBackend>,
        tracker: Arc<dyn CtTracker>,
        ectx: Arc<ExecCtx>,
    ) -> Result<Self> {
        cfg.validate()?;
        let hw = HwCtx::new(hw, ectx);

        let post_act = HwTable::create(
            &hw,
            &TableAttr {
                name: "ct_post_act".to_string(),
                level: POST_ACT_LEVEL,
                max_rules: 0,
            },
        )?;
        let ct = HwTable::create(
            &hw,
            &TableAttr {
                name: "ct".to_string(),
                level: CT_LEVEL,
                max_rules: cfg.max_entries,
            },
        )?;
        let ct_nat = HwTable::create(
            &hw,
            &TableAttr {
                name: "ct_nat".to_string(),
                level: CT_LEVEL,
                max_rules: cfg.max_entries,
            },
        )?;

        let taskq = TaskQ::new("ctoff_taskq").map_err(|e| {
            OffloadError::Hardware(format!("failed to start task queue: {e}"))
        })?;
        let stats =
            KStatNamed::new("ctoff", "ct_offload", CtOffloadStats::new())
                .map_err(|e| OffloadError::BadConfig(e.to_string()))?;

        let shared = Arc::new(CtShared {
            zone_map: IdMapping::new("zone ids", cfg.zone_id_max),
            label_map: IdMapping::new("ct labels", cfg.label_id_max),
            tuples: KMutex::new(TupleIndex::default()),
            counters: CounterPool::new(hw.clone()),
            taskq: taskq.handle(),
            stats,
            entries: AtomicU32::new(0),
            hw,
            cfg,
            ct,
            ct_nat,
            post_act,
        });

        let miss_map = IdMapping::new("act miss ids", shared.cfg.miss_id_max);
        shared.log(
            LogLevel::Note,
            &format!(
                "ct offload ready: accounting {:?}, {} entries",
                shared.cfg.accounting, shared.cfg.max_entries
            ),
        );

        Ok(Self {
            control: KMutex::new(BTreeMap::new()),
            zones: ZoneRegistry::new(shared.clone(), tracker),
            miss_map,
            shared,
            taskq,
        })
    }

    /// Offload a rule carrying a CT action, returning the redirect to
    /// install in its place. Repeating the request for an offloaded
    /// rule returns the same redirect.
    pub fn offload(&self, attr: &FlowRuleAttr) -> Result<CtRedirect> {
        let Some(ct) = attr.ct else {
            return Err(OffloadError::Unsupported(format!(
                "rule {} has no CT action",
                attr.id
            )));
        };

        let mut control = self.control.lock();
        if let Some(flow) = control.get(&attr.id) {
            return Ok(flow.redirect.clone());
        }

        let zone = self.zones.get_or_create(ct.zone)?;
        let miss = self
            .miss_map
            .acquire(ActMiss { chain: attr.chain, rule_id: attr.id })?;

        // Chain 0 has not been classified into a zone yet and goes
        // straight to the CT tables; other chains dispatch through the
        // zone's pre-CT table.
        let mut b = ModHdrBuilder::new();
        let dest = if attr.chain == 0 {
            b.set_reg(Reg::Zone, zone.zone_id())?;
            if ct.nat { self.shared.ct_nat.id() } else { self.shared.ct.id() }
        } else {
            b.set_reg(Reg::Zone, u32::from(ct.zone))?;
            zone.pre_ct(ct.nat).table_id()
        };
        b.set_reg(Reg::ActMiss, miss.id())?;

        let redirect = CtRedirect { dest, actions: b.finish() };
        control.insert(attr.id, CtFlow { redirect: redirect.clone(), miss, zone });
        Ok(redirect)
    }

    /// Undo [`CtOffload::offload`]. Releasing the last rule of a zone
    /// tears down the zone context.
    pub fn deoffload(&self, attr: &FlowRuleAttr) -> Result<()> {
        let mut control = self.control.lock();
        let flow = control.remove(&attr.id).ok_or(OffloadError::NotFound)?;
        drop(flow);
        Ok(())
    }

    pub fn is_offload_done(&self, attr: &FlowRuleAttr) -> bool {
        self.control.lock().contains_key(&attr.id)
    }

    /// The action-miss id assigned to an offloaded rule.
    pub fn miss_id(&self, rule_id: u64) -> Option<u32> {
        self.control.lock().get(&rule_id).map(|f| f.miss.id())
    }

    /// The zone an offloaded rule sends traffic into.
    pub fn rule_zone(&self, rule_id: u64) -> Option<u16> {
        self.control.lock().get(&rule_id).map(|f| f.zone.zone())
    }

    /// Map an action-miss register value back to the rule to resume.
    pub fn miss_cookie(&self, id: u32) -> Option<ActMiss> {
        self.miss_map.find_value(id)
    }

    /// Find the restore cookie for a packet which missed after the CT
    /// tables. `zone_restore` is the value of the zone-restore
    /// register.
    ///
    /// This never blocks on the control lock or on hardware: a hit
    /// whose entry is deleted meanwhile is torn down on the task
    /// queue. Misses are counted, never reported as errors.
    pub fn restore(
        &self,
        pkt: &[u8],
        zone_restore: u32,
    ) -> Option<RestoreCookie> {
        let Some(zone) = self.shared.zone_map.find_value(zone_restore) else {
            self.restore_miss(zone_restore, pkt, "unknown zone");
            return None;
        };

        let Some(tuple) = tuple::tuple_from_packet(pkt, zone) else {
            self.restore_miss(zone_restore, pkt, "unparsable packet");
            return None;
        };

        let entry = self.shared.tuples.lock().lookup_valid(&tuple);
        let Some(entry) = entry else {
            self.restore_miss(zone_restore, pkt, "no entry");
            return None;
        };

        if entry.zone_id() != zone_restore {
            self.shared.log(
                LogLevel::Warn,
                &format!(
                    "entry {} has zone id {}, packet carried {zone_restore}",
                    entry.cookie(),
                    entry.zone_id()
                ),
            );
            self.shared.release_deferred(entry);
            self.restore_miss(zone_restore, pkt, "zone mismatch");
            return None;
        }

        let cookie = entry.restore_cookie();
        self.shared.stats().restore_hit.incr(1);
        self.shared.release_deferred(entry);
        Some(cookie)
    }

    fn restore_miss(&self, zone_restore: u32, pkt: &[u8], reason: &str) {
        self.shared.stats().restore_drop.incr(1);
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let pkt_len = pkt.len() as u64;
                crate::ctoff_provider::ct__restore__miss!(
                    || (zone_restore, pkt_len, reason)
                );
            } else {
                let (_, _, _) = (zone_restore, pkt, reason);
            }
        }
    }

    /// Every entry of every zone, by zone and cookie.
    pub fn dump(&self) -> DumpCtEntriesResp {
        let entries = self
            .zones
            .caches()
            .iter()
            .flat_map(|c| c.dump())
            .sorted_by_key(|e| (e.zone, e.cookie))
            .collect();
        DumpCtEntriesResp { entries }
    }

    pub fn stats_snap(&self) -> CtOffloadStatsSnap {
        self.shared.stats().snapshot()
    }

    /// The context of `zone`. Holding it past the zone's last
    /// `deoffload` moves the teardown out from under the control lock.
    #[cfg(any(feature = "test-help", test))]
    pub fn zone(&self, zone: u16) -> Option<Arc<ZoneCtx>> {
        self.zones.get(zone)
    }

    pub fn zone_cache(&self, zone: u16) -> Option<Arc<CtCache>> {
        self.zones.cache(zone)
    }

    pub fn num_zones(&self) -> usize {
        self.zones.len()
    }

    /// The number of (plain, NAT) tuple index slots.
    pub fn tuple_index_len(&self) -> (usize, usize) {
        self.shared.tuples.lock().len()
    }

    pub fn cfg(&self) -> &CtOffloadCfg {
        &self.shared.cfg
    }

    /// Wait for all deferred teardown queued so far.
    pub fn flush(&self) {
        self.taskq.flush();
    }
}

impl Drop for CtOffload {
    fn drop(&mut self) {
        let flows = core::mem::take(&mut *self.control.lock());
        drop(flows);
        self.taskq.flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_cfg_is_valid() {
        assert_eq!(CtOffloadCfg::default().validate(), Ok(()));
    }

    #[test]
    fn cfg_bounded_by_registers() {
        let cfg = CtOffloadCfg { zone_id_max: 256, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(OffloadError::BadConfig(_))));

        let cfg = CtOffloadCfg { miss_id_max: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(OffloadError::BadConfig(_))));

        let cfg = CtOffloadCfg { max_entries: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(OffloadError::BadConfig(_))));
    }

    #[test]
    fn last_restore_reference_tears_down_on_taskq() {
        use crate::PrintlnLog;
        use crate::engine::sim::SimHw;
        use crate::engine::sim::SimTracker;
        use ctoff_api::CtAction;
        use ctoff_api::CtCookie;
        use ctoff_api::CtFlowReq;
        use ctoff_api::Protocol;
        use ctoff_api::Tuple;
        use std::net::Ipv4Addr;

        let sim = Arc::new(SimHw::new());
        let tracker = Arc::new(SimTracker::new());
        let ectx = Arc::new(ExecCtx::new(Box::new(PrintlnLog)));
        let ct = CtOffload::new(
            CtOffloadCfg::default(),
            sim.clone(),
            tracker.clone(),
            ectx,
        )
        .unwrap();
        ct.offload(&FlowRuleAttr::new(1, 1, CtAction { zone: 3, nat: false }))
            .unwrap();

        let tuple = Tuple::new_v4(
            Protocol::TCP,
            (Ipv4Addr::new(10, 0, 0, 1), 1234),
            (Ipv4Addr::new(10, 0, 0, 2), 80),
            3,
        );
        let cookie = CtCookie(9);
        tracker.add(&CtFlowReq::new(cookie, tuple, RestoreCookie(9))).unwrap();

        let cache = ct.zone_cache(3).unwrap();
        let held = cache.get(cookie).unwrap();
        cache.del(cookie).unwrap();
        assert_eq!(sim.num_counters(), 1);

        ct.shared.release_deferred(held);
        ct.flush();
        assert_eq!(sim.num_counters(), 0);
        assert_eq!(ct.tuple_index_len(), (0, 0));
    }

    #[test]
    fn stats_snapshot_names() {
        let stats = KStatNamed::new("ctoff", "t", CtOffloadStats::new()).unwrap();
        stats.vals.add_ok.incr(2);
        stats.vals.offloaded.incr(1);
        stats.vals.offloaded.decr(1);
        let snap = stats.vals.snapshot();
        assert_eq!(snap.add_ok, 2);
        assert_eq!(snap.offloaded, 0);
    }
}
