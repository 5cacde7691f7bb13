// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! In-memory stand-ins for the hardware backend and the connection
//! tracker.
//!
//! [`SimHw`] checks what a real device would refuse: forwarding to a
//! table of the same or a lower level, rules matching fields their
//! group does not declare, references to objects which do not exist,
//! and freeing objects which are still referenced.

use super::Result;
use super::hw::CounterData;
use super::hw::CounterId;
use super::hw::GroupId;
use super::hw::HwBackend;
use super::hw::HwError;
use super::hw::MatchFields;
use super::hw::ModHdrId;
use super::hw::RuleId;
use super::hw::RuleSpec;
use super::hw::TableAttr;
use super::hw::TableId;
use super::modhdr::ModHdrProgram;
use super::tracker::CtEventListener;
use super::tracker::CtTracker;
use super::tracker::same_listener;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use ctoff_api::CtCookie;
use ctoff_api::CtFlowReq;
use ctoff_api::CtStats;
use ctoff_api::OffloadError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Object limits of a [`SimHw`].
#[derive(Clone, Copy, Debug)]
pub struct SimLimits {
    pub tables: usize,
    pub rules: usize,
    pub counters: usize,
    pub mod_hdrs: usize,
}

impl Default for SimLimits {
    fn default() -> Self {
        Self { tables: 1024, rules: 1 << 20, counters: 1 << 20, mod_hdrs: 1 << 20 }
    }
}

struct SimGroup {
    criteria: MatchFields,
    size: u32,
}

struct SimTable {
    attr: TableAttr,
    groups: BTreeMap<GroupId, SimGroup>,
}

struct SimRule {
    table: TableId,
    group: Option<GroupId>,
    spec: RuleSpec,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    limits: SimLimits,
    tables: BTreeMap<TableId, SimTable>,
    rules: BTreeMap<RuleId, SimRule>,
    counters: BTreeMap<CounterId, CounterData>,
    mod_hdrs: BTreeMap<ModHdrId, ModHdrProgram>,
    // Fail the add_rule call this many calls from now.
    fail_add_rule: Option<u64>,
    fail_mod_hdr: bool,
}

impl SimState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_spec(
        &self,
        table: TableId,
        group: Option<GroupId>,
        spec: &RuleSpec,
    ) -> core::result::Result<(), HwError> {
        let src = self.tables.get(&table).ok_or(HwError::NoEntry)?;
        let dst = self.tables.get(&spec.dest).ok_or(HwError::NoEntry)?;
        if dst.attr.level <= src.attr.level {
            return Err(HwError::Unsupported(format!(
                "{} (level {}) cannot forward to {} (level {})",
                src.attr.name, src.attr.level, dst.attr.name, dst.attr.level
            )));
        }

        if let Some(gid) = group {
            let grp = src.groups.get(&gid).ok_or(HwError::NoEntry)?;
            if !grp.criteria.contains(spec.matches.fields()) {
                return Err(HwError::Unsupported(format!(
                    "group {gid:?} does not match on {:?}",
                    spec.matches.fields() - grp.criteria
                )));
            }
        }

        if let Some(m) = spec.mod_hdr {
            if !self.mod_hdrs.contains_key(&m) {
                return Err(HwError::NoEntry);
            }
        }
        if let Some(c) = spec.counter {
            if !self.counters.contains_key(&c) {
                return Err(HwError::NoEntry);
            }
        }
        Ok(())
    }

    fn rules_in(&self, table: TableId) -> usize {
        self.rules.values().filter(|r| r.table == table).count()
    }
}

/// A simulated flow-table device.
#[derive(Default)]
pub struct SimHw {
    state: KMutex<SimState>,
    epoch: Moment,
}

impl SimHw {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: SimLimits) -> Self {
        let sim = Self::default();
        sim.state.lock().limits = limits;
        sim
    }

    /// Fail the `n`th `add_rule` call from now; 1 is the next one.
    pub fn fail_add_rule(&self, n: u64) {
        self.state.lock().fail_add_rule = Some(n);
    }

    /// Fail the next header-rewrite allocation.
    pub fn fail_next_mod_hdr(&self) {
        self.state.lock().fail_mod_hdr = true;
    }

    /// Pretend the device counted traffic against `id`.
    pub fn set_counter(&self, id: CounterId, bytes: u64, packets: u64) {
        let last_used = Moment::now().delta_as_millis(self.epoch);
        if let Some(c) = self.state.lock().counters.get_mut(&id) {
            *c = CounterData { bytes, packets, last_used };
        }
    }

    pub fn num_tables(&self) -> usize {
        self.state.lock().tables.len()
    }

    pub fn num_groups(&self) -> usize {
        self.state.lock().tables.values().map(|t| t.groups.len()).sum()
    }

    pub fn num_rules(&self) -> usize {
        self.state.lock().rules.len()
    }

    pub fn num_counters(&self) -> usize {
        self.state.lock().counters.len()
    }

    pub fn num_mod_hdrs(&self) -> usize {
        self.state.lock().mod_hdrs.len()
    }

    pub fn rules_in(&self, table: TableId) -> usize {
        self.state.lock().rules_in(table)
    }

    /// The specs of every rule in `table`.
    pub fn rule_specs(&self, table: TableId) -> Vec<RuleSpec> {
        self.state
            .lock()
            .rules
            .values()
            .filter(|r| r.table == table)
            .map(|r| r.spec.clone())
            .collect()
    }

    pub fn rule(&self, id: RuleId) -> Option<RuleSpec> {
        self.state.lock().rules.get(&id).map(|r| r.spec.clone())
    }

    pub fn mod_hdr(&self, id: ModHdrId) -> Option<ModHdrProgram> {
        self.state.lock().mod_hdrs.get(&id).cloned()
    }

    /// The id of the first table named `name`.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.state
            .lock()
            .tables
            .iter()
            .find(|(_, t)| t.attr.name == name)
            .map(|(id, _)| *id)
    }

    pub fn table_name(&self, id: TableId) -> Option<String> {
        self.state.lock().tables.get(&id).map(|t| t.attr.name.clone())
    }
}

impl HwBackend for SimHw {
    fn create_table(&self, attr: &TableAttr) -> core::result::Result<TableId, HwError> {
        let mut state = self.state.lock();
        if state.tables.len() >= state.limits.tables {
            return Err(HwError::NoSpace {
                resource: "tables",
                limit: state.limits.tables as u64,
            });
        }
        let id = TableId(state.next() as u32);
        state
            .tables
            .insert(id, SimTable { attr: attr.clone(), groups: BTreeMap::new() });
        Ok(id)
    }

    fn destroy_table(&self, table: TableId) -> core::result::Result<(), HwError> {
        let mut state = self.state.lock();
        let t = state.tables.get(&table).ok_or(HwError::NoEntry)?;
        let forwarded_to = state.rules.values().any(|r| r.spec.dest == table);
        if !t.groups.is_empty() || state.rules_in(table) > 0 || forwarded_to {
            return Err(HwError::Busy);
        }
        state.tables.remove(&table);
        Ok(())
    }

    fn create_group(
        &self,
        table: TableId,
        criteria: MatchFields,
        size: u32,
    ) -> core::result::Result<GroupId, HwError> {
        let mut state = self.state.lock();
        let id = GroupId(state.next() as u32);
        let t = state.tables.get_mut(&table).ok_or(HwError::NoEntry)?;
        t.groups.insert(id, SimGroup { criteria, size });
        Ok(id)
    }

    fn destroy_group(
        &self,
        table: TableId,
        group: GroupId,
    ) -> core::result::Result<(), HwError> {
        let mut state = self.state.lock();
        if state.rules.values().any(|r| r.group == Some(group)) {
            return Err(HwError::Busy);
        }
        let t = state.tables.get_mut(&table).ok_or(HwError::NoEntry)?;
        t.groups.remove(&group).map(|_| ()).ok_or(HwError::NoEntry)
    }

    fn add_rule(
        &self,
        table: TableId,
        group: Option<GroupId>,
        spec: &RuleSpec,
    ) -> core::result::Result<RuleId, HwError> {
        let mut state = self.state.lock();
        if let Some(n) = state.fail_add_rule {
            if n <= 1 {
                state.fail_add_rule = None;
                return Err(HwError::Busy);
            }
            state.fail_add_rule = Some(n - 1);
        }

        state.check_spec(table, group, spec)?;

        if state.rules.len() >= state.limits.rules {
            return Err(HwError::NoSpace {
                resource: "rules",
                limit: state.limits.rules as u64,
            });
        }
        if let Some(t) = state.tables.get(&table) {
            let max = t.attr.max_rules;
            if max != 0 && state.rules_in(table) >= max as usize {
                return Err(HwError::NoSpace {
                    resource: "table rules",
                    limit: u64::from(max),
                });
            }
        }
        if let Some(gid) = group {
            let size = state
                .tables
                .get(&table)
                .and_then(|t| t.groups.get(&gid))
                .map_or(0, |g| g.size);
            let used =
                state.rules.values().filter(|r| r.group == Some(gid)).count();
            if used >= size as usize {
                return Err(HwError::NoSpace {
                    resource: "group rules",
                    limit: u64::from(size),
                });
            }
        }

        let id = RuleId(state.next());
        state.rules.insert(id, SimRule { table, group, spec: spec.clone() });
        Ok(id)
    }

    fn update_rule(
        &self,
        rule: RuleId,
        spec: &RuleSpec,
    ) -> core::result::Result<(), HwError> {
        let mut state = self.state.lock();
        let (table, group) = match state.rules.get(&rule) {
            Some(r) => (r.table, r.group),
            None => return Err(HwError::NoEntry),
        };
        state.check_spec(table, group, spec)?;
        if let Some(r) = state.rules.get_mut(&rule) {
            r.spec = spec.clone();
        }
        Ok(())
    }

    fn del_rule(&self, rule: RuleId) -> core::result::Result<(), HwError> {
        self.state.lock().rules.remove(&rule).map(|_| ()).ok_or(HwError::NoEntry)
    }

    fn alloc_counter(&self) -> core::result::Result<CounterId, HwError> {
        let mut state = self.state.lock();
        if state.counters.len() >= state.limits.counters {
            return Err(HwError::NoSpace {
                resource: "counters",
                limit: state.limits.counters as u64,
            });
        }
        let id = CounterId(state.next());
        state.counters.insert(id, CounterData::default());
        Ok(id)
    }

    fn query_counter(
        &self,
        counter: CounterId,
    ) -> core::result::Result<CounterData, HwError> {
        self.state.lock().counters.get(&counter).copied().ok_or(HwError::NoEntry)
    }

    fn free_counter(&self, counter: CounterId) -> core::result::Result<(), HwError> {
        let mut state = self.state.lock();
        if state.rules.values().any(|r| r.spec.counter == Some(counter)) {
            return Err(HwError::Busy);
        }
        state.counters.remove(&counter).map(|_| ()).ok_or(HwError::NoEntry)
    }

    fn alloc_mod_hdr(
        &self,
        prog: &ModHdrProgram,
    ) -> core::result::Result<ModHdrId, HwError> {
        let mut state = self.state.lock();
        if core::mem::take(&mut state.fail_mod_hdr) {
            return Err(HwError::Busy);
        }
        if state.mod_hdrs.len() >= state.limits.mod_hdrs {
            return Err(HwError::NoSpace {
                resource: "header rewrites",
                limit: state.limits.mod_hdrs as u64,
            });
        }
        let id = ModHdrId(state.next() as u32);
        state.mod_hdrs.insert(id, prog.clone());
        Ok(id)
    }

    fn free_mod_hdr(&self, id: ModHdrId) -> core::result::Result<(), HwError> {
        let mut state = self.state.lock();
        if state.rules.values().any(|r| r.spec.mod_hdr == Some(id)) {
            return Err(HwError::Busy);
        }
        state.mod_hdrs.remove(&id).map(|_| ()).ok_or(HwError::NoEntry)
    }
}

/// A connection tracker which forwards events to whichever listener
/// registered last for a zone.
#[derive(Default)]
pub struct SimTracker {
    listeners: KMutex<BTreeMap<u16, Vec<Arc<dyn CtEventListener>>>>,
    fail_register: KMutex<bool>,
}

impl SimTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next registration.
    pub fn fail_next_register(&self) {
        *self.fail_register.lock() = true;
    }

    fn listener(&self, zone: u16) -> Result<Arc<dyn CtEventListener>> {
        self.listeners
            .lock()
            .get(&zone)
            .and_then(|l| l.last().cloned())
            .ok_or(OffloadError::NotFound)
    }

    pub fn add(&self, req: &CtFlowReq) -> Result<()> {
        self.listener(req.tuple.zone)?.flow_add(req)
    }

    pub fn del(&self, zone: u16, cookie: CtCookie) -> Result<()> {
        self.listener(zone)?.flow_del(cookie)
    }

    pub fn stats(&self, zone: u16, cookie: CtCookie) -> Result<CtStats> {
        self.listener(zone)?.flow_stats(cookie)
    }

    pub fn listeners(&self, zone: u16) -> usize {
        self.listeners.lock().get(&zone).map_or(0, Vec::len)
    }
}

impl CtTracker for SimTracker {
    fn register(
        &self,
        zone: u16,
        listener: Arc<dyn CtEventListener>,
    ) -> Result<()> {
        if core::mem::take(&mut *self.fail_register.lock()) {
            return Err(OffloadError::exhausted("tracker listeners", 0));
        }
        self.listeners.lock().entry(zone).or_default().push(listener);
        Ok(())
    }

    fn unregister(&self, zone: u16, listener: &Arc<dyn CtEventListener>) {
        let mut listeners = self.listeners.lock();
        if let Some(l) = listeners.get_mut(&zone) {
            l.retain(|x| !same_listener(x, listener));
            if l.is_empty() {
                listeners.remove(&zone);
            }
        }
    }
}
