// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The hardware flow-table backend and owned handles to its objects.
//!
//! The engine never talks to a [`HwBackend`] directly for anything
//! that must later be freed. Instead every table, group, rule, and
//! header-rewrite program is wrapped in a handle which releases the
//! object when dropped. Rolling back a partially built structure is
//! then just a matter of dropping whatever was built so far.

use super::modhdr::ModHdrProgram;
use crate::ExecCtx;
use crate::LogLevel;
use bitflags::bitflags;
use ctoff_api::AddrPair;
use ctoff_api::OffloadError;
use ctoff_api::Protocol;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct TableId(pub u32);

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct GroupId(pub u32);

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct RuleId(pub u64);

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct CounterId(pub u64);

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ModHdrId(pub u32);

/// Metadata registers carried alongside a packet through the
/// hardware pipeline.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Reg {
    /// [`CtStateFlags`] of the connection.
    CtState,
    /// The connection mark.
    Mark,
    /// The mapped id of the connection labels.
    Labels,
    /// The tracker zone. Holds the raw zone on entry to a pre-CT
    /// table and the compressed zone id within the CT tables.
    Zone,
    /// The compressed zone id, used to restore the zone when a packet
    /// is handed back to software.
    ZoneRestore,
    /// The mapped id of the rule to resume on a CT miss.
    ActMiss,
}

impl Reg {
    /// The width of the register in bits.
    pub const fn bits(&self) -> u32 {
        match self {
            Self::CtState => 16,
            Self::Mark => 32,
            Self::Labels => 32,
            Self::Zone => 16,
            Self::ZoneRestore => 8,
            Self::ActMiss => 16,
        }
    }

    /// The largest value the register can hold.
    pub const fn max_val(&self) -> u32 {
        match self.bits() {
            32 => u32::MAX,
            b => (1 << b) - 1,
        }
    }
}

bitflags! {
    /// Connection state bits written to [`Reg::CtState`].
    #[derive(
        Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
    )]
    pub struct CtStateFlags: u16 {
        const EST = 1 << 1;
        const TRK = 1 << 2;
        const NAT = 1 << 3;
        const REPLY = 1 << 4;
        const NEW = 1 << 5;
    }
}

bitflags! {
    /// The set of fields a match touches. A flow group declares the
    /// fields its rules may match on.
    #[derive(
        Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
    )]
    pub struct MatchFields: u16 {
        const PROTO = 1 << 0;
        const ADDRS = 1 << 1;
        const PORTS = 1 << 2;
        const ZONE = 1 << 3;
        const CT_STATE = 1 << 4;
    }
}

/// The match half of a rule. Fields left as `None` are wildcards.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MatchSpec {
    pub proto: Option<Protocol>,
    pub addrs: Option<AddrPair>,
    pub ports: Option<(u16, u16)>,
    pub zone: Option<u16>,
    /// Value and mask.
    pub ct_state: Option<(CtStateFlags, CtStateFlags)>,
}

impl MatchSpec {
    pub fn fields(&self) -> MatchFields {
        let mut f = MatchFields::empty();
        f.set(MatchFields::PROTO, self.proto.is_some());
        f.set(MatchFields::ADDRS, self.addrs.is_some());
        f.set(MatchFields::PORTS, self.ports.is_some());
        f.set(MatchFields::ZONE, self.zone.is_some());
        f.set(MatchFields::CT_STATE, self.ct_state.is_some());
        f
    }
}

/// A match plus the actions applied on a hit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RuleSpec {
    pub prio: u16,
    pub matches: MatchSpec,
    pub mod_hdr: Option<ModHdrId>,
    pub counter: Option<CounterId>,
    pub dest: TableId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableAttr {
    pub name: String,
    /// The pipeline stage of the table. A rule may only forward to a
    /// table of a higher level.
    pub level: u32,
    /// Zero leaves the size to the backend.
    pub max_rules: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CounterData {
    pub bytes: u64,
    pub packets: u64,
    pub last_used: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum HwError {
    #[error("no space for {resource} (limit {limit})")]
    NoSpace { resource: &'static str, limit: u64 },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("no such object")]
    NoEntry,
    #[error("device busy")]
    Busy,
}

impl From<HwError> for OffloadError {
    fn from(e: HwError) -> Self {
        match e {
            HwError::NoSpace { resource, limit } => {
                OffloadError::exhausted(resource, limit)
            }
            HwError::Unsupported(msg) => OffloadError::Unsupported(msg),
            e @ (HwError::NoEntry | HwError::Busy) => {
                OffloadError::Hardware(e.to_string())
            }
        }
    }
}

/// The hardware flow-table backend.
///
/// Every call may fail; none are retried.
pub trait HwBackend: Send + Sync {
    fn create_table(&self, attr: &TableAttr) -> Result<TableId, HwError>;
    fn destroy_table(&self, table: TableId) -> Result<(), HwError>;

    fn create_group(
        &self,
        table: TableId,
        criteria: MatchFields,
        size: u32,
    ) -> Result<GroupId, HwError>;
    fn destroy_group(
        &self,
        table: TableId,
        group: GroupId,
    ) -> Result<(), HwError>;

    fn add_rule(
        &self,
        table: TableId,
        group: Option<GroupId>,
        spec: &RuleSpec,
    ) -> Result<RuleId, HwError>;
    fn update_rule(&self, rule: RuleId, spec: &RuleSpec) -> Result<(), HwError>;
    fn del_rule(&self, rule: RuleId) -> Result<(), HwError>;

    fn alloc_counter(&self) -> Result<CounterId, HwError>;
    fn query_counter(&self, counter: CounterId) -> Result<CounterData, HwError>;
    fn free_counter(&self, counter: CounterId) -> Result<(), HwError>;

    fn alloc_mod_hdr(&self, prog: &ModHdrProgram) -> Result<ModHdrId, HwError>;
    fn free_mod_hdr(&self, id: ModHdrId) -> Result<(), HwError>;
}

/// The backend bound at initialization plus the context used to
/// report failures while releasing objects.
pub struct HwCtx {
    pub backend: Arc<dyn HwBackend>,
    pub ectx: Arc<ExecCtx>,
}

impl HwCtx {
    pub fn new(backend: Arc<dyn HwBackend>, ectx: Arc<ExecCtx>) -> Arc<Self> {
        Arc::new(Self { backend, ectx })
    }

    /// Errors while tearing down are logged and otherwise ignored.
    fn teardown_err(&self, what: impl Display, err: HwError) {
        self.ectx
            .log
            .log(LogLevel::Error, &format!("failed to release {what}: {err}"));
    }
}

/// An owned hardware table.
pub struct HwTable {
    hw: Arc<HwCtx>,
    id: TableId,
    name: String,
}

impl HwTable {
    pub fn create(hw: &Arc<HwCtx>, attr: &TableAttr) -> Result<Arc<Self>, HwError> {
        let id = hw.backend.create_table(attr)?;
        Ok(Arc::new(Self { hw: hw.clone(), id, name: attr.name.clone() }))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hw(&self) -> &Arc<HwCtx> {
        &self.hw
    }

    pub fn create_group(
        self: &Arc<Self>,
        criteria: MatchFields,
        size: u32,
    ) -> Result<HwGroup, HwError> {
        let id = self.hw.backend.create_group(self.id, criteria, size)?;
        Ok(HwGroup { table: self.clone(), id })
    }

    /// Install a rule, optionally within `group`.
    pub fn add_rule(
        self: &Arc<Self>,
        group: Option<&HwGroup>,
        spec: RuleSpec,
    ) -> Result<HwRule, HwError> {
        let id = self.hw.backend.add_rule(self.id, group.map(|g| g.id), &spec)?;
        Ok(HwRule { table: self.clone(), id, spec })
    }
}

impl fmt::Debug for HwTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HwTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for HwTable {
    fn drop(&mut self) {
        if let Err(e) = self.hw.backend.destroy_table(self.id) {
            self.hw.teardown_err(format_args!("table {}", self.name), e);
        }
    }
}

/// An owned flow group within a [`HwTable`].
pub struct HwGroup {
    table: Arc<HwTable>,
    id: GroupId,
}

impl HwGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }
}

impl Drop for HwGroup {
    fn drop(&mut self) {
        let hw = &self.table.hw;
        if let Err(e) = hw.backend.destroy_group(self.table.id, self.id) {
            hw.teardown_err(
                format_args!("group {} of {}", self.id.0, self.table.name),
                e,
            );
        }
    }
}

/// An installed rule. The rule keeps its table alive.
pub struct HwRule {
    table: Arc<HwTable>,
    id: RuleId,
    spec: RuleSpec,
}

impl HwRule {
    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn table(&self) -> &Arc<HwTable> {
        &self.table
    }

    /// Replace the rule's match and actions in place. On failure the
    /// rule keeps its previous spec.
    pub fn update(&mut self, spec: RuleSpec) -> Result<(), HwError> {
        self.table.hw.backend.update_rule(self.id, &spec)?;
        self.spec = spec;
        Ok(())
    }
}

impl Drop for HwRule {
    fn drop(&mut self) {
        let hw = &self.table.hw;
        if let Err(e) = hw.backend.del_rule(self.id) {
            hw.teardown_err(
                format_args!("rule {} in {}", self.id.0, self.table.name),
                e,
            );
        }
    }
}

/// An allocated header-rewrite program.
pub struct HwModHdr {
    hw: Arc<HwCtx>,
    id: ModHdrId,
    prog: ModHdrProgram,
}

impl HwModHdr {
    pub fn alloc(hw: &Arc<HwCtx>, prog: ModHdrProgram) -> Result<Self, HwError> {
        let id = hw.backend.alloc_mod_hdr(&prog)?;
        Ok(Self { hw: hw.clone(), id, prog })
    }

    pub fn id(&self) -> ModHdrId {
        self.id
    }

    pub fn prog(&self) -> &ModHdrProgram {
        &self.prog
    }
}

impl Drop for HwModHdr {
    fn drop(&mut self) {
        if let Err(e) = self.hw.backend.free_mod_hdr(self.id) {
            self.hw.teardown_err(format_args!("mod-hdr {}", self.id.0), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::PrintlnLog;
    use crate::engine::sim::SimHw;

    fn ctx(sim: &Arc<SimHw>) -> Arc<HwCtx> {
        HwCtx::new(sim.clone(), Arc::new(ExecCtx::new(Box::new(PrintlnLog))))
    }

    fn attr(name: &str, level: u32) -> TableAttr {
        TableAttr { name: name.to_string(), level, max_rules: 8 }
    }

    #[test]
    fn handles_release_on_drop() {
        let sim = Arc::new(SimHw::new());
        let hw = ctx(&sim);
        let next = HwTable::create(&hw, &attr("next", 2)).unwrap();
        let table = HwTable::create(&hw, &attr("t", 1)).unwrap();
        let grp = table.create_group(MatchFields::ZONE, 4).unwrap();
        let spec = RuleSpec {
            prio: 1,
            matches: MatchSpec { zone: Some(3), ..Default::default() },
            mod_hdr: None,
            counter: None,
            dest: next.id(),
        };
        let rule = table.add_rule(Some(&grp), spec).unwrap();
        assert_eq!(sim.num_tables(), 2);
        assert_eq!(sim.num_rules(), 1);

        // The rule keeps the table alive after the caller lets go.
        drop(table);
        assert_eq!(sim.num_tables(), 2);

        drop(rule);
        assert_eq!(sim.num_rules(), 0);
        drop(grp);
        assert_eq!(sim.num_tables(), 1);
        assert_eq!(sim.num_groups(), 0);
    }

    #[test]
    fn failed_update_keeps_spec() {
        let sim = Arc::new(SimHw::new());
        let hw = ctx(&sim);
        let next = HwTable::create(&hw, &attr("next", 2)).unwrap();
        let table = HwTable::create(&hw, &attr("t", 1)).unwrap();
        let spec = RuleSpec {
            prio: 0,
            matches: MatchSpec::default(),
            mod_hdr: None,
            counter: None,
            dest: next.id(),
        };
        let mut rule = table.add_rule(None, spec.clone()).unwrap();
        let bad = RuleSpec { mod_hdr: Some(ModHdrId(999)), ..spec.clone() };
        assert_eq!(rule.update(bad), Err(HwError::NoEntry));
        assert_eq!(rule.spec(), &spec);
    }

    #[test]
    fn register_widths() {
        assert_eq!(Reg::ZoneRestore.max_val(), 255);
        assert_eq!(Reg::ActMiss.max_val(), 65535);
        assert_eq!(Reg::Mark.max_val(), u32::MAX);
    }

    #[test]
    fn hw_error_conversion() {
        let e: OffloadError =
            HwError::NoSpace { resource: "rules", limit: 4 }.into();
        assert_eq!(e, OffloadError::exhausted("rules", 4));
        let e: OffloadError = HwError::Busy.into();
        assert!(matches!(e, OffloadError::Hardware(_)));
    }
}
