// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-zone pre-CT tables.
//!
//! Each zone has two, one for plain and one for NAT traffic, holding
//! exactly two rules:
//!
//! 1. A classification rule matching this zone's raw id in the zone
//!    register with the tracked bit set (and the NAT bit set only in
//!    the NAT table). It rewrites the zone register to the zone's
//!    compressed id and forwards to the shared CT (or CT NAT) table.
//!
//! 2. A lowest-priority miss rule which matches everything and
//!    forwards to the post-action table.

use super::Result;
use super::ct::CtShared;
use super::hw::CtStateFlags;
use super::hw::GroupId;
use super::hw::HwGroup;
use super::hw::HwModHdr;
use super::hw::HwRule;
use super::hw::HwTable;
use super::hw::MatchFields;
use super::hw::MatchSpec;
use super::hw::Reg;
use super::hw::RuleSpec;
use super::hw::TableAttr;
use super::hw::TableId;
use super::modhdr::ModHdrBuilder;
use std::sync::Arc;

/// The pipeline level of the pre-CT tables.
pub const PRE_CT_LEVEL: u32 = 1;

/// The priority of the miss rule; it must lose to every other rule.
pub const PRE_CT_MISS_PRIO: u16 = u16::MAX;

/// One pre-CT table and its rules. Fields drop in declaration order,
/// rules before the objects they use.
pub struct PreCtTable {
    flow_rule: HwRule,
    miss_rule: HwRule,
    mod_hdr: HwModHdr,
    flow_grp: HwGroup,
    miss_grp: HwGroup,
    table: Arc<HwTable>,
    nat: bool,
}

impl PreCtTable {
    pub fn new(
        shared: &CtShared,
        zone: u16,
        zone_id: u32,
        nat: bool,
    ) -> Result<Self> {
        let name = if nat {
            format!("ct_pre_nat_z{zone}")
        } else {
            format!("ct_pre_z{zone}")
        };
        let attr = TableAttr { name, level: PRE_CT_LEVEL, max_rules: 2 };
        let table = HwTable::create(&shared.hw, &attr)?;
        let flow_grp =
            table.create_group(MatchFields::ZONE | MatchFields::CT_STATE, 1)?;
        let miss_grp = table.create_group(MatchFields::empty(), 1)?;

        let mod_hdr = HwModHdr::alloc(
            &shared.hw,
            ModHdrBuilder::new().set_reg(Reg::Zone, zone_id)?.finish(),
        )?;

        let mask = CtStateFlags::TRK | CtStateFlags::NAT;
        let state = if nat { mask } else { CtStateFlags::TRK };
        let ct_table = if nat { &shared.ct_nat } else { &shared.ct };
        let flow_spec = RuleSpec {
            prio: 0,
            matches: MatchSpec {
                zone: Some(zone),
                ct_state: Some((state, mask)),
                ..Default::default()
            },
            mod_hdr: Some(mod_hdr.id()),
            counter: None,
            dest: ct_table.id(),
        };
        let flow_rule = table.add_rule(Some(&flow_grp), flow_spec)?;

        let miss_spec = RuleSpec {
            prio: PRE_CT_MISS_PRIO,
            matches: MatchSpec::default(),
            mod_hdr: None,
            counter: None,
            dest: shared.post_act.id(),
        };
        let miss_rule = table.add_rule(Some(&miss_grp), miss_spec)?;

        Ok(Self { flow_rule, miss_rule, mod_hdr, flow_grp, miss_grp, table, nat })
    }

    pub fn table_id(&self) -> TableId {
        self.table.id()
    }

    pub fn is_nat(&self) -> bool {
        self.nat
    }

    pub fn flow_rule(&self) -> &HwRule {
        &self.flow_rule
    }

    pub fn miss_rule(&self) -> &HwRule {
        &self.miss_rule
    }

    pub fn mod_hdr(&self) -> &HwModHdr {
        &self.mod_hdr
    }

    /// The (classification, miss) groups.
    pub fn groups(&self) -> (GroupId, GroupId) {
        (self.flow_grp.id(), self.miss_grp.id())
    }
}
