// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Header-rewrite programs.
//!
//! A program is the bounded list of field-set operations a rule
//! applies on a hit: tagging metadata registers and, for NAT'd
//! connections, rewriting addresses and ports.

use super::Result;
use super::hw::Reg;
use ctoff_api::OffloadError;
use ctoff_api::Tuple;
use serde::Serialize;
use std::net::IpAddr;

/// The number of actions a single program may hold.
pub const MOD_HDR_MAX_ACTIONS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ModHdrAction {
    SetReg { reg: Reg, val: u32 },
    SetSrcIp(IpAddr),
    SetDstIp(IpAddr),
    SetSrcPort(u16),
    SetDstPort(u16),
}

pub type ModHdrProgram = heapless::Vec<ModHdrAction, MOD_HDR_MAX_ACTIONS>;

#[derive(Debug, Default)]
pub struct ModHdrBuilder {
    prog: ModHdrProgram,
}

impl ModHdrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, action: ModHdrAction) -> Result<&mut Self> {
        self.prog.push(action).map_err(|_| {
            OffloadError::Unsupported(format!(
                "header rewrite exceeds {MOD_HDR_MAX_ACTIONS} actions"
            ))
        })?;
        Ok(self)
    }

    pub fn set_reg(&mut self, reg: Reg, val: u32) -> Result<&mut Self> {
        if val > reg.max_val() {
            return Err(OffloadError::Unsupported(format!(
                "value {val} does not fit {reg:?} register"
            )));
        }
        self.push(ModHdrAction::SetReg { reg, val })
    }

    /// Emit the rewrites turning `from` into `to`. Only the fields
    /// which differ produce an action.
    pub fn nat(&mut self, from: &Tuple, to: &Tuple) -> Result<&mut Self> {
        if from.addrs.src() != to.addrs.src() {
            self.push(ModHdrAction::SetSrcIp(to.addrs.src()))?;
        }
        if from.addrs.dst() != to.addrs.dst() {
            self.push(ModHdrAction::SetDstIp(to.addrs.dst()))?;
        }
        if from.src_port != to.src_port {
            self.push(ModHdrAction::SetSrcPort(to.src_port))?;
        }
        if from.dst_port != to.dst_port {
            self.push(ModHdrAction::SetDstPort(to.dst_port))?;
        }
        Ok(self)
    }

    pub fn finish(&mut self) -> ModHdrProgram {
        core::mem::take(&mut self.prog)
    }
}

/// The value `prog` writes to `reg`, if any. The last write wins.
pub fn reg_value(prog: &ModHdrProgram, reg: Reg) -> Option<u32> {
    prog.iter().rev().find_map(|a| match a {
        ModHdrAction::SetReg { reg: r, val } if *r == reg => Some(*val),
        _ => None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use ctoff_api::Protocol;

    #[test]
    fn nat_emits_only_changed_fields() {
        let from = Tuple::new_v4(
            Protocol::TCP,
            ("10.0.0.1".parse().unwrap(), 5000),
            ("10.0.0.2".parse().unwrap(), 80),
            1,
        );
        let to = Tuple::new_v4(
            Protocol::TCP,
            ("192.168.1.1".parse().unwrap(), 6000),
            ("10.0.0.2".parse().unwrap(), 80),
            1,
        );
        let prog = ModHdrBuilder::new().nat(&from, &to).unwrap().finish();
        assert_eq!(
            prog.as_slice(),
            &[
                ModHdrAction::SetSrcIp("192.168.1.1".parse().unwrap()),
                ModHdrAction::SetSrcPort(6000),
            ]
        );
    }

    #[test]
    fn overflow_is_unsupported() {
        let mut b = ModHdrBuilder::new();
        for i in 0..MOD_HDR_MAX_ACTIONS as u32 {
            b.set_reg(Reg::Mark, i).unwrap();
        }
        assert!(matches!(
            b.set_reg(Reg::Mark, 99),
            Err(OffloadError::Unsupported(_))
        ));
        let prog = b.finish();
        assert_eq!(prog.len(), MOD_HDR_MAX_ACTIONS);
        assert_eq!(reg_value(&prog, Reg::Mark), Some(15));
    }

    #[test]
    fn register_width_enforced() {
        let mut b = ModHdrBuilder::new();
        assert!(b.set_reg(Reg::ZoneRestore, 255).is_ok());
        assert!(b.set_reg(Reg::ZoneRestore, 256).is_err());
    }
}
