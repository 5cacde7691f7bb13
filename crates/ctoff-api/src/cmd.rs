// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::ct::CtCookie;
use super::ct::RestoreCookie;
use super::ip::Tuple;
use serde::Deserialize;
use serde::Serialize;

/// The connection-tracking action attached to a policy flow rule.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CtAction {
    /// The tracker zone the rule sends traffic into.
    pub zone: u16,
    /// Does this rule send traffic to the NAT side of the zone?
    pub nat: bool,
}

/// The subset of a compiled policy rule the offload engine needs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowRuleAttr {
    /// Caller-unique rule identifier.
    pub id: u64,
    pub chain: u32,
    pub prio: u16,
    pub ct: Option<CtAction>,
}

impl FlowRuleAttr {
    pub fn new(id: u64, chain: u32, ct: CtAction) -> Self {
        Self { id, chain, prio: 0, ct: Some(ct) }
    }
}

/// One offloaded connection direction as seen by a debug dump.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CtEntryDump {
    pub zone: u16,
    pub cookie: CtCookie,
    pub tuple: Tuple,
    pub tuple_nat: Option<Tuple>,
    pub valid: bool,
    pub nat: bool,
    pub restore_cookie: RestoreCookie,
    pub counter: Option<u64>,
    pub shared_counter: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DumpCtEntriesResp {
    pub entries: Vec<CtEntryDump>,
}

