// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print dumps in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both debugging tools and integration tests.

use crate::api::CtEntryDump;
use crate::api::DumpCtEntriesResp;
use crate::engine::offload::CtOffloadStatsSnap;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpCtEntriesResp`].
pub fn print_ct_entries(resp: &DumpCtEntriesResp) -> std::io::Result<()> {
    print_ct_entries_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpCtEntriesResp`] into a given writer.
pub fn print_ct_entries_into(
    writer: &mut impl Write,
    resp: &DumpCtEntriesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "CT Entries: {}", resp.entries.len())?;
    write_hr(&mut t)?;
    print_ct_entry_header(&mut t)?;
    for entry in &resp.entries {
        print_ct_entry(&mut t, entry)?;
    }
    t.flush()
}

/// Print the header for the [`print_ct_entry()`] output.
pub fn print_ct_entry_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "ZONE\tCOOKIE\tSTATE\tTUPLE\tNAT TUPLE\tRESTORE\tCOUNTER")
}

pub fn print_ct_entry(
    t: &mut impl Write,
    entry: &CtEntryDump,
) -> std::io::Result<()> {
    let state = if entry.valid { "VALID" } else { "PENDING" };
    let nat = match &entry.tuple_nat {
        Some(tn) => tn.to_string(),
        None => "--".to_string(),
    };
    let counter = match entry.counter {
        Some(c) if entry.shared_counter => format!("{c} (shared)"),
        Some(c) => c.to_string(),
        None => "--".to_string(),
    };

    writeln!(
        t,
        "{}\t{}\t{state}\t{}\t{nat}\t{}\t{counter}",
        entry.zone, entry.cookie, entry.tuple, entry.restore_cookie,
    )
}

/// Print a [`CtOffloadStatsSnap`].
pub fn print_ct_stats(snap: &CtOffloadStatsSnap) -> std::io::Result<()> {
    print_ct_stats_into(&mut std::io::stdout(), snap)
}

/// Print a [`CtOffloadStatsSnap`] into a given writer.
pub fn print_ct_stats_into(
    writer: &mut impl Write,
    snap: &CtOffloadStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    let rows = [
        ("offloaded", snap.offloaded),
        ("add_ok", snap.add_ok),
        ("add_dup", snap.add_dup),
        ("add_err", snap.add_err),
        ("update_ok", snap.update_ok),
        ("update_err", snap.update_err),
        ("del", snap.del),
        ("stats_query", snap.stats_query),
        ("restore_hit", snap.restore_hit),
        ("restore_drop", snap.restore_drop),
        ("zones", snap.zones),
        ("counters_shared", snap.counters_shared),
    ];

    writeln!(t, "STAT\tVALUE")?;
    for (name, val) in rows {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::CtCookie;
    use crate::api::Protocol;
    use crate::api::RestoreCookie;
    use crate::api::Tuple;

    #[test]
    fn entries_table() {
        let tuple = Tuple::new_v4(
            Protocol::TCP,
            ("10.0.0.1".parse().unwrap(), 5000),
            ("10.0.0.2".parse().unwrap(), 80),
            1,
        );
        let resp = DumpCtEntriesResp {
            entries: vec![CtEntryDump {
                zone: 1,
                cookie: CtCookie(0x10),
                tuple,
                tuple_nat: None,
                valid: true,
                nat: false,
                restore_cookie: RestoreCookie(0x99),
                counter: Some(4),
                shared_counter: true,
            }],
        };

        let mut out = Vec::new();
        print_ct_entries_into(&mut out, &resp).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("CT Entries: 1\n"));
        assert!(out.contains("VALID"));
        assert!(out.contains("TCP:10.0.0.1:5000:10.0.0.2:80/z1"));
        assert!(out.contains("4 (shared)"));
    }

    #[test]
    fn stats_table() {
        let snap = CtOffloadStatsSnap { add_ok: 3, ..Default::default() };
        let mut out = Vec::new();
        print_ct_stats_into(&mut out, &snap).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.lines().any(|l| l.starts_with("add_ok") && l.ends_with('3')));
    }
}
