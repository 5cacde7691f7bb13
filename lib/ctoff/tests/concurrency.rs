// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tracker events, restores, and rule offloads racing each other.

use common::*;
use ctoff_test_utils as common;
use rand::Rng;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

#[cfg(test)]
#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

const THREADS: usize = 6;
const ITERS: usize = 2000;
const COOKIES: u64 = 24;
const ZONES: [u16; 2] = [1, 2];

/// Cookie `c` always names the same connection: even cookies are the
/// forward direction of a pair, odd ones the reply.
fn tuple_of(c: u64, zone: u16) -> Tuple {
    let pair = (c / 2) as u16;
    let t = tcp4(("10.0.0.1", 1000 + pair), ("10.0.0.2", 80), zone);
    if c % 2 == 0 { t } else { t.reverse() }
}

#[test]
fn add_del_restore_race() {
    let h = Arc::new(Harness::new());
    for (i, zone) in ZONES.iter().enumerate() {
        h.offload_zone(i as u64, *zone, false);
    }
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let h = h.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                barrier.wait();
                for _ in 0..ITERS {
                    let zone = ZONES[rng.random_range(0..ZONES.len())];
                    let c = rng.random_range(0..COOKIES);
                    let t = tuple_of(c, zone);
                    match rng.random_range(0..10) {
                        0..=3 => {
                            let mut r = req(c, t);
                            r.restore_cookie =
                                RestoreCookie(rng.random_range(0..4));
                            let _ = h.tracker.add(&r);
                        }
                        4..=5 => {
                            let _ = h.tracker.del(zone, CtCookie(c));
                        }
                        6 => {
                            let _ = h.tracker.stats(zone, CtCookie(c));
                        }
                        _ => {
                            let zid = h.zone_id(zone);
                            if let Some(rc) = h.ct.restore(&packet_for(&t), zid) {
                                assert!(rc.0 < 4);
                            }
                        }
                    }
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    h.ct.flush();

    // Every entry left standing is valid and installed.
    let dump = h.ct.dump();
    for e in &dump.entries {
        assert!(e.valid, "entry {} left pending", e.cookie);
        assert!(e.counter.is_some());
    }
    let (plain, nat) = h.ct.tuple_index_len();
    assert_eq!(plain + nat, dump.entries.len());
    assert_eq!(h.ct.stats_snap().offloaded, dump.entries.len() as u64);

    for zone in ZONES {
        for c in 0..COOKIES {
            let _ = h.tracker.del(zone, CtCookie(c));
        }
    }
    h.ct.flush();
    assert_eq!(h.ct.tuple_index_len(), (0, 0));
    assert_eq!(h.sim.num_counters(), 0);
    assert_eq!(h.sim.num_rules(), ZONES.len() * 4);
    assert_eq!(h.ct.stats_snap().offloaded, 0);
}

#[test]
fn offload_deoffload_race() {
    let h = Arc::new(Harness::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS as u64)
        .map(|id| {
            let h = h.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                let attr = FlowRuleAttr::new(
                    id,
                    rng.random_range(0..3),
                    CtAction { zone: 5, nat: rng.random_bool(0.5) },
                );
                barrier.wait();
                for _ in 0..200 {
                    h.ct.offload(&attr).unwrap();
                    let t = tuple_of(id * 2, 5);
                    let _ = h.tracker.add(&req(id * 2, t));
                    h.ct.deoffload(&attr).unwrap();
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    h.ct.flush();
    assert_eq!(h.ct.num_zones(), 0);
    assert_eq!(h.tracker.listeners(5), 0);
    assert_eq!(h.sim.num_tables(), 3);
    assert_eq!(h.sim.num_rules(), 0);
    assert_eq!(h.sim.num_counters(), 0);
    assert_eq!(h.ct.tuple_index_len(), (0, 0));
}
