// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection-tracking flow offload.
//!
//! This crate maps connections already tracked in software onto
//! hardware match-action rules so that established traffic bypasses
//! the software tracker after its first packet. The tracker drives it
//! with add/delete/stats events (see [`engine::ct::CtCache`]), the
//! rule compiler with offload requests for rules carrying a CT action
//! (see [`engine::offload::CtOffload`]), and the datapath calls
//! [`engine::offload::CtOffload::restore`] to reattach tracker state
//! to packets which missed partway through the hardware pipeline.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
// Enable features needed for USDT, if needed.
#![cfg_attr(all(feature = "usdt", not(usdt_stable_asm)), feature(asm))]
#![cfg_attr(
    all(feature = "usdt", target_os = "macos", not(usdt_stable_asm_sym)),
    feature(asm_sym)
)]

#[macro_use]
extern crate cfg_if;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as ctoff;

pub mod ddi;
pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod provider;

pub use ctoff_api as api;
pub use provider::LogLevel;
pub use provider::LogProvider;
pub use provider::PrintlnLog;
pub use provider::SlogLog;

/// The execution context handed to the engine at construction.
pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}

impl ExecCtx {
    pub fn new(log: Box<dyn LogProvider>) -> Self {
        Self { log }
    }
}

// ================================================================
// DTrace USDT Provider
//
// Allowing us to use USDT to trace the offload engine when running
// in std/test.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod ctoff_provider {
    fn ct__entry__add(zone: u16, cookie: u64, tuple: &str, nat: u8) {}
    fn ct__entry__del(zone: u16, cookie: u64, tuple: &str) {}
    fn ct__restore__miss(zone_id: u32, pkt_len: u64, reason: &str) {}
    fn zone__create(zone: u16, zone_id: u32) {}
    fn zone__destroy(zone: u16, zone_id: u32) {}
}
