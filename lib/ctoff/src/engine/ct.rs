// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-zone cache of offloaded connections.
//!
//! Each offloaded connection direction is a [`CtEntry`], owned by the
//! [`CtCache`] of its zone and keyed by the tracker's cookie. Entries
//! are also indexed by tuple, process wide, so the datapath can map a
//! packet back to its connection. An entry is indexed under its NAT
//! tuple when NAT changes the tuple and under its plain tuple
//! otherwise.
//!
//! # Lifecycle
//!
//! An entry is `pending` from insertion until its hardware rule is in
//! place, then `valid`. Only valid entries are visible to tuple
//! lookups. An entry is torn down when its last `Arc` is dropped: the
//! cache holds one, an in-progress add holds one, and the restore
//! path holds one transiently. Teardown removes the entry from the
//! tuple index and releases its hardware objects exactly once.
//!
//! # Locking
//!
//! Two locks guard this module: the cookie map of each cache and the
//! global tuple index. When both are held the cookie map is taken
//! first. Neither is held across a hardware call, and an entry `Arc`
//! is never dropped while either is held, as dropping the last one
//! takes the tuple index lock.

use super::Result;
use super::counter::CounterPool;
use super::counter::CtCounter;
use super::hw::CtStateFlags;
use super::hw::HwCtx;
use super::hw::HwModHdr;
use super::hw::HwRule;
use super::hw::HwTable;
use super::hw::MatchSpec;
use super::hw::Reg;
use super::hw::RuleSpec;
use super::mapping::IdMapping;
use super::mapping::MappedId;
use super::modhdr::ModHdrBuilder;
use super::offload::CtOffloadCfg;
use super::offload::CtOffloadStats;
use super::tracker::CtEventListener;
use super::tuple;
use crate::LogLevel;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::sync::KMutex;
use crate::ddi::taskq::TaskQHandle;
use ctoff_api::AccountingMode;
use ctoff_api::CtCookie;
use ctoff_api::CtEntryDump;
use ctoff_api::CtFlowReq;
use ctoff_api::CtLabels;
use ctoff_api::CtStats;
use ctoff_api::OffloadError;
use ctoff_api::RestoreCookie;
use ctoff_api::Tuple;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// State shared by every zone: the CT tables, the global tuple index,
/// and the pools entries draw from.
pub struct CtShared {
    pub(crate) hw: Arc<HwCtx>,
    pub(crate) cfg: CtOffloadCfg,
    pub(crate) ct: Arc<HwTable>,
    pub(crate) ct_nat: Arc<HwTable>,
    pub(crate) post_act: Arc<HwTable>,
    pub(crate) zone_map: Arc<IdMapping<u16>>,
    pub(crate) label_map: Arc<IdMapping<CtLabels>>,
    pub(crate) tuples: KMutex<TupleIndex>,
    pub(crate) counters: CounterPool,
    pub(crate) taskq: TaskQHandle,
    pub(crate) stats: KStatNamed<CtOffloadStats>,
    pub(crate) entries: AtomicU32,
}

impl CtShared {
    pub(crate) fn log(&self, level: LogLevel, msg: &str) {
        self.hw.ectx.log.log(level, msg);
    }

    pub(crate) fn stats(&self) -> &CtOffloadStats {
        &self.stats.vals
    }

    /// Claim a slot for a new entry. The slot is given back when the
    /// entry is dropped.
    fn reserve_entry(&self) -> Result<()> {
        let max = self.cfg.max_entries;
        self.entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| OffloadError::exhausted("ct entries", u64::from(max)))
    }

    /// Release a reference to an entry from a context which must not
    /// block. If this was the last reference the teardown runs on the
    /// task queue.
    pub(crate) fn release_deferred(&self, entry: Arc<CtEntry>) {
        let Some(last) = Arc::into_inner(entry) else {
            return;
        };

        if let Err(task) = self.taskq.dispatch(Box::new(move || drop(last))) {
            // The queue is shutting down and nothing else may run;
            // tear down inline.
            task();
        }
    }
}

const ENTRY_VALID: u8 = 1 << 0;
const ENTRY_PLAIN: u8 = 1 << 1;
const ENTRY_NAT: u8 = 1 << 2;

struct IndexSlot {
    entry: Weak<CtEntry>,
    valid: bool,
}

/// The tuple index: every offloaded entry, by plain or NAT tuple.
///
/// Slots hold weak references so that the index never keeps an
/// entry alive; an entry removes its own slot when it is dropped.
#[derive(Default)]
pub(crate) struct TupleIndex {
    plain: BTreeMap<Tuple, IndexSlot>,
    nat: BTreeMap<Tuple, IndexSlot>,
}

impl TupleIndex {
    fn map(&mut self, nat: bool) -> &mut BTreeMap<Tuple, IndexSlot> {
        if nat { &mut self.nat } else { &mut self.plain }
    }

    fn insert(&mut self, entry: &Arc<CtEntry>) -> Result<()> {
        let slot = IndexSlot { entry: Arc::downgrade(entry), valid: false };
        match self.map(entry.has_nat).entry(entry.index_tuple()) {
            Entry::Vacant(v) => {
                v.insert(slot);
            }

            // The previous owner is mid-teardown; its drop will leave
            // our slot alone.
            Entry::Occupied(mut o) if o.get().entry.strong_count() == 0 => {
                o.insert(slot);
            }

            Entry::Occupied(_) => return Err(OffloadError::Duplicate),
        }

        let flag = if entry.has_nat { ENTRY_NAT } else { ENTRY_PLAIN };
        entry.flags.fetch_or(flag, Ordering::Release);
        Ok(())
    }

    fn slot_of(&mut self, entry: &CtEntry) -> Option<&mut IndexSlot> {
        self.map(entry.has_nat)
            .get_mut(&entry.index_tuple())
            .filter(|s| core::ptr::eq(s.entry.as_ptr(), entry))
    }

    fn set_valid(&mut self, entry: &CtEntry) -> bool {
        match self.slot_of(entry) {
            Some(slot) => {
                slot.valid = true;
                entry.flags.fetch_or(ENTRY_VALID, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Drop the slot of an entry being torn down. No strong reference
    /// to it remains, and it may have been moved out of its `Arc`, so
    /// its slot is the dead one under its key. A live slot under the
    /// same key belongs to a newer entry.
    fn remove(&mut self, entry: &CtEntry) {
        let map = self.map(entry.has_nat);
        let key = entry.index_tuple();
        if map.get(&key).is_some_and(|s| s.entry.strong_count() == 0) {
            map.remove(&key);
        }
        entry
            .flags
            .fetch_and(!(ENTRY_VALID | ENTRY_PLAIN | ENTRY_NAT), Ordering::Release);
    }

    /// Find the valid entry for `tuple`, trying the plain index first.
    ///
    /// The returned reference must be dropped after the index lock.
    pub(crate) fn lookup_valid(&self, tuple: &Tuple) -> Option<Arc<CtEntry>> {
        [&self.plain, &self.nat]
            .into_iter()
            .filter_map(|m| m.get(tuple))
            .filter(|slot| slot.valid)
            .find_map(|slot| slot.entry.upgrade())
    }

    /// The number of (plain, NAT) slots.
    pub(crate) fn len(&self) -> (usize, usize) {
        (self.plain.len(), self.nat.len())
    }
}

/// The hardware state of an installed entry. Fields drop in order:
/// the rule goes before the objects it references.
struct ZoneRule {
    rule: HwRule,
    mod_hdr: HwModHdr,
    labels: Option<MappedId<CtLabels>>,
}

/// One offloaded connection direction.
pub struct CtEntry {
    cookie: CtCookie,
    tuple: Tuple,
    tuple_nat: Tuple,
    has_nat: bool,
    zone_id: Arc<MappedId<u16>>,
    // ENTRY_* bits, only modified under the tuple index lock.
    flags: AtomicU8,
    restore_cookie: AtomicU64,
    counter: OnceLock<Arc<CtCounter>>,
    hw: KMutex<Option<ZoneRule>>,
    // The latest update received while pending. Set and taken under
    // the tuple index lock.
    next: KMutex<Option<CtFlowReq>>,
    shared: Arc<CtShared>,
}

impl CtEntry {
    pub fn cookie(&self) -> CtCookie {
        self.cookie
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    /// The post-NAT tuple, if NAT changes the tuple.
    pub fn tuple_nat(&self) -> Option<&Tuple> {
        self.has_nat.then_some(&self.tuple_nat)
    }

    pub fn has_nat(&self) -> bool {
        self.has_nat
    }

    pub fn zone_id(&self) -> u32 {
        self.zone_id.id()
    }

    pub fn is_valid(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ENTRY_VALID != 0
    }

    pub fn restore_cookie(&self) -> RestoreCookie {
        RestoreCookie(self.restore_cookie.load(Ordering::Acquire))
    }

    pub fn counter(&self) -> Option<&Arc<CtCounter>> {
        self.counter.get()
    }

    /// The tuple this entry is indexed and restored by.
    pub fn index_tuple(&self) -> Tuple {
        if self.has_nat { self.tuple_nat } else { self.tuple }
    }

    fn match_spec(&self) -> MatchSpec {
        let t = &self.tuple;
        MatchSpec {
            proto: Some(t.proto),
            addrs: Some(t.addrs),
            ports: t.proto.has_ports().then_some((t.src_port, t.dst_port)),
            // Zone ids are bounded by the zone-restore register.
            zone: Some(self.zone_id() as u16),
            ct_state: None,
        }
    }

    fn dump(&self, zone: u16) -> CtEntryDump {
        let counter = self.counter();
        CtEntryDump {
            zone,
            cookie: self.cookie,
            tuple: self.tuple,
            tuple_nat: self.tuple_nat().copied(),
            valid: self.is_valid(),
            nat: self.has_nat,
            restore_cookie: self.restore_cookie(),
            counter: counter.map(|c| c.id().0),
            shared_counter: counter.is_some_and(|c| c.is_shared()),
        }
    }
}

impl Drop for CtEntry {
    fn drop(&mut self) {
        let this: &CtEntry = self;
        let flags = {
            let mut tuples = this.shared.tuples.lock();
            let flags = this.flags.load(Ordering::Acquire);
            tuples.remove(this);
            flags
        };

        // Rule first, then the counter it references.
        drop(self.hw.get_mut().take());
        drop(self.counter.take());

        if flags & ENTRY_VALID != 0 {
            self.shared.stats().offloaded.decr(1);
        }
        self.shared.entries.fetch_sub(1, Ordering::AcqRel);

        if flags & (ENTRY_PLAIN | ENTRY_NAT) != 0 {
            entry_del_probe(self.tuple.zone, self.cookie, &self.tuple);
        }
    }
}

/// The connections offloaded within one zone, keyed by cookie.
pub struct CtCache {
    zone: u16,
    zone_id: Arc<MappedId<u16>>,
    entries: KMutex<BTreeMap<CtCookie, Arc<CtEntry>>>,
    shared: Arc<CtShared>,
}

impl CtCache {
    pub(crate) fn new(
        zone: u16,
        zone_id: Arc<MappedId<u16>>,
        shared: Arc<CtShared>,
    ) -> Self {
        Self { zone, zone_id, entries: KMutex::new(BTreeMap::new()), shared }
    }

    pub fn zone(&self) -> u16 {
        self.zone
    }

    pub fn zone_id(&self) -> u32 {
        self.zone_id.id()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Look up an entry by cookie, pending or valid.
    pub fn get(&self, cookie: CtCookie) -> Option<Arc<CtEntry>> {
        self.entries.lock().get(&cookie).cloned()
    }

    /// Offload a connection direction, or update the one already
    /// offloaded under the same cookie.
    ///
    /// A repeat of an add already applied is a no-op. On failure
    /// nothing of the new entry remains.
    pub fn add(&self, req: &CtFlowReq) -> Result<()> {
        if req.tuple.zone != self.zone {
            return Err(OffloadError::Inconsistent(format!(
                "tuple {} offered to zone {}",
                req.tuple, self.zone
            )));
        }
        let req = tuple::normalize(req);
        let req: &CtFlowReq = &req;
        tuple::validate(req)?;
        let tuple_nat = tuple::nat_tuple(&req.tuple, req.nat.as_ref())?;

        let (entry, existing) = {
            let mut entries = self.entries.lock();
            match entries.get(&req.cookie) {
                Some(e) => (e.clone(), true),
                None => {
                    let entry = self.insert_new(req, tuple_nat)?;
                    entries.insert(req.cookie, entry.clone());
                    (entry, false)
                }
            }
        };

        if existing {
            return self.update(entry, req, tuple_nat);
        }

        match self.install(&entry, req) {
            Ok(()) => match self.publish(&entry) {
                Some(next) => self.update(entry, &next, tuple_nat),
                None => Ok(()),
            },

            Err(e) => {
                let removed = self.remove_if_same(&entry);
                drop(removed);
                drop(entry);
                self.add_failed(req, &e);
                Err(e)
            }
        }
    }

    /// Build a pending entry and claim its tuple. Called with the
    /// cookie map locked.
    fn insert_new(
        &self,
        req: &CtFlowReq,
        tuple_nat: Tuple,
    ) -> Result<Arc<CtEntry>> {
        self.shared.reserve_entry()?;
        let entry = Arc::new(CtEntry {
            cookie: req.cookie,
            tuple: req.tuple,
            tuple_nat,
            has_nat: tuple_nat != req.tuple,
            zone_id: self.zone_id.clone(),
            flags: AtomicU8::new(0),
            restore_cookie: AtomicU64::new(req.restore_cookie.0),
            counter: OnceLock::new(),
            hw: KMutex::new(None),
            next: KMutex::new(None),
            shared: self.shared.clone(),
        });

        let res = self.shared.tuples.lock().insert(&entry);
        match res {
            Ok(()) => Ok(entry),
            Err(e) => {
                // Never indexed, so its drop only returns the slot.
                drop(entry);
                self.shared.stats().add_dup.incr(1);
                Err(e)
            }
        }
    }

    /// Acquire the entry's counter and install its rule.
    fn install(&self, entry: &CtEntry, req: &CtFlowReq) -> Result<()> {
        let counter = self.select_counter(entry, req)?;
        let counter_id = counter.id();
        let _ = entry.counter.set(counter);

        let (labels, mod_hdr) = self.rewrite(entry, req)?;
        let table =
            if entry.has_nat { &self.shared.ct_nat } else { &self.shared.ct };
        let spec = RuleSpec {
            prio: 0,
            matches: entry.match_spec(),
            mod_hdr: Some(mod_hdr.id()),
            counter: Some(counter_id),
            dest: self.shared.post_act.id(),
        };
        let rule = table.add_rule(None, spec)?;
        *entry.hw.lock() = Some(ZoneRule { rule, mod_hdr, labels });
        Ok(())
    }

    /// Share the counter of the opposite direction when accounting
    /// allows it.
    fn select_counter(
        &self,
        entry: &CtEntry,
        req: &CtFlowReq,
    ) -> Result<Arc<CtCounter>> {
        let counters = &self.shared.counters;
        let per_conn = self.shared.cfg.accounting
            == AccountingMode::PerConnection
            || req.accounting == Some(AccountingMode::PerConnection);
        if per_conn {
            return counters.create_exclusive();
        }

        let rev = self.shared.tuples.lock().lookup_valid(&entry.tuple.reverse());
        let shared = rev
            .as_ref()
            .and_then(|r| r.counter())
            .and_then(|c| counters.share(c));
        drop(rev);

        match shared {
            Some(c) => {
                self.shared.stats().counters_shared.incr(1);
                Ok(c)
            }
            None => counters.create_shared(),
        }
    }

    /// Build the header rewrite for `req`: connection state, mark,
    /// labels, zone restore id, and the NAT rewrites.
    fn rewrite(
        &self,
        entry: &CtEntry,
        req: &CtFlowReq,
    ) -> Result<(Option<MappedId<CtLabels>>, HwModHdr)> {
        // All-zero labels are the common case and use the sentinel.
        let labels = if req.labels.is_zero() {
            None
        } else {
            Some(self.shared.label_map.acquire(req.labels)?)
        };
        let label_id = labels.as_ref().map_or(0, MappedId::id);

        let mut state = CtStateFlags::TRK;
        state |= if req.established {
            CtStateFlags::EST
        } else {
            CtStateFlags::NEW
        };
        if req.reply {
            state |= CtStateFlags::REPLY;
        }
        if entry.has_nat {
            state |= CtStateFlags::NAT;
        }

        let mut b = ModHdrBuilder::new();
        b.set_reg(Reg::CtState, u32::from(state.bits()))?
            .set_reg(Reg::Mark, req.mark)?
            .set_reg(Reg::Labels, label_id)?
            .set_reg(Reg::ZoneRestore, entry.zone_id())?;
        if entry.has_nat {
            b.nat(&entry.tuple, &entry.tuple_nat)?;
        }

        let mod_hdr = HwModHdr::alloc(&self.shared.hw, b.finish())?;
        Ok((labels, mod_hdr))
    }

    /// Make an installed entry visible to tuple lookups, unless it was
    /// deleted while being installed. Returns any update which arrived
    /// in the meantime.
    fn publish(&self, entry: &Arc<CtEntry>) -> Option<CtFlowReq> {
        let (published, next) = {
            let entries = self.entries.lock();
            let ours = entries
                .get(&entry.cookie)
                .is_some_and(|e| Arc::ptr_eq(e, entry));
            let mut tuples = self.shared.tuples.lock();
            if ours && tuples.set_valid(entry) {
                (true, entry.next.lock().take())
            } else {
                (false, None)
            }
        };

        if published {
            let stats = self.shared.stats();
            stats.add_ok.incr(1);
            stats.offloaded.incr(1);
            entry_add_probe(self.zone, entry.cookie, &entry.tuple, entry.has_nat);
        }
        next
    }

    fn add_failed(&self, req: &CtFlowReq, e: &OffloadError) {
        if e.is_quiet() {
            return;
        }

        self.shared.stats().add_err.incr(1);
        self.shared.log(
            LogLevel::Error,
            &format!(
                "failed to offload {} (cookie {}): {e}",
                req.tuple, req.cookie
            ),
        );
    }

    /// Remove `entry` from the cookie map if it still owns its cookie.
    fn remove_if_same(&self, entry: &Arc<CtEntry>) -> Option<Arc<CtEntry>> {
        let mut entries = self.entries.lock();
        match entries.get(&entry.cookie) {
            Some(e) if Arc::ptr_eq(e, entry) => entries.remove(&entry.cookie),
            _ => None,
        }
    }

    /// Update an existing entry with a new restore cookie and state.
    ///
    /// Only the header rewrite changes; the rule is updated in place.
    /// If the update fails the entry is deleted.
    fn update(
        &self,
        entry: Arc<CtEntry>,
        req: &CtFlowReq,
        tuple_nat: Tuple,
    ) -> Result<()> {
        let changed = entry.restore_cookie() != req.restore_cookie;
        if changed && (entry.tuple != req.tuple || entry.tuple_nat != tuple_nat)
        {
            let err = OffloadError::Inconsistent(format!(
                "cookie {} changed tuple from {} to {}",
                req.cookie, entry.tuple, req.tuple
            ));
            self.fail_update(entry, &err);
            return Err(err);
        }

        // The install in progress owns the rule. The latest request is
        // applied once it publishes the entry.
        let pending = {
            let _tuples = self.shared.tuples.lock();
            let pending = !entry.is_valid();
            if pending {
                *entry.next.lock() = changed.then(|| req.clone());
            }
            pending
        };

        if pending || !changed {
            self.shared.stats().add_dup.incr(1);
            return Ok(());
        }

        match self.rebuild(&entry, req) {
            Ok(()) => {
                {
                    let _tuples = self.shared.tuples.lock();
                    entry
                        .restore_cookie
                        .store(req.restore_cookie.0, Ordering::Release);
                }
                self.shared.stats().update_ok.incr(1);
                Ok(())
            }

            Err(e) => {
                self.fail_update(entry, &e);
                Err(e)
            }
        }
    }

    fn rebuild(&self, entry: &CtEntry, req: &CtFlowReq) -> Result<()> {
        let (labels, mod_hdr) = self.rewrite(entry, req)?;

        let stale = {
            let mut hw = entry.hw.lock();
            let Some(zr) = hw.as_mut() else {
                return Err(OffloadError::Inconsistent(format!(
                    "valid entry {} has no rule",
                    entry.cookie
                )));
            };

            let spec =
                RuleSpec { mod_hdr: Some(mod_hdr.id()), ..zr.rule.spec().clone() };
            zr.rule.update(spec)?;
            (
                core::mem::replace(&mut zr.mod_hdr, mod_hdr),
                core::mem::replace(&mut zr.labels, labels),
            )
        };

        drop(stale);
        Ok(())
    }

    fn fail_update(&self, entry: Arc<CtEntry>, e: &OffloadError) {
        self.shared.stats().update_err.incr(1);
        self.shared.log(
            LogLevel::Error,
            &format!(
                "failed to update {} (cookie {}), removing: {e}",
                entry.tuple, entry.cookie
            ),
        );
        let removed = self.remove_if_same(&entry);
        drop(removed);
    }

    /// Delete the entry for `cookie`. Its hardware state is released
    /// once no one else holds it.
    pub fn del(&self, cookie: CtCookie) -> Result<()> {
        let entry =
            self.entries.lock().remove(&cookie).ok_or(OffloadError::NotFound)?;
        self.shared.stats().del.incr(1);
        drop(entry);
        Ok(())
    }

    /// Report the hardware counters of a valid entry.
    pub fn stats(&self, cookie: CtCookie) -> Result<CtStats> {
        self.shared.stats().stats_query.incr(1);
        let entry = self.get(cookie).ok_or(OffloadError::NotFound)?;
        if !entry.is_valid() {
            return Err(OffloadError::NotFound);
        }

        let Some(counter) = entry.counter() else {
            return Err(OffloadError::Inconsistent(format!(
                "valid entry {cookie} has no counter"
            )));
        };
        self.shared.counters.query(counter)
    }

    /// Remove every entry, returning how many there were.
    pub fn drain(&self) -> usize {
        let entries = core::mem::take(&mut *self.entries.lock());
        let n = entries.len();
        drop(entries);
        n
    }

    pub fn dump(&self) -> Vec<CtEntryDump> {
        let entries: Vec<Arc<CtEntry>> =
            self.entries.lock().values().cloned().collect();
        entries.iter().map(|e| e.dump(self.zone)).collect()
    }
}

impl CtEventListener for CtCache {
    fn flow_add(&self, req: &CtFlowReq) -> Result<()> {
        self.add(req)
    }

    fn flow_del(&self, cookie: CtCookie) -> Result<()> {
        self.del(cookie)
    }

    fn flow_stats(&self, cookie: CtCookie) -> Result<CtStats> {
        self.stats(cookie)
    }
}

fn entry_add_probe(zone: u16, cookie: CtCookie, tuple: &Tuple, nat: bool) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::ctoff_provider::ct__entry__add!(
                || (zone, cookie.0, tuple.to_string(), u8::from(nat))
            );
        } else {
            let (_, _, _, _) = (zone, cookie, tuple, nat);
        }
    }
}

fn entry_del_probe(zone: u16, cookie: CtCookie, tuple: &Tuple) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::ctoff_provider::ct__entry__del!(
                || (zone, cookie.0, tuple.to_string())
            );
        } else {
            let (_, _, _) = (zone, cookie, tuple);
        }
    }
}
