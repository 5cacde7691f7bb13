// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Zone contexts.
//!
//! A zone context is created on first use of a zone and lives as long
//! as some offloaded rule holds an `Arc` to it. It owns the zone's
//! compressed id, its pre-CT tables, and its connection cache. The
//! registry holds a weak reference to the context and a strong one to
//! its cache, so readers never end up owning a context.

use super::Result;
use super::ct::CtCache;
use super::ct::CtShared;
use super::mapping::MappedId;
use super::pre_ct::PreCtTable;
use super::tracker::CtEventListener;
use super::tracker::CtTracker;
use crate::LogLevel;
use crate::ddi::sync::KMutex;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::sync::Weak;

struct ZoneSlot {
    ctx: Weak<ZoneCtx>,
    cache: Arc<CtCache>,
}

type ZoneMap = KMutex<BTreeMap<u16, ZoneSlot>>;

pub struct ZoneCtx {
    zone: u16,
    cache: Arc<CtCache>,
    pre_ct: PreCtTable,
    pre_ct_nat: PreCtTable,
    zone_id: Arc<MappedId<u16>>,
    registry: Arc<ZoneMap>,
    tracker: Arc<dyn CtTracker>,
    shared: Arc<CtShared>,
}

impl ZoneCtx {
    /// Build every part of the context. On failure whatever was built
    /// is released in reverse order.
    fn create(
        zone: u16,
        registry: &Arc<ZoneMap>,
        shared: &Arc<CtShared>,
        tracker: &Arc<dyn CtTracker>,
    ) -> Result<Arc<Self>> {
        let zone_id = Arc::new(shared.zone_map.acquire(zone)?);
        let pre_ct = PreCtTable::new(shared, zone, zone_id.id(), false)?;
        let pre_ct_nat = PreCtTable::new(shared, zone, zone_id.id(), true)?;
        let cache =
            Arc::new(CtCache::new(zone, zone_id.clone(), shared.clone()));
        tracker.register(zone, cache.clone())?;

        shared.stats().zones.incr(1);
        zone_probe(true, zone, zone_id.id());

        Ok(Arc::new(Self {
            zone,
            cache,
            pre_ct,
            pre_ct_nat,
            zone_id,
            registry: registry.clone(),
            tracker: tracker.clone(),
            shared: shared.clone(),
        }))
    }

    pub fn zone(&self) -> u16 {
        self.zone
    }

    pub fn zone_id(&self) -> u32 {
        self.zone_id.id()
    }

    pub fn cache(&self) -> &Arc<CtCache> {
        &self.cache
    }

    pub fn pre_ct(&self, nat: bool) -> &PreCtTable {
        if nat { &self.pre_ct_nat } else { &self.pre_ct }
    }
}

impl Drop for ZoneCtx {
    fn drop(&mut self) {
        self.shared.taskq.flush();

        let listener: Arc<dyn CtEventListener> = self.cache.clone();
        self.tracker.unregister(self.zone, &listener);
        drop(listener);

        let drained = self.cache.drain();
        self.shared.taskq.flush();
        if drained > 0 {
            self.shared.log(
                LogLevel::Note,
                &format!("zone {} destroyed with {drained} entries", self.zone),
            );
        }

        let removed = {
            let this: *const ZoneCtx = self;
            let mut zones = self.registry.lock();
            match zones.entry(self.zone) {
                Entry::Occupied(o) if core::ptr::eq(o.get().ctx.as_ptr(), this) => {
                    Some(o.remove())
                }
                _ => None,
            }
        };
        drop(removed);

        self.shared.stats().zones.decr(1);
        zone_probe(false, self.zone, self.zone_id.id());
    }
}

/// All live zone contexts, by zone.
pub struct ZoneRegistry {
    zones: Arc<ZoneMap>,
    shared: Arc<CtShared>,
    tracker: Arc<dyn CtTracker>,
}

impl ZoneRegistry {
    pub(crate) fn new(shared: Arc<CtShared>, tracker: Arc<dyn CtTracker>) -> Self {
        Self { zones: Arc::new(KMutex::new(BTreeMap::new())), shared, tracker }
    }

    /// Return the context of `zone`, creating it if needed.
    /// Return the context of `zone`, creating it if needed. Must be
    /// called under the control lock.
    pub fn get_or_create(&self, zone: u16) -> Result<Arc<ZoneCtx>> {
        let mut zones = self.zones.lock();
        if let Some(ctx) = zones.get(&zone).and_then(|s| s.ctx.upgrade()) {
            return Ok(ctx);
        }

        let ctx = ZoneCtx::create(zone, &self.zones, &self.shared, &self.tracker)?;
        let slot =
            ZoneSlot { ctx: Arc::downgrade(&ctx), cache: ctx.cache.clone() };
        let stale = zones.insert(zone, slot);
        drop(zones);
        drop(stale);
        Ok(ctx)
    }

    #[cfg(any(feature = "test-help", test))]
    pub(crate) fn get(&self, zone: u16) -> Option<Arc<ZoneCtx>> {
        let ctx = self.zones.lock().get(&zone).and_then(|s| s.ctx.upgrade());
        ctx
    }

    pub fn cache(&self, zone: u16) -> Option<Arc<CtCache>> {
        let cache = self.zones.lock().get(&zone).map(|s| s.cache.clone());
        cache
    }

    /// The cache of every registered zone, in zone order.
    pub fn caches(&self) -> Vec<Arc<CtCache>> {
        let caches = self.zones.lock().values().map(|s| s.cache.clone()).collect();
        caches
    }

    pub fn len(&self) -> usize {
        self.zones.lock().len()
    }
}

fn zone_probe(create: bool, zone: u16, zone_id: u32) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            if create {
                crate::ctoff_provider::zone__create!(|| (zone, zone_id));
            } else {
                crate::ctoff_provider::zone__destroy!(|| (zone, zone_id));
            }
        } else {
            let (_, _, _) = (create, zone, zone_id);
        }
    }
}
