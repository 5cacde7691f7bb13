// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Hardware packet/byte counters.
//!
//! A counter is held through an `Arc<CtCounter>`. An exclusive counter
//! has a single holder. A shared counter may be handed to the entry
//! for the opposite direction of the same connection, and is freed
//! once both directions let go of it.

use super::Result;
use super::hw::CounterId;
use super::hw::HwCtx;
use ctoff_api::CtStats;
use std::fmt;
use std::sync::Arc;

pub struct CtCounter {
    hw: Arc<HwCtx>,
    id: CounterId,
    shared: bool,
}

impl CtCounter {
    pub fn id(&self) -> CounterId {
        self.id
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl fmt::Debug for CtCounter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CtCounter")
            .field("id", &self.id)
            .field("shared", &self.shared)
            .finish()
    }
}

impl Drop for CtCounter {
    fn drop(&mut self) {
        if let Err(e) = self.hw.backend.free_counter(self.id) {
            self.hw.ectx.log.log(
                crate::LogLevel::Error,
                &format!("failed to free counter {}: {e}", self.id.0),
            );
        }
    }
}

pub struct CounterPool {
    hw: Arc<HwCtx>,
}

impl CounterPool {
    pub fn new(hw: Arc<HwCtx>) -> Self {
        Self { hw }
    }

    fn alloc(&self, shared: bool) -> Result<Arc<CtCounter>> {
        let id = self.hw.backend.alloc_counter()?;
        Ok(Arc::new(CtCounter { hw: self.hw.clone(), id, shared }))
    }

    pub fn create_exclusive(&self) -> Result<Arc<CtCounter>> {
        self.alloc(false)
    }

    pub fn create_shared(&self) -> Result<Arc<CtCounter>> {
        self.alloc(true)
    }

    /// Take another reference on a shared counter. Exclusive counters
    /// are never handed out twice.
    pub fn share(&self, counter: &Arc<CtCounter>) -> Option<Arc<CtCounter>> {
        counter.shared.then(|| counter.clone())
    }

    pub fn query(&self, counter: &CtCounter) -> Result<CtStats> {
        let data = self.hw.backend.query_counter(counter.id)?;
        Ok(CtStats {
            bytes: data.bytes,
            packets: data.packets,
            last_used: data.last_used,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ExecCtx;
    use crate::PrintlnLog;
    use crate::engine::sim::SimHw;

    fn pool(sim: &Arc<SimHw>) -> CounterPool {
        CounterPool::new(HwCtx::new(
            sim.clone(),
            Arc::new(ExecCtx::new(Box::new(PrintlnLog))),
        ))
    }

    #[test]
    fn shared_counter_freed_on_last_release() {
        let sim = Arc::new(SimHw::new());
        let pool = pool(&sim);
        let c1 = pool.create_shared().unwrap();
        let c2 = pool.share(&c1).unwrap();
        assert_eq!(Arc::strong_count(&c1), 2);
        assert_eq!(sim.num_counters(), 1);

        drop(c1);
        assert_eq!(Arc::strong_count(&c2), 1);
        assert_eq!(sim.num_counters(), 1);
        drop(c2);
        assert_eq!(sim.num_counters(), 0);
    }

    #[test]
    fn exclusive_is_not_shared() {
        let sim = Arc::new(SimHw::new());
        let pool = pool(&sim);
        let c = pool.create_exclusive().unwrap();
        assert!(pool.share(&c).is_none());
        drop(c);
        assert_eq!(sim.num_counters(), 0);
    }

    #[test]
    fn query_reports_hw_values() {
        let sim = Arc::new(SimHw::new());
        let pool = pool(&sim);
        let c = pool.create_exclusive().unwrap();
        sim.set_counter(c.id(), 1500, 3);
        let stats = pool.query(&c).unwrap();
        assert_eq!((stats.bytes, stats.packets), (1500, 3));
    }
}
