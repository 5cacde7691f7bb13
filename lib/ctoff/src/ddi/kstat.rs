// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named statistics in the style of illumos kstats.
//!
//! See `kstat_create(9F)`. There is no kstat framework to register
//! with here; a [`KStatNamed`] simply owns the values so they can be
//! read back through [`KStatProvider::snapshot`].

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The longest name a kstat may carry, not counting the NUL.
pub const KSTAT_STRLEN: usize = 31;

/// A provider of named kstats.
///
/// Rather than implementing this trait manually, the kstat-macro
/// should be used.
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct SomeStats {
///     adds: KStatU64,
///     dels: KStatU64,
/// }
/// ```
pub trait KStatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn init(&mut self) -> Result<(), Error>;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

/// Initialize and hold a [`KStatProvider`].
///
/// This should be called **exactly** once for a given provider.
pub struct KStatNamed<T: KStatProvider> {
    pub module: String,
    pub name: String,
    pub vals: Box<T>,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        check_name(module)?;
        check_name(name)?;
        let mut vals = Box::new(provider);
        vals.init()?;
        Ok(Self { module: module.to_string(), name: name.to_string(), vals })
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.contains('\0') {
        return Err(Error::NulChar);
    }

    if name.len() > KSTAT_STRLEN {
        return Err(Error::NameTooLong(name.to_string()));
    }

    Ok(())
}

/// A 64-bit unsigned named kstat.
///
/// Updates go through `&self` so that a single stats block can be
/// shared between threads.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: AtomicU64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        check_name(name)
    }

    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn incr(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn decr(&self, n: u64) {
        let _ = self.value.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |v| Some(v.saturating_sub(n)),
        );
    }

    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A kstat error.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("kstat name too long: {0}")]
    NameTooLong(String),
    #[error("kstat name contains NUL char")]
    NulChar,
}

#[cfg(test)]
mod test {
    use super::*;

    struct TwoStats {
        hits: KStatU64,
        misses: KStatU64,
    }

    impl KStatProvider for TwoStats {
        const NUM_FIELDS: u32 = 2;
        type Snap = (u64, u64);

        fn init(&mut self) -> Result<(), Error> {
            self.hits.init("hits")?;
            self.misses.init("misses")
        }

        fn new() -> Self {
            Self { hits: KStatU64::new(), misses: KStatU64::new() }
        }

        fn snapshot(&self) -> Self::Snap {
            (self.hits.val(), self.misses.val())
        }
    }

    #[test]
    fn update_and_snapshot() {
        let ks = KStatNamed::new("ctoff", "test", TwoStats::new()).unwrap();
        ks.vals.hits.incr(3);
        ks.vals.misses.incr(1);
        ks.vals.misses.decr(4);
        assert_eq!(ks.vals.snapshot(), (3, 0));
        assert_eq!(ks.vals.num_fields(), 2);
    }

    #[test]
    fn bad_names() {
        let long = "x".repeat(KSTAT_STRLEN + 1);
        assert_eq!(
            KStatNamed::new("ctoff", &long, TwoStats::new()).err(),
            Some(Error::NameTooLong(long.clone()))
        );
        assert_eq!(
            KStatNamed::new("ct\0off", "ok", TwoStats::new()).err(),
            Some(Error::NulChar)
        );
    }
}
