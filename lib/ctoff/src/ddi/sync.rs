// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
//!
//! These mirror the illumos `mutex(9F)` and `condvar(9F)` interfaces
//! on top of the std primitives. Every critical section in the engine
//! leaves its state consistent before anything that can panic, so a
//! poisoned lock is simply recovered.

use core::ops::Deref;
use core::ops::DerefMut;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::TryLockError;

/// A mutex, modelled on `kmutex_t`.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

/// Returned by [`KMutex::try_lock`] when another thread holds the
/// lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockTaken;

impl<T> KMutex<T> {
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }

    pub fn try_lock(&self) -> Result<KMutexGuard<'_, T>, LockTaken> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(KMutexGuard { guard }),
            Err(TryLockError::Poisoned(e)) => {
                Ok(KMutexGuard { guard: e.into_inner() })
            }
            Err(TryLockError::WouldBlock) => Err(LockTaken),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default> Default for KMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A condition variable, modelled on `kcondvar_t`.
pub struct KCondvar {
    cv: Condvar,
}

impl KCondvar {
    pub fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    pub fn wait<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
    ) -> KMutexGuard<'a, T> {
        let guard =
            self.cv.wait(lock.guard).unwrap_or_else(PoisonError::into_inner);
        KMutexGuard { guard }
    }
}

impl Default for KCondvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_reports_holder() {
        let m = KMutex::new(5);
        let g = m.lock();
        assert_eq!(m.try_lock().err(), Some(LockTaken));
        drop(g);
        assert_eq!(*m.try_lock().unwrap(), 5);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let m = Arc::new(KMutex::new(0u32));
        let m2 = m.clone();
        let res = thread::spawn(move || {
            let mut g = m2.lock();
            *g = 7;
            panic!("poison");
        })
        .join();
        assert!(res.is_err());
        assert_eq!(*m.lock(), 7);
    }

    #[test]
    fn condvar_wakes_all_waiters() {
        let state = Arc::new((KMutex::new(false), KCondvar::new()));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let state = state.clone();
                thread::spawn(move || {
                    let (lock, cv) = &*state;
                    let mut ready = lock.lock();
                    while !*ready {
                        ready = cv.wait(ready);
                    }
                })
            })
            .collect();

        {
            let (lock, cv) = &*state;
            *lock.lock() = true;
            cv.notify_all();
        }

        for w in waiters {
            w.join().unwrap();
        }
    }
}
