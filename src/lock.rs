//! Poison recovery for store and engine locks.
//!
//! A panic inside a subscriber callback (or a test) poisons whatever lock
//! was held at the time, while the cached data behind it is still
//! structurally sound. Every lock in this crate is therefore taken through
//! these extensions, which recover the guard and log the incident instead
//! of spreading the panic to every later caller.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(result: Result<G, PoisonError<G>>, site: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(site, "recovered poisoned cache lock");
        poisoned.into_inner()
    })
}

pub(crate) trait RecoverRwLock<T> {
    fn read_recovered(&self, site: &'static str) -> RwLockReadGuard<'_, T>;
    fn write_recovered(&self, site: &'static str) -> RwLockWriteGuard<'_, T>;
}

impl<T> RecoverRwLock<T> for RwLock<T> {
    fn read_recovered(&self, site: &'static str) -> RwLockReadGuard<'_, T> {
        recover(self.read(), site)
    }

    fn write_recovered(&self, site: &'static str) -> RwLockWriteGuard<'_, T> {
        recover(self.write(), site)
    }
}

pub(crate) trait RecoverMutex<T> {
    fn lock_recovered(&self, site: &'static str) -> MutexGuard<'_, T>;
}

impl<T> RecoverMutex<T> for Mutex<T> {
    fn lock_recovered(&self, site: &'static str) -> MutexGuard<'_, T> {
        recover(self.lock(), site)
    }
}
