//! Lock acquisition that survives poisoning: the poisoning is logged and the
//! data used as-is.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Mutex was poisoned by a panicking holder; recovering its data");
        poisoned.into_inner()
    })
}

pub(crate) fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("RwLock was poisoned during read; recovering its data");
        poisoned.into_inner()
    })
}

pub(crate) fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("RwLock was poisoned during write; recovering its data");
        poisoned.into_inner()
    })
}
