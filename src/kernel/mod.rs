//! Thin wrappers around Linux kernel privilege primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: syscall -> bitset -> capset -> ambient -> credentials

pub mod ambient;
pub(crate) mod bitset;
pub mod capset;
pub mod credentials;
pub mod syscall;

use std::sync::{Mutex, MutexGuard, PoisonError};

// prctl command numbers, per <linux/prctl.h>.
pub(crate) const PR_SET_KEEPCAPS: libc::c_long = 8;
pub(crate) const PR_SET_NAME: libc::c_long = 15;
pub(crate) const PR_CAPBSET_READ: libc::c_long = 23;
pub(crate) const PR_CAPBSET_DROP: libc::c_long = 24;
pub(crate) const PR_GET_SECUREBITS: libc::c_long = 27;
pub(crate) const PR_SET_SECUREBITS: libc::c_long = 28;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_long = 38;
pub(crate) const PR_CAP_AMBIENT: libc::c_long = 47;
pub(crate) const PR_CAP_AMBIENT_IS_SET: libc::c_long = 1;
pub(crate) const PR_CAP_AMBIENT_RAISE: libc::c_long = 2;
pub(crate) const PR_CAP_AMBIENT_LOWER: libc::c_long = 3;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_long = 4;

/// Lock a store mutex, recovering the data on poison. A panic elsewhere
/// must not wedge privilege state that later cleanup paths need to push.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
