//! Credential transitions that keep capability state consistent.
//!
//! Each operation raises exactly the capability the kernel demands for it
//! in Effective, performs the change, and clears Effective again on every
//! exit path. The uid change is additionally bracketed with the kernel's
//! legacy keep-capabilities flag so Permitted survives the transition.

use super::capset::CapSet;
use super::syscall::{multithread, Syscaller};
use super::PR_SET_KEEPCAPS;
use crate::types::{CapValue, Flag, Result};
use libc::c_long;
use nix::unistd::{Gid, Uid};
use std::ffi::CStr;

/// Change uid without losing Permitted capabilities. Effective is cleared
/// by the time this returns, success or failure.
pub fn switch_uid(uid: Uid) -> Result<()> {
    switch_uid_with(&multithread(), uid)
}

pub(crate) fn switch_uid_with(sc: &Syscaller, uid: Uid) -> Result<()> {
    let working = CapSet::current()?;
    working.set_flag(Flag::Effective, &[CapValue::SETUID], true);

    let _ = sc.wprctl3("keepcaps", PR_SET_KEEPCAPS, 1, 0);
    let mut result = working.set_proc_with(sc);
    if result.is_ok() {
        result = sc.write3("setuid", libc::SYS_setuid, uid.as_raw() as c_long, 0, 0, || {
            // SAFETY: setuid with any uid value is safe; failure is reported.
            unsafe { libc::setuid(uid.as_raw()) }
        });
    }

    let _ = sc.wprctl3("keepcaps", PR_SET_KEEPCAPS, 0, 0);
    working.clear_flag(Flag::Effective);
    let _ = working.set_proc_with(sc);

    result
}

/// Change gid and the supplementary group list in one bracketed operation.
/// The gid changes first so group membership never outlives it.
pub fn switch_groups(gid: Gid, groups: &[Gid]) -> Result<()> {
    switch_groups_with(&multithread(), gid, groups)
}

pub(crate) fn switch_groups_with(sc: &Syscaller, gid: Gid, groups: &[Gid]) -> Result<()> {
    let working = CapSet::current()?;
    working.set_flag(Flag::Effective, &[CapValue::SETGID], true);

    let mut result = working.set_proc_with(sc);
    if result.is_ok() {
        result = sc.write3("setgid", libc::SYS_setgid, gid.as_raw() as c_long, 0, 0, || {
            // SAFETY: setgid with any gid value is safe; failure is reported.
            unsafe { libc::setgid(gid.as_raw()) }
        });
    }
    if result.is_ok() {
        let raw: Vec<libc::gid_t> = groups.iter().map(|g| g.as_raw()).collect();
        result = sc.write3(
            "setgroups",
            libc::SYS_setgroups,
            raw.len() as c_long,
            raw.as_ptr() as c_long,
            0,
            || {
                // SAFETY: the pointer and length describe a live gid array.
                unsafe { libc::setgroups(raw.len(), raw.as_ptr()) }
            },
        );
    }

    working.clear_flag(Flag::Effective);
    let _ = working.set_proc_with(sc);

    result
}

/// Enter a chroot and move the working directory inside it. Both steps are
/// needed before the new root is actually escape-proof against relative
/// path traversal.
pub fn enter_root(root: &CStr) -> Result<()> {
    enter_root_with(&multithread(), root)
}

pub(crate) fn enter_root_with(sc: &Syscaller, root: &CStr) -> Result<()> {
    let working = CapSet::current()?;
    working.set_flag(Flag::Effective, &[CapValue::SYS_CHROOT], true);

    let mut result = working.set_proc_with(sc);
    if result.is_ok() {
        result = sc.write3(
            "chroot",
            libc::SYS_chroot,
            root.as_ptr() as c_long,
            0,
            0,
            || {
                // SAFETY: root is a valid NUL-terminated path.
                unsafe { libc::chroot(root.as_ptr()) }
            },
        );
    }
    if result.is_ok() {
        result = sc.write3(
            "chdir",
            libc::SYS_chdir,
            b"/\0".as_ptr() as c_long,
            0,
            0,
            || {
                // SAFETY: literal NUL-terminated path.
                unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) }
            },
        );
    }

    working.clear_flag(Flag::Effective);
    let _ = working.set_proc_with(sc);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_uid_clears_effective_even_on_failure() {
        // Unprivileged: changing to another uid fails, but the bracket must
        // still leave Effective empty.
        if Uid::effective().is_root() {
            return;
        }
        let result = switch_uid(Uid::from_raw(1));
        assert!(result.is_err());
        let current = CapSet::current().unwrap();
        assert!(!current.get_flag(Flag::Effective, CapValue::SETUID));
    }

    #[test]
    fn switch_groups_rejects_without_privilege() {
        if Uid::effective().is_root() {
            return;
        }
        let result = switch_groups(Gid::from_raw(1), &[Gid::from_raw(1)]);
        assert!(result.is_err());
    }

    #[test]
    fn enter_root_requires_privilege() {
        if Uid::effective().is_root() {
            return;
        }
        let root = CStr::from_bytes_with_nul(b"/tmp\0").unwrap();
        assert!(enter_root(root).is_err());
    }
}
