//! Ambient and bounding set helpers, secure bits, and prctl passthroughs.
//!
//! Reads are plain per-thread calls; every mutation goes through a
//! [`Syscaller`] so the POSIX broadcast override applies.

use super::syscall::{multithread, Syscaller};
use super::{
    PR_CAPBSET_DROP, PR_CAPBSET_READ, PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL,
    PR_CAP_AMBIENT_IS_SET, PR_CAP_AMBIENT_LOWER, PR_CAP_AMBIENT_RAISE, PR_GET_SECUREBITS,
    PR_SET_NO_NEW_PRIVS, PR_SET_SECUREBITS,
};
use crate::types::{CapError, CapValue, Result};
use libc::c_long;
use nix::errno::Errno;
use std::sync::OnceLock;

fn prctl_read(op: &'static str, cmd: c_long, a1: c_long, a2: c_long) -> Result<c_long> {
    // SAFETY: read-only prctl commands; errors surface as -1/errno.
    let rc = unsafe { libc::prctl(cmd as libc::c_int, a1, a2, 0, 0) };
    if rc < 0 {
        Err(CapError::sys(op, Errno::last()))
    } else {
        Ok(rc as c_long)
    }
}

/// Highest defined capability index plus one, per the running kernel.
///
/// Read once from /proc; if that file is unreadable the bounding set is
/// probed instead, which works on any kernel new enough to matter here.
pub fn max_bits() -> u32 {
    static MAX: OnceLock<u32> = OnceLock::new();
    *MAX.get_or_init(|| {
        if let Ok(text) = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap") {
            if let Ok(last) = text.trim().parse::<u32>() {
                return (last + 1).min(CapValue::CAPACITY);
            }
        }
        let mut bits = 0;
        while bits < CapValue::CAPACITY {
            let probe = match CapValue::new(bits) {
                Some(cap) => cap,
                None => break,
            };
            if get_bound(probe).is_err() {
                break;
            }
            bits += 1;
        }
        bits.max(1)
    })
}

/// Query one ambient bit. An index beyond the kernel's range comes back as
/// the kernel's error, which is also how the end of the range is discovered.
pub fn get_ambient(cap: CapValue) -> Result<bool> {
    let rc = prctl_read(
        "cap_get_ambient",
        PR_CAP_AMBIENT,
        PR_CAP_AMBIENT_IS_SET,
        cap.value() as c_long,
    )?;
    Ok(rc == 1)
}

/// Whether the running kernel supports the ambient set at all.
pub fn ambient_supported() -> bool {
    get_ambient(CapValue::CHOWN).is_ok()
}

/// Raise or lower exactly one ambient bit.
pub fn set_ambient(cap: CapValue, on: bool) -> Result<()> {
    set_ambient_with(&multithread(), cap, on)
}

pub(crate) fn set_ambient_with(sc: &Syscaller, cap: CapValue, on: bool) -> Result<()> {
    let request = if on {
        PR_CAP_AMBIENT_RAISE
    } else {
        PR_CAP_AMBIENT_LOWER
    };
    sc.wprctl6(
        "cap_set_ambient",
        PR_CAP_AMBIENT,
        request,
        cap.value() as c_long,
        0,
        0,
        0,
    )
    .map(|_| ())
}

/// Erase the ambient set.
///
/// The bits are read back first: if the walk reaches the end of the defined
/// range without finding a raised bit, the set is already empty and the
/// clear-all primitive is skipped. That keeps this working on kernels where
/// the ambient API is administratively locked but the set is empty, where
/// clear-all would fail for no useful reason.
pub fn reset_ambient() -> Result<()> {
    reset_ambient_with(&multithread())
}

pub(crate) fn reset_ambient_with(sc: &Syscaller) -> Result<()> {
    let mut index = 0;
    loop {
        let cap = match CapValue::new(index) {
            Some(cap) => cap,
            None => break,
        };
        match get_ambient(cap) {
            Err(_) => return Ok(()),
            Ok(true) => break,
            Ok(false) => index += 1,
        }
    }
    sc.wprctl6(
        "cap_reset_ambient",
        PR_CAP_AMBIENT,
        PR_CAP_AMBIENT_CLEAR_ALL,
        0,
        0,
        0,
        0,
    )
    .map(|_| ())
}

/// Query one bounding-set bit.
pub fn get_bound(cap: CapValue) -> Result<bool> {
    let rc = prctl_read("cap_get_bound", PR_CAPBSET_READ, cap.value() as c_long, 0)?;
    Ok(rc == 1)
}

/// Drop one bounding-set bit. Irreversible for the life of the process tree.
pub fn drop_bound(cap: CapValue) -> Result<()> {
    drop_bound_with(&multithread(), cap)
}

pub(crate) fn drop_bound_with(sc: &Syscaller, cap: CapValue) -> Result<()> {
    sc.wprctl3("cap_drop_bound", PR_CAPBSET_DROP, cap.value() as c_long, 0)
        .map(|_| ())
}

/// Read the securebits word of the current process.
pub fn get_secbits() -> u32 {
    // PR_GET_SECUREBITS cannot fail on any kernel with capability support.
    // SAFETY: read-only prctl.
    let rc = unsafe { libc::prctl(PR_GET_SECUREBITS as libc::c_int, 0, 0, 0, 0) };
    rc as u32
}

/// Set the securebits word of the current process.
pub fn set_secbits(bits: u32) -> Result<()> {
    set_secbits_with(&multithread(), bits)
}

pub(crate) fn set_secbits_with(sc: &Syscaller, bits: u32) -> Result<()> {
    sc.wprctl3("cap_set_secbits", PR_SET_SECUREBITS, bits as c_long, 0)
        .map(|_| ())
}

pub(crate) fn set_no_new_privs_with(sc: &Syscaller) -> Result<()> {
    sc.wprctl6("no_new_privs", PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0, 0)
        .map(|_| ())
}

/// Plain 6-argument prctl on the calling thread.
pub fn prctl(cmd: c_long, a1: c_long, a2: c_long, a3: c_long, a4: c_long, a5: c_long) -> Result<c_long> {
    // SAFETY: forwarding call; failures surface as error returns.
    let rc = unsafe { libc::prctl(cmd as libc::c_int, a1, a2, a3, a4, a5) };
    if rc < 0 {
        Err(CapError::sys("prctl", Errno::last()))
    } else {
        Ok(rc as c_long)
    }
}

/// State-writing 6-argument prctl with process-wide semantics. Use this
/// rather than [`prctl`] whenever the call mutates kernel state.
pub fn prctlw(cmd: c_long, a1: c_long, a2: c_long, a3: c_long, a4: c_long, a5: c_long) -> Result<c_long> {
    multithread().wprctl6("prctlw", cmd, a1, a2, a3, a4, a5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_bits_is_sane() {
        let bits = max_bits();
        assert!(bits >= 1);
        assert!(bits <= CapValue::CAPACITY);
        // Every current kernel defines at least the POSIX-draft range.
        assert!(bits > CapValue::SYS_CHROOT.value());
    }

    #[test]
    fn bounding_reads_never_panic() {
        for index in 0..CapValue::CAPACITY {
            let cap = CapValue::new(index).unwrap();
            let _ = get_bound(cap);
        }
    }

    #[test]
    fn ambient_query_past_range_reports_kernel_error() {
        if !ambient_supported() {
            return;
        }
        let past_range = CapValue::new(CapValue::CAPACITY - 1).unwrap();
        if past_range.value() >= max_bits() {
            assert!(get_ambient(past_range).is_err());
        }
    }

    #[test]
    fn reset_ambient_on_empty_set_is_idempotent() {
        // Under a normal unprivileged test run the ambient set is empty, so
        // both calls take the no-syscall path and succeed.
        let first = reset_ambient();
        let second = reset_ambient();
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
