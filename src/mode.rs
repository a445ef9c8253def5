//! The mode engine: named privilege postures over securebits, ambient,
//! bounding and capability-vector state.
//!
//! Every transition follows the same bracket: fetch the current
//! capabilities, raise CAP_SETPCAP in Effective (needed to touch ambient,
//! bounding and securebits state), apply the posture steps, then clear
//! Effective and push once more. The final clear-and-push runs on every
//! exit path, so a failed transition never leaves CAP_SETPCAP raised.

use crate::kernel::ambient::{
    ambient_supported, drop_bound_with, get_ambient, get_bound, get_secbits, max_bits,
    reset_ambient_with, set_no_new_privs_with, set_secbits_with,
};
use crate::kernel::capset::CapSet;
use crate::kernel::syscall::{multithread, Syscaller};
use crate::types::{CapError, CapMode, CapValue, Flag, Result};

pub const SECBIT_NOROOT: u32 = 1 << 0;
pub const SECBIT_NOROOT_LOCKED: u32 = 1 << 1;
pub const SECBIT_NO_SETUID_FIXUP: u32 = 1 << 2;
pub const SECBIT_NO_SETUID_FIXUP_LOCKED: u32 = 1 << 3;
pub const SECBIT_KEEP_CAPS: u32 = 1 << 4;
pub const SECBIT_KEEP_CAPS_LOCKED: u32 = 1 << 5;
pub const SECBIT_NO_CAP_AMBIENT_RAISE: u32 = 1 << 6;
pub const SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED: u32 = 1 << 7;

/// The locked securebits common to every non-hybrid posture.
pub const SECURED_BASIC_BITS: u32 = SECBIT_NOROOT
    | SECBIT_NOROOT_LOCKED
    | SECBIT_NO_SETUID_FIXUP
    | SECBIT_NO_SETUID_FIXUP_LOCKED
    | SECBIT_KEEP_CAPS_LOCKED;

/// [`SECURED_BASIC_BITS`] plus the ambient-raise lock, used whenever the
/// kernel supports the ambient set.
pub const SECURED_AMBIENT_BITS: u32 =
    SECURED_BASIC_BITS | SECBIT_NO_CAP_AMBIENT_RAISE | SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED;

/// Lock the process (and its descendants) into one of the named postures.
/// Whether this succeeds or fails, Effective is cleared by the time it
/// returns.
pub fn set_mode(mode: CapMode) -> Result<()> {
    log::debug!("applying capability mode {}", mode);
    set_mode_with(&multithread(), mode)
}

pub(crate) fn set_mode_with(sc: &Syscaller, mode: CapMode) -> Result<()> {
    if mode == CapMode::Uncertain {
        return Err(CapError::Invalid("cannot set mode 'uncertain'".to_string()));
    }

    let working = CapSet::current()?;
    working.set_flag(Flag::Effective, &[CapValue::SETPCAP], true);

    let mut result = working.set_proc_with(sc);
    if result.is_ok() {
        result = apply_posture(sc, mode, &working);
    }

    working.clear_flag(Flag::Effective);
    let cleanup = working.set_proc_with(sc);
    result.and(cleanup)
}

/// Posture-specific steps. Vector edits land in `working` and are committed
/// by the caller's final push; securebits, ambient, bounding and
/// no-new-privs changes hit the kernel directly.
fn apply_posture(sc: &Syscaller, mode: CapMode, working: &CapSet) -> Result<()> {
    match mode {
        CapMode::Hybrid => return set_secbits_with(sc, 0),
        CapMode::NoPriv | CapMode::Pure1eInit => working.clear_flag(Flag::Inheritable),
        CapMode::Pure1e => {}
        // Rejected by the caller; kept total rather than panicking.
        CapMode::Uncertain => {
            return Err(CapError::Invalid("cannot set mode 'uncertain'".to_string()))
        }
    }

    let mut secbits = SECURED_AMBIENT_BITS;
    if !ambient_supported() {
        secbits = SECURED_BASIC_BITS;
    } else {
        reset_ambient_with(sc)?;
    }
    set_secbits_with(sc, secbits)?;

    if mode != CapMode::NoPriv {
        return Ok(());
    }

    // Individual drop failures are ignored; any surviving bit shows up in
    // the reverse classification.
    for index in 0..max_bits() {
        if let Some(cap) = CapValue::new(index) {
            let _ = drop_bound_with(sc, cap);
        }
    }
    working.clear_flag(Flag::Permitted);
    let _ = set_no_new_privs_with(sc);
    Ok(())
}

/// Classify the current process state back into a posture.
pub fn get_mode() -> CapMode {
    let secbits = get_secbits();
    if secbits == 0 {
        return CapMode::Hybrid;
    }
    if secbits & SECURED_BASIC_BITS != SECURED_BASIC_BITS {
        return CapMode::Uncertain;
    }

    // The ambient set must be empty. An error on the first index means the
    // ambient API is unsupported or locked, which is fine; an error later
    // is the normal end of the defined range, at which point the securebits
    // must carry the ambient locks too.
    let mut index = 0;
    loop {
        let cap = match CapValue::new(index) {
            Some(cap) => cap,
            None => break,
        };
        match get_ambient(cap) {
            Err(_) => {
                if index > 0 && secbits != SECURED_AMBIENT_BITS {
                    return CapMode::Uncertain;
                }
                break;
            }
            Ok(true) => return CapMode::Uncertain,
            Ok(false) => index += 1,
        }
    }

    let working = match CapSet::current() {
        Ok(working) => working,
        Err(_) => return CapMode::Uncertain,
    };
    let diff = CapSet::new().compare(&working);

    if diff.differs(Flag::Inheritable) {
        return CapMode::Pure1e;
    }
    if diff.differs(Flag::Permitted) || diff.differs(Flag::Effective) {
        return CapMode::Pure1eInit;
    }

    for index in 0..max_bits() {
        if let Some(cap) = CapValue::new(index) {
            if let Ok(true) = get_bound(cap) {
                return CapMode::Pure1eInit;
            }
        }
    }

    CapMode::NoPriv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secured_bits_nest() {
        assert_eq!(
            SECURED_AMBIENT_BITS & SECURED_BASIC_BITS,
            SECURED_BASIC_BITS
        );
        assert_eq!(SECURED_BASIC_BITS, 0x2f);
        assert_eq!(SECURED_AMBIENT_BITS, 0xef);
    }

    #[test]
    fn uncertain_is_rejected_before_any_kernel_call() {
        let err = set_mode(CapMode::Uncertain).unwrap_err();
        assert!(matches!(err, CapError::Invalid(_)));
    }

    #[test]
    fn get_mode_returns_a_stable_answer() {
        // Without privilege no posture change is possible, so two reads in
        // a row must agree.
        assert_eq!(get_mode(), get_mode());
    }
}
