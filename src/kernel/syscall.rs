//! Pluggable invoker for privilege-mutating system calls.
//!
//! The kernel's capability syscalls act on the calling thread only. POSIX
//! requires process-wide semantics, so every public mutating entry point in
//! this crate routes through a process-wide `multithread` [`Syscaller`] whose
//! bindings can be overridden once with a thread-broadcasting implementation
//! (see [`set_syscall`]). A separate `singlethread` instance exists for the
//! forked launcher child, where exactly one thread exists and no broadcast
//! is needed.

use crate::types::{CapError, Result};
use libc::c_long;
use nix::errno::Errno;
use std::sync::RwLock;

/// 3-argument raw syscall binding. Returns the kernel's raw result: a
/// negative value is a negated errno, never a plain -1.
pub type Invoke3 = fn(c_long, c_long, c_long, c_long) -> c_long;

/// 6-argument raw syscall binding, same return convention as [`Invoke3`].
pub type Invoke6 = fn(c_long, c_long, c_long, c_long, c_long, c_long, c_long) -> c_long;

/// How uid/gid/groups/chroot and write-prctl operations are issued.
///
/// Carried inside the [`Syscaller`] so behavior is fully determined by the
/// value a component was given, not by a process-wide boolean.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallSemantics {
    /// Use the libc wrappers. glibc broadcasts setuid-family calls to all
    /// threads itself; prctl and capset remain per-thread.
    LibcWrappers,
    /// Route everything through the raw bindings. Selected automatically
    /// when an override is installed, on the assumption that the override
    /// provides the process-wide broadcast.
    RoutedRaw,
}

/// A pair of raw syscall entries plus the semantics flag that governs
/// whether libc wrappers may be substituted for them.
#[derive(Clone, Copy)]
pub struct Syscaller {
    pub(crate) three: Invoke3,
    pub(crate) six: Invoke6,
    pub(crate) semantics: CallSemantics,
}

fn os_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

fn direct3(nr: c_long, a1: c_long, a2: c_long, a3: c_long) -> c_long {
    // SAFETY: forwards to syscall(2); argument validity is the kernel's
    // problem and failures come back as error returns.
    let rc = unsafe { libc::syscall(nr, a1, a2, a3) };
    if rc == -1 {
        -(os_errno() as c_long)
    } else {
        rc
    }
}

fn direct6(
    nr: c_long,
    a1: c_long,
    a2: c_long,
    a3: c_long,
    a4: c_long,
    a5: c_long,
    a6: c_long,
) -> c_long {
    // SAFETY: as direct3.
    let rc = unsafe { libc::syscall(nr, a1, a2, a3, a4, a5, a6) };
    if rc == -1 {
        -(os_errno() as c_long)
    } else {
        rc
    }
}

const DIRECT: Syscaller = Syscaller {
    three: direct3,
    six: direct6,
    semantics: CallSemantics::LibcWrappers,
};

/// Invoker for the post-fork launcher child: plain raw calls, no libc
/// wrapper indirection, safe while the child is still single-threaded.
pub(crate) const SINGLETHREAD: Syscaller = Syscaller {
    three: direct3,
    six: direct6,
    semantics: CallSemantics::RoutedRaw,
};

static MULTITHREAD: RwLock<Syscaller> = RwLock::new(DIRECT);

/// Current multithread invoker, copied out so callers never hold the
/// registry lock across a kernel call.
pub(crate) fn multithread() -> Syscaller {
    *MULTITHREAD
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Override the bindings used for all process-wide privilege mutations,
/// e.g. with an implementation that executes the call on every thread.
/// Passing `None` for either entry restores the direct default.
pub fn set_syscall(three: Option<Invoke3>, six: Option<Invoke6>) {
    let mut sc = MULTITHREAD
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *sc = match (three, six) {
        (Some(three), Some(six)) => Syscaller {
            three,
            six,
            semantics: CallSemantics::RoutedRaw,
        },
        _ => DIRECT,
    };
}

impl Syscaller {
    pub(crate) fn invoke3(&self, nr: c_long, a1: c_long, a2: c_long, a3: c_long) -> c_long {
        (self.three)(nr, a1, a2, a3)
    }

    pub(crate) fn invoke6(
        &self,
        nr: c_long,
        a1: c_long,
        a2: c_long,
        a3: c_long,
        a4: c_long,
        a5: c_long,
        a6: c_long,
    ) -> c_long {
        (self.six)(nr, a1, a2, a3, a4, a5, a6)
    }

    /// State-writing prctl, 3-argument form. Raw bindings return negated
    /// errnos, so negative results are translated here.
    pub(crate) fn wprctl3(
        &self,
        op: &'static str,
        cmd: c_long,
        a1: c_long,
        a2: c_long,
    ) -> Result<c_long> {
        match self.semantics {
            CallSemantics::RoutedRaw => {
                let rc = self.invoke3(libc::SYS_prctl, cmd, a1, a2);
                if rc < 0 {
                    Err(CapError::sys(op, Errno::from_raw(-rc as i32)))
                } else {
                    Ok(rc)
                }
            }
            CallSemantics::LibcWrappers => {
                // SAFETY: prctl is safe to call with any command; bad
                // arguments surface as error returns.
                let rc = unsafe { libc::prctl(cmd as libc::c_int, a1, a2, 0, 0) };
                if rc < 0 {
                    Err(CapError::sys(op, Errno::last()))
                } else {
                    Ok(rc as c_long)
                }
            }
        }
    }

    /// State-writing prctl, 6-argument form.
    pub(crate) fn wprctl6(
        &self,
        op: &'static str,
        cmd: c_long,
        a1: c_long,
        a2: c_long,
        a3: c_long,
        a4: c_long,
        a5: c_long,
    ) -> Result<c_long> {
        match self.semantics {
            CallSemantics::RoutedRaw => {
                let rc = self.invoke6(libc::SYS_prctl, cmd, a1, a2, a3, a4, a5);
                if rc < 0 {
                    Err(CapError::sys(op, Errno::from_raw(-rc as i32)))
                } else {
                    Ok(rc)
                }
            }
            CallSemantics::LibcWrappers => {
                // SAFETY: as wprctl3.
                let rc = unsafe { libc::prctl(cmd as libc::c_int, a1, a2, a3, a4, a5) };
                if rc < 0 {
                    Err(CapError::sys(op, Errno::last()))
                } else {
                    Ok(rc as c_long)
                }
            }
        }
    }

    /// Change-credential syscall with a libc fallback. The raw path is used
    /// under [`CallSemantics::RoutedRaw`] so an installed broadcast override
    /// also covers uid/gid/groups/chroot changes; otherwise the libc wrapper
    /// runs, keeping glibc's own setxid broadcast in play.
    pub(crate) fn write3(
        &self,
        op: &'static str,
        nr: c_long,
        a1: c_long,
        a2: c_long,
        a3: c_long,
        libc_call: impl FnOnce() -> libc::c_int,
    ) -> Result<()> {
        match self.semantics {
            CallSemantics::RoutedRaw => {
                let rc = self.invoke3(nr, a1, a2, a3);
                if rc < 0 {
                    Err(CapError::sys(op, Errno::from_raw(-rc as i32)))
                } else {
                    Ok(())
                }
            }
            CallSemantics::LibcWrappers => {
                if libc_call() != 0 {
                    Err(CapError::sys(op, Errno::last()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake3(_nr: c_long, _a1: c_long, _a2: c_long, _a3: c_long) -> c_long {
        -(libc::EPERM as c_long)
    }

    fn fake6(
        _nr: c_long,
        _a1: c_long,
        _a2: c_long,
        _a3: c_long,
        _a4: c_long,
        _a5: c_long,
        _a6: c_long,
    ) -> c_long {
        7
    }

    #[test]
    fn routed_raw_translates_negated_errno() {
        let sc = Syscaller {
            three: fake3,
            six: fake6,
            semantics: CallSemantics::RoutedRaw,
        };
        let err = sc.wprctl3("test-prctl", 0, 0, 0).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));
        assert_eq!(sc.wprctl6("test-prctl", 0, 0, 0, 0, 0, 0).unwrap(), 7);
    }

    #[test]
    fn default_multithread_uses_libc_wrappers() {
        assert_eq!(multithread().semantics, CallSemantics::LibcWrappers);
    }

    #[test]
    fn write3_prefers_raw_binding_when_routed() {
        let sc = Syscaller {
            three: fake3,
            six: fake6,
            semantics: CallSemantics::RoutedRaw,
        };
        // The libc closure must not run on the routed path.
        let err = sc
            .write3("test-write", libc::SYS_setuid, 0, 0, 0, || {
                panic!("libc fallback used on routed path")
            })
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));
    }
}
