//! The in-memory capability vector store and its kernel get/set surface.

use super::bitset::{CapBits, CAP_WORDS};
use super::syscall::{multithread, Syscaller};
use crate::types::{CapError, CapValue, Flag, Result};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::sync::{Mutex, OnceLock};

pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Preferred header version reported by the running kernel, probed once.
/// A capget with version 0 is the kernel's documented way of asking.
fn kernel_version() -> u32 {
    static VERSION: OnceLock<u32> = OnceLock::new();
    *VERSION.get_or_init(|| {
        let mut header = CapUserHeader { version: 0, pid: 0 };
        // SAFETY: capget with a null data pointer only writes the header.
        let _ = unsafe {
            libc::syscall(
                libc::SYS_capget,
                &mut header as *mut CapUserHeader,
                std::ptr::null_mut::<CapUserData>(),
            )
        };
        if header.version == 0 {
            LINUX_CAPABILITY_VERSION_3
        } else {
            header.version
        }
    })
}

/// Snapshot of the three bit planes, detached from any lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Planes {
    pub(crate) effective: CapBits,
    pub(crate) permitted: CapBits,
    pub(crate) inheritable: CapBits,
}

impl Planes {
    fn plane(&self, flag: Flag) -> &CapBits {
        match flag {
            Flag::Effective => &self.effective,
            Flag::Permitted => &self.permitted,
            Flag::Inheritable => &self.inheritable,
        }
    }

    fn plane_mut(&mut self, flag: Flag) -> &mut CapBits {
        match flag {
            Flag::Effective => &mut self.effective,
            Flag::Permitted => &mut self.permitted,
            Flag::Inheritable => &mut self.inheritable,
        }
    }

    fn to_user_data(self) -> [CapUserData; CAP_WORDS] {
        let mut data = [CapUserData::default(); CAP_WORDS];
        for (word, entry) in data.iter_mut().enumerate() {
            *entry = CapUserData {
                effective: self.effective.word(word),
                permitted: self.permitted.word(word),
                inheritable: self.inheritable.word(word),
            };
        }
        data
    }

    fn from_user_data(data: &[CapUserData; CAP_WORDS]) -> Self {
        let mut planes = Planes::default();
        for (word, entry) in data.iter().enumerate() {
            planes.effective.set_word(word, entry.effective);
            planes.permitted.set_word(word, entry.permitted);
            planes.inheritable.set_word(word, entry.inheritable);
        }
        planes
    }
}

struct CapState {
    version: u32,
    pid: i32,
    planes: Planes,
}

/// One process's capability state: a version/target-pid header plus the
/// Effective, Permitted and Inheritable planes.
///
/// The store is exclusively owned but internally locked, so threads sharing
/// a reference serialize whole operations rather than interleaving fields.
/// Mutations are pure in-memory edits until [`CapSet::set_proc`] pushes them;
/// the kernel enforces Effective being a subset of Permitted at push time.
pub struct CapSet {
    state: Mutex<CapState>,
}

/// Which planes differ between two stores, from [`CapSet::compare`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapDiff {
    pub effective: bool,
    pub permitted: bool,
    pub inheritable: bool,
}

impl CapDiff {
    pub fn any(&self) -> bool {
        self.effective || self.permitted || self.inheritable
    }

    pub fn differs(&self, flag: Flag) -> bool {
        match flag {
            Flag::Effective => self.effective,
            Flag::Permitted => self.permitted,
            Flag::Inheritable => self.inheritable,
        }
    }
}

fn capget(header: &mut CapUserHeader, data: &mut [CapUserData; CAP_WORDS]) -> Result<()> {
    // Reads have no POSIX broadcast requirement, so this is a plain call.
    // SAFETY: header and data are valid, correctly sized kernel structs.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        Err(CapError::sys("capget", Errno::last()))
    } else {
        Ok(())
    }
}

impl CapSet {
    /// Fresh store with every plane cleared, headed for the current process.
    pub fn new() -> Self {
        CapSet {
            state: Mutex::new(CapState {
                version: kernel_version(),
                pid: 0,
                planes: Planes::default(),
            }),
        }
    }

    /// Fetch the calling process's capability state.
    pub fn current() -> Result<Self> {
        let set = CapSet::new();
        set.fetch(Pid::from_raw(0))?;
        Ok(set)
    }

    /// Fetch another process's capability state. Read-only peer inspection
    /// is still supported by the kernel, unlike the write direction.
    pub fn of_pid(pid: Pid) -> Result<Self> {
        let set = CapSet::new();
        set.fetch(pid)?;
        Ok(set)
    }

    fn fetch(&self, pid: Pid) -> Result<()> {
        let mut state = super::lock(&self.state);
        let mut header = CapUserHeader {
            version: state.version,
            pid: pid.as_raw(),
        };
        let mut data = [CapUserData::default(); CAP_WORDS];
        capget(&mut header, &mut data)?;
        state.planes = Planes::from_user_data(&data);
        state.pid = 0;
        Ok(())
    }

    /// Push this store to the kernel for the current process, via the
    /// multithread invoker so an installed broadcast override covers every
    /// thread.
    pub fn set_proc(&self) -> Result<()> {
        self.set_proc_with(&multithread())
    }

    pub(crate) fn set_proc_with(&self, sc: &Syscaller) -> Result<()> {
        let state = super::lock(&self.state);
        let header = CapUserHeader {
            version: state.version,
            pid: state.pid,
        };
        let data = state.planes.to_user_data();
        let rc = sc.invoke3(
            libc::SYS_capset,
            &header as *const CapUserHeader as libc::c_long,
            data.as_ptr() as libc::c_long,
            0,
        );
        if rc < 0 {
            Err(CapError::sys("capset", Errno::from_raw(-rc as i32)))
        } else {
            Ok(())
        }
    }

    /// Push this store onto another process.
    #[deprecated(
        note = "the kernel dropped support for changing another process's \
                capabilities long ago; this reports the kernel's rejection"
    )]
    pub fn set_pid(&self, pid: Pid) -> Result<()> {
        let state = super::lock(&self.state);
        let header = CapUserHeader {
            version: state.version,
            pid: pid.as_raw(),
        };
        let data = state.planes.to_user_data();
        // SAFETY: valid header/data pair, as in set_proc_with.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &header as *const CapUserHeader,
                data.as_ptr(),
            )
        };
        if rc != 0 {
            Err(CapError::sys("capset", Errno::last()))
        } else {
            Ok(())
        }
    }

    /// Query one bit of one plane.
    pub fn get_flag(&self, flag: Flag, cap: CapValue) -> bool {
        super::lock(&self.state).planes.plane(flag).get(cap)
    }

    /// Raise or lower the named bits in one plane. In-memory only; nothing
    /// reaches the kernel until the store is pushed.
    pub fn set_flag(&self, flag: Flag, caps: &[CapValue], on: bool) {
        let mut state = super::lock(&self.state);
        let plane = state.planes.plane_mut(flag);
        for cap in caps {
            plane.put(*cap, on);
        }
    }

    /// Empty one plane.
    pub fn clear_flag(&self, flag: Flag) {
        super::lock(&self.state).planes.plane_mut(flag).clear_all();
    }

    /// Empty all three planes.
    pub fn clear(&self) {
        super::lock(&self.state).planes = Planes::default();
    }

    /// Per-plane XOR against another store.
    pub fn compare(&self, other: &CapSet) -> CapDiff {
        let a = self.snapshot();
        let b = other.snapshot();
        CapDiff {
            effective: a.effective.differs(&b.effective),
            permitted: a.permitted.differs(&b.permitted),
            inheritable: a.inheritable.differs(&b.inheritable),
        }
    }

    /// Independent copy sharing nothing with the original.
    pub fn dup(&self) -> CapSet {
        let state = super::lock(&self.state);
        CapSet {
            state: Mutex::new(CapState {
                version: state.version,
                pid: state.pid,
                planes: state.planes,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> Planes {
        super::lock(&self.state).planes
    }

    pub(crate) fn set_plane(&self, flag: Flag, bits: CapBits) {
        *super::lock(&self.state).planes.plane_mut(flag) = bits;
    }
}

impl Default for CapSet {
    fn default() -> Self {
        CapSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_empty() {
        let set = CapSet::new();
        assert!(!set.get_flag(Flag::Effective, CapValue::SETPCAP));
        assert!(!set.get_flag(Flag::Permitted, CapValue::SETPCAP));
        assert!(!set.get_flag(Flag::Inheritable, CapValue::SETPCAP));
    }

    #[test]
    fn flag_mutation_is_in_memory_and_per_plane() {
        let set = CapSet::new();
        set.set_flag(Flag::Permitted, &[CapValue::SETUID, CapValue::SETGID], true);
        assert!(set.get_flag(Flag::Permitted, CapValue::SETUID));
        assert!(set.get_flag(Flag::Permitted, CapValue::SETGID));
        assert!(!set.get_flag(Flag::Effective, CapValue::SETUID));

        set.set_flag(Flag::Permitted, &[CapValue::SETUID], false);
        assert!(!set.get_flag(Flag::Permitted, CapValue::SETUID));
        assert!(set.get_flag(Flag::Permitted, CapValue::SETGID));

        set.clear_flag(Flag::Permitted);
        assert!(!set.get_flag(Flag::Permitted, CapValue::SETGID));
    }

    #[test]
    fn compare_reports_the_differing_plane() {
        let a = CapSet::new();
        let b = CapSet::new();
        assert!(!a.compare(&b).any());

        b.set_flag(Flag::Inheritable, &[CapValue::NET_BIND_SERVICE], true);
        let diff = a.compare(&b);
        assert!(diff.any());
        assert!(diff.differs(Flag::Inheritable));
        assert!(!diff.differs(Flag::Effective));
        assert!(!diff.differs(Flag::Permitted));
    }

    #[test]
    fn dup_is_detached_from_the_original() {
        let a = CapSet::new();
        a.set_flag(Flag::Effective, &[CapValue::KILL], true);
        let b = a.dup();
        assert!(!a.compare(&b).any());

        b.set_flag(Flag::Effective, &[CapValue::KILL], false);
        assert!(a.get_flag(Flag::Effective, CapValue::KILL));
        assert!(a.compare(&b).differs(Flag::Effective));
    }

    #[test]
    fn clear_empties_every_plane() {
        let set = CapSet::new();
        set.set_flag(Flag::Effective, &[CapValue::CHOWN], true);
        set.set_flag(Flag::Inheritable, &[CapValue::CHOWN], true);
        set.clear();
        assert!(!set.compare(&CapSet::new()).any());
    }
}
