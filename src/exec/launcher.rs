//! Fork a child into a reduced-privilege state, then exec.
//!
//! The parent keeps its own privilege; all changes happen in the child,
//! after the fork, in a fixed order:
//!
//! 1. user callback (before any privilege change)
//! 2. uid change (bracketed with keep-capabilities so Permitted survives)
//! 3. gid and supplementary groups
//! 4. capability mode posture
//! 5. IAB tuple
//! 6. chroot (mode/IAB first: the posture may be what drops CAP_SYS_CHROOT,
//!    and it must still be present while the chroot happens)
//! 7. execve
//!
//! The child reports any failure as an errno over a close-on-exec pipe and
//! exits nonzero; a successful exec closes the pipe and the parent sees EOF.

use crate::iab::IabSet;
use crate::kernel::credentials::{enter_root_with, switch_groups_with, switch_uid_with};
use crate::kernel::lock;
use crate::kernel::syscall::SINGLETHREAD;
use crate::kernel::PR_SET_NAME;
use crate::mode::set_mode_with;
use crate::types::{CapError, CapMode, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe2, ForkResult, Gid, Pid, Uid};
use std::ffi::{CStr, CString};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

/// Child-side hook run after the fork but before any privilege change.
/// A failure aborts the launch and its error code reaches the parent.
pub type LaunchCallback = Box<dyn FnMut() -> std::io::Result<()> + Send>;

struct LaunchState {
    program: Option<CString>,
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
    uid: Option<Uid>,
    groups: Option<(Gid, Vec<Gid>)>,
    mode: Option<CapMode>,
    iab: Option<Arc<IabSet>>,
    chroot: Option<CString>,
    callback: Option<LaunchCallback>,
}

/// Configuration bundle and driver for one or more reduced-privilege
/// launches. Field setters serialize on an internal lock; a launch holds
/// that lock from validation through the fork, so the child's copy of the
/// configuration is consistent. The launcher never owns an attached
/// [`IabSet`], only a shared handle to it.
pub struct Launcher {
    state: Mutex<LaunchState>,
}

fn cstring(what: &'static str, s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| CapError::Invalid(format!("{} contains a NUL byte", what)))
}

impl Launcher {
    /// Launcher for a program with its full argument vector (argv includes
    /// the program name by convention).
    pub fn new<S: AsRef<str>>(program: &str, argv: &[S]) -> Result<Self> {
        let argv = argv
            .iter()
            .map(|arg| cstring("argument", arg.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if argv.is_empty() {
            return Err(CapError::Invalid("empty argument vector".to_string()));
        }
        Ok(Launcher {
            state: Mutex::new(LaunchState {
                program: Some(cstring("program path", program)?),
                argv,
                envp: None,
                uid: None,
                groups: None,
                mode: None,
                iab: None,
                chroot: None,
                callback: None,
            }),
        })
    }

    /// Launcher with no program: the fork runs only the callback and exits.
    pub fn for_callback(callback: LaunchCallback) -> Self {
        Launcher {
            state: Mutex::new(LaunchState {
                program: None,
                argv: Vec::new(),
                envp: None,
                uid: None,
                groups: None,
                mode: None,
                iab: None,
                chroot: None,
                callback: Some(callback),
            }),
        }
    }

    /// Install or cancel the pre-privilege-change callback.
    pub fn set_callback(&self, callback: Option<LaunchCallback>) {
        lock(&self.state).callback = callback;
    }

    /// Explicit environment for the child. Without this the parent's
    /// environment is inherited.
    pub fn set_env<S: AsRef<str>>(&self, envp: &[S]) -> Result<()> {
        let envp = envp
            .iter()
            .map(|entry| cstring("environment entry", entry.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        lock(&self.state).envp = Some(envp);
        Ok(())
    }

    /// Child will switch to this uid, keeping its Permitted set.
    pub fn set_uid(&self, uid: Uid) {
        lock(&self.state).uid = Some(uid);
    }

    /// Child will switch to this gid and supplementary group list.
    pub fn set_groups(&self, gid: Gid, groups: &[Gid]) {
        lock(&self.state).groups = Some((gid, groups.to_vec()));
    }

    /// Child will lock itself into this posture.
    pub fn set_mode(&self, mode: CapMode) {
        lock(&self.state).mode = Some(mode);
    }

    /// Attach an IAB tuple for the child, returning the previously attached
    /// handle. The tuple stays owned by the caller; its planes are read
    /// under its own lock at launch time, so a concurrent mutation cannot
    /// tear the value the child applies.
    pub fn set_iab(&self, iab: Option<Arc<IabSet>>) -> Option<Arc<IabSet>> {
        let mut state = lock(&self.state);
        std::mem::replace(&mut state.iab, iab)
    }

    /// Child will chroot here (and chdir to the new root) after all
    /// capability changes.
    pub fn set_chroot(&self, root: &str) -> Result<()> {
        lock(&self.state).chroot = Some(cstring("chroot path", root)?);
        Ok(())
    }

    /// Fork, apply the configured privilege reductions in the child, and
    /// exec. Returns the child's pid once the exec has happened, or the
    /// child's reported error with the child already reaped.
    pub fn launch(&self) -> Result<Pid> {
        let mut state = lock(&self.state);

        if state.callback.is_none() && (state.program.is_none() || state.argv.is_empty()) {
            return Err(CapError::Invalid(
                "launch needs a callback or a program with arguments".to_string(),
            ));
        }

        // Everything the child needs is materialized before the fork; the
        // child avoids allocation and takes no locks.
        let envp: Vec<CString> = match &state.envp {
            Some(envp) => envp.clone(),
            None => std::env::vars()
                .filter_map(|(key, value)| CString::new(format!("{}={}", key, value)).ok())
                .collect(),
        };
        let iab_planes = state.iab.as_ref().map(|iab| iab.snapshot());

        let (read_end, write_end) =
            pipe2(OFlag::O_CLOEXEC).map_err(|errno| CapError::sys("pipe2", errno))?;

        log::debug!(
            "launching {:?} (uid={:?}, mode={:?})",
            state.program,
            state.uid,
            state.mode
        );

        // SAFETY: the child only runs async-signal-safe code plus the same
        // capability engine the original design runs post-fork; the parent
        // continues normally.
        match unsafe { fork() } {
            Err(errno) => Err(CapError::Fork(errno)),
            Ok(ForkResult::Child) => {
                // The child inherits the configuration lock held here and
                // never unlocks it; it leaves through exec or _exit.
                drop(read_end);
                child_after_fork(write_end, &mut state, &envp, iab_planes)
            }
            Ok(ForkResult::Parent { child }) => {
                // The child has its own copy; the configuration lock and
                // the write end are released so EOF can reach us.
                drop(state);
                drop(write_end);
                wait_for_child(read_end, child)
            }
        }
    }
}

/// Parent side: block until the child execs (EOF) or reports an errno.
fn wait_for_child(read_end: OwnedFd, child: Pid) -> Result<Pid> {
    let mut pipe = std::fs::File::from(read_end);
    let mut buf = [0u8; 4];
    let mut got = 0;
    while got < buf.len() {
        match pipe.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::Interrupted
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue
            }
            Err(e) => {
                let _ = waitpid(child, None);
                return Err(CapError::Io(e));
            }
        }
    }

    if got == 0 {
        // close-on-exec closed the pipe: the program is running.
        return Ok(child);
    }

    let errno = if got == buf.len() {
        Errno::from_raw(i32::from_ne_bytes(buf))
    } else {
        Errno::EIO
    };
    let _ = waitpid(child, None);
    Err(CapError::Child(errno))
}

/// Child side. Never returns: either the process image is replaced by a
/// successful exec, or the failure code is written to the pipe and the
/// child exits with a distinguished nonzero status.
fn child_after_fork(
    status_fd: OwnedFd,
    state: &mut LaunchState,
    envp: &[CString],
    iab_planes: Option<crate::iab::IabPlanes>,
) -> ! {
    let sc = SINGLETHREAD;
    // SAFETY: PR_SET_NAME reads a short NUL-terminated string.
    let _ = unsafe {
        libc::prctl(
            PR_SET_NAME as libc::c_int,
            b"capbox-launch\0".as_ptr() as libc::c_long,
            0,
            0,
            0,
        )
    };

    if let Some(callback) = state.callback.as_mut() {
        if let Err(e) = callback() {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            report_and_exit(&status_fd, errno);
        }
    }

    let program = match &state.program {
        Some(program) => program,
        // Callback-only launch: the callback ran, nothing left to do.
        None => unsafe { libc::_exit(0) },
    };

    let result = (|| -> Result<()> {
        if let Some(uid) = state.uid {
            switch_uid_with(&sc, uid)?;
        }
        if let Some((gid, groups)) = &state.groups {
            switch_groups_with(&sc, *gid, groups)?;
        }
        if let Some(mode) = state.mode {
            set_mode_with(&sc, mode)?;
        }
        if let Some(planes) = iab_planes {
            crate::iab::apply_planes_with(&sc, planes)?;
        }
        if let Some(root) = &state.chroot {
            enter_root_with(&sc, root)?;
        }
        let argv: Vec<&CStr> = state.argv.iter().map(|arg| arg.as_c_str()).collect();
        let envp: Vec<&CStr> = envp.iter().map(|entry| entry.as_c_str()).collect();
        match nix::unistd::execve(program, &argv, &envp) {
            Ok(never) => match never {},
            Err(errno) => Err(CapError::sys("execve", errno)),
        }
    })();

    let errno = match result {
        Err(e) => e.errno().unwrap_or(Errno::EINVAL) as i32,
        Ok(()) => libc::EINVAL,
    };
    report_and_exit(&status_fd, errno)
}

/// Write the failure code to the parent, retrying transient conditions,
/// then terminate.
fn report_and_exit(status_fd: &OwnedFd, errno: i32) -> ! {
    let bytes = errno.to_ne_bytes();
    loop {
        // SAFETY: fd is open and the buffer outlives the call.
        let n = unsafe {
            libc::write(
                status_fd.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if n < 0 {
            let e = std::io::Error::last_os_error().raw_os_error();
            if e == Some(libc::EINTR) || e == Some(libc::EAGAIN) {
                continue;
            }
        }
        break;
    }
    // SAFETY: terminating the child without unwinding back into caller code.
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_argv() {
        let argv: [&str; 0] = [];
        assert!(Launcher::new("/bin/true", &argv).is_err());
    }

    #[test]
    fn rejects_nul_bytes_in_paths() {
        assert!(Launcher::new("/bin/\0true", &["true"]).is_err());
        let launcher = Launcher::new("/bin/true", &["true"]).unwrap();
        assert!(launcher.set_chroot("/tmp/\0root").is_err());
    }

    #[test]
    fn attach_returns_previous_tuple() {
        let launcher = Launcher::new("/bin/true", &["true"]).unwrap();
        let first = Arc::new(IabSet::new());
        let second = Arc::new(IabSet::new());

        assert!(launcher.set_iab(Some(first.clone())).is_none());
        let displaced = launcher.set_iab(Some(second)).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(launcher.set_iab(None).is_some());
    }

    #[test]
    fn callback_cancellation() {
        let launcher = Launcher::for_callback(Box::new(|| Ok(())));
        launcher.set_callback(None);
        // With neither callback nor program the launch is rejected upfront.
        assert!(matches!(
            launcher.launch().unwrap_err(),
            CapError::Invalid(_)
        ));
    }
}
