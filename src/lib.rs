//! capbox: Linux process-capability management with kernel-enforced postures
//! and a race-safe reduced-privilege launcher.
//!
//! # Architecture
//!
//! This crate is organized by Linux kernel primitive families:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::syscall`]: pluggable invoker for privilege-mutating syscalls
//! - [`kernel::capset`]: capability vector store (capget/capset surface)
//! - [`kernel::ambient`]: ambient/bounding bits, securebits, no-new-privs
//! - [`kernel::credentials`]: uid/gid/chroot transitions with capability
//!   bracketing
//!
//! ## Privilege Engines
//! - [`mode`]: named lockdown postures (hybrid, pure1e, pure1e-init, nopriv)
//! - [`iab`]: Inheritable/Ambient/Bounding tuples and their ordered
//!   application
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launcher`]: fork + privilege drop + exec with child-to-parent
//!   error propagation
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - engines re-read state rather than trusting caches
//! 2. **No silent partial success** - multi-step transitions clear their
//!    transient grants on every exit path
//! 3. **Types prevent errors** - checked capability indices, closed enums,
//!    a child routine that cannot return
//! 4. **Minimal unsafe** - thin wrappers with explicit SAFETY comments,
//!    concentrated in [`kernel`]
//!
//! # Threads
//!
//! The kernel applies capability changes to the calling thread only. Public
//! mutating entry points route through a process-wide invoker that can be
//! overridden once (see [`kernel::syscall::set_syscall`]) with a binding
//! that broadcasts the call to every thread, restoring POSIX process-wide
//! semantics. Programs that never create threads, or that change privilege
//! before spawning any, need no override.

// Kernel Primitives
pub mod kernel;

// Privilege Engines
pub mod iab;
pub mod mode;

// Execution Control
pub mod exec;

// CLI entrypoint wiring for the caplaunch binary.
pub mod cli;

// Shared types
pub mod types;

// Re-export commonly used types for convenience
pub use exec::{LaunchCallback, Launcher};
pub use iab::{IabSet, Vector};
pub use kernel::ambient::{
    ambient_supported, drop_bound, get_ambient, get_bound, get_secbits, max_bits, reset_ambient,
    set_ambient, set_secbits,
};
pub use kernel::capset::{CapDiff, CapSet};
pub use kernel::syscall::set_syscall;
pub use mode::{get_mode, set_mode};
pub use types::{CapError, CapMode, CapValue, Flag, Result};
