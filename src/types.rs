/// Core types shared across the capbox system
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capability index newtype for type safety.
///
/// Indices are validated against the bit-plane capacity, not against the
/// running kernel's highest defined capability; use
/// [`crate::kernel::ambient::max_bits`] for the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapValue(u32);

impl CapValue {
    /// Number of indices the in-memory bit planes can carry.
    pub const CAPACITY: u32 = 64;

    pub const CHOWN: CapValue = CapValue(0);
    pub const DAC_OVERRIDE: CapValue = CapValue(1);
    pub const FOWNER: CapValue = CapValue(3);
    pub const KILL: CapValue = CapValue(5);
    pub const SETGID: CapValue = CapValue(6);
    pub const SETUID: CapValue = CapValue(7);
    pub const SETPCAP: CapValue = CapValue(8);
    pub const NET_BIND_SERVICE: CapValue = CapValue(10);
    pub const NET_RAW: CapValue = CapValue(13);
    pub const SYS_CHROOT: CapValue = CapValue(18);
    pub const SYS_ADMIN: CapValue = CapValue(21);

    pub fn new(cap: u32) -> Option<Self> {
        if cap < Self::CAPACITY {
            Some(Self(cap))
        } else {
            None
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CapValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cap{}", self.0)
    }
}

/// The three per-process capability planes of a [`crate::CapSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flag {
    #[serde(rename = "effective")]
    Effective,
    #[serde(rename = "permitted")]
    Permitted,
    #[serde(rename = "inheritable")]
    Inheritable,
}

/// Named privilege postures applied by [`crate::mode::set_mode`] and
/// recovered by [`crate::mode::get_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapMode {
    /// No match against any known posture.
    #[serde(rename = "uncertain")]
    Uncertain,
    /// Irreversibly privilege-free: empty bounding set, cleared vectors,
    /// no-new-privs raised.
    #[serde(rename = "nopriv")]
    NoPriv,
    /// Pure capability inheritance: secure bits locked, ambient cleared.
    #[serde(rename = "pure1e")]
    Pure1e,
    /// As pure1e, with the inheritable vector cleared first.
    #[serde(rename = "pure1e-init")]
    Pure1eInit,
    /// Legacy-compatible posture: secure bits fully permissive.
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl std::fmt::Display for CapMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CapMode::Uncertain => "uncertain",
            CapMode::NoPriv => "nopriv",
            CapMode::Pure1e => "pure1e",
            CapMode::Pure1eInit => "pure1e-init",
            CapMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CapMode {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nopriv" | "no-priv" => Ok(CapMode::NoPriv),
            "pure1e" => Ok(CapMode::Pure1e),
            "pure1e-init" | "pure1e_init" => Ok(CapMode::Pure1eInit),
            "hybrid" => Ok(CapMode::Hybrid),
            other => Err(CapError::Invalid(format!("unknown mode '{}'", other))),
        }
    }
}

/// Custom error types for capbox
#[derive(Error, Debug)]
pub enum CapError {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("{op} failed: {errno}")]
    Sys { op: &'static str, errno: Errno },

    #[error("fork failed: {0}")]
    Fork(Errno),

    /// The forked child reported a failure before it could exec.
    #[error("launch failed in child: {0}")]
    Child(Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CapError {
    pub(crate) fn sys(op: &'static str, errno: Errno) -> Self {
        CapError::Sys { op, errno }
    }

    /// Kernel error code behind this failure, when one exists.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            CapError::Sys { errno, .. } => Some(*errno),
            CapError::Fork(errno) | CapError::Child(errno) => Some(*errno),
            CapError::Io(e) => e.raw_os_error().map(Errno::from_raw),
            CapError::Invalid(_) => None,
        }
    }
}

impl From<Errno> for CapError {
    fn from(err: Errno) -> Self {
        CapError::Sys {
            op: "syscall",
            errno: err,
        }
    }
}

/// Result type alias for capbox operations
pub type Result<T> = std::result::Result<T, CapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_value_validates_range() {
        assert!(CapValue::new(0).is_some());
        assert!(CapValue::new(63).is_some());
        assert!(CapValue::new(64).is_none());
        assert!(CapValue::new(200).is_none());
    }

    #[test]
    fn cap_value_preserves_value() {
        assert_eq!(CapValue::SETPCAP.value(), 8);
        assert_eq!(CapValue::new(18), Some(CapValue::SYS_CHROOT));
    }

    #[test]
    fn mode_names_round_trip() {
        for mode in [
            CapMode::NoPriv,
            CapMode::Pure1e,
            CapMode::Pure1eInit,
            CapMode::Hybrid,
        ] {
            let parsed: CapMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert!("uncertain".parse::<CapMode>().is_err());
        assert!("bogus".parse::<CapMode>().is_err());
    }

    #[test]
    fn errno_is_preserved() {
        let err = CapError::sys("capset", Errno::EPERM);
        assert_eq!(err.errno(), Some(Errno::EPERM));
        assert!(CapError::Invalid("x".into()).errno().is_none());
    }
}
