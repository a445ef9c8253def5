//! Inheritable/Ambient/Bounding tuples and the transition engine that
//! applies them to the current process.
//!
//! Ambient bits silently vanish when Inheritable or Permitted change, and
//! bounding drops can clamp ambient bits, so the apply order is fixed:
//! inheritable vector first, then an ambient reset, then a single walk that
//! raises each requested ambient bit and drops each requested bounding bit
//! together, so no drop can undo a raise made by the same call.

use crate::kernel::ambient::{
    drop_bound_with, get_ambient, get_bound, max_bits, reset_ambient_with, set_ambient_with,
};
use crate::kernel::bitset::CapBits;
use crate::kernel::capset::CapSet;
use crate::kernel::lock;
use crate::kernel::syscall::{multithread, Syscaller};
use crate::types::{CapValue, Flag, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// The three planes of an [`IabSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vector {
    #[serde(rename = "inh")]
    Inheritable,
    #[serde(rename = "amb")]
    Ambient,
    /// A raised bit schedules the capability for a bounding-set drop.
    #[serde(rename = "bound")]
    Bound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IabPlanes {
    pub(crate) i: CapBits,
    pub(crate) a: CapBits,
    pub(crate) nb: CapBits,
}

/// An inheritable/ambient/bounding tuple, mutated in memory and applied to
/// the current process as one ordered transition.
///
/// Plane edits are coupled the way the kernel couples the underlying state:
/// raising an Ambient bit raises the matching Inheritable bit (ambient
/// requires inheritable), and lowering an Inheritable bit lowers the
/// Ambient bit with it. Bound bits are independent drop requests.
pub struct IabSet {
    state: Mutex<IabPlanes>,
}

impl IabSet {
    /// Empty tuple: nothing inherited, nothing ambient, nothing dropped.
    pub fn new() -> Self {
        IabSet {
            state: Mutex::new(IabPlanes::default()),
        }
    }

    /// Tuple describing the current process: its Inheritable plane, its
    /// ambient bits, and the complement of its bounding set.
    pub fn current() -> Result<Self> {
        let iab = IabSet::new();
        let current = CapSet::current()?;
        {
            let mut planes = lock(&iab.state);
            for index in 0..max_bits() {
                let cap = match CapValue::new(index) {
                    Some(cap) => cap,
                    None => break,
                };
                if current.get_flag(Flag::Inheritable, cap) {
                    planes.i.put(cap, true);
                }
                if let Ok(false) = get_bound(cap) {
                    planes.nb.put(cap, true);
                }
                if let Ok(true) = get_ambient(cap) {
                    planes.a.put(cap, true);
                }
            }
        }
        Ok(iab)
    }

    /// Query one bit of one plane.
    pub fn get_vector(&self, vector: Vector, cap: CapValue) -> bool {
        let planes = lock(&self.state);
        match vector {
            Vector::Inheritable => planes.i.get(cap),
            Vector::Ambient => planes.a.get(cap),
            Vector::Bound => planes.nb.get(cap),
        }
    }

    /// Raise or lower one bit, with the inheritable/ambient coupling.
    pub fn set_vector(&self, vector: Vector, cap: CapValue, on: bool) {
        let mut planes = lock(&self.state);
        match (vector, on) {
            (Vector::Inheritable, true) => planes.i.put(cap, true),
            (Vector::Inheritable, false) => {
                planes.i.put(cap, false);
                planes.a.put(cap, false);
            }
            (Vector::Ambient, true) => {
                planes.a.put(cap, true);
                planes.i.put(cap, true);
            }
            (Vector::Ambient, false) => planes.a.put(cap, false),
            (Vector::Bound, on) => planes.nb.put(cap, on),
        }
    }

    /// Copy a plane of a capability store into one vector of this tuple,
    /// with the same coupling as [`IabSet::set_vector`].
    pub fn fill(&self, vector: Vector, source: &CapSet, flag: Flag) {
        for index in 0..CapValue::CAPACITY {
            if let Some(cap) = CapValue::new(index) {
                self.set_vector(vector, cap, source.get_flag(flag, cap));
            }
        }
    }

    /// Apply this tuple to the current process via the multithread invoker.
    pub fn set_proc(&self) -> Result<()> {
        log::debug!("applying IAB tuple to current process");
        self.set_proc_with(&multithread())
    }

    pub(crate) fn set_proc_with(&self, sc: &Syscaller) -> Result<()> {
        apply_planes_with(sc, self.snapshot())
    }

    pub(crate) fn snapshot(&self) -> IabPlanes {
        *lock(&self.state)
    }
}

impl Default for IabSet {
    fn default() -> Self {
        IabSet::new()
    }
}

/// True when the requested Inheritable plane contains a bit outside the
/// union of the current Inheritable and Permitted planes. Granting such a
/// bit needs CAP_SETPCAP in Effective.
pub(crate) fn grants_new_inheritable(
    requested: &CapBits,
    inheritable: &CapBits,
    permitted: &CapBits,
) -> bool {
    requested
        .iter_set()
        .any(|cap| !inheritable.get(cap) && !permitted.get(cap))
}

pub(crate) fn apply_planes_with(sc: &Syscaller, iab: IabPlanes) -> Result<()> {
    let reserve = CapSet::current()?;
    let snap = reserve.snapshot();

    let mut raising = grants_new_inheritable(&iab.i, &snap.inheritable, &snap.permitted);

    // A bounding drop only matters (and only needs CAP_SETPCAP) if the bit
    // is still present in the kernel's bounding set.
    let mut check_bound = false;
    if !iab.nb.is_empty() {
        for cap in iab.nb.iter_set() {
            if let Ok(true) = get_bound(cap) {
                raising = true;
                check_bound = true;
                break;
            }
        }
    }

    // The reserve copy carries the new Inheritable plane: the restore push
    // at the end must drop the transient CAP_SETPCAP without undoing the
    // inheritable grant this call just made.
    reserve.set_plane(Flag::Inheritable, iab.i);

    let working = reserve.dup();
    if raising {
        working.set_flag(Flag::Effective, &[CapValue::SETPCAP], true);
    }

    // Nothing is committed until this push; its failure needs no restore.
    working.set_proc_with(sc)?;

    let result = (|| {
        reset_ambient_with(sc)?;
        for index in (0..max_bits()).rev() {
            let cap = match CapValue::new(index) {
                Some(cap) => cap,
                None => continue,
            };
            if iab.a.get(cap) {
                set_ambient_with(sc, cap, true)?;
            }
            if check_bound && iab.nb.get(cap) {
                drop_bound_with(sc, cap)?;
            }
        }
        Ok(())
    })();

    let _ = reserve.set_proc_with(sc);
    result
}
