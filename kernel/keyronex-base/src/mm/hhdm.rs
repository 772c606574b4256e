//! Higher-half direct map (HHDM) bookkeeping.
//!
//! The bootloader identity-maps all of physical memory at a fixed offset
//! into kernel virtual space. Once that offset is known, physical frames
//! can be read and written directly without a temporary mapping.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PhysAddr, VirtAddr};

/// Sentinel meaning "not yet initialized".
const UNSET: u64 = u64::MAX;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(UNSET);

/// Records the HHDM offset reported by the bootloader.
///
/// Must be called exactly once, before any other function in this module.
pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// Returns the HHDM offset.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
#[must_use]
pub fn offset() -> u64 {
    let v = HHDM_OFFSET.load(Ordering::Acquire);
    assert!(v != UNSET, "hhdm::offset() called before hhdm::init()");
    v
}

/// Translates a physical address to its HHDM virtual alias.
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(offset() + phys.as_u64())
}

/// Translates an HHDM virtual address back to physical.
///
/// # Panics
///
/// Panics (debug builds) if `virt` is below the HHDM offset.
#[must_use]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    let off = offset();
    debug_assert!(virt.as_u64() >= off, "address is not in the HHDM region");
    PhysAddr::new_truncate(virt.as_u64() - off)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    // Tests share the one global HHDM offset; serialize via a lock-free
    // re-init since host tests run single-threaded per binary.
    fn reset(offset: u64) {
        HHDM_OFFSET.store(offset, Ordering::Release);
    }

    #[test]
    fn roundtrip() {
        reset(0x1000_0000_0000);
        let phys = PhysAddr::new_truncate(0x1234_000);
        let virt = phys_to_virt(phys);
        assert_eq!(virt_to_phys(virt), phys);
    }

    #[test]
    #[should_panic(expected = "before hhdm::init")]
    fn panics_before_init() {
        reset(UNSET);
        offset();
    }
}
