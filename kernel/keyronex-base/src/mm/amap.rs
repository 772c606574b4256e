//! Anonymous maps: sparse three-level radix trees of [`Anon`] pages.
//!
//! Indexed by page offset into the owning VM object. Each level is a
//! 512-entry array (matching one page's worth of 8-byte pointers), lazily
//! allocated on first insert so a sparse amap costs nothing for the pages
//! it never touches. Three levels address `512^3` pages, or 512 GiB at
//! 4 KiB pages -- comfortably larger than any single VAD.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::mm::anon::Anon;
use crate::sync::SpinLock;

const FANOUT: usize = 512;
const FANOUT_BITS: u32 = 9;
const FANOUT_MASK: u64 = (FANOUT as u64) - 1;

struct L1Node {
    anons: [Option<Arc<Anon>>; FANOUT],
}

impl L1Node {
    fn new() -> Box<Self> {
        Box::new(Self {
            anons: core::array::from_fn(|_| None),
        })
    }
}

struct L2Node {
    children: [Option<Box<L1Node>>; FANOUT],
}

impl L2Node {
    fn new() -> Box<Self> {
        Box::new(Self {
            children: core::array::from_fn(|_| None),
        })
    }
}

struct L3Node {
    children: [Option<Box<L2Node>>; FANOUT],
}

impl L3Node {
    fn new() -> Box<Self> {
        Box::new(Self {
            children: core::array::from_fn(|_| None),
        })
    }
}

fn split(page_index: u64) -> (usize, usize, usize) {
    let l1 = (page_index & FANOUT_MASK) as usize;
    let l2 = ((page_index >> FANOUT_BITS) & FANOUT_MASK) as usize;
    let l3 = ((page_index >> (2 * FANOUT_BITS)) & FANOUT_MASK) as usize;
    (l3, l2, l1)
}

/// A sparse anonymous map, indexed by page offset.
///
/// The root is lazily allocated: an amap with nothing inserted costs one
/// `Option` and no heap allocation at all.
pub struct Amap {
    root: SpinLock<Option<Box<L3Node>>>,
}

impl Amap {
    /// Creates an empty amap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: SpinLock::new(None),
        }
    }

    /// Looks up the anon at `page_index`, if any.
    #[must_use]
    pub fn lookup(&self, page_index: u64) -> Option<Arc<Anon>> {
        let (l3i, l2i, l1i) = split(page_index);
        let root = self.root.lock();
        let l3 = root.as_ref()?;
        let l2 = l3.children[l3i].as_ref()?;
        let l1 = l2.children[l2i].as_ref()?;
        l1.anons[l1i].clone()
    }

    /// Installs `anon` at `page_index`, allocating intermediate levels as
    /// needed. Returns the anon previously installed there, if any.
    pub fn insert(&self, page_index: u64, anon: Arc<Anon>) -> Option<Arc<Anon>> {
        let (l3i, l2i, l1i) = split(page_index);
        let mut root = self.root.lock();
        let l3 = root.get_or_insert_with(L3Node::new);
        let l2 = l3.children[l3i].get_or_insert_with(L2Node::new);
        let l1 = l2.children[l2i].get_or_insert_with(L1Node::new);
        l1.anons[l1i].replace(anon)
    }

    /// Removes and returns the anon at `page_index`, if present. Does not
    /// prune now-empty intermediate nodes; a sparse amap that fills and
    /// empties the same range repeatedly pays one allocation, not a churn
    /// of them.
    pub fn remove(&self, page_index: u64) -> Option<Arc<Anon>> {
        let (l3i, l2i, l1i) = split(page_index);
        let mut root = self.root.lock();
        let l3 = root.as_mut()?;
        let l2 = l3.children[l3i].as_mut()?;
        let l1 = l2.children[l2i].as_mut()?;
        l1.anons[l1i].take()
    }

    /// Returns `true` if the amap has never had anything inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.lock().is_none()
    }

    /// Invokes `f` with the page index and anon of every currently
    /// populated entry. Used by fork to demote a parent's writable
    /// mappings of shared anons to read-only.
    pub fn for_each(&self, mut f: impl FnMut(u64, &Arc<Anon>)) {
        let root = self.root.lock();
        let Some(l3) = root.as_ref() else { return };
        for (l3i, l2_slot) in l3.children.iter().enumerate() {
            let Some(l2) = l2_slot else { continue };
            for (l2i, l1_slot) in l2.children.iter().enumerate() {
                let Some(l1) = l1_slot else { continue };
                for (l1i, anon_slot) in l1.anons.iter().enumerate() {
                    if let Some(anon) = anon_slot {
                        let page_index = ((l3i as u64) << (2 * FANOUT_BITS))
                            | ((l2i as u64) << FANOUT_BITS)
                            | (l1i as u64);
                        f(page_index, anon);
                    }
                }
            }
        }
    }

    /// Duplicates the three-level structure for a fork child, sharing
    /// (not copying) every anon -- cloning the `Arc` bumps its refcount,
    /// which is exactly the signal the write-fault path uses to decide
    /// whether a copy is owed.
    #[must_use]
    pub fn fork(&self) -> Self {
        let root = self.root.lock();
        let Some(l3) = root.as_ref() else {
            return Self::new();
        };

        let mut new_l3 = L3Node::new();
        for (i, l2_slot) in l3.children.iter().enumerate() {
            let Some(l2) = l2_slot else { continue };
            let mut new_l2 = L2Node::new();
            for (j, l1_slot) in l2.children.iter().enumerate() {
                let Some(l1) = l1_slot else { continue };
                let mut new_l1 = L1Node::new();
                for (k, anon) in l1.anons.iter().enumerate() {
                    new_l1.anons[k] = anon.clone();
                }
                new_l2.children[j] = Some(new_l1);
            }
            new_l3.children[i] = Some(new_l2);
        }

        Self {
            root: SpinLock::new(Some(new_l3)),
        }
    }
}

impl Default for Amap {
    fn default() -> Self {
        Self::new()
    }
}

impl Amap {
    /// Pages out inactive anons to backing store under memory pressure.
    ///
    /// Not implemented: selecting which inactive anons to evict,
    /// allocating swap descriptors for them, and issuing the write IOP
    /// are all missing. The fault handler's non-resident branch (see
    /// [`crate::mm::address_space::AddressSpace::fault`]) already
    /// handles the read side; this is the write side that would feed it.
    ///
    /// Calling this with `swap_enabled == false` is a caller bug, not a
    /// degraded mode, so it panics rather than silently returning success.
    pub fn page_out_inactive(&self, swap_enabled: bool) -> ! {
        assert!(
            swap_enabled,
            "page_out_inactive called with swap disabled; caller should have checked \
             the configuration flag before reaching for the pager"
        );
        todo!("swap writer: inactive-anon selection, swap descriptor allocation, and write IOP issuance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;
    use crate::paging::{PhysFrame, Size4KiB};

    fn anon(addr: u64) -> Arc<Anon> {
        Anon::new_resident(PhysFrame::from_start_address(PhysAddr::new_truncate(addr)).unwrap())
    }

    #[test]
    fn empty_amap_has_no_entries() {
        let a = Amap::new();
        assert!(a.is_empty());
        assert!(a.lookup(0).is_none());
    }

    #[test]
    fn insert_then_lookup() {
        let a = Amap::new();
        let anon1 = anon(0x1000);
        assert!(a.insert(42, anon1.clone()).is_none());
        assert!(!a.is_empty());
        let found = a.lookup(42).unwrap();
        assert_eq!(found.resident_frame(), anon1.resident_frame());
    }

    #[test]
    fn insert_replaces_previous() {
        let a = Amap::new();
        let a1 = anon(0x1000);
        let a2 = anon(0x2000);
        a.insert(5, a1.clone());
        let prev = a.insert(5, a2.clone());
        assert_eq!(prev.unwrap().resident_frame(), a1.resident_frame());
        assert_eq!(a.lookup(5).unwrap().resident_frame(), a2.resident_frame());
    }

    #[test]
    fn remove_clears_entry() {
        let a = Amap::new();
        a.insert(7, anon(0x3000));
        assert!(a.remove(7).is_some());
        assert!(a.lookup(7).is_none());
        assert!(a.remove(7).is_none());
    }

    #[test]
    fn sparse_indices_across_levels() {
        let a = Amap::new();
        // Indices chosen to land in different L3/L2 buckets.
        let hi = (300u64 << 18) | (17 << 9) | 3;
        a.insert(hi, anon(0x4000));
        a.insert(3, anon(0x5000));
        assert!(a.lookup(hi).is_some());
        assert!(a.lookup(3).is_some());
        assert!(a.lookup(1).is_none());
    }

    #[test]
    fn for_each_visits_every_populated_entry() {
        let a = Amap::new();
        a.insert(3, anon(0x1000));
        let hi = (300u64 << 18) | (17 << 9) | 3;
        a.insert(hi, anon(0x2000));
        let mut seen = alloc::vec::Vec::new();
        a.for_each(|idx, _| seen.push(idx));
        seen.sort_unstable();
        assert_eq!(seen, alloc::vec![3, hi]);
    }

    #[test]
    fn fork_shares_anons_and_bumps_refcount() {
        let a = Amap::new();
        let anon1 = anon(0x1000);
        a.insert(9, anon1.clone());
        assert!(anon1.is_unique());

        let child = a.fork();
        assert!(!anon1.is_unique());
        let found = child.lookup(9).unwrap();
        assert_eq!(found.resident_frame(), anon1.resident_frame());
    }
}
