//! Namecache: an LRU'd tree of resolved path components.
//!
//! Mirrors a filesystem's directory structure lazily. Each entry caches
//! the resolution of one name under a parent entry: positive entries
//! point at a vnode handle, negative entries record a cached lookup
//! failure. An entry with no outstanding caller reference sits on a
//! single global LRU; a child also pins its parent (an entry cannot be
//! evicted while it still has children), so releasing the last
//! reference to a leaf can cascade upward.
//!
//! Generic over the vnode handle type `V` so this module carries no
//! dependency on any concrete filesystem or vnode trait.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use crate::sync::SpinLock;

/// 64-bit FNV-1a offset basis.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
/// 64-bit FNV-1a prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hashes `name` with FNV-1a.
///
/// Per byte: `hash ^= byte` then `hash *= prime` -- XOR-then-multiply,
/// not multiply-then-XOR, matching the canonical FNV-1a ordering.
#[must_use]
pub fn fnv1a(name: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in name {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Ordering key for a parent's child tree: `(name length << 32 | hash)`,
/// with the name itself as a memcmp tiebreaker on collision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ChildKey(u64, String);

fn child_key(name: &str) -> ChildKey {
    let hash = fnv1a(name.as_bytes());
    let packed = (name.len() as u64) << 32 | (hash & 0xFFFF_FFFF);
    ChildKey(packed, String::from(name))
}

/// One cached name resolution.
///
/// `vnode` is `None` for a negative entry (a cached lookup failure).
pub struct Entry<V> {
    name: String,
    hash: u64,
    parent: SpinLock<Option<Weak<Entry<V>>>>,
    children: SpinLock<BTreeMap<ChildKey, Arc<Entry<V>>>>,
    refcount: core::sync::atomic::AtomicU32,
    vnode: SpinLock<Option<V>>,
}

impl<V: Clone> Entry<V> {
    fn new(name: &str, parent: Option<&Arc<Entry<V>>>, vnode: Option<V>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            hash: fnv1a(name.as_bytes()),
            parent: SpinLock::new(parent.map(Arc::downgrade)),
            children: SpinLock::new(BTreeMap::new()),
            refcount: core::sync::atomic::AtomicU32::new(1),
            vnode: SpinLock::new(vnode),
        })
    }

    /// The entry's name within its parent.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry's FNV-1a name hash.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Whether this is a positive (resolved) entry.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.vnode.lock().is_some()
    }

    /// The associated vnode handle, if this is a positive entry.
    #[must_use]
    pub fn vnode(&self) -> Option<V> {
        self.vnode.lock().clone()
    }

    /// Current external reference count (diagnostic).
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(core::sync::atomic::Ordering::Acquire)
    }

    /// This entry's parent, if any (`None` for a filesystem root).
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Entry<V>>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Looks up a child by name without creating one.
    #[must_use]
    pub fn lookup_child(&self, name: &str) -> Option<Arc<Entry<V>>> {
        self.children.lock().get(&child_key(name)).cloned()
    }
}

/// An LRU'd tree of namecache entries rooted at a single filesystem root.
///
/// `max_inactive` is the high-water mark for the zero-refcount LRU: once
/// exceeded, [`Namecache::release`] evicts least-recently-used entries
/// until the queue is back at the mark.
pub struct Namecache<V> {
    root: Arc<Entry<V>>,
    lru: SpinLock<VecDeque<Arc<Entry<V>>>>,
    max_inactive: usize,
}

impl<V: Clone> Namecache<V> {
    /// Creates a namecache rooted at a fresh, positive root entry.
    #[must_use]
    pub fn new(root_vnode: V, max_inactive: usize) -> Self {
        Self {
            root: Entry::new("", None, Some(root_vnode)),
            lru: SpinLock::new(VecDeque::new()),
            max_inactive,
        }
    }

    /// The root entry. Always refcount >= 1 for the cache's own lifetime;
    /// it is never on the LRU because it has no parent to pin.
    #[must_use]
    pub fn root(&self) -> Arc<Entry<V>> {
        self.root.clone()
    }

    /// Number of entries currently parked on the inactive LRU.
    #[must_use]
    pub fn lru_len(&self) -> usize {
        self.lru.lock().len()
    }

    /// Retains `entry`: increments its refcount, pulling it off the LRU
    /// if it was there.
    pub fn retain(&self, entry: &Arc<Entry<V>>) {
        let old = entry
            .refcount
            .fetch_add(1, core::sync::atomic::Ordering::AcqRel);
        if old == 0 {
            let mut lru = self.lru.lock();
            if let Some(pos) = lru.iter().position(|e| Arc::ptr_eq(e, entry)) {
                lru.remove(pos);
            }
        }
    }

    /// Inserts a new positive child of `parent`, pinning the parent (a
    /// live child keeps its parent resolvable). Returns the new entry
    /// with refcount 1, owned by the caller.
    pub fn insert_positive(&self, parent: &Arc<Entry<V>>, name: &str, vnode: V) -> Arc<Entry<V>> {
        self.retain(parent);
        let entry = Entry::new(name, Some(parent), Some(vnode));
        parent
            .children
            .lock()
            .insert(child_key(name), entry.clone());
        entry
    }

    /// Inserts a new negative (missing-name) child of `parent`.
    pub fn insert_negative(&self, parent: &Arc<Entry<V>>, name: &str) -> Arc<Entry<V>> {
        self.retain(parent);
        let entry = Entry::new(name, Some(parent), None);
        parent
            .children
            .lock()
            .insert(child_key(name), entry.clone());
        entry
    }

    /// Releases `entry`: decrements its refcount. Reaching zero either
    /// frees the entry immediately (if it has no parent, i.e. it was
    /// already detached) or parks it on the LRU tail, then evicts down
    /// to `max_inactive` if the queue has grown past it.
    pub fn release(&self, entry: &Arc<Entry<V>>) {
        let old = entry
            .refcount
            .fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
        debug_assert!(old > 0, "namecache entry refcount underflow");
        if old != 1 {
            return;
        }
        if entry.parent().is_some() {
            self.lru.lock().push_back(entry.clone());
            self.evict_to_watermark();
        }
        // Orphaned (parent already gone): nothing references this Arc
        // from the cache; it is freed as soon as the caller drops theirs.
    }

    fn evict_to_watermark(&self) {
        loop {
            let victim = {
                let mut lru = self.lru.lock();
                if lru.len() <= self.max_inactive {
                    return;
                }
                match lru.pop_front() {
                    Some(v) => v,
                    None => return,
                }
            };
            let Some(parent) = victim.parent() else {
                continue;
            };
            parent
                .children
                .lock()
                .remove(&child_key(victim.name()));
            // The child pinned its parent on creation; dropping it here
            // is the other half of that pin, which may itself cascade.
            self.release(&parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(fnv1a(b""), FNV_OFFSET_BASIS);
        // FNV-1a("a") = (offset_basis XOR 'a') * prime.
        let expected = (FNV_OFFSET_BASIS ^ u64::from(b'a')).wrapping_mul(FNV_PRIME);
        assert_eq!(fnv1a(b"a"), expected);
    }

    #[test]
    fn retain_release_round_trip_keeps_entry_off_lru_while_held() {
        let cache = Namecache::new(1u64, 256);
        let child = cache.insert_positive(&cache.root(), "bin", 2u64);
        assert_eq!(cache.lru_len(), 0);
        cache.release(&child);
        assert_eq!(cache.lru_len(), 1);
        cache.retain(&child);
        assert_eq!(cache.lru_len(), 0);
    }

    #[test]
    fn lookup_child_finds_inserted_entry() {
        let cache = Namecache::new(1u64, 256);
        let child = cache.insert_positive(&cache.root(), "etc", 2u64);
        let found = cache.root().lookup_child("etc").expect("child present");
        assert!(Arc::ptr_eq(&found, &child));
        assert_eq!(found.vnode(), Some(2u64));
    }

    #[test]
    fn negative_entry_has_no_vnode() {
        let cache = Namecache::new(1u64, 256);
        let miss = cache.insert_negative(&cache.root(), "nope");
        assert!(!miss.is_positive());
        assert_eq!(miss.vnode(), None);
    }

    /// Spec scenario: with `max_inactive = 2`, three children of the root
    /// are created and released in order A, B, C. Only the two most
    /// recently released survive in the parent's child tree; the oldest
    /// (A) is evicted.
    #[test]
    fn lru_eviction_keeps_most_recently_released() {
        let cache = Namecache::new(1u64, 2);
        let root = cache.root();
        let a = cache.insert_positive(&root, "a", 10u64);
        let b = cache.insert_positive(&root, "b", 11u64);
        let c = cache.insert_positive(&root, "c", 12u64);

        cache.release(&a);
        cache.release(&b);
        cache.release(&c);

        assert_eq!(cache.lru_len(), 2);
        assert!(root.lookup_child("a").is_none(), "oldest entry should be evicted");
        assert!(root.lookup_child("b").is_some());
        assert!(root.lookup_child("c").is_some());
    }

    #[test]
    fn evicting_last_child_releases_parent_pin() {
        let cache = Namecache::new(1u64, 0);
        let root = cache.root();
        let dir = cache.insert_positive(&root, "dir", 5u64);
        let leaf = cache.insert_positive(&dir, "leaf", 6u64);

        // dir is pinned by its child `leaf`; releasing our own handle on
        // `dir` alone must not free it while `leaf` still exists.
        cache.release(&dir);
        assert!(root.lookup_child("dir").is_some());

        // Releasing the leaf evicts it immediately (max_inactive = 0),
        // which drops the pin `leaf` held on `dir`; `dir` then has no
        // external holders left either and is evicted in turn.
        cache.release(&leaf);
        assert!(root.lookup_child("dir").is_none());
    }
}
