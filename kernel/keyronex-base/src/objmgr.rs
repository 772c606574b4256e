//! Object manager.
//!
//! Every kernel-managed object (VM objects, vnodes, dispatcher objects
//! exposed to user handles, devices) embeds an [`ObjectHeader`] giving it
//! a type tag, an atomic reference count, and an optional name. Reference
//! counting is the only lifetime mechanism; there is no cycle collector,
//! so any back-reference that could form a cycle (e.g. a page's pointer
//! to the object that owns it) must be a [`Weak`](alloc::sync::Weak)
//! reference, never a strong [`Arc`].

use alloc::string::String;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identifies what kind of object a header is attached to.
///
/// New kinds should be added here rather than distinguished by downcasting;
/// keeping the tag centralized lets diagnostics (e.g. an object dump) walk
/// headers without knowing every concrete Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A VM object (anonymous or vnode-backed).
    VmObject,
    /// A vnode.
    Vnode,
    /// A dispatcher object reachable through a handle table.
    Dispatcher,
    /// A device instance.
    Device,
    /// A process.
    Process,
    /// A thread.
    Thread,
}

/// Global monotonically increasing object id source, used for diagnostics
/// (object dumps, `ps`-style listings) rather than identity: identity is
/// the header's address.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Embedded header giving an object a type tag, a reference count, and
/// an optional name.
///
/// The reference count here is purely a diagnostic/debug mirror of the
/// real count, which in Rust is [`alloc::sync::Arc`]'s own strong count:
/// objects are always held behind `Arc<T>` so `retain`/`release` are just
/// `Arc::clone`/drop. [`ObjectHeader::retain_count`] lets code that only
/// has a reference (not an `Arc`) sanity-check liveness without cloning.
pub struct ObjectHeader {
    id: u64,
    kind: ObjectKind,
    refs: AtomicU32,
    name: Option<String>,
}

impl ObjectHeader {
    /// Creates a new header for an object of kind `kind`, initial
    /// refcount 1 (the caller's own `Arc`).
    #[must_use]
    pub fn new(kind: ObjectKind, name: Option<String>) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            refs: AtomicU32::new(1),
            name,
        }
    }

    /// This object's diagnostic id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This object's kind tag.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// This object's name, if it was given one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Mirrors a new strong reference being taken (e.g. just after
    /// `Arc::clone`). Kept in sync manually since the header doesn't own
    /// the `Arc` it's embedded in.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirrors a strong reference being dropped. Returns the count
    /// remaining after the decrement.
    pub fn release(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// The diagnostic reference count.
    #[must_use]
    pub fn retain_count(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = ObjectHeader::new(ObjectKind::VmObject, None);
        let b = ObjectHeader::new(ObjectKind::VmObject, None);
        assert!(b.id() > a.id());
    }

    #[test]
    fn retain_release_tracks_count() {
        let h = ObjectHeader::new(ObjectKind::Vnode, None);
        assert_eq!(h.retain_count(), 1);
        h.retain();
        assert_eq!(h.retain_count(), 2);
        assert_eq!(h.release(), 1);
        assert_eq!(h.retain_count(), 1);
    }

    #[test]
    fn name_roundtrip() {
        let named = ObjectHeader::new(ObjectKind::Process, Some(String::from("init")));
        assert_eq!(named.name(), Some("init"));
        let anon = ObjectHeader::new(ObjectKind::Process, None);
        assert_eq!(anon.name(), None);
    }

    #[test]
    fn kind_is_preserved() {
        let h = ObjectHeader::new(ObjectKind::Thread, None);
        assert_eq!(h.kind(), ObjectKind::Thread);
    }
}
