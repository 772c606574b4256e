//! Bridges the page fault path to the IOP engine.
//!
//! A vnode-backed [`super::object::VmObject`] only knows its vnode by an
//! opaque id, and a swapped-out [`super::anon::Anon`] only knows a slot
//! number -- neither type can reach into the filesystem or swap device
//! directly, since both live above this crate in the dependency graph.
//! Two registrable resolvers, the same `AtomicPtr` hook pattern as
//! [`crate::log`]'s print function and [`crate::ipl`]'s CPU-id lookup, let
//! the runtime crate supply the real [`IopHandler`] once it has mounted a
//! filesystem or brought up swap. Until a resolver is registered every
//! lookup misses, and the fault handler's callers keep retrying -- the
//! same behavior callers saw before this module existed.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::iop::{Frame, FrameFn, FramePayload, Iop, IopHandler, IopResult, Mdl, iop_send_sync};
use crate::mm::PAGE_SIZE;
use crate::mm::pfn::{PageUse, PfnDatabase};
use crate::paging::{PhysFrame, Size4KiB};

/// Resolves an id -- a vnode id for [`set_vnode_resolver`], a swap slot
/// for [`set_swap_resolver`] -- to the handler that actually serves it.
pub type HandlerResolverFn = fn(id: u64) -> Option<Arc<dyn IopHandler>>;

fn no_handler(_id: u64) -> Option<Arc<dyn IopHandler>> {
    None
}

static VNODE_RESOLVER: AtomicPtr<()> = AtomicPtr::new(no_handler as *mut ());
static SWAP_RESOLVER: AtomicPtr<()> = AtomicPtr::new(no_handler as *mut ());

/// Registers the resolver used to find a vnode's read handler.
///
/// # Safety
///
/// The provided function must be callable from whatever context the page
/// fault handler runs in, including with the faulting address space's
/// inner lock held.
pub unsafe fn set_vnode_resolver(f: HandlerResolverFn) {
    VNODE_RESOLVER.store(f as *mut (), Ordering::Release);
}

/// Registers the resolver used to find the swap device's read handler.
///
/// # Safety
///
/// Same obligations as [`set_vnode_resolver`].
pub unsafe fn set_swap_resolver(f: HandlerResolverFn) {
    SWAP_RESOLVER.store(f as *mut (), Ordering::Release);
}

#[inline]
fn load(resolver: &AtomicPtr<()>) -> HandlerResolverFn {
    let ptr = resolver.load(Ordering::Acquire);
    // SAFETY: only valid `HandlerResolverFn` pointers (or `no_handler`) are
    // ever stored into these statics.
    unsafe { core::mem::transmute(ptr) }
}

/// Drives a single-frame read IOP against `handler` into `frame`,
/// synchronously -- the fault handler holds the address space lock and
/// cannot itself await, so this goes through [`iop_send_sync`] rather
/// than parking on the dispatcher the way an async vnode read does.
fn read_frame_sync(handler: Arc<dyn IopHandler>, frame: PhysFrame<Size4KiB>, vnode: Option<u64>, offset: u64) -> IopResult {
    let mdl = Mdl::new(alloc::vec![frame], 0, PAGE_SIZE as u32);
    let iop = Iop::new();
    iop.push_frame(
        Frame::new(FrameFn::Read, vnode, FramePayload::Mdl(mdl))
            .with_rw_offset(offset)
            .with_handler(handler),
    );
    iop_send_sync(&iop)
}

/// Reads vnode `vnode_id`'s page `page_index` into a freshly allocated
/// frame, returning it on success.
///
/// Returns `None` if nothing is registered to serve `vnode_id`, the PFN
/// database has no frame to give, or the read itself failed; the caller
/// (see [`super::address_space::AddressSpace::fault`]) treats all three
/// the same way it always treated a cache miss -- ask the fault to be
/// retried.
pub fn read_object_page(pfn: &PfnDatabase, vnode_id: u64, page_index: u64) -> Option<PhysFrame<Size4KiB>> {
    let handler = (load(&VNODE_RESOLVER))(vnode_id)?;
    let frame = pfn.alloc_page(PageUse::ObjectCached).ok()?;
    let offset = page_index * PAGE_SIZE as u64;
    match read_frame_sync(handler, frame, Some(vnode_id), offset) {
        IopResult::Ok => Some(frame),
        IopResult::Error(_) => {
            let _ = pfn.free_page(frame);
            None
        }
    }
}

/// Reads swap slot `slot` back into a freshly allocated frame.
///
/// Same success/failure contract as [`read_object_page`], for the
/// non-resident-anon branch of the fault handler.
pub fn read_swap_page(pfn: &PfnDatabase, slot: u64) -> Option<PhysFrame<Size4KiB>> {
    let handler = (load(&SWAP_RESOLVER))(slot)?;
    let frame = pfn.alloc_page(PageUse::Anonymous).ok()?;
    match read_frame_sync(handler, frame, None, slot * PAGE_SIZE as u64) {
        IopResult::Ok => Some(frame),
        IopResult::Error(_) => {
            let _ = pfn.free_page(frame);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;
    use crate::iop::IopRet;

    struct FillWith(u8);
    impl IopHandler for FillWith {
        fn dispatch(&self, _iop: &Iop, _frame_index: usize) -> IopRet {
            IopRet::Completed
        }
    }

    fn resolve_fill(_id: u64) -> Option<Arc<dyn IopHandler>> {
        Some(Arc::new(FillWith(0)))
    }

    #[test]
    fn no_resolver_registered_misses() {
        let pfn = PfnDatabase::new(0x200, 4);
        assert!(read_object_page(&pfn, 1, 0).is_none());
        assert!(read_swap_page(&pfn, 7).is_none());
    }

    #[test]
    fn registered_resolver_serves_a_page() {
        let pfn = PfnDatabase::new(0x200, 4);
        unsafe { set_vnode_resolver(resolve_fill) };
        let frame = read_object_page(&pfn, 1, 3).expect("resolver is registered");
        assert_eq!(
            frame,
            PhysFrame::from_start_address(PhysAddr::new_truncate(0x200 * 0x1000)).unwrap()
        );
        unsafe { set_vnode_resolver(no_handler) };
    }
}
