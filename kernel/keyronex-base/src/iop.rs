//! The I/O packet (IOP) engine.
//!
//! An [`Iop`] is a stack of [`Frame`]s threaded through a single
//! re-entrant loop, [`iop_continue`]. Each frame names the device-stack
//! layer that handles it via an [`IopHandler`]; `vnops`/`vfsops`-style
//! dispatch tables are the only place this core uses dynamic dispatch,
//! per the one hot polymorphism point the design calls for.
//!
//! The engine itself is device-agnostic: it knows how to walk frames and
//! slaves, not how to talk to a disk. Concrete handlers (a block driver,
//! a filesystem's vnops) are supplied by whatever external code attaches
//! them to a frame; this core only needs the interface.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::dispatch::Event;
use crate::sync::SpinLock;

/// A memory descriptor list: a fixed-size run of physical frames backing
/// a virtually contiguous I/O buffer.
///
/// The referenced frames are expected to be wired (see
/// [`crate::mm::pfn::PfnDatabase::wire`]) for as long as the MDL exists;
/// this type itself only records which frames they are.
#[derive(Debug, Clone)]
pub struct Mdl {
    frames: Vec<crate::paging::PhysFrame<crate::paging::Size4KiB>>,
    /// Byte offset of the buffer's start within the first frame.
    offset_in_first: u32,
    /// Total length of the buffer in bytes.
    length: u32,
}

impl Mdl {
    /// Builds an MDL over the given frames.
    #[must_use]
    pub fn new(
        frames: Vec<crate::paging::PhysFrame<crate::paging::Size4KiB>>,
        offset_in_first: u32,
        length: u32,
    ) -> Self {
        Self {
            frames,
            offset_in_first,
            length,
        }
    }

    /// The frames backing this buffer, in order.
    #[must_use]
    pub fn frames(&self) -> &[crate::paging::PhysFrame<crate::paging::Size4KiB>] {
        &self.frames
    }

    /// Total length of the described buffer in bytes.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Byte offset of the buffer's start within its first frame.
    #[must_use]
    pub fn offset_in_first(&self) -> u32 {
        self.offset_in_first
    }
}

/// What a frame is asking a device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFn {
    Read,
    Write,
    Ioctl,
    NinePCall,
    Scsi,
    Connect,
}

/// Either a memory-described buffer or a small inline kernel buffer,
/// whichever the function tag calls for.
pub enum FramePayload {
    Mdl(Mdl),
    /// A small inline control payload (ioctl argument, connect address).
    Inline(Vec<u8>),
    /// No payload (e.g. a bare completion frame).
    None,
}

/// One layer of an IOP's descent through the device stack.
pub struct Frame {
    pub func: FrameFn,
    /// Object id of the target vnode, if any (weak by construction: the
    /// IOP does not keep the vnode alive).
    pub vnode: Option<u64>,
    /// Byte offset a [`FrameFn::Read`]/[`FrameFn::Write`] frame applies
    /// to, meaningless for other frame functions.
    pub rw_offset: u64,
    pub payload: FramePayload,
    /// The handler that dispatches/completes this frame. `None` means a
    /// bookkeeping frame with no device behind it -- dispatch treats it
    /// as immediately `Completed`.
    pub handler: Option<Arc<dyn IopHandler>>,
    /// Slave IOPs attached to this frame by its handler before returning
    /// `Pending`; run to completion, in order, before this frame's own
    /// dispatch is considered done going down.
    pub slaves: Vec<Arc<Iop>>,
}

impl Frame {
    /// Creates a new frame with no handler and no slaves attached yet.
    #[must_use]
    pub fn new(func: FrameFn, vnode: Option<u64>, payload: FramePayload) -> Self {
        Self {
            func,
            vnode,
            rw_offset: 0,
            payload,
            handler: None,
            slaves: Vec::new(),
        }
    }

    /// Sets the byte offset a read/write frame applies to.
    #[must_use]
    pub fn with_rw_offset(mut self, offset: u64) -> Self {
        self.rw_offset = offset;
        self
    }

    /// Attaches the handler that will dispatch/complete this frame.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn IopHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Attaches a slave IOP, to be run before this frame dispatches.
    pub fn attach_slave(&mut self, slave: Arc<Iop>) {
        self.slaves.push(slave);
    }
}

/// What a dispatch or completion routine hands back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IopRet {
    /// Kick off a freshly pushed IOP. Only meaningful as the `incoming`
    /// argument to the first [`iop_continue`] call for a given IOP; the
    /// engine ignores `incoming` on that call (there is no prior frame
    /// result to deliver) but an explicit variant keeps call sites honest
    /// about which kind of call they are making, instead of overloading
    /// `Completed` as a begin sentinel.
    Begin,
    /// This step is done; turn around (from dispatch) or keep going
    /// (from completion).
    Completed,
    /// Dispatch: the frame prepared a new one below it, keep descending.
    /// Completion: go back down instead of continuing up.
    Continue,
    /// The device is asynchronous; suspend this IOP. The caller must
    /// arrange for [`iop_continue`] to be called again with the result,
    /// resuming at exactly this frame.
    Pending,
}

/// The final outcome of a completed IOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IopResult {
    Ok,
    Error(i32),
}

/// The vnops/vfsops/device-dispatch seam: the one hot polymorphism point
/// in the I/O path.
pub trait IopHandler: Send + Sync {
    /// Called while the engine is descending through this frame.
    fn dispatch(&self, iop: &Iop, frame_index: usize) -> IopRet;

    /// Called while the engine is ascending back through this frame.
    fn complete(&self, iop: &Iop, frame_index: usize) -> IopRet {
        let _ = (iop, frame_index);
        IopRet::Completed
    }
}

struct IopState {
    frames: Vec<Frame>,
    /// Index of the frame currently being processed; starts at -1 (no
    /// frame reached yet).
    stack_current: i64,
    going_up: bool,
    /// Set when the next pass down should move to a new frame (initial
    /// descent, or after a dispatch routine prepares one via
    /// [`IopRet::Continue`]). Clear when resuming a frame whose slaves
    /// just finished, or re-dispatching after [`IopRet::Continue`] from
    /// a completion routine -- both cases stay on the same frame.
    needs_advance: bool,
}

/// An I/O packet: a stack of frames plus the control state that
/// [`iop_continue`] drives through them.
pub struct Iop {
    state: SpinLock<IopState>,
    event: Event,
    result: SpinLock<Option<IopResult>>,
    /// Compare-exchanged once to race-safely decide who starts this IOP
    /// when it is a slave waiting to be kicked off.
    begun: AtomicBool,
    incomplete_slave_iops_n: AtomicU32,
    master: SpinLock<Option<Weak<Iop>>>,
}

impl Iop {
    /// Creates a new, empty IOP (no frames yet; the caller pushes its
    /// first frame before the first [`iop_continue`] call).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(IopState {
                frames: Vec::new(),
                stack_current: -1,
                going_up: false,
                needs_advance: true,
            }),
            event: Event::new(false),
            result: SpinLock::new(None),
            begun: AtomicBool::new(false),
            incomplete_slave_iops_n: AtomicU32::new(0),
            master: SpinLock::new(None),
        })
    }

    /// Pushes a new frame onto the stack. Dispatch routines call this to
    /// prepare the frame they want the engine to descend into next,
    /// before returning [`IopRet::Continue`].
    pub fn push_frame(&self, frame: Frame) {
        self.state.lock().frames.push(frame);
    }

    /// Attaches a slave IOP to frame `frame_index`. A dispatch routine
    /// may call this for its own current frame and return
    /// [`IopRet::Pending`]; the engine runs the slave and re-dispatches
    /// this frame once it (and any other attached slave) completes.
    pub fn attach_slave(&self, frame_index: usize, slave: Arc<Iop>) {
        self.state.lock().frames[frame_index].slaves.push(slave);
    }

    /// Number of frames currently on the stack.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// The final result, once the IOP has completed.
    #[must_use]
    pub fn result(&self) -> Option<IopResult> {
        *self.result.lock()
    }

    /// The event a caller waits on for this IOP's completion. Signaled by
    /// [`finish`] once the stack has fully unwound back past frame zero.
    #[must_use]
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Records an outcome ahead of completion, e.g. an error noticed by
    /// a handler's `complete`. [`finish`] only fills in [`IopResult::Ok`]
    /// when nothing has been recorded yet.
    pub fn set_result(&self, result: IopResult) {
        *self.result.lock() = Some(result);
    }

    fn set_master(&self, master: &Arc<Iop>) {
        *self.master.lock() = Some(Arc::downgrade(master));
    }

    /// Atomic compare-exchange: returns `true` the first (and only the
    /// first) time this is called for a given IOP.
    fn try_begin(&self) -> bool {
        self.begun
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Runs `iop`'s frame stack until it either fully completes or a frame
/// returns [`IopRet::Pending`].
///
/// On first entry for a freshly pushed frame, `incoming` is ignored; on
/// resumption after a `Pending` return, `incoming` carries the device's
/// result for the frame that suspended.
pub fn iop_continue(iop: &Arc<Iop>, incoming: IopRet) -> IopRet {
    let mut pending_result = incoming;
    loop {
        let going_up;
        let idx;
        {
            let mut state = iop.state.lock();
            if state.going_up {
                going_up = true;
            } else {
                if state.needs_advance {
                    state.stack_current += 1;
                    state.needs_advance = false;
                }
                going_up = false;
            }
            idx = state.stack_current;
        }

        if going_up && idx < 0 {
            finish(iop);
            return IopRet::Completed;
        }

        let idx_usize = idx as usize;
        if !going_up {
            // Start every not-yet-begun slave of this frame. A slave
            // going pending does not block its siblings from starting;
            // this frame only dispatches once every slave has finished.
            while let Some(slave) = next_unbegun_slave(iop, idx_usize) {
                slave.set_master(iop);
                iop.incomplete_slave_iops_n.fetch_add(1, Ordering::AcqRel);
                iop_continue(&slave, IopRet::Begin);
            }
            if iop.incomplete_slave_iops_n.load(Ordering::Acquire) > 0 {
                return IopRet::Pending;
            }

            match dispatch_frame(iop, idx_usize) {
                IopRet::Completed => {
                    let mut state = iop.state.lock();
                    state.going_up = true;
                    state.stack_current -= 1;
                }
                IopRet::Continue => {
                    iop.state.lock().needs_advance = true;
                }
                IopRet::Pending => return IopRet::Pending,
            }
        } else {
            let ret = complete_frame(iop, idx_usize, pending_result);
            pending_result = IopRet::Completed;
            match ret {
                IopRet::Completed => {
                    iop.state.lock().stack_current -= 1;
                }
                IopRet::Continue => {
                    let mut state = iop.state.lock();
                    state.going_up = false;
                    state.needs_advance = false;
                }
                IopRet::Pending => return IopRet::Pending,
            }
        }
    }
}

fn next_unbegun_slave(iop: &Arc<Iop>, frame_index: usize) -> Option<Arc<Iop>> {
    let state = iop.state.lock();
    state.frames[frame_index]
        .slaves
        .iter()
        .find(|s| s.try_begin())
        .cloned()
}

fn dispatch_frame(iop: &Arc<Iop>, idx: usize) -> IopRet {
    let handler = {
        let state = iop.state.lock();
        state.frames[idx].handler.clone()
    };
    match handler {
        Some(h) => h.dispatch(iop, idx),
        None => IopRet::Completed,
    }
}

fn complete_frame(iop: &Arc<Iop>, idx: usize, _incoming: IopRet) -> IopRet {
    let handler = {
        let state = iop.state.lock();
        state.frames[idx].handler.clone()
    };
    match handler {
        Some(h) => h.complete(iop, idx),
        None => IopRet::Completed,
    }
}

fn finish(iop: &Arc<Iop>) {
    let master = iop.master.lock().as_ref().and_then(Weak::upgrade);
    match master {
        Some(master) => {
            if master.incomplete_slave_iops_n.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = iop_continue(&master, IopRet::Completed);
            }
        }
        None => {
            let mut result = iop.result.lock();
            if result.is_none() {
                *result = Some(IopResult::Ok);
            }
            drop(result);
            iop.event.signal();
        }
    }
}

/// Submits `iop` and polls it to completion.
///
/// Host/test-friendly synchronous helper: a kernel build with real
/// asynchronous devices would instead await [`Iop`]'s embedded event
/// through the dispatcher, parking the calling task until a `Pending`
/// frame's device completion callback resumes it.
pub fn iop_send_sync(iop: &Arc<Iop>) -> IopResult {
    let mut ret = iop_continue(iop, IopRet::Begin);
    while ret == IopRet::Pending {
        // No asynchronous devices in this build drive the resumption;
        // a real caller would await `iop.event` here instead of busy
        // looping. Host tests only exercise handlers that resolve
        // without going through this branch.
        ret = iop_continue(iop, IopRet::Completed);
    }
    iop.result().unwrap_or(IopResult::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct ImmediateOk;
    impl IopHandler for ImmediateOk {
        fn dispatch(&self, _iop: &Iop, _frame_index: usize) -> IopRet {
            IopRet::Completed
        }
    }

    #[test]
    fn single_frame_completes_synchronously() {
        let iop = Iop::new();
        iop.push_frame(Frame::new(FrameFn::Read, None, FramePayload::None).with_handler(Arc::new(ImmediateOk)));
        assert_eq!(iop_continue(&iop, IopRet::Begin), IopRet::Completed);
        assert_eq!(iop.result(), Some(IopResult::Ok));
    }

    struct TwoLevelDown {
        pushed: AtomicBool,
    }
    impl IopHandler for TwoLevelDown {
        fn dispatch(&self, iop: &Iop, frame_index: usize) -> IopRet {
            if frame_index == 0 && !self.pushed.swap(true, Ordering::AcqRel) {
                iop.push_frame(Frame::new(FrameFn::Read, None, FramePayload::None).with_handler(Arc::new(ImmediateOk)));
                return IopRet::Continue;
            }
            IopRet::Completed
        }
    }

    #[test]
    fn dispatch_continue_descends_to_pushed_frame() {
        let iop = Iop::new();
        iop.push_frame(
            Frame::new(FrameFn::Read, None, FramePayload::None)
                .with_handler(Arc::new(TwoLevelDown { pushed: AtomicBool::new(false) })),
        );
        assert_eq!(iop_continue(&iop, IopRet::Begin), IopRet::Completed);
        assert_eq!(iop.frame_count(), 2);
    }

    struct CountingHandler {
        dispatched: AtomicUsize,
        completed: AtomicUsize,
    }
    impl IopHandler for CountingHandler {
        fn dispatch(&self, _iop: &Iop, _frame_index: usize) -> IopRet {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            IopRet::Completed
        }
        fn complete(&self, _iop: &Iop, _frame_index: usize) -> IopRet {
            self.completed.fetch_add(1, Ordering::Relaxed);
            IopRet::Completed
        }
    }

    #[test]
    fn completion_runs_after_dispatch() {
        let handler = Arc::new(CountingHandler {
            dispatched: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });
        let iop = Iop::new();
        iop.push_frame(Frame::new(FrameFn::Write, None, FramePayload::None).with_handler(handler.clone()));
        iop_continue(&iop, IopRet::Begin);
        assert_eq!(handler.dispatched.load(Ordering::Relaxed), 1);
        assert_eq!(handler.completed.load(Ordering::Relaxed), 1);
    }

    struct PendingThenDone {
        resumed: AtomicBool,
    }
    impl IopHandler for PendingThenDone {
        fn dispatch(&self, _iop: &Iop, _frame_index: usize) -> IopRet {
            if self.resumed.swap(true, Ordering::AcqRel) {
                IopRet::Completed
            } else {
                IopRet::Pending
            }
        }
    }

    #[test]
    fn pending_suspends_and_resumes() {
        let iop = Iop::new();
        iop.push_frame(
            Frame::new(FrameFn::Read, None, FramePayload::None)
                .with_handler(Arc::new(PendingThenDone { resumed: AtomicBool::new(false) })),
        );
        assert_eq!(iop_continue(&iop, IopRet::Begin), IopRet::Pending);
        assert_eq!(iop_continue(&iop, IopRet::Completed), IopRet::Completed);
    }

    /// Master frame attaches two slaves; the first goes pending, the
    /// engine starts the second which completes synchronously, and the
    /// whole IOP goes pending until the first slave is resumed -- the
    /// "two slave IOPs completing out of order" scenario.
    #[test]
    fn slaves_completing_out_of_order_signal_master_once_both_finish() {
        let slave1 = Iop::new();
        slave1.push_frame(
            Frame::new(FrameFn::Read, None, FramePayload::None)
                .with_handler(Arc::new(PendingThenDone { resumed: AtomicBool::new(false) })),
        );
        let slave2 = Iop::new();
        slave2.push_frame(Frame::new(FrameFn::Read, None, FramePayload::None).with_handler(Arc::new(ImmediateOk)));

        let master = Iop::new();
        let mut frame = Frame::new(FrameFn::Read, None, FramePayload::None).with_handler(Arc::new(ImmediateOk));
        frame.attach_slave(slave1.clone());
        frame.attach_slave(slave2.clone());
        master.push_frame(frame);

        assert_eq!(iop_continue(&master, IopRet::Begin), IopRet::Pending);
        assert_eq!(master.incomplete_slave_iops_n.load(Ordering::Acquire), 2);

        assert_eq!(iop_continue(&slave1, IopRet::Completed), IopRet::Completed);
        assert_eq!(master.result(), Some(IopResult::Ok));
    }

    #[test]
    fn send_sync_returns_ok_for_trivial_iop() {
        let iop = Iop::new();
        iop.push_frame(Frame::new(FrameFn::Ioctl, None, FramePayload::None).with_handler(Arc::new(ImmediateOk)));
        assert_eq!(iop_send_sync(&iop), IopResult::Ok);
    }
}
