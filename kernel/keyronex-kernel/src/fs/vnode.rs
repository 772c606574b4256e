//! Vnode operations: the per-filesystem surface the VFS calls through.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};

use keyronex_base::dispatch::wait;
use keyronex_base::iop::{Frame, FrameFn, FramePayload, Iop, IopHandler, IopRet, iop_continue};
use keyronex_base::objmgr::{ObjectHeader, ObjectKind};
use keyronex_base::sync::SpinLock;

use super::{DirEntry, FsError, VnodeFuture, VnodeType};

/// [`IopHandler`] for a frame wrapping a plain vnode-op future: dispatch
/// has nothing of its own to descend into, so the first call always
/// suspends; [`drive_through_iop`] only re-dispatches this frame (via
/// [`iop_continue`] with [`IopRet::Completed`]) once its spawned task has
/// actually finished running the wrapped future, so the second dispatch
/// call is the real completion signal. This is the seam a real
/// block-backed filesystem would replace with a handler that walks its
/// own device stack instead of a bare future.
struct AsyncOpHandler {
    resumed: AtomicBool,
}

impl AsyncOpHandler {
    fn new() -> Self {
        Self {
            resumed: AtomicBool::new(false),
        }
    }
}

impl IopHandler for AsyncOpHandler {
    fn dispatch(&self, _iop: &Iop, _frame_index: usize) -> IopRet {
        if self.resumed.swap(true, Ordering::AcqRel) {
            IopRet::Completed
        } else {
            IopRet::Pending
        }
    }
}

/// Runs `op` to completion through a single-frame IOP rather than awaiting
/// it directly, so a vnode's reads and writes are visible to the same
/// engine that drives device I/O, instead of bypassing it entirely.
async fn drive_through_iop<T, Fut>(func: FrameFn, vnode_id: u64, offset: u64, op: Fut) -> T
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let iop = Iop::new();
    iop.push_frame(
        Frame::new(func, Some(vnode_id), FramePayload::None)
            .with_rw_offset(offset)
            .with_handler(Arc::new(AsyncOpHandler::new())),
    );

    let outcome: Arc<SpinLock<Option<T>>> = Arc::new(SpinLock::new(None));
    debug_assert_eq!(
        iop_continue(&iop, IopRet::Begin),
        IopRet::Pending,
        "a fresh single-frame AsyncOpHandler IOP always suspends on first dispatch"
    );

    {
        let iop = iop.clone();
        let outcome = outcome.clone();
        crate::sched::spawn(async move {
            let value = op.await;
            *outcome.lock() = Some(value);
            let _ = iop_continue(&iop, IopRet::Completed);
        });
    }

    wait(iop.event()).await;
    outcome
        .lock()
        .take()
        .expect("iop completion signals only after the outcome slot is filled")
}

/// Per-filesystem operations a vnode exposes to the VFS.
///
/// Every method takes `Arc<Self>` so implementations can hand out futures
/// that outlive the call (e.g. a future doing async block I/O) without
/// borrowing the vnode.
pub trait VnodeOps: Send + Sync {
    /// Resolves one path component under this (directory) vnode.
    fn lookup(self: Arc<Self>, name: String) -> VnodeFuture<Result<Arc<Vnode>, FsError>>;

    /// Reads `len` bytes starting at `offset`.
    fn read(self: Arc<Self>, offset: u64, len: usize) -> VnodeFuture<Result<Vec<u8>, FsError>>;

    /// Writes `data` at `offset`, returning the number of bytes written.
    fn write(self: Arc<Self>, offset: u64, data: Vec<u8>) -> VnodeFuture<Result<usize, FsError>>;

    /// Lists the immediate children of a directory vnode.
    fn readdir(self: Arc<Self>) -> VnodeFuture<Result<Vec<DirEntry>, FsError>>;

    /// Returns a symlink's target path.
    fn readlink(self: Arc<Self>) -> VnodeFuture<Result<String, FsError>> {
        let _ = self;
        alloc::boxed::Box::pin(core::future::ready(Err(FsError::NotSupported)))
    }

    /// Device/file-specific control operation.
    fn ioctl(self: Arc<Self>, cmd: u32, arg: usize) -> VnodeFuture<Result<usize, FsError>> {
        let _ = (self, cmd, arg);
        alloc::boxed::Box::pin(core::future::ready(Err(FsError::NotSupported)))
    }
}

/// A node in the VFS graph: a type tag, an object-manager header, the
/// filesystem-specific operations that implement it, and (for directory
/// vnodes that are the root of a mounted filesystem) the vnode it covers
/// in the parent filesystem.
pub struct Vnode {
    header: ObjectHeader,
    kind: VnodeType,
    ops: Arc<dyn VnodeOps>,
    /// Set once another filesystem is mounted on this vnode; holds that
    /// filesystem's index in the owning [`crate::fs::vfs::Vfs`]'s mount table.
    mounted_here: SpinLock<Option<usize>>,
}

impl Vnode {
    /// Wraps filesystem-specific operations in a new vnode.
    #[must_use]
    pub fn new(kind: VnodeType, ops: Arc<dyn VnodeOps>) -> Arc<Self> {
        Arc::new(Self {
            header: ObjectHeader::new(ObjectKind::Vnode, None),
            kind,
            ops,
            mounted_here: SpinLock::new(None),
        })
    }

    /// The vnode's type.
    #[must_use]
    pub const fn kind(&self) -> VnodeType {
        self.kind
    }

    /// The object-manager header embedded in this vnode.
    #[must_use]
    pub const fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// The filesystem-specific operations backing this vnode.
    #[must_use]
    pub fn ops(&self) -> Arc<dyn VnodeOps> {
        self.ops.clone()
    }

    /// Index of the filesystem mounted on this vnode, if any.
    #[must_use]
    pub fn mounted_here(&self) -> Option<usize> {
        *self.mounted_here.lock()
    }

    /// Records that filesystem `mount_index` is now mounted on this vnode.
    ///
    /// # Panics
    ///
    /// Panics if this vnode is not a directory, or something is already
    /// mounted here.
    pub fn set_mounted_here(&self, mount_index: usize) {
        assert_eq!(self.kind, VnodeType::Directory, "can only mount on a directory");
        let mut slot = self.mounted_here.lock();
        assert!(slot.is_none(), "vnode already has a filesystem mounted on it");
        *slot = Some(mount_index);
    }

    /// Clears a prior [`Vnode::set_mounted_here`].
    pub fn clear_mounted_here(&self) {
        *self.mounted_here.lock() = None;
    }

    /// Reads into `buf`, returning the number of bytes actually read.
    ///
    /// Adapts [`VnodeOps::read`]'s owned-`Vec` return to a caller-supplied
    /// buffer, the shape the syscall I/O path copies into/out of user
    /// memory with. Runs through [`drive_through_iop`] rather than
    /// awaiting the op directly, so the read is a real IOP as far as the
    /// rest of the device stack is concerned.
    pub async fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        #[allow(clippy::cast_possible_truncation, reason = "offsets fit u64 on all supported targets")]
        let offset = offset as u64;
        let len = buf.len();
        let ops = self.ops();
        let data = drive_through_iop(FrameFn::Read, self.header.id(), offset, async move {
            ops.read(offset, len).await
        })
        .await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Writes `buf` at `offset`, returning the number of bytes written.
    pub async fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        #[allow(clippy::cast_possible_truncation, reason = "offsets fit u64 on all supported targets")]
        let offset = offset as u64;
        let data = buf.to_vec();
        let ops = self.ops();
        drive_through_iop(FrameFn::Write, self.header.id(), offset, async move {
            ops.write(offset, data).await
        })
        .await
    }
}
