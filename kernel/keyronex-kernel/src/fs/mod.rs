//! Virtual filesystem layer.
//!
//! A namecache-backed path resolver sits on top of a small vnode
//! operations trait and a mount table. Core types are self-contained so
//! this module (apart from `vfs`'s global singleton) is host-testable.

extern crate alloc;

use alloc::string::String;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod file;
pub mod path;
pub mod vfs;
pub mod vnode;

/// Errors returned by vnode operations and path resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No such file or directory.
    NotFound,
    /// Expected a directory, found something else.
    NotADirectory,
    /// Expected a non-directory, found a directory.
    IsADirectory,
    /// Malformed argument (e.g. a relative path where absolute was required).
    InvalidArgument,
    /// Operation not permitted by the vnode's access controls.
    PermissionDenied,
    /// Name already exists.
    Exists,
    /// Backing store is full.
    NoSpace,
    /// Underlying device or medium error.
    Io,
    /// Symlink resolution exceeded the splice depth limit.
    LoopDetected,
    /// The vnode's type does not support this operation.
    NotSupported,
}

impl FsError {
    /// Maps this filesystem error to a POSIX-style errno value.
    ///
    /// Used at the syscall boundary when surfacing a [`FsError`] as a
    /// negative return value to userspace; the errno/POSIX personality
    /// lives here rather than in the executive core's object manager.
    #[must_use]
    pub const fn to_errno(self) -> isize {
        match self {
            Self::NotFound => keyronex_base::syscall::ENOENT,
            Self::NotADirectory => keyronex_base::syscall::ENOTDIR,
            Self::IsADirectory => keyronex_base::syscall::EISDIR,
            Self::InvalidArgument => keyronex_base::syscall::EINVAL,
            Self::PermissionDenied => keyronex_base::syscall::EACCES,
            Self::Exists => keyronex_base::syscall::EEXIST,
            Self::NoSpace => keyronex_base::syscall::EIO,
            Self::Io => keyronex_base::syscall::EIO,
            Self::LoopDetected => keyronex_base::syscall::EINVAL,
            Self::NotSupported => keyronex_base::syscall::ENOSYS,
        }
    }
}

/// What kind of object a directory entry or vnode names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
}

/// One entry read back from a directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// The entry's name within its directory.
    pub name: String,
    /// The entry's vnode type.
    pub kind: VnodeType,
}

/// A heap-allocated, pinned future, for object-safe async vnode operations.
pub type VnodeFuture<T> = Pin<alloc::boxed::Box<dyn Future<Output = T> + Send>>;

/// Creates a [`Waker`] that does nothing when woken.
///
/// Used to poll vnode-operation futures that are expected to resolve
/// synchronously (in-memory filesystems, cached lookups); driver-backed
/// vnodes that can genuinely return `Pending` must not be polled this way.
#[must_use]
pub fn noop_waker() -> Waker {
    fn noop(_: *const ()) {}
    fn clone(p: *const ()) -> RawWaker {
        RawWaker::new(p, &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
}

/// Polls `future` once; panics if it is not immediately ready.
///
/// # Panics
///
/// Panics if `future` returns [`Poll::Pending`].
pub fn poll_immediate<F: Future>(future: F) -> F::Output {
    try_poll_immediate(future).expect("poll_immediate: future did not complete synchronously")
}

/// Polls `future` once, returning `None` instead of panicking on [`Poll::Pending`].
pub fn try_poll_immediate<F: Future>(future: F) -> Option<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut future = core::pin::pin!(future);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(v) => Some(v),
        Poll::Pending => None,
    }
}
