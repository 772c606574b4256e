//! Per-process file descriptor table.
//!
//! Maps small integer handles to an open vnode, its access flags, and
//! an independent seek offset. This is POSIX-personality bookkeeping
//! layered on top of the VFS, not part of the vnode/namecache core.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use bitflags::bitflags;

use super::vnode::Vnode;

bitflags! {
    /// Access mode a file descriptor was opened with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
    }
}

/// One open file: the vnode it refers to, how it was opened, and the
/// process-local seek position.
pub struct OpenFile {
    /// The vnode this descriptor refers to.
    pub inode: Arc<Vnode>,
    /// Flags the descriptor was opened with.
    pub flags: OpenFlags,
    /// Current seek offset for sequential reads/writes.
    pub offset: usize,
}

impl OpenFile {
    /// Wraps a vnode as a freshly-opened file at offset zero.
    #[must_use]
    pub const fn new(inode: Arc<Vnode>, flags: OpenFlags) -> Self {
        Self {
            inode,
            flags,
            offset: 0,
        }
    }
}

/// A process's table of open file descriptors.
///
/// Descriptor numbers are assigned by the caller (`insert_at`) or by
/// [`FileDescriptorTable::insert`], which picks the lowest unused
/// number — the usual POSIX `open`/`dup` allocation rule.
#[derive(Default)]
pub struct FileDescriptorTable {
    files: BTreeMap<usize, OpenFile>,
}

impl FileDescriptorTable {
    /// Creates an empty file descriptor table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// Installs `inode` at a specific descriptor number, replacing
    /// whatever was there (used for stdin/stdout/stderr setup).
    pub fn insert_at(&mut self, fd: usize, inode: Arc<Vnode>, flags: OpenFlags) {
        self.files.insert(fd, OpenFile::new(inode, flags));
    }

    /// Installs `inode` at the lowest unused descriptor number,
    /// returning it.
    pub fn insert(&mut self, inode: Arc<Vnode>, flags: OpenFlags) -> usize {
        let fd = self
            .files
            .keys()
            .copied()
            .enumerate()
            .find(|&(expected, actual)| expected != actual)
            .map_or(self.files.len(), |(expected, _)| expected);
        self.files.insert(fd, OpenFile::new(inode, flags));
        fd
    }

    /// Looks up an open file by descriptor number.
    #[must_use]
    pub fn get(&self, fd: usize) -> Option<&OpenFile> {
        self.files.get(&fd)
    }

    /// Looks up an open file mutably by descriptor number.
    pub fn get_mut(&mut self, fd: usize) -> Option<&mut OpenFile> {
        self.files.get_mut(&fd)
    }

    /// Closes a descriptor, returning its entry if it was open.
    pub fn remove(&mut self, fd: usize) -> Option<OpenFile> {
        self.files.remove(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vnode::VnodeOps;
    use crate::fs::{DirEntry, FsError, VnodeFuture, VnodeType};
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::vec::Vec;

    struct DummyFile;

    impl VnodeOps for DummyFile {
        fn lookup(self: Arc<Self>, _name: String) -> VnodeFuture<Result<Arc<Vnode>, FsError>> {
            Box::pin(core::future::ready(Err(FsError::NotADirectory)))
        }
        fn read(self: Arc<Self>, _offset: u64, _len: usize) -> VnodeFuture<Result<Vec<u8>, FsError>> {
            Box::pin(core::future::ready(Ok(Vec::new())))
        }
        fn write(self: Arc<Self>, _offset: u64, data: Vec<u8>) -> VnodeFuture<Result<usize, FsError>> {
            Box::pin(core::future::ready(Ok(data.len())))
        }
        fn readdir(self: Arc<Self>) -> VnodeFuture<Result<Vec<DirEntry>, FsError>> {
            Box::pin(core::future::ready(Ok(Vec::new())))
        }
    }

    fn dummy_vnode() -> Arc<Vnode> {
        Vnode::new(VnodeType::Regular, Arc::new(DummyFile))
    }

    #[test]
    fn insert_at_then_get_round_trips() {
        let mut table = FileDescriptorTable::new();
        table.insert_at(0, dummy_vnode(), OpenFlags::READ);
        let entry = table.get(0).expect("fd 0 present");
        assert_eq!(entry.flags, OpenFlags::READ);
        assert_eq!(entry.offset, 0);
    }

    #[test]
    fn insert_picks_lowest_free_descriptor() {
        let mut table = FileDescriptorTable::new();
        let a = table.insert(dummy_vnode(), OpenFlags::READ);
        let b = table.insert(dummy_vnode(), OpenFlags::READ);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        table.remove(0);
        let c = table.insert(dummy_vnode(), OpenFlags::READ);
        assert_eq!(c, 0, "should reuse the freed slot");
    }

    #[test]
    fn get_mut_allows_offset_tracking() {
        let mut table = FileDescriptorTable::new();
        table.insert_at(3, dummy_vnode(), OpenFlags::WRITE);
        table.get_mut(3).expect("fd 3 present").offset += 128;
        assert_eq!(table.get(3).unwrap().offset, 128);
    }

    #[test]
    fn remove_clears_slot() {
        let mut table = FileDescriptorTable::new();
        table.insert_at(0, dummy_vnode(), OpenFlags::READ);
        assert!(table.remove(0).is_some());
        assert!(table.get(0).is_none());
    }
}
