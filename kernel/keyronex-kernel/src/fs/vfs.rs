//! Mount table and namecache-backed path resolution.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use keyronex_base::namecache::{Entry, Namecache};
use keyronex_base::sync::SpinLock;

use crate::config::{MAX_INACTIVE_NAMECACHE_ENTRIES, MAX_SYMLINK_DEPTH};

use super::path;
use super::vnode::Vnode;
use super::{FsError, poll_immediate};

/// What a lookup should return: the final component, or the parent plus
/// the final component name (for `*_at`-style syscalls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Resolve every component.
    Full,
    /// Stop one component short of the end.
    SecondToLast,
}

/// A resolved namecache entry paired with the mount it was resolved
/// through, so a caller can refuse to unmount a filesystem with
/// outstanding handles.
#[derive(Clone)]
pub struct VfsHandle {
    /// The namecache entry this handle names.
    pub entry: Arc<Entry<Arc<Vnode>>>,
    /// Index of the mount this entry's filesystem lives under.
    pub mount: usize,
}

/// A mounted filesystem: its root vnode and, unless it's the system
/// root, the vnode in the parent filesystem it's mounted on.
struct Mount {
    name: String,
    namecache: Namecache<Arc<Vnode>>,
    covered: Option<(usize, Arc<Entry<Arc<Vnode>>>)>,
}

/// The virtual filesystem: a mount table plus one namecache per mount.
pub struct Vfs {
    mounts: Vec<Mount>,
}

impl Vfs {
    fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Mounts `root_vnode` as a brand-new filesystem named `name`.
    ///
    /// If this is the first mount, it becomes the system root and
    /// `at` is ignored. Otherwise `at` names the handle covered by this
    /// mount: traversing `..` from the new root walks back to it, and
    /// the covered vnode is substituted by this filesystem's root while
    /// the mount is active.
    pub fn mount(&mut self, name: &str, root_vnode: Arc<Vnode>, at: Option<&VfsHandle>) -> usize {
        let index = self.mounts.len();
        let covered = at.map(|h| (h.mount, h.entry.clone()));
        if let Some((_, covered_entry)) = &covered {
            covered_entry
                .vnode()
                .expect("mount point must be a positive entry")
                .set_mounted_here(index);
        }
        self.mounts.push(Mount {
            name: name.to_string(),
            namecache: Namecache::new(root_vnode, MAX_INACTIVE_NAMECACHE_ENTRIES),
            covered,
        });
        keyronex_base::kinfo!("VFS: mounted {} at index {}", name, index);
        index
    }

    /// The system root handle (the first filesystem mounted).
    ///
    /// # Panics
    ///
    /// Panics if nothing has been mounted yet.
    #[must_use]
    pub fn root(&self) -> VfsHandle {
        assert!(!self.mounts.is_empty(), "no filesystem mounted");
        VfsHandle {
            entry: self.mounts[0].namecache.root(),
            mount: 0,
        }
    }

    fn substitute_mount_point(&self, handle: VfsHandle) -> VfsHandle {
        let Some(vnode) = handle.entry.vnode() else {
            return handle;
        };
        match vnode.mounted_here() {
            Some(mount_index) => VfsHandle {
                entry: self.mounts[mount_index].namecache.root(),
                mount: mount_index,
            },
            None => handle,
        }
    }

    fn cross_root_upward(&self, handle: VfsHandle) -> VfsHandle {
        if handle.entry.parent().is_some() {
            return handle;
        }
        match &self.mounts[handle.mount].covered {
            Some((parent_mount, parent_entry)) => VfsHandle {
                entry: parent_entry.clone(),
                mount: *parent_mount,
            },
            None => handle,
        }
    }

    fn lookup_one_component(
        &self,
        handle: &VfsHandle,
        name: &str,
    ) -> Result<Arc<Entry<Arc<Vnode>>>, FsError> {
        let mount = &self.mounts[handle.mount];
        if let Some(child) = handle.entry.lookup_child(name) {
            return match child.vnode() {
                Some(_) => Ok(child),
                None => Err(FsError::NotFound),
            };
        }

        let Some(dir_vnode) = handle.entry.vnode() else {
            return Err(FsError::NotFound);
        };
        match poll_immediate(dir_vnode.ops().lookup(name.to_string())) {
            Ok(child_vnode) => Ok(mount
                .namecache
                .insert_positive(&handle.entry, name, child_vnode)),
            Err(FsError::NotFound) => {
                mount.namecache.insert_negative(&handle.entry, name);
                Err(FsError::NotFound)
            }
            Err(other) => Err(other),
        }
    }

    /// Resolves `path` starting from `start`, per `mode`.
    ///
    /// Handles `.`, `..` (including crossing back out of a mounted
    /// filesystem through its covered vnode), mount-point substitution,
    /// and splicing symlink targets into the remaining component list
    /// (bounded by [`MAX_SYMLINK_DEPTH`] to catch loops).
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NotFound`] if any component is missing,
    /// [`FsError::LoopDetected`] if symlink resolution nests too deep,
    /// or [`FsError::InvalidArgument`] for a malformed path.
    pub fn vfs_lookup(
        &self,
        start: &VfsHandle,
        path_str: &str,
        mode: LookupMode,
    ) -> Result<VfsHandle, FsError> {
        let mut current = if path::is_absolute(path_str) {
            self.root()
        } else {
            start.clone()
        };

        let components: Vec<&str> = path::components(path_str).collect();
        if components.is_empty() {
            return Ok(current);
        }

        let last = if mode == LookupMode::SecondToLast {
            components.len().saturating_sub(1)
        } else {
            components.len()
        };

        let mut symlink_depth = 0;
        let mut remaining: Vec<String> = components[..last].iter().map(|s| s.to_string()).collect();
        remaining.reverse();

        while let Some(name) = remaining.pop() {
            if name == "." {
                continue;
            }
            if name == ".." {
                current = self.cross_root_upward(current);
                if let Some(parent) = current.entry.parent() {
                    current = VfsHandle {
                        entry: parent,
                        mount: current.mount,
                    };
                }
                continue;
            }

            let entry = self.lookup_one_component(&current, &name)?;
            let mut next = VfsHandle {
                entry,
                mount: current.mount,
            };
            next = self.substitute_mount_point(next);

            let is_final = remaining.is_empty();
            let vnode = next.entry.vnode().expect("positive entry has a vnode");
            if vnode.kind() == super::VnodeType::Symlink && !is_final {
                symlink_depth += 1;
                if symlink_depth > MAX_SYMLINK_DEPTH {
                    return Err(FsError::LoopDetected);
                }
                let target = poll_immediate(vnode.ops().readlink())?;
                if path::is_absolute(&target) {
                    current = self.root();
                }
                let mut spliced: Vec<String> =
                    path::components(&target).map(|s| s.to_string()).collect();
                spliced.reverse();
                remaining.extend(spliced);
                continue;
            }

            current = next;
        }

        Ok(current)
    }

    /// Resolves an absolute path to its final vnode, for simple callers
    /// that don't need handle bookkeeping.
    ///
    /// # Errors
    ///
    /// Propagates [`vfs_lookup`](Self::vfs_lookup)'s errors.
    pub fn resolve(&self, abs_path: &str) -> Result<Arc<Vnode>, FsError> {
        if !path::is_absolute(abs_path) {
            return Err(FsError::InvalidArgument);
        }
        let root = self.root();
        let handle = self.vfs_lookup(&root, abs_path, LookupMode::Full)?;
        handle.entry.vnode().ok_or(FsError::NotFound)
    }

    /// The name a mount was registered under.
    #[must_use]
    pub fn mount_name(&self, index: usize) -> &str {
        &self.mounts[index].name
    }
}

/// Global VFS instance.
static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Initializes the global VFS.
///
/// # Panics
///
/// Panics if the VFS has already been initialized.
pub fn init() {
    let mut vfs = VFS.lock();
    assert!(vfs.is_none(), "VFS already initialized");
    *vfs = Some(Vfs::new());
}

/// Runs `f` with a shared reference to the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs<R>(f: impl FnOnce(&Vfs) -> R) -> R {
    let vfs = VFS.lock();
    f(vfs.as_ref().expect("VFS not initialized"))
}

/// Runs `f` with a mutable reference to the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs_mut<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DirEntry, VnodeFuture, VnodeType};
    use crate::fs::vnode::VnodeOps;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    struct MemDir {
        children: SpinLock<BTreeMap<String, Arc<Vnode>>>,
    }

    impl VnodeOps for MemDir {
        fn lookup(self: Arc<Self>, name: String) -> VnodeFuture<Result<Arc<Vnode>, FsError>> {
            let result = self
                .children
                .lock()
                .get(&name)
                .cloned()
                .ok_or(FsError::NotFound);
            alloc::boxed::Box::pin(core::future::ready(result))
        }

        fn read(self: Arc<Self>, _offset: u64, _len: usize) -> VnodeFuture<Result<Vec<u8>, FsError>> {
            alloc::boxed::Box::pin(core::future::ready(Err(FsError::IsADirectory)))
        }

        fn write(
            self: Arc<Self>,
            _offset: u64,
            _data: Vec<u8>,
        ) -> VnodeFuture<Result<usize, FsError>> {
            alloc::boxed::Box::pin(core::future::ready(Err(FsError::IsADirectory)))
        }

        fn readdir(self: Arc<Self>) -> VnodeFuture<Result<Vec<DirEntry>, FsError>> {
            let entries = self
                .children
                .lock()
                .iter()
                .map(|(name, v)| DirEntry {
                    name: name.clone(),
                    kind: v.kind(),
                })
                .collect();
            alloc::boxed::Box::pin(core::future::ready(Ok(entries)))
        }
    }

    struct MemFile;

    impl VnodeOps for MemFile {
        fn lookup(self: Arc<Self>, _name: String) -> VnodeFuture<Result<Arc<Vnode>, FsError>> {
            alloc::boxed::Box::pin(core::future::ready(Err(FsError::NotADirectory)))
        }

        fn read(self: Arc<Self>, _offset: u64, _len: usize) -> VnodeFuture<Result<Vec<u8>, FsError>> {
            alloc::boxed::Box::pin(core::future::ready(Ok(vec![])))
        }

        fn write(
            self: Arc<Self>,
            _offset: u64,
            data: Vec<u8>,
        ) -> VnodeFuture<Result<usize, FsError>> {
            let len = data.len();
            alloc::boxed::Box::pin(core::future::ready(Ok(len)))
        }

        fn readdir(self: Arc<Self>) -> VnodeFuture<Result<Vec<DirEntry>, FsError>> {
            alloc::boxed::Box::pin(core::future::ready(Err(FsError::NotADirectory)))
        }
    }

    fn dir(children: &[(&str, Arc<Vnode>)]) -> Arc<Vnode> {
        let mut map = BTreeMap::new();
        for (name, vnode) in children {
            map.insert((*name).to_string(), vnode.clone());
        }
        Vnode::new(
            VnodeType::Directory,
            Arc::new(MemDir {
                children: SpinLock::new(map),
            }),
        )
    }

    fn file() -> Arc<Vnode> {
        Vnode::new(VnodeType::Regular, Arc::new(MemFile))
    }

    #[test]
    fn resolves_simple_absolute_path() {
        let bin_file = file();
        let bin_dir = dir(&[("init", bin_file)]);
        let root = dir(&[("bin", bin_dir)]);

        let mut vfs = Vfs::new();
        vfs.mount("rootfs", root, None);

        let resolved = vfs.resolve("/bin/init").unwrap();
        assert_eq!(resolved.kind(), VnodeType::Regular);
    }

    #[test]
    fn missing_component_caches_negative_entry() {
        let root = dir(&[]);
        let mut vfs = Vfs::new();
        vfs.mount("rootfs", root, None);

        assert!(matches!(vfs.resolve("/nope"), Err(FsError::NotFound)));
        let root_handle = vfs.root();
        let cached = root_handle.entry.lookup_child("nope").unwrap();
        assert!(!cached.is_positive());
    }

    #[test]
    fn dot_and_dotdot_navigate_without_error() {
        let leaf = file();
        let sub = dir(&[("leaf", leaf)]);
        let root = dir(&[("sub", sub)]);
        let mut vfs = Vfs::new();
        vfs.mount("rootfs", root, None);

        let resolved = vfs.resolve("/sub/./../sub/leaf").unwrap();
        assert_eq!(resolved.kind(), VnodeType::Regular);
    }

    #[test]
    fn second_to_last_mode_stops_before_final_component() {
        let leaf = file();
        let sub = dir(&[("leaf", leaf)]);
        let root = dir(&[("sub", sub)]);
        let mut vfs = Vfs::new();
        vfs.mount("rootfs", root, None);

        let root_handle = vfs.root();
        let parent = vfs
            .vfs_lookup(&root_handle, "/sub/leaf", LookupMode::SecondToLast)
            .unwrap();
        assert_eq!(parent.entry.name(), "sub");
    }

    #[test]
    fn mount_point_is_substituted_during_lookup() {
        let mounted_file = file();
        let mounted_root = dir(&[("hello", mounted_file)]);
        let mount_dir = dir(&[]);
        let root = dir(&[("mnt", mount_dir)]);

        let mut vfs = Vfs::new();
        vfs.mount("rootfs", root, None);
        let root_handle = vfs.root();
        let mnt_handle = VfsHandle {
            entry: vfs.lookup_one_component(&root_handle, "mnt").unwrap(),
            mount: 0,
        };
        vfs.mount("tmpfs", mounted_root, Some(&mnt_handle));

        let resolved = vfs.resolve("/mnt/hello").unwrap();
        assert_eq!(resolved.kind(), VnodeType::Regular);
    }
}
