//! Syscall number/errno facade.
//!
//! The constants and [`userptr`] validation logic are architecture- and
//! runtime-independent, so they live in `keyronex-base` and are
//! re-exported here for the process/trap-handling code in [`crate::proc`].

pub use keyronex_base::syscall::{
    CLOCK_MONOTONIC, EACCES, EBADF, EEXIST, EFAULT, EINVAL, EIO, EISDIR, ENOENT, ENOSYS, ENOTDIR,
    KernelVersionInfo, MemoryInfo, QUERY_KERNEL_VERSION, QUERY_MEMORY, QUERY_UPTIME, SYS_CHANNEL_CALL,
    SYS_CHANNEL_CREATE, SYS_CHANNEL_RECV, SYS_CHANNEL_SEND, SYS_CLOCK_GETTIME, SYS_DEBUG_LOG,
    SYS_EVENT_CREATE, SYS_EVENT_SIGNAL, SYS_EVENT_WAIT, SYS_EVENT_WAIT_MANY, SYS_HANDLE_CLOSE,
    SYS_HANDLE_DUP, SYS_HANDLE_INFO, SYS_MEM_CREATE_SHARED, SYS_MEM_MAP, SYS_MEM_MAP_SHARED,
    SYS_MEM_PROTECT, SYS_MEM_UNMAP, SYS_QUERY, SYS_TASK_DETACH, SYS_TASK_EXIT, SYS_TASK_INFO,
    SYS_TASK_KILL, SYS_TASK_SPAWN, SYS_TASK_WAIT, SYS_TIMER_CREATE, SYS_VNODE_OPEN, SYS_VNODE_READ,
    SYS_VNODE_READDIR, SYS_VNODE_STAT, SYS_VNODE_UNLINK, SYS_VNODE_WRITE, Timespec, UptimeInfo,
    userptr,
};
