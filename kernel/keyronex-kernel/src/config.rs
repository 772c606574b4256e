//! Compile-time kernel configuration.
//!
//! A single source of truth for the handful of constants that size
//! statically-allocated per-CPU tables and gate log verbosity.

use keyronex_base::log::LogLevel;

/// Maximum kernel log level (compile-time). Sinks at or below this level
/// will receive messages; higher-verbosity messages are compiled out.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// Maximum number of CPUs supported by the kernel.
///
/// Sizes every `CpuLocal` array; raising it costs a few KiB of `.bss` per
/// such array, not a runtime allocation.
pub const MAX_CPUS: usize = 64;

/// Kernel heap size in bytes.
pub const KERNEL_HEAP_SIZE: u64 = 16 * 1024 * 1024;

/// High-water mark for a namecache's inactive (zero-refcount) LRU.
pub const MAX_INACTIVE_NAMECACHE_ENTRIES: usize = 256;

/// Default thread timeslice, in timer ticks, assigned on dispatch.
pub const DEFAULT_TIMESLICE_TICKS: u32 = 20;

/// Maximum dispatcher objects a single `wait_multi` call may wait on.
///
/// Re-exported from `keyronex-base` so kernel code reaches for it from the
/// same place as the other tunables; the base crate owns the real value
/// since the dispatcher types it sizes live there.
pub use keyronex_base::dispatch::INLINE_WAITBLOCK_CAPACITY;

/// Maximum symlink splices followed while resolving a single path, before
/// assuming a loop.
pub const MAX_SYMLINK_DEPTH: usize = 8;

/// Whether anonymous pages may be written out to a backing store under
/// memory pressure. Off until a swap device backend exists.
pub const SWAP_ENABLED: bool = false;

/// Build target triple, for boot banner diagnostics. Set by `build.rs`;
/// falls back to a placeholder if it did not run (e.g. `cargo check` on host).
pub const TARGET: &str = match option_env!("TARGET") {
    Some(t) => t,
    None => "unknown-target",
};

/// Build profile name, for boot banner diagnostics.
#[cfg(debug_assertions)]
pub const PROFILE: &str = "debug";
#[cfg(not(debug_assertions))]
pub const PROFILE: &str = "release";

/// Project version, taken from the crate's own `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
