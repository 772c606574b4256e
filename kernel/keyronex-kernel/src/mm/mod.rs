//! Memory management types, traits, and subsystems.
//!
//! Core data structures and algorithms live in [`keyronex_base::mm`] for
//! host testability. This module re-exports them and adds kernel-specific
//! glue (boot-info conversion, global VMM wiring, heap init).

// Re-export root-level items from keyronex-base.
pub use keyronex_base::mm::{
    FrameAllocator, FrameDeallocator, PAGE_MASK, PAGE_SIZE, PhysMemoryRegion, PmmError, VmmError,
    zero_frame,
};

// Re-export submodules that don't need kernel extension.
pub use keyronex_base::mm::address_space;
pub use keyronex_base::mm::amap;
pub use keyronex_base::mm::anon;
pub use keyronex_base::mm::hhdm;
pub use keyronex_base::mm::layout;
pub use keyronex_base::mm::mapper;
pub use keyronex_base::mm::object;
pub use keyronex_base::mm::pfn;
pub use keyronex_base::mm::region;
pub use keyronex_base::mm::vad;

// Kernel-extended modules (re-export keyronex-base contents + add glue).
pub mod heap;
pub mod pmm;
pub mod scope;
pub mod vmm;
