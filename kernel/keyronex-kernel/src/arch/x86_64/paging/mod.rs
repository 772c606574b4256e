//! Page table mapper for walking and building page tables via the HHDM.
//!
//! The mapper implementation is architecture-specific but has no
//! runtime-only state, so it lives in `keyronex-base` alongside the
//! aarch64 one and is re-exported here.

pub use super::structures::paging::{PageTable, PageTableEntry, PageTableFlags};
pub use keyronex_base::arch::x86_64::paging::{PageTableMapper, TranslateResult, UnmapError};
