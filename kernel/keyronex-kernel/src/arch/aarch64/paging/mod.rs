//! AArch64 page table mapper.
//!
//! The mapper itself has no runtime-specific state; the stub lives in
//! `keyronex-base` alongside the x86_64 mapper it mirrors.

pub use keyronex_base::arch::aarch64::paging::AArch64PageMapper;
