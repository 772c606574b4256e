//! x86_64 instruction wrappers.

pub mod segmentation;
pub mod tlb;
