//! x86_64 control and status registers.

pub mod control;

pub use keyronex_base::arch::x86_64::registers::{model_specific, rflags};
