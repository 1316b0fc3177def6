//! The only code that differs between architectures: system call numbers
//! and instructions, the entry point, and the final jumps.
//!
//! Both entry points call `stub_main(sp, here, origin)`, which each binary
//! defines. `sp` points at `argc`, `here` is the address of `_start`, and
//! `origin` is what stage-0 passes in the third argument register. The
//! kernel starts a process with that register zeroed.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::*;
