//! Freestanding runtime for elfpack stubs.
//!
//! The `loader` binary rebuilds a packed program with `elfpack::loader` and
//! jumps to it; the `stage0` binary inflates a loader that was wrapped to
//! save space. Both are flat position-independent blobs (see `link.ld`) with
//! their template blocks in `.rodata.params`, patched by the packer.

#![no_std]

use core::panic::PanicInfo;
use core::ptr;

use elfpack::loader::Fatal;
use elfpack::params::{self, Version};
use elfpack::stage0;

pub mod arch;
pub mod linux;

/// An unpatched parameter block for a loader of `version`.
pub const fn params_template(version: Version) -> [u8; params::V2_LEN] {
    let mut block = [0u8; params::V2_LEN];
    let mut i = 0;
    while i < params::MAGIC.len() {
        block[i] = params::MAGIC[i];
        i += 1;
    }
    block[8] = version as u8;
    block
}

/// An empty `+zELF-S0` block.
pub const fn stage0_template() -> [u8; stage0::PARAMS_LEN] {
    let mut block = [0u8; stage0::PARAMS_LEN];
    let mut i = 0;
    while i < stage0::MAGIC.len() {
        block[i] = stage0::MAGIC[i];
        i += 1;
    }
    block
}

/// Reads a block the packer may have patched after the build.
pub fn read_patched<const N: usize>(block: &'static [u8; N]) -> [u8; N] {
    unsafe { ptr::read_volatile(block) }
}

extern "C" {
    static __stub_end: u8;
}

/// Runtime address of the end of this stub's code and read-only data.
pub fn stub_end() -> u64 {
    unsafe { ptr::addr_of!(__stub_end) as u64 }
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    linux::exit(Fatal::Panic.code())
}
