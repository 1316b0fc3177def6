//! Packer for 64-bit Linux ELF executables (x86_64 and aarch64).
//!
//! A packed file is a small ELF whose only code is a stub. The stub finds
//! the packed block that follows it, decompresses the original image into
//! memory, maps its segments the way the kernel would, and jumps to it,
//! either directly or through the program's dynamic linker.
//!
//! # Layout of the crate
//!
//! Everything the stub runs at process start builds without `std` and
//! without an allocator, so the `stub/` package can link it into a
//! freestanding binary:
//!
//! * `elf`: views of headers and program headers.
//! * `params`: the `+zELF-PR` parameter block patched into each stub.
//! * `container`: the packed block header and the digest trailer.
//! * `codec` and `filter`: decoders and the reversible branch filters.
//! * `scan`: finding a packed block in the process's mappings.
//! * `loader`: the state machine from entry to the final jump, written
//!   against the `loader::System` trait.
//! * `stage0`: the wrapper that inflates a large stub before it runs.
//!
//! With the default `std` feature the host side is available too: the
//! encoders, `packer` and `unpack`.
//!
//! # Packing
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use elfpack::packer::{self, PackOptions, StubDir};
//!
//! let input = std::fs::read("a.out")?;
//! let packed = packer::pack(&input, &PackOptions::default(), &StubDir::from_env()?)?;
//! std::fs::write("a.out.packed", &packed.data)?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! * System V ABI, ELF-64 Object File Format.
//! * `fs/binfmt_elf.c` in Linux, for what the kernel puts on the stack.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
#[macro_use]
mod debug;
#[cfg(feature = "std")]
pub use debug::DEBUG;

pub mod le;
pub mod elf;
pub mod params;
pub mod password;
pub mod codec;
pub mod filter;
pub mod container;
pub mod scan;
pub mod loader;
pub mod stage0;

#[cfg(feature = "std")]
pub mod packer;
#[cfg(feature = "std")]
pub mod unpack;

#[cfg(test)]
mod tests;
