//! The operating system as the loader sees it.
//!
//! The stub implements `System` with raw system calls; host tests use a
//! fake address space. Addresses are plain `u64` values, and mapped memory
//! is reached through `memory` and `memory_mut` so the loader itself stays
//! free of raw pointers.

use core::fmt;

use bitflags::bitflags;

use crate::elf::{PF_R, PF_W, PF_X};

bitflags! {
    /// Page protection, with the `PROT_*` bit values.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl Prot {
    /// The protection for a segment with ELF `p_flags`.
    pub fn from_segment_flags(p_flags: u32) -> Prot {
        let mut prot = Prot::empty();
        if p_flags & PF_R != 0 {
            prot |= Prot::READ;
        }
        if p_flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if p_flags & PF_X != 0 {
            prot |= Prot::EXEC;
        }
        prot
    }
}

/// A failed system call, carrying the positive error number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

pub const EINVAL: Errno = Errno(22);
pub const ENOMEM: Errno = Errno(12);
pub const EFAULT: Errno = Errno(14);
pub const ENOENT: Errno = Errno(2);
pub const EBADF: Errno = Errno(9);
pub const ENOTTY: Errno = Errno(25);

/// What a mapping is filled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled private memory.
    Anon,
    /// A private copy of `fd` starting at `offset`.
    File { fd: i32, offset: u64 },
}

pub type SysResult<T> = Result<T, Errno>;

/// System services used by the loader.
pub trait System {
    /// Maps `len` bytes. With `fixed` the mapping lands exactly at `addr`
    /// and replaces whatever was there; otherwise `addr` is a hint.
    fn mmap(&mut self, addr: u64, len: u64, prot: Prot, fixed: bool, backing: Backing) -> SysResult<u64>;

    fn munmap(&mut self, addr: u64, len: u64) -> SysResult<()>;

    fn mprotect(&mut self, addr: u64, len: u64, prot: Prot) -> SysResult<()>;

    /// Opens a NUL-terminated path read-only.
    fn open(&mut self, path: &[u8]) -> SysResult<i32>;

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> SysResult<usize>;

    fn pread(&mut self, fd: i32, buf: &mut [u8], offset: u64) -> SysResult<usize>;

    fn write(&mut self, fd: i32, buf: &[u8]) -> SysResult<usize>;

    fn close(&mut self, fd: i32);

    /// Turns terminal echo on `fd` on or off, returning the previous
    /// setting. Fails when `fd` is not a terminal.
    fn set_echo(&mut self, fd: i32, on: bool) -> SysResult<bool>;

    /// Mapped, readable memory at `addr`.
    fn memory(&self, addr: u64, len: usize) -> SysResult<&[u8]>;

    /// Mapped, writable memory at `addr`.
    fn memory_mut(&mut self, addr: u64, len: usize) -> SysResult<&mut [u8]>;

    /// A readable and a writable range at once. The ranges must not overlap.
    fn memory_pair(&mut self, src: u64, src_len: usize, dst: u64, dst_len: usize)
        -> SysResult<(&[u8], &mut [u8])>;

    fn copy(&mut self, dst: u64, src: u64, len: usize) -> SysResult<()> {
        if len == 0 {
            return Ok(());
        }
        let (from, to) = self.memory_pair(src, len, dst, len)?;
        to.copy_from_slice(from);
        Ok(())
    }

    fn read_word(&self, addr: u64) -> SysResult<u64> {
        let bytes = self.memory(addr, 8)?;
        Ok(crate::le::read_u64(bytes, 0))
    }

    fn write_word(&mut self, addr: u64, value: u64) -> SysResult<()> {
        let bytes = self.memory_mut(addr, 8)?;
        crate::le::write_u64(bytes, 0, value);
        Ok(())
    }

    /// Reads until `buf` is full or end of file. Returns the length read.
    fn read_all(&mut self, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.read(fd, &mut buf[n..])? {
                0 => break,
                k => n += k,
            }
        }
        Ok(n)
    }
}
