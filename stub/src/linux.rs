//! `System` over raw Linux system calls.

use core::slice;

use elfpack::le::{read_u32, write_u32};
use elfpack::loader::sys::{EFAULT, EINVAL};
use elfpack::loader::{Backing, Errno, Prot, SysResult, System};

use crate::arch::*;

const MAP_PRIVATE: u64 = 0x02;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

const AT_FDCWD: i64 = -100;
const O_RDONLY: u64 = 0;
const O_CLOEXEC: u64 = 0o2000000;

const TCGETS: u64 = 0x5401;
const TCSETS: u64 = 0x5402;
/// `c_lflag` in the kernel's `struct termios`.
const LFLAG_OFFSET: usize = 12;
const ECHO: u32 = 0o10;
const TERMIOS_LEN: usize = 60;

/// The running process.
pub struct Linux;

fn check(ret: i64) -> SysResult<u64> {
    if (-4095..0).contains(&ret) {
        Err(Errno(-ret as i32))
    } else {
        Ok(ret as u64)
    }
}

fn call(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> SysResult<u64> {
    check(unsafe { syscall6(nr, a0, a1, a2, a3, a4, a5) })
}

/// Ends the process with `status`.
pub fn exit(status: i32) -> ! {
    loop {
        let _ = call(SYS_EXIT_GROUP, status as u64, 0, 0, 0, 0, 0);
    }
}

fn range_ok(addr: u64, len: usize) -> bool {
    addr != 0 && addr.checked_add(len as u64).is_some()
}

impl Linux {
    fn termios(&mut self, fd: i32, request: u64, termios: &mut [u8; TERMIOS_LEN]) -> SysResult<()> {
        call(SYS_IOCTL, fd as u64, request, termios.as_mut_ptr() as u64, 0, 0, 0).map(|_| ())
    }
}

impl System for Linux {
    fn mmap(&mut self, addr: u64, len: u64, prot: Prot, fixed: bool, backing: Backing) -> SysResult<u64> {
        let mut flags = MAP_PRIVATE;
        if fixed {
            flags |= MAP_FIXED;
        }
        let (fd, offset) = match backing {
            Backing::Anon => {
                flags |= MAP_ANONYMOUS;
                (-1i64 as u64, 0)
            }
            Backing::File { fd, offset } => (fd as u64, offset),
        };
        call(SYS_MMAP, addr, len, u64::from(prot.bits()), flags, fd, offset)
    }

    fn munmap(&mut self, addr: u64, len: u64) -> SysResult<()> {
        call(SYS_MUNMAP, addr, len, 0, 0, 0, 0).map(|_| ())
    }

    fn mprotect(&mut self, addr: u64, len: u64, prot: Prot) -> SysResult<()> {
        call(SYS_MPROTECT, addr, len, u64::from(prot.bits()), 0, 0, 0).map(|_| ())
    }

    fn open(&mut self, path: &[u8]) -> SysResult<i32> {
        if path.last() != Some(&0) {
            return Err(EINVAL);
        }
        call(SYS_OPENAT, AT_FDCWD as u64, path.as_ptr() as u64, O_RDONLY | O_CLOEXEC, 0, 0, 0)
            .map(|fd| fd as i32)
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        call(SYS_READ, fd as u64, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0).map(|n| n as usize)
    }

    fn pread(&mut self, fd: i32, buf: &mut [u8], offset: u64) -> SysResult<usize> {
        call(SYS_PREAD64, fd as u64, buf.as_mut_ptr() as u64, buf.len() as u64, offset, 0, 0)
            .map(|n| n as usize)
    }

    fn write(&mut self, fd: i32, buf: &[u8]) -> SysResult<usize> {
        call(SYS_WRITE, fd as u64, buf.as_ptr() as u64, buf.len() as u64, 0, 0, 0).map(|n| n as usize)
    }

    fn close(&mut self, fd: i32) {
        let _ = call(SYS_CLOSE, fd as u64, 0, 0, 0, 0, 0);
    }

    fn set_echo(&mut self, fd: i32, on: bool) -> SysResult<bool> {
        let mut termios = [0u8; TERMIOS_LEN];
        self.termios(fd, TCGETS, &mut termios)?;
        let lflag = read_u32(&termios, LFLAG_OFFSET);
        let was = lflag & ECHO != 0;
        write_u32(&mut termios, LFLAG_OFFSET, if on { lflag | ECHO } else { lflag & !ECHO });
        self.termios(fd, TCSETS, &mut termios)?;
        Ok(was)
    }

    fn memory(&self, addr: u64, len: usize) -> SysResult<&[u8]> {
        if !range_ok(addr, len) {
            return Err(EFAULT);
        }
        Ok(unsafe { slice::from_raw_parts(addr as *const u8, len) })
    }

    fn memory_mut(&mut self, addr: u64, len: usize) -> SysResult<&mut [u8]> {
        if !range_ok(addr, len) {
            return Err(EFAULT);
        }
        Ok(unsafe { slice::from_raw_parts_mut(addr as *mut u8, len) })
    }

    fn memory_pair(&mut self, src: u64, src_len: usize, dst: u64, dst_len: usize)
        -> SysResult<(&[u8], &mut [u8])>
    {
        if !range_ok(src, src_len) || !range_ok(dst, dst_len) {
            return Err(EFAULT);
        }
        if src < dst + dst_len as u64 && dst < src + src_len as u64 {
            return Err(EINVAL);
        }
        unsafe {
            Ok((slice::from_raw_parts(src as *const u8, src_len),
                slice::from_raw_parts_mut(dst as *mut u8, dst_len)))
        }
    }
}
