use core::arch::{asm, global_asm};

use elfpack::elf::Arch;
use elfpack::loader::{Fatal, Handoff};

pub const ARCH: Arch = Arch::Aarch64;

pub const SYS_IOCTL: u64 = 29;
pub const SYS_OPENAT: u64 = 56;
pub const SYS_CLOSE: u64 = 57;
pub const SYS_READ: u64 = 63;
pub const SYS_WRITE: u64 = 64;
pub const SYS_PREAD64: u64 = 67;
pub const SYS_EXIT_GROUP: u64 = 94;
pub const SYS_MUNMAP: u64 = 215;
pub const SYS_MMAP: u64 = 222;
pub const SYS_MPROTECT: u64 = 226;

global_asm!(
    ".section .text.entry,\"ax\"",
    ".globl _start",
    "_start:",
    "mov x0, sp",
    "adr x1, _start",
    "bl stub_main",
    "mov x0, #{returned}",
    "mov x8, #{exit}",
    "svc #0",
    "brk #0",
    returned = const Fatal::Returned as u8,
    exit = const SYS_EXIT_GROUP,
);

#[inline]
pub unsafe fn syscall6(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let ret: i64;
    asm!(
        "svc #0",
        in("x8") nr,
        inlateout("x0") a0 as i64 => ret,
        in("x1") a1,
        in("x2") a2,
        in("x3") a3,
        in("x4") a4,
        in("x5") a5,
        options(nostack),
    );
    ret
}

/// Starts the program described by `handoff` on the original stack.
///
/// With an unmap the stub branches to the hatch with the entry point in
/// the link register, so the hatch's `ret` lands there.
pub unsafe fn transfer(handoff: &Handoff) -> ! {
    match (handoff.hatch, handoff.unmap) {
        (Some(hatch), Some(unmap)) =>
            jump(handoff.sp, hatch, handoff.entry, SYS_MUNMAP, unmap.start, unmap.len()),
        _ => jump(handoff.sp, handoff.entry, 0, 0, 0, 0),
    }
}

/// Enters an inflated stub at `entry` with `origin` in `x2`.
pub unsafe fn enter_stub(sp: u64, entry: u64, origin: u64) -> ! {
    asm!(
        "mov sp, {sp}",
        "br {entry}",
        sp = in(reg) sp,
        entry = in(reg) entry,
        in("x2") origin,
        options(noreturn),
    )
}

unsafe fn jump(sp: u64, target: u64, lr: u64, nr: u64, a0: u64, a1: u64) -> ! {
    asm!(
        "mov sp, {sp}",
        "mov x2, xzr",
        "mov x3, xzr",
        "mov x4, xzr",
        "mov x5, xzr",
        "mov x6, xzr",
        "mov x7, xzr",
        "mov x9, xzr",
        "mov x10, xzr",
        "mov x11, xzr",
        "mov x12, xzr",
        "mov x13, xzr",
        "mov x14, xzr",
        "mov x15, xzr",
        "mov x17, xzr",
        "mov x18, xzr",
        "mov x19, xzr",
        "mov x20, xzr",
        "mov x21, xzr",
        "mov x22, xzr",
        "mov x23, xzr",
        "mov x24, xzr",
        "mov x25, xzr",
        "mov x26, xzr",
        "mov x27, xzr",
        "mov x28, xzr",
        "mov x29, xzr",
        "br x16",
        sp = in(reg) sp,
        in("x0") a0,
        in("x1") a1,
        in("x8") nr,
        in("x16") target,
        in("x30") lr,
        options(noreturn),
    )
}
