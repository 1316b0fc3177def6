use core::arch::{asm, global_asm};

use elfpack::elf::Arch;
use elfpack::loader::{Fatal, Handoff};

pub const ARCH: Arch = Arch::X86_64;

pub const SYS_READ: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_CLOSE: u64 = 3;
pub const SYS_MMAP: u64 = 9;
pub const SYS_MPROTECT: u64 = 10;
pub const SYS_MUNMAP: u64 = 11;
pub const SYS_IOCTL: u64 = 16;
pub const SYS_PREAD64: u64 = 17;
pub const SYS_EXIT_GROUP: u64 = 231;
pub const SYS_OPENAT: u64 = 257;

global_asm!(
    ".section .text.entry,\"ax\"",
    ".globl _start",
    "_start:",
    "mov rdi, rsp",
    "lea rsi, [rip + _start]",
    "and rsp, -16",
    "call stub_main",
    "mov edi, {returned}",
    "mov eax, {exit}",
    "syscall",
    "ud2",
    returned = const Fatal::Returned as u8,
    exit = const SYS_EXIT_GROUP,
);

#[inline]
pub unsafe fn syscall6(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let ret: i64;
    asm!(
        "syscall",
        inlateout("rax") nr as i64 => ret,
        in("rdi") a0,
        in("rsi") a1,
        in("rdx") a2,
        in("r10") a3,
        in("r8") a4,
        in("r9") a5,
        out("rcx") _,
        out("r11") _,
        options(nostack),
    );
    ret
}

/// Starts the program described by `handoff` on the original stack.
///
/// With an unmap the stub returns into the hatch, which unmaps the stub,
/// zeroes the registers the system call used, pops `rdx` (zero, no exit
/// handler), and returns to the entry point.
pub unsafe fn transfer(handoff: &Handoff) -> ! {
    match (handoff.hatch, handoff.unmap) {
        (Some(hatch), Some(unmap)) =>
            jump(handoff.sp, handoff.entry, hatch, SYS_MUNMAP, unmap.start, unmap.len()),
        _ => jump(handoff.sp, handoff.entry, 0, 0, 0, 0),
    }
}

/// Enters an inflated stub at `entry` with `origin` in `rdx`.
pub unsafe fn enter_stub(sp: u64, entry: u64, origin: u64) -> ! {
    asm!(
        "mov rsp, {sp}",
        "jmp {entry}",
        sp = in(reg) sp,
        entry = in(reg) entry,
        in("rdx") origin,
        options(noreturn),
    )
}

unsafe fn jump(sp: u64, entry: u64, hatch: u64, nr: u64, a0: u64, a1: u64) -> ! {
    asm!(
        "mov rsp, {sp}",
        "push {entry}",
        "test {hatch}, {hatch}",
        "jz 2f",
        "push 0",
        "push {hatch}",
        "2:",
        "xor ebx, ebx",
        "xor ecx, ecx",
        "xor edx, edx",
        "xor ebp, ebp",
        "xor r8d, r8d",
        "xor r9d, r9d",
        "xor r10d, r10d",
        "xor r11d, r11d",
        "xor r12d, r12d",
        "xor r13d, r13d",
        "xor r14d, r14d",
        "xor r15d, r15d",
        "ret",
        sp = in(reg) sp,
        entry = in(reg) entry,
        hatch = in(reg) hatch,
        in("rax") nr,
        in("rdi") a0,
        in("rsi") a1,
        options(noreturn),
    )
}
