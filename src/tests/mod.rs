use std::collections::HashMap;
use std::env;
use std::fs;
use std::path;

mod pack;

use crate::codec::CodecId;
use crate::elf::{Arch, Header, ProgramHeader, EHDR_SIZE, PHDR_SIZE, PT_LOAD};
use crate::loader::sys::{self, Backing, Errno, Prot, SysResult, System};
use crate::loader::Linkage;
use crate::packer::{self, PackError, StubKey, StubSource};
use crate::params::{Flags, ParameterBlock, PasswordCheck, Version};
use crate::stage0;

/// One program header for `minimal_elf`.
#[derive(Clone, Copy, Debug)]
pub struct PhdrSpec {
    pub p_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: u32,
    pub align: u64,
}

impl PhdrSpec {
    pub fn load(offset: u64, vaddr: u64, filesz: u64, memsz: u64, flags: u32) -> Self {
        PhdrSpec { p_type: PT_LOAD, offset, vaddr, filesz, memsz, flags, align: 0x1000 }
    }
}

/// A `len`-byte ELF file with the header and program headers filled in and
/// the rest zeroed.
pub fn minimal_elf(arch: Arch, e_type: u16, entry: u64, phdrs: &[PhdrSpec], len: usize) -> Vec<u8> {
    let mut image = vec![0u8; len.max(EHDR_SIZE + phdrs.len() * PHDR_SIZE)];
    Header::new(arch, e_type, entry, phdrs.len() as u16).write(&mut image);
    for (i, spec) in phdrs.iter().enumerate() {
        let ph = ProgramHeader {
            p_type: spec.p_type,
            p_flags: spec.flags,
            p_offset: spec.offset,
            p_vaddr: spec.vaddr,
            p_paddr: spec.vaddr,
            p_filesz: spec.filesz,
            p_memsz: spec.memsz,
            p_align: spec.align,
        };
        let at = EHDR_SIZE + i * PHDR_SIZE;
        ph.write(&mut image[at..at + PHDR_SIZE]);
    }
    image
}

/// Bytes that compress about as well as machine code: a few repeating
/// instruction-like patterns with varying operands.
pub fn code_like(len: usize, seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    while out.len() < len {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        match x % 4 {
            0 => out.extend_from_slice(&[0x48, 0x89, 0xe5]),
            1 => out.extend_from_slice(&[0xe8, (x >> 8) as u8, (x >> 16) as u8 & 0x0f, 0, 0]),
            2 => out.extend_from_slice(&[0x48, 0x8b, 0x45, (x >> 8) as u8 & 0xf8]),
            _ => out.extend_from_slice(&[0xc3, 0x90, 0x90]),
        }
    }
    out.truncate(len);
    out
}

// call fs::write if the environment variable ELFPACK_TEST_SAVE is set.
pub fn maybe_save<P: AsRef<path::Path>>(path: P, data: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("ELFPACK_TEST_SAVE").is_some() {
        fs::write(path, data)?;
    }
    Ok(())
}

/// A loader stub: `code` bytes of filler with a parameter block template,
/// then zeros up to `len`.
pub fn fake_loader(version: Version, code: usize, len: usize) -> Vec<u8> {
    let mut stub = code_like(code, version as u32);
    stub.resize(len, 0);
    let password = match version {
        Version::Plain => None,
        Version::Password => Some(PasswordCheck { salt: 0, obfuscated_hash: 0 }),
    };
    ParameterBlock { version, flags: Flags::empty(), virtual_start: 0, packed_data_vaddr: 0, password }
        .write(&mut stub[0x40..]);
    stub
}

/// Stage-0 code with an empty `+zELF-S0` block.
pub fn fake_stage0() -> Vec<u8> {
    let mut code = vec![0x90; 0x80];
    stage0::Params { unpacked_len: 0, packed_len: 0, data_offset: 0 }.write(&mut code[0x40..]);
    code
}

/// Stub binaries held in memory by file name.
#[derive(Default)]
pub struct MemoryStubs {
    pub files: HashMap<String, Vec<u8>>,
}

impl MemoryStubs {
    /// Every loader variant, `len` bytes long, and stage-0 for both
    /// architectures.
    pub fn all(len: usize) -> Self {
        let mut stubs = MemoryStubs::default();
        for &arch in &[Arch::X86_64, Arch::Aarch64] {
            for &linkage in &[Linkage::Static, Linkage::Dynamic] {
                for &codec in &CodecId::ALL {
                    for &password in &[false, true] {
                        let key = StubKey { arch, linkage, codec, password };
                        let version = if password { Version::Password } else { Version::Plain };
                        stubs.files.insert(key.file_name(), fake_loader(version, 0x400.min(len - 0x80), len));
                    }
                }
            }
            stubs.files.insert(packer::stage0_file_name(arch), fake_stage0());
        }
        stubs
    }
}

impl StubSource for MemoryStubs {
    fn loader(&self, key: &StubKey) -> Result<Vec<u8>, PackError> {
        let name = key.file_name();
        self.files.get(&name).cloned().ok_or(PackError::MissingStub { name })
    }

    fn stage0(&self, arch: Arch) -> Result<Option<Vec<u8>>, PackError> {
        Ok(self.files.get(&packer::stage0_file_name(arch)).cloned())
    }
}

pub const PAGE: u64 = 0x1000;
/// Size of the fake address space, which starts at address 0.
pub const ARENA_LEN: u64 = 128 << 20;
/// Where non-fixed mappings start looking for room.
pub const MMAP_BASE: u64 = 0x0100_0000;
/// The stack occupies the top of the arena.
pub const STACK_TOP: u64 = ARENA_LEN;
const STACK_LEN: u64 = 0x10000;

struct OpenFile {
    data: Vec<u8>,
    pos: usize,
    terminal: bool,
}

/// An address space and file table for running the loader on the host.
///
/// Memory is one flat zeroed buffer with a protection per page; `None`
/// means unmapped. A file-backed mapping copies the file's bytes. File
/// descriptor 0 reads `stdin`; `/dev/tty` exists only when `terminal` is
/// set, and only it supports echo control.
pub struct FakeSystem {
    mem: Vec<u8>,
    prot: Vec<Option<Prot>>,
    files: HashMap<Vec<u8>, Vec<u8>>,
    fds: HashMap<i32, OpenFile>,
    next_fd: i32,
    pub stdin: Vec<u8>,
    stdin_pos: usize,
    pub terminal: Option<Vec<u8>>,
    pub echo: bool,
    pub stderr: Vec<u8>,
    pub opened: Vec<Vec<u8>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        FakeSystem {
            mem: vec![0; ARENA_LEN as usize],
            prot: vec![None; (ARENA_LEN / PAGE) as usize],
            files: HashMap::new(),
            fds: HashMap::new(),
            next_fd: 3,
            stdin: Vec::new(),
            stdin_pos: 0,
            terminal: None,
            echo: true,
            stderr: Vec::new(),
            opened: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.as_bytes().to_vec(), data);
    }

    /// Maps `bytes` at `addr` with `prot`, as the kernel maps a file.
    pub fn map_bytes(&mut self, addr: u64, bytes: &[u8], prot: Prot) {
        let len = crate::le::align_up(bytes.len() as u64, PAGE);
        self.mmap(addr, len, Prot::READ | Prot::WRITE, true, Backing::Anon).unwrap();
        self.mem[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
        self.mprotect(addr, len, prot).unwrap();
    }

    pub fn prot_at(&self, addr: u64) -> Option<Prot> {
        self.prot.get((addr / PAGE) as usize).copied().flatten()
    }

    /// Raw bytes, ignoring protection.
    pub fn peek(&self, addr: u64, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }

    /// Builds an entry stack frame at the top of the arena and returns the
    /// stack pointer.
    pub fn push_stack(&mut self, args: &[&str], env: &[&str], auxv: &[(u64, u64)]) -> u64 {
        let base = STACK_TOP - STACK_LEN;
        self.mmap(base, STACK_LEN, Prot::READ | Prot::WRITE, true, Backing::Anon).unwrap();

        // Strings go at the top, the pointer block below them.
        let mut strings = STACK_TOP;
        let mut place = |mem: &mut Vec<u8>, s: &str| {
            strings -= s.len() as u64 + 1;
            let at = strings as usize;
            mem[at..at + s.len()].copy_from_slice(s.as_bytes());
            mem[at + s.len()] = 0;
            strings
        };
        let argv: Vec<u64> = args.iter().map(|s| place(&mut self.mem, s)).collect();
        let envp: Vec<u64> = env.iter().map(|s| place(&mut self.mem, s)).collect();

        let mut words = vec![argv.len() as u64];
        words.extend(&argv);
        words.push(0);
        words.extend(&envp);
        words.push(0);
        for &(tag, value) in auxv {
            words.push(tag);
            words.push(value);
        }
        words.extend(&[0, 0]);

        let sp = (strings - words.len() as u64 * 8) & !15;
        for (i, &w) in words.iter().enumerate() {
            self.write_word(sp + i as u64 * 8, w).unwrap();
        }
        sp
    }

    /// The auxiliary vector of the frame at `sp`, without the terminator.
    pub fn auxv(&self, sp: u64) -> Vec<(u64, u64)> {
        let argc = self.read_word(sp).unwrap();
        let mut p = sp + 8 * (argc + 2);
        while self.read_word(p).unwrap() != 0 {
            p += 8;
        }
        p += 8;
        let mut out = Vec::new();
        loop {
            let tag = self.read_word(p).unwrap();
            if tag == 0 {
                return out;
            }
            out.push((tag, self.read_word(p + 8).unwrap()));
            p += 16;
        }
    }

    /// The value slot of the `AT_NULL` entry at `sp`.
    pub fn auxv_terminator(&self, sp: u64) -> u64 {
        let argc = self.read_word(sp).unwrap();
        let mut p = sp + 8 * (argc + 2);
        while self.read_word(p).unwrap() != 0 {
            p += 8;
        }
        p += 8;
        while self.read_word(p).unwrap() != 0 {
            p += 16;
        }
        self.read_word(p + 8).unwrap()
    }

    /// The current mappings in `/proc/self/maps` format.
    pub fn render_maps(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.prot.len() {
            let prot = match self.prot[i] {
                Some(prot) => prot,
                None => {
                    i += 1;
                    continue;
                }
            };
            let start = i;
            while i < self.prot.len() && self.prot[i] == Some(prot) {
                i += 1;
            }
            let perm = |p: Prot, c: char| if prot.contains(p) { c } else { '-' };
            out.extend_from_slice(format!("{:08x}-{:08x} {}{}{}p 00000000 00:00 0\n",
                start as u64 * PAGE, i as u64 * PAGE,
                perm(Prot::READ, 'r'), perm(Prot::WRITE, 'w'), perm(Prot::EXEC, 'x')).as_bytes());
        }
        out
    }

    fn pages(&self, addr: u64, len: u64) -> SysResult<core::ops::Range<usize>> {
        if addr % PAGE != 0 || len == 0 {
            return Err(sys::EINVAL);
        }
        let end = addr.checked_add(len).ok_or(sys::ENOMEM)?;
        if end > ARENA_LEN {
            return Err(sys::ENOMEM);
        }
        Ok((addr / PAGE) as usize..crate::le::align_up(end, PAGE) as usize / PAGE as usize)
    }

    fn check(&self, addr: u64, len: usize, need: Prot) -> SysResult<core::ops::Range<usize>> {
        let end = addr.checked_add(len as u64).ok_or(sys::EFAULT)?;
        if end > ARENA_LEN {
            return Err(sys::EFAULT);
        }
        let first = (addr / PAGE) as usize;
        let last = crate::le::align_up(end, PAGE) as usize / PAGE as usize;
        for page in first..last.max(first + 1) {
            match self.prot[page] {
                Some(prot) if prot.contains(need) => (),
                _ => return Err(sys::EFAULT),
            }
        }
        Ok(addr as usize..end as usize)
    }
}

impl System for FakeSystem {
    fn mmap(&mut self, addr: u64, len: u64, prot: Prot, fixed: bool, backing: Backing) -> SysResult<u64> {
        let len = crate::le::align_up(len, PAGE);
        let start = if fixed {
            self.pages(addr, len)?;
            addr
        } else {
            let count = (len / PAGE) as usize;
            let mut page = (MMAP_BASE / PAGE) as usize;
            loop {
                if page + count > self.prot.len() {
                    return Err(sys::ENOMEM);
                }
                match self.prot[page..page + count].iter().rposition(|p| p.is_some()) {
                    Some(used) => page += used + 1,
                    None => break,
                }
            }
            page as u64 * PAGE
        };
        let range = self.pages(start, len)?;
        let bytes = start as usize..(start + len) as usize;
        for b in &mut self.mem[bytes.clone()] {
            *b = 0;
        }
        if let Backing::File { fd, offset } = backing {
            let file = self.fds.get(&fd).ok_or(sys::EBADF)?;
            let from = (offset as usize).min(file.data.len());
            let n = (file.data.len() - from).min(len as usize);
            self.mem[bytes.start..bytes.start + n].copy_from_slice(&file.data[from..from + n]);
        }
        for p in &mut self.prot[range] {
            *p = Some(prot);
        }
        Ok(start)
    }

    fn munmap(&mut self, addr: u64, len: u64) -> SysResult<()> {
        let range = self.pages(addr, len)?;
        for p in &mut self.prot[range] {
            *p = None;
        }
        Ok(())
    }

    fn mprotect(&mut self, addr: u64, len: u64, prot: Prot) -> SysResult<()> {
        let range = self.pages(addr, len)?;
        if self.prot[range.clone()].iter().any(|p| p.is_none()) {
            return Err(sys::ENOMEM);
        }
        for p in &mut self.prot[range] {
            *p = Some(prot);
        }
        Ok(())
    }

    fn open(&mut self, path: &[u8]) -> SysResult<i32> {
        let path = match path.split_last() {
            Some((&0, path)) => path,
            _ => return Err(sys::EINVAL),
        };
        self.opened.push(path.to_vec());
        let file = if path == b"/dev/tty" {
            let input = self.terminal.clone().ok_or(Errno(6))?;
            OpenFile { data: input, pos: 0, terminal: true }
        } else {
            let data = self.files.get(path).cloned().ok_or(sys::ENOENT)?;
            OpenFile { data, pos: 0, terminal: false }
        };
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, file);
        Ok(fd)
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        if fd == 0 {
            let n = (self.stdin.len() - self.stdin_pos).min(buf.len());
            buf[..n].copy_from_slice(&self.stdin[self.stdin_pos..self.stdin_pos + n]);
            self.stdin_pos += n;
            return Ok(n);
        }
        let file = self.fds.get_mut(&fd).ok_or(sys::EBADF)?;
        let mut n = (file.data.len() - file.pos).min(buf.len());
        if file.terminal {
            // A terminal read returns one line at a time.
            if let Some(nl) = file.data[file.pos..file.pos + n].iter().position(|&b| b == b'\n') {
                n = nl + 1;
            }
        }
        buf[..n].copy_from_slice(&file.data[file.pos..file.pos + n]);
        file.pos += n;
        Ok(n)
    }

    fn pread(&mut self, fd: i32, buf: &mut [u8], offset: u64) -> SysResult<usize> {
        let file = self.fds.get(&fd).ok_or(sys::EBADF)?;
        let from = (offset as usize).min(file.data.len());
        let n = (file.data.len() - from).min(buf.len());
        buf[..n].copy_from_slice(&file.data[from..from + n]);
        Ok(n)
    }

    fn write(&mut self, fd: i32, buf: &[u8]) -> SysResult<usize> {
        match fd {
            1 | 2 => {
                self.stderr.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(sys::EBADF),
        }
    }

    fn close(&mut self, fd: i32) {
        self.fds.remove(&fd);
    }

    fn set_echo(&mut self, fd: i32, on: bool) -> SysResult<bool> {
        match self.fds.get(&fd) {
            Some(file) if file.terminal => {
                let previous = self.echo;
                self.echo = on;
                Ok(previous)
            }
            _ => Err(sys::ENOTTY),
        }
    }

    fn memory(&self, addr: u64, len: usize) -> SysResult<&[u8]> {
        let range = self.check(addr, len, Prot::READ)?;
        Ok(&self.mem[range])
    }

    fn memory_mut(&mut self, addr: u64, len: usize) -> SysResult<&mut [u8]> {
        let range = self.check(addr, len, Prot::WRITE)?;
        Ok(&mut self.mem[range])
    }

    fn memory_pair(&mut self, src: u64, src_len: usize, dst: u64, dst_len: usize)
        -> SysResult<(&[u8], &mut [u8])>
    {
        let src = self.check(src, src_len, Prot::READ)?;
        let dst = self.check(dst, dst_len, Prot::WRITE)?;
        if src.start < dst.end && dst.start < src.end {
            return Err(sys::EINVAL);
        }
        if src.start < dst.start {
            let (low, high) = self.mem.split_at_mut(dst.start);
            Ok((&low[src], &mut high[..dst.end - dst.start]))
        } else {
            let (low, high) = self.mem.split_at_mut(src.start);
            Ok((&high[..src.end - src.start], &mut low[dst]))
        }
    }
}

#[test]
fn test_fake_system() {
    let mut sys = FakeSystem::new();
    let a = sys.mmap(0, 0x1800, Prot::READ | Prot::WRITE, false, Backing::Anon).unwrap();
    assert_eq!(a, MMAP_BASE);
    let b = sys.mmap(0, 0x1000, Prot::READ, false, Backing::Anon).unwrap();
    assert_eq!(b, MMAP_BASE + 0x2000);
    sys.write_word(a + 8, 0x1122).unwrap();
    assert_eq!(sys.read_word(a + 8), Ok(0x1122));
    assert_eq!(sys.write_word(b, 1), Err(sys::EFAULT));
    sys.copy(a + 0x1000, a + 8, 8).unwrap();
    assert_eq!(sys.read_word(a + 0x1000), Ok(0x1122));
    sys.munmap(a, 0x2000).unwrap();
    assert_eq!(sys.read_word(a), Err(sys::EFAULT));
    assert_eq!(sys.mprotect(a, 0x1000, Prot::READ), Err(sys::ENOMEM));

    let sp = sys.push_stack(&["prog", "x"], &["HOME=/"], &[(3, 0x400040), (9, 0x401000)]);
    assert_eq!(sys.auxv(sp), vec![(3, 0x400040), (9, 0x401000)]);
    let maps = sys.render_maps();
    assert!(std::str::from_utf8(&maps).unwrap().contains("01002000-01003000 r--p"));
}
