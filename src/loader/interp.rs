//! DynamicBootstrap: finding the program interpreter and mapping it.

use super::{map, Backing, Fatal, Image, Phdrs, Prot, System};
use crate::elf::{self, Arch, Header, ET_DYN, EHDR_SIZE, PT_INTERP};
use crate::le::{align_down, align_up};

pub(super) const PATH_MAX: usize = 4096;

// Read once from the front of the interpreter: header and program headers.
const HEAD_LEN: usize = 4096;

const SELF_EXE: &[u8] = b"/proc/self/exe\0";

/// The interpreter path, NUL-terminated: the image's own `PT_INTERP`, then
/// the one of the packed file on disk, then the architecture default.
pub(super) fn path<'b, S: System>(sys: &mut S, image: &Image, arch: Arch, buf: &'b mut [u8; PATH_MAX])
    -> Result<&'b [u8], Fatal>
{
    let from_image = {
        let bytes = image.bytes(sys)?;
        image.phdrs.find(PT_INTERP).and_then(|ph| copy_path(bytes, ph.p_offset, ph.p_filesz, buf))
    };
    if let Some(len) = from_image {
        return Ok(&buf[..len]);
    }
    if let Some(len) = self_exe_interp(sys, buf) {
        return Ok(&buf[..len]);
    }
    let default = arch.default_interp();
    buf[..default.len()].copy_from_slice(default);
    Ok(&buf[..default.len()])
}

/// Copies a NUL-terminated string at `offset` in `bytes` into `buf`.
/// Returns the length including the NUL.
fn copy_path(bytes: &[u8], offset: u64, len: u64, buf: &mut [u8; PATH_MAX]) -> Option<usize> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    let s = bytes.get(start..end)?;
    let nul = s.iter().position(|&b| b == 0)?;
    if nul == 0 || nul >= PATH_MAX {
        return None;
    }
    buf[..=nul].copy_from_slice(&s[..=nul]);
    Some(nul + 1)
}

fn self_exe_interp<S: System>(sys: &mut S, buf: &mut [u8; PATH_MAX]) -> Option<usize> {
    let fd = sys.open(SELF_EXE).ok()?;
    let found = read_interp(sys, fd, buf);
    sys.close(fd);
    found
}

fn read_interp<S: System>(sys: &mut S, fd: i32, buf: &mut [u8; PATH_MAX]) -> Option<usize> {
    let mut head = [0u8; HEAD_LEN];
    let n = sys.pread(fd, &mut head, 0).ok()?;
    let header = Header::parse(&head[..n]).ok()?;
    let phdrs = Phdrs::read(&head[..n], &header)?;
    let ph = phdrs.find(PT_INTERP)?;
    let len = usize::try_from(ph.p_filesz).ok()?.min(PATH_MAX);
    let mut path = [0u8; PATH_MAX];
    let got = sys.pread(fd, &mut path[..len], ph.p_offset).ok()?;
    copy_path(&path[..got], 0, got as u64, buf)
}

/// Maps the interpreter at `path`. Returns its load bias and entry point.
pub(super) fn load<S: System>(sys: &mut S, path: &[u8], arch: Arch, page: u64) -> Result<(u64, u64), Fatal> {
    let fd = sys.open(path).map_err(|_| Fatal::Interpreter)?;
    let loaded = map_interp(sys, fd, arch, page);
    sys.close(fd);
    loaded
}

fn map_interp<S: System>(sys: &mut S, fd: i32, arch: Arch, page: u64) -> Result<(u64, u64), Fatal> {
    let mut head = [0u8; HEAD_LEN];
    let n = sys.pread(fd, &mut head, 0).map_err(|_| Fatal::Interpreter)?;
    if n < EHDR_SIZE {
        return Err(Fatal::Interpreter);
    }
    let header = Header::parse(&head[..n]).map_err(|_| Fatal::Interpreter)?;
    if header.validate().ok() != Some(arch) || header.e_type != ET_DYN {
        return Err(Fatal::Interpreter);
    }
    if usize::from(header.e_phentsize) != elf::PHDR_SIZE {
        return Err(Fatal::Interpreter);
    }
    let phdrs = Phdrs::read(&head[..n], &header).ok_or(Fatal::Interpreter)?;

    let bias = map::reserve(sys, &phdrs, page).map_err(|_| Fatal::Interpreter)?;
    for ph in phdrs.loads().filter(|ph| ph.p_memsz > 0) {
        let start = bias.wrapping_add(ph.p_vaddr);
        let first = align_down(start, page);
        let lead = start - first;
        if ph.p_offset < lead {
            return Err(Fatal::Interpreter);
        }
        let file_end = start + ph.p_filesz;
        let mem_end = align_up(start + ph.p_memsz, page);

        let mut mapped = first;
        if ph.p_filesz > 0 {
            let file_pages = align_up(file_end, page);
            let backing = Backing::File { fd, offset: ph.p_offset - lead };
            sys.mmap(first, file_pages - first, Prot::READ | Prot::WRITE, true, backing)
                .map_err(|_| Fatal::Interpreter)?;
            // The rest of the last file page belongs to bss.
            let tail = (file_pages - file_end) as usize;
            if tail > 0 && ph.p_memsz > ph.p_filesz {
                zero(sys, file_end, tail)?;
            }
            mapped = file_pages;
        }
        if mem_end > mapped {
            sys.mmap(mapped, mem_end - mapped, Prot::READ | Prot::WRITE, true, Backing::Anon)
                .map_err(|_| Fatal::Interpreter)?;
        }
        sys.mprotect(first, mem_end - first, Prot::from_segment_flags(ph.p_flags))
            .map_err(|_| Fatal::Interpreter)?;
    }
    Ok((bias, bias.wrapping_add(header.e_entry)))
}

fn zero<S: System>(sys: &mut S, addr: u64, len: usize) -> Result<(), Fatal> {
    for b in sys.memory_mut(addr, len).map_err(|_| Fatal::Interpreter)? {
        *b = 0;
    }
    Ok(())
}
