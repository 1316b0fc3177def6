//! ReserveAddressSpace and MapSegments.

use super::{Backing, Errno, Fatal, Image, Phdrs, Prot, System};
use crate::elf::{Arch, ProgramHeader, PF_X, PT_PHDR};
use crate::le::{align_down, align_up};

// Alignments above this are treated as this when reserving.
const MAX_ALIGN: u64 = 1 << 21;

/// The page-rounded span of the loadable segments and the largest
/// alignment among them.
fn hull(phdrs: &Phdrs, page: u64) -> Option<(u64, u64, u64)> {
    let mut lo = u64::MAX;
    let mut hi = 0;
    let mut align = page;
    for ph in phdrs.loads() {
        lo = lo.min(align_down(ph.p_vaddr, page));
        hi = hi.max(align_up(ph.vaddr_end(), page));
        if ph.p_align.is_power_of_two() {
            align = align.max(ph.p_align.min(MAX_ALIGN));
        }
    }
    if lo >= hi {
        None
    } else {
        Some((lo, hi, align))
    }
}

/// Reserves an inaccessible mapping covering every loadable segment, aligned
/// for the most aligned one, and returns the load bias.
pub(super) fn reserve<S: System>(sys: &mut S, phdrs: &Phdrs, page: u64) -> Result<u64, Errno> {
    let (lo, hi, align) = hull(phdrs, page).ok_or(super::sys::EINVAL)?;
    let span = hi - lo;
    let total = span + align;
    let addr = sys.mmap(0, total, Prot::empty(), false, Backing::Anon)?;
    let start = align_up(addr, align);
    if start > addr {
        sys.munmap(addr, start - addr)?;
    }
    let tail = start + span;
    if addr + total > tail {
        sys.munmap(tail, addr + total - tail)?;
    }
    Ok(start.wrapping_sub(lo))
}

/// Page range of a segment at `bias`.
fn pages(ph: &ProgramHeader, bias: u64, page: u64) -> (u64, u64) {
    let start = bias.wrapping_add(ph.p_vaddr);
    (align_down(start, page), align_up(start + ph.p_memsz, page))
}

/// Maps every loadable segment writable and copies its file bytes out of
/// the image. `protect` applies the real permissions afterwards.
///
/// Returns the hatch page, created while mapping the first executable
/// segment.
pub(super) fn map_segments<S: System>(sys: &mut S, image: &Image, bias: u64, page: u64, arch: Arch)
    -> Result<Option<u64>, Fatal>
{
    let mut hatch = None;
    for ph in image.phdrs.loads().filter(|ph| ph.p_memsz > 0) {
        let start = bias.wrapping_add(ph.p_vaddr);
        let (first, end) = pages(ph, bias, page);
        sys.mmap(first, end - first, Prot::READ | Prot::WRITE, true, Backing::Anon)
            .map_err(|_| Fatal::Mapping)?;

        // Like a file mapping, the first page also gets the file bytes that
        // precede the segment.
        let lead = start - first;
        let (from, to, len) = if ph.p_offset >= lead {
            (ph.p_offset - lead, first, ph.p_filesz + lead)
        } else {
            (ph.p_offset, start, ph.p_filesz)
        };
        if from.saturating_add(len) > image.len as u64 {
            return Err(Fatal::Mapping);
        }
        sys.copy(to, image.addr + from, len as usize).map_err(|_| Fatal::Mapping)?;

        if hatch.is_none() && ph.p_flags & PF_X != 0 {
            hatch = Some(make_hatch(sys, arch, page)?);
        }
    }
    Ok(hatch)
}

/// Drops each segment to its own protection.
pub(super) fn protect<S: System>(sys: &mut S, phdrs: &Phdrs, bias: u64, page: u64) -> Result<(), Fatal> {
    for ph in phdrs.loads().filter(|ph| ph.p_memsz > 0) {
        let (first, end) = pages(ph, bias, page);
        sys.mprotect(first, end - first, Prot::from_segment_flags(ph.p_flags))
            .map_err(|_| Fatal::Mapping)?;
    }
    Ok(())
}

fn make_hatch<S: System>(sys: &mut S, arch: Arch, page: u64) -> Result<u64, Fatal> {
    let code = arch.hatch_code();
    let addr = sys.mmap(0, page, Prot::READ | Prot::WRITE, false, Backing::Anon)
        .map_err(|_| Fatal::MissingHatch)?;
    sys.memory_mut(addr, code.len()).map_err(|_| Fatal::MissingHatch)?.copy_from_slice(code);
    sys.mprotect(addr, page, Prot::READ | Prot::EXEC).map_err(|_| Fatal::MissingHatch)?;
    Ok(addr)
}

/// The runtime address of the program header table, for `AT_PHDR`.
///
/// Uses `PT_PHDR` or a segment that maps the table. Failing both, the ELF
/// header and table get a read-only page of their own, placed where file
/// offset 0 would be if that spot is free.
pub(super) fn phdr_address<S: System>(sys: &mut S, image: &Image, bias: u64, page: u64) -> Result<u64, Fatal> {
    let header = &image.header;
    if let Some(ph) = image.phdrs.find(PT_PHDR) {
        return Ok(bias.wrapping_add(ph.p_vaddr));
    }
    let table_start = header.e_phoff;
    let table_end = header.phdr_table_end();
    for ph in image.phdrs.loads() {
        if table_start >= ph.p_offset && table_end <= ph.file_end() {
            return Ok(bias.wrapping_add(ph.p_vaddr) + (table_start - ph.p_offset));
        }
    }

    if table_end > page || table_end > image.len as u64 {
        return Err(Fatal::Mapping);
    }
    let wanted = image.phdrs.loads()
        .map(|ph| bias.wrapping_add(ph.p_vaddr).wrapping_sub(ph.p_offset))
        .min()
        .map(|addr| align_down(addr, page));
    let free = |addr: u64| image.phdrs.loads().all(|ph| {
        let (first, end) = pages(ph, bias, page);
        addr + page <= first || addr >= end
    });
    let addr = match wanted {
        Some(addr) if addr != 0 && free(addr) =>
            sys.mmap(addr, page, Prot::READ | Prot::WRITE, true, Backing::Anon),
        _ => sys.mmap(0, page, Prot::READ | Prot::WRITE, false, Backing::Anon),
    }.map_err(|_| Fatal::Mapping)?;
    sys.copy(addr, image.addr, table_end as usize).map_err(|_| Fatal::Mapping)?;
    sys.mprotect(addr, page, Prot::READ).map_err(|_| Fatal::Mapping)?;
    Ok(addr + table_start)
}
