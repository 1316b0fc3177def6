//! Super-strip: cut an ELF file down to the bytes its segments use.
//!
//! The result ends at the last byte any program header refers to, minus
//! trailing zeros, which the loader recreates as bss. Section headers past
//! the new end are dropped and program headers are clamped to it.

use crate::elf::{Elf, FormatError, PHDR_SIZE, PT_INTERP, PT_NULL};

/// Returns the stripped copy of `input`.
pub fn super_strip(input: &[u8]) -> Result<Vec<u8>, FormatError> {
    let elf = Elf::parse(input)?;
    elf.check_segments()?;
    let mut header = *elf.header();
    let phdrs: Vec<_> = elf.program_headers().collect();

    let len = input.len() as u64;
    let table_end = header.phdr_table_end();
    let mut keep = table_end.max(u64::from(header.e_ehsize));
    // The interpreter string must keep its NUL.
    if let Some(interp) = phdrs.iter().find(|ph| ph.p_type == PT_INTERP) {
        keep = keep.max(interp.file_end());
    }
    let used = phdrs.iter()
        .filter(|ph| ph.p_type != PT_NULL)
        .map(|ph| ph.file_end())
        .fold(keep, u64::max)
        .min(len);

    let mut end = used;
    while end > keep && input[end as usize - 1] == 0 {
        end -= 1;
    }
    let end = end.max(keep.min(len));
    debug!("strip: {} -> {} bytes ({} referenced)", len, end, used);

    let mut out = input[..end as usize].to_vec();
    if header.e_shoff >= end {
        header.e_shoff = 0;
        header.e_shnum = 0;
        header.e_shstrndx = 0;
    }
    header.write(&mut out);
    for (i, ph) in phdrs.iter().enumerate() {
        let mut ph = *ph;
        if ph.p_offset >= end {
            if ph.p_filesz > 0 || ph.p_offset > end {
                ph.p_offset = end;
            }
            ph.p_filesz = 0;
        } else if ph.file_end() > end {
            ph.p_filesz = end - ph.p_offset;
        }
        let at = header.e_phoff as usize + i * PHDR_SIZE;
        ph.write(&mut out[at..at + PHDR_SIZE]);
    }
    Ok(out)
}
