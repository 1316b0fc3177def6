//! ManualRelocate: applying the load bias without a dynamic linker.
//!
//! The strategies run in `Strategy::ORDER` and the first one that patches
//! anything wins. Each reads link-time addresses from the decompressed
//! image and patches the mapped segments, which are still writable.

use super::{Fatal, Image, System};
use crate::elf::{
    Arch, DT_NULL, DT_PLTGOT, DT_POINTER_TAGS, DT_RELA, DT_RELAENT, DT_RELASZ, DT_RELR,
    DT_RELRENT, DT_RELRSZ, DYN_SIZE, PF_W, PT_DYNAMIC, RELA_SIZE,
};
use crate::le::read_u64;

/// A way of finding the words that need the load bias.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// `R_*_RELATIVE` entries of `DT_RELA` and the `DT_RELR` bitmap.
    RelativeTable,
    /// Words of the global offset table that point into the image.
    GotScan,
    /// Every aligned word of the writable segments that looks like an
    /// address inside the image.
    ///
    /// Best effort: any data word that happens to fall in the image's
    /// address range gets patched too.
    BruteForce,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [Strategy::RelativeTable, Strategy::GotScan, Strategy::BruteForce];

    pub fn best_effort(self) -> bool {
        self == Strategy::BruteForce
    }
}

// Words looked at past DT_PLTGOT.
const GOT_SCAN_WORDS: u64 = 4096;
// Smaller values are taken for plain integers by the brute-force scan.
const MIN_POINTER: u64 = 0x1000;

/// What the dynamic section says about relocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Dynamic {
    rela: Option<u64>,
    relasz: u64,
    relaent: u64,
    relr: Option<u64>,
    relrsz: u64,
    relrent: u64,
    pltgot: Option<u64>,
}

impl Dynamic {
    fn read(image: &Image, bytes: &[u8]) -> Self {
        let mut dynamic = Dynamic { relaent: RELA_SIZE as u64, relrent: 8, ..Dynamic::default() };
        let ph = match image.phdrs.find(PT_DYNAMIC) {
            Some(ph) => ph,
            None => return dynamic,
        };
        let start = ph.p_offset as usize;
        let end = start.saturating_add(ph.p_filesz as usize).min(bytes.len());
        let mut at = start;
        while at + DYN_SIZE <= end {
            let tag = read_u64(bytes, at);
            let value = read_u64(bytes, at + 8);
            match tag {
                DT_NULL => break,
                DT_RELA => dynamic.rela = Some(value),
                DT_RELASZ => dynamic.relasz = value,
                DT_RELAENT if value != 0 => dynamic.relaent = value,
                DT_RELR => dynamic.relr = Some(value),
                DT_RELRSZ => dynamic.relrsz = value,
                DT_RELRENT if value != 0 => dynamic.relrent = value,
                DT_PLTGOT => dynamic.pltgot = Some(value),
                _ => (),
            }
            at += DYN_SIZE;
        }
        dynamic
    }
}

/// Link-time address range of the image.
fn span(image: &Image) -> (u64, u64) {
    let lo = image.phdrs.loads().map(|ph| ph.p_vaddr).min().unwrap_or(0);
    let hi = image.phdrs.loads().map(|ph| ph.vaddr_end()).max().unwrap_or(0);
    (lo, hi)
}

/// Translates a link-time address into an offset in the image file.
fn file_offset(image: &Image, vaddr: u64) -> Option<usize> {
    image.phdrs.loads()
        .find(|ph| vaddr >= ph.p_vaddr && vaddr < ph.p_vaddr + ph.p_filesz)
        .and_then(|ph| usize::try_from(ph.p_offset + (vaddr - ph.p_vaddr)).ok())
}

/// Runs the strategies in order. Returns the one that patched something and
/// how many words it patched; an image with nothing to patch reports the
/// last strategy with a count of zero.
pub(super) fn relocate<S: System>(sys: &mut S, image: &Image, bias: u64, arch: Arch)
    -> Result<(Strategy, usize), Fatal>
{
    for &strategy in &Strategy::ORDER {
        let count = attempt(sys, image, bias, arch, strategy)?;
        if count > 0 {
            return Ok((strategy, count));
        }
    }
    Ok((Strategy::BruteForce, 0))
}

fn attempt<S: System>(sys: &mut S, image: &Image, bias: u64, arch: Arch, strategy: Strategy)
    -> Result<usize, Fatal>
{
    match strategy {
        Strategy::RelativeTable => relative_table(sys, image, bias, arch),
        Strategy::GotScan => got_scan(sys, image, bias),
        Strategy::BruteForce => brute_force(sys, image, bias),
    }
}

fn add_bias<S: System>(sys: &mut S, addr: u64, bias: u64) -> Result<(), Fatal> {
    let value = sys.read_word(addr).map_err(|_| Fatal::Mapping)?;
    sys.write_word(addr, value.wrapping_add(bias)).map_err(|_| Fatal::Mapping)
}

fn relative_table<S: System>(sys: &mut S, image: &Image, bias: u64, arch: Arch) -> Result<usize, Fatal> {
    let dynamic = {
        let bytes = image.bytes(sys)?;
        Dynamic::read(image, bytes)
    };
    let mut count = 0;

    if let Some(rela) = dynamic.rela {
        let start = file_offset(image, rela).ok_or(Fatal::Mapping)?;
        let entries = (dynamic.relasz / dynamic.relaent) as usize;
        let step = dynamic.relaent as usize;
        for i in 0..entries {
            let at = start + i * step;
            let (r_offset, r_info, r_addend) = {
                let bytes = image.bytes(sys)?;
                if at + RELA_SIZE > bytes.len() {
                    return Err(Fatal::Mapping);
                }
                (read_u64(bytes, at), read_u64(bytes, at + 8), read_u64(bytes, at + 16))
            };
            if r_info as u32 == arch.relative_reloc() {
                sys.write_word(bias.wrapping_add(r_offset), bias.wrapping_add(r_addend))
                    .map_err(|_| Fatal::Mapping)?;
                count += 1;
            }
        }
    }

    if let Some(relr) = dynamic.relr {
        let start = file_offset(image, relr).ok_or(Fatal::Mapping)?;
        let entries = (dynamic.relrsz / dynamic.relrent) as usize;
        let mut next = 0u64;
        for i in 0..entries {
            let entry = {
                let bytes = image.bytes(sys)?;
                let at = start + i * 8;
                if at + 8 > bytes.len() {
                    return Err(Fatal::Mapping);
                }
                read_u64(bytes, at)
            };
            if entry & 1 == 0 {
                add_bias(sys, bias.wrapping_add(entry), bias)?;
                next = entry + 8;
                count += 1;
            } else {
                let mut bits = entry >> 1;
                let mut addr = next;
                while bits != 0 {
                    if bits & 1 != 0 {
                        add_bias(sys, bias.wrapping_add(addr), bias)?;
                        count += 1;
                    }
                    bits >>= 1;
                    addr += 8;
                }
                next += 63 * 8;
            }
        }
    }

    if count > 0 {
        rebase_dynamic(sys, image, bias)?;
    }
    Ok(count)
}

/// Adds the bias to the address-valued tags of the mapped dynamic section,
/// as the dynamic linker would for its own bookkeeping.
fn rebase_dynamic<S: System>(sys: &mut S, image: &Image, bias: u64) -> Result<(), Fatal> {
    let ph = match image.phdrs.find(PT_DYNAMIC) {
        Some(ph) => ph,
        None => return Ok(()),
    };
    let base = bias.wrapping_add(ph.p_vaddr);
    for i in 0..ph.p_filesz / DYN_SIZE as u64 {
        let at = base + i * DYN_SIZE as u64;
        let tag = sys.read_word(at).map_err(|_| Fatal::Mapping)?;
        if tag == DT_NULL {
            break;
        }
        if DT_POINTER_TAGS.contains(&tag) {
            add_bias(sys, at + 8, bias)?;
        }
    }
    Ok(())
}

fn got_scan<S: System>(sys: &mut S, image: &Image, bias: u64) -> Result<usize, Fatal> {
    let pltgot = {
        let bytes = image.bytes(sys)?;
        Dynamic::read(image, bytes).pltgot
    };
    let got = match pltgot {
        Some(got) => got,
        None => return Ok(0),
    };
    let segment = match image.phdrs.loads().find(|ph| got >= ph.p_vaddr && got < ph.p_vaddr + ph.p_filesz) {
        Some(ph) => *ph,
        None => return Ok(0),
    };
    let (lo, hi) = span(image);
    let end = (segment.p_vaddr + segment.p_filesz).min(got + GOT_SCAN_WORDS * 8);
    let mut count = 0;
    let mut addr = got;
    while addr + 8 <= end {
        let at = bias.wrapping_add(addr);
        let value = sys.read_word(at).map_err(|_| Fatal::Mapping)?;
        if value != 0 && value >= lo && value < hi {
            sys.write_word(at, value.wrapping_add(bias)).map_err(|_| Fatal::Mapping)?;
            count += 1;
        }
        addr += 8;
    }
    Ok(count)
}

fn brute_force<S: System>(sys: &mut S, image: &Image, bias: u64) -> Result<usize, Fatal> {
    let (lo, hi) = span(image);
    let lo = lo.max(MIN_POINTER);
    let mut count = 0;
    for ph in image.phdrs.loads().filter(|ph| ph.p_flags & PF_W != 0) {
        let mut addr = (ph.p_vaddr + 7) & !7;
        while addr + 8 <= ph.p_vaddr + ph.p_filesz {
            let at = bias.wrapping_add(addr);
            let value = sys.read_word(at).map_err(|_| Fatal::Mapping)?;
            if value >= lo && value < hi {
                sys.write_word(at, value.wrapping_add(bias)).map_err(|_| Fatal::Mapping)?;
                count += 1;
            }
            addr += 8;
        }
    }
    Ok(count)
}
