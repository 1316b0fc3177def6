//! The stub runtime: rebuilds the original process image in memory and
//! works out where to jump.
//!
//! `run` walks the states in order:
//!
//! 1. Enter: the password gate, when the parameter block has one.
//! 2. LocatePayload: the patched address, or a scan of the stub's mappings.
//! 3. Decompress into an anonymous scratch mapping.
//! 4. Unfilter according to the parameter block flags.
//! 5. ValidateElf: architecture and the ELF type this stub was built for.
//! 6. ReserveAddressSpace for position-independent images.
//! 7. MapSegments, creating the hatch page on the first executable one.
//! 8. StaticHandoff, DynamicBootstrap, or ManualRelocate.
//!
//! The final jump is not here. `run` returns a `Handoff` and the stub's
//! architecture code clears registers and transfers control. Every failure
//! is a `Fatal`, whose discriminant is the process exit status.

use core::fmt;

use crate::codec::Codec;
use crate::container::{Layout, PackedBlock, PackedHeader};
use crate::elf::{self, Arch, Header, ProgramHeader, ET_DYN, ET_EXEC, PT_INTERP, PT_LOAD};
use crate::filter::Filter;
use crate::le::{align_down, align_up};
use crate::params::{Flags, ParameterBlock};
use crate::scan::Region;

mod auxv;
mod gate;
mod interp;
mod locate;
mod map;
pub mod reloc;
pub mod sys;

pub use self::sys::{Backing, Errno, Prot, SysResult, System};

/// Why the stub gave up. The discriminant is the exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Fatal {
    BadPassword = 1,
    /// The image's architecture or type doesn't match this stub.
    TypeMismatch = 2,
    Alloc = 3,
    PayloadNotFound = 4,
    /// Decompression, digest, or unfilter failure.
    Decompress = 5,
    /// Bad ELF image or a failed segment mapping.
    Mapping = 6,
    Interpreter = 7,
    /// The parameter block or a block header is implausible.
    Params = 11,
    /// The patched address does not point at this stub's marker.
    Marker = 66,
    MissingHatch = 88,
    /// Control came back from the transferred-to program.
    Returned = 97,
    /// The stub panicked.
    Panic = 98,
    /// The entry point or hatch lies inside the stub's own region.
    RegionCollision = 99,
}

impl Fatal {
    pub fn code(self) -> i32 {
        self as u8 as i32
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let what = match self {
            Fatal::BadPassword => "bad password",
            Fatal::TypeMismatch => "image type mismatch",
            Fatal::Alloc => "allocation failed",
            Fatal::PayloadNotFound => "packed data not found",
            Fatal::Decompress => "decompression failed",
            Fatal::Mapping => "mapping failed",
            Fatal::Interpreter => "interpreter failed",
            Fatal::Params => "bad parameters",
            Fatal::Marker => "bad marker",
            Fatal::MissingHatch => "no hatch",
            Fatal::Returned => "program returned",
            Fatal::Panic => "panic",
            Fatal::RegionCollision => "region collision",
        };
        write!(f, "{} (exit {})", what, self.code())
    }
}

/// Which ELF type a stub variant runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Linkage {
    /// Fixed-address `ET_EXEC` images.
    Static,
    /// Position-independent `ET_DYN` images.
    Dynamic,
}

impl Linkage {
    pub fn for_type(e_type: u16) -> Linkage {
        if e_type == ET_DYN { Linkage::Dynamic } else { Linkage::Static }
    }

    pub fn name(self) -> &'static str {
        match self {
            Linkage::Static => "static",
            Linkage::Dynamic => "dynamic",
        }
    }

    fn e_type(self) -> u16 {
        match self {
            Linkage::Static => ET_EXEC,
            Linkage::Dynamic => ET_DYN,
        }
    }
}

/// What the stub knows at entry.
#[derive(Clone, Copy, Debug)]
pub struct Boot {
    pub arch: Arch,
    pub linkage: Linkage,
    /// Stack pointer at process entry, pointing at `argc`.
    pub sp: u64,
    /// Runtime address that corresponds to `params.virtual_start`.
    pub origin: u64,
    /// Where the running stub code lives.
    pub own: Region,
    pub params: ParameterBlock,
}

/// How control reaches the program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    StaticHandoff,
    DynamicBootstrap,
    ManualRelocate,
}

/// Where to jump, with which stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handoff {
    pub mode: Mode,
    pub entry: u64,
    pub sp: u64,
    pub hatch: Option<u64>,
    /// Unmapped through the hatch on the way out.
    pub unmap: Option<Region>,
}

pub(crate) const MAX_PHDRS: usize = 64;

/// A fixed-capacity copy of a program header table.
#[derive(Clone, Copy)]
pub(crate) struct Phdrs {
    list: [ProgramHeader; MAX_PHDRS],
    len: usize,
}

impl Phdrs {
    fn empty() -> Self {
        Phdrs { list: [ProgramHeader::default(); MAX_PHDRS], len: 0 }
    }

    /// Copies the table of the image in `bytes`. `None` if it doesn't fit.
    pub(crate) fn read(bytes: &[u8], header: &Header) -> Option<Self> {
        let count = usize::from(header.e_phnum);
        if count > MAX_PHDRS {
            return None;
        }
        let mut phdrs = Phdrs::empty();
        for i in 0..count {
            phdrs.list[i] = ProgramHeader::read(bytes, header, i)?;
        }
        phdrs.len = count;
        Some(phdrs)
    }

    pub(crate) fn all(&self) -> &[ProgramHeader] {
        &self.list[..self.len]
    }

    pub(crate) fn loads(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.all().iter().filter(|ph| ph.p_type == PT_LOAD)
    }

    pub(crate) fn find(&self, p_type: u32) -> Option<ProgramHeader> {
        self.all().iter().find(|ph| ph.p_type == p_type).copied()
    }
}

/// The decompressed image in its scratch mapping.
pub(crate) struct Image {
    pub addr: u64,
    pub len: usize,
    pub map_len: u64,
    pub header: Header,
    pub phdrs: Phdrs,
}

impl Image {
    pub(crate) fn bytes<'s, S: System>(&self, sys: &'s S) -> Result<&'s [u8], Fatal> {
        sys.memory(self.addr, self.len).map_err(|_| Fatal::Mapping)
    }
}

/// Runs every state up to the transfer.
pub fn run<S: System, C: Codec>(sys: &mut S, boot: &Boot) -> Result<Handoff, Fatal> {
    // Enter
    if let Some(check) = boot.params.password {
        gate::check(sys, &check)?;
    }
    let auxv = auxv::find(sys, boot.sp)?;
    let page = auxv::get(sys, auxv, elf::AT_PAGESZ)?
        .filter(|&page| page.is_power_of_two() && page >= 0x1000)
        .unwrap_or(0x1000);

    let addr = locate::locate::<S, C>(sys, boot)?;
    let (scratch, scratch_len, original) = decompress::<S, C>(sys, boot, addr, page)?;
    let image = validate(sys, boot, scratch, scratch_len, original)?;

    let bias = if image.header.e_type == ET_DYN {
        map::reserve(sys, &image.phdrs, page).map_err(|_| Fatal::Alloc)?
    } else {
        0
    };
    let hatch = map::map_segments(sys, &image, bias, page, boot.arch)?;
    let phdr_addr = map::phdr_address(sys, &image, bias, page)?;

    let mode = select_mode(&image, boot.params.flags);
    let entry = bias.wrapping_add(image.header.e_entry);
    let mut update = auxv::Update {
        phdr: phdr_addr,
        phnum: u64::from(image.header.e_phnum),
        phent: u64::from(image.header.e_phentsize),
        entry,
        base: 0,
        terminator: None,
    };

    let handoff = match mode {
        Mode::DynamicBootstrap => {
            map::protect(sys, &image.phdrs, bias, page)?;
            let hatch = hatch.ok_or(Fatal::MissingHatch)?;
            let mut path_buf = [0u8; interp::PATH_MAX];
            let path = interp::path(sys, &image, boot.arch, &mut path_buf)?;
            let (interp_base, interp_entry) = interp::load(sys, path, boot.arch, page)?;
            update.base = interp_base;
            update.terminator = Some(hatch);
            Handoff {
                mode,
                entry: interp_entry,
                sp: boot.sp,
                hatch: Some(hatch),
                unmap: Some(Region {
                    start: align_down(boot.own.start, page),
                    end: align_up(boot.own.end, page),
                }),
            }
        }
        Mode::ManualRelocate => {
            reloc::relocate(sys, &image, bias, boot.arch)?;
            map::protect(sys, &image.phdrs, bias, page)?;
            Handoff { mode, entry, sp: boot.sp, hatch, unmap: None }
        }
        Mode::StaticHandoff => {
            map::protect(sys, &image.phdrs, bias, page)?;
            Handoff { mode, entry, sp: boot.sp, hatch, unmap: None }
        }
    };
    auxv::rewrite(sys, auxv, &update)?;
    // The image has been copied out; a failed unmap only costs address space.
    let _ = sys.munmap(image.addr, image.map_len);

    let collides = |addr: u64| boot.own.start <= addr && addr < boot.own.end;
    if collides(handoff.entry) || handoff.hatch.map_or(false, collides) {
        return Err(Fatal::RegionCollision);
    }
    Ok(handoff)
}

fn select_mode(image: &Image, flags: Flags) -> Mode {
    let has_interp = image.phdrs.find(PT_INTERP).is_some();
    let manual = flags.contains(Flags::MANUAL_RELOC);
    if has_interp && !manual {
        Mode::DynamicBootstrap
    } else if image.header.e_type == ET_DYN && !has_interp && manual {
        Mode::ManualRelocate
    } else {
        Mode::StaticHandoff
    }
}

/// Decompresses and unfilters the block at `addr`. Returns the scratch
/// mapping, its length, and the image size.
fn decompress<S: System, C: Codec>(sys: &mut S, boot: &Boot, addr: u64, page: u64)
    -> Result<(u64, u64, usize), Fatal>
{
    let flags = boot.params.flags;
    let layout = Layout::for_flags(flags);
    let header = {
        let bytes = sys.memory(addr, layout.header_len()).map_err(|_| Fatal::PayloadNotFound)?;
        PackedHeader::parse(bytes, layout).map_err(|_| Fatal::Marker)?
    };
    header.check_plausible().map_err(|_| Fatal::Params)?;
    let stream = header.stream_size() as usize;
    let original = header.original_size as usize;
    let capacity = C::ID.capacity(stream);
    let scratch_len = align_up(capacity as u64, page);
    let scratch = sys.mmap(0, scratch_len, Prot::READ | Prot::WRITE, false, Backing::Anon)
        .map_err(|_| Fatal::Alloc)?;

    let block_len = header.block_len(flags.contains(Flags::DIGEST));
    let (src, dst) = sys.memory_pair(addr, block_len, scratch, capacity)
        .map_err(|_| Fatal::PayloadNotFound)?;
    let block = PackedBlock::parse(src, flags).map_err(|_| Fatal::Params)?;
    let n = C::decompress(block.compressed, dst).map_err(|_| Fatal::Decompress)?;
    if n != stream || !block.digest_ok(&dst[..n]) {
        return Err(Fatal::Decompress);
    }
    Filter::from_flags(flags).decode(boot.arch, &mut dst[..n], original)
        .map_err(|_| Fatal::Decompress)?;
    Ok((scratch, scratch_len, original))
}

fn validate<S: System>(sys: &S, boot: &Boot, addr: u64, map_len: u64, len: usize) -> Result<Image, Fatal> {
    let bytes = sys.memory(addr, len).map_err(|_| Fatal::Mapping)?;
    let elf = elf::Elf::parse(bytes).map_err(|err| match err {
        elf::FormatError::Machine { .. } | elf::FormatError::Type { .. } => Fatal::TypeMismatch,
        _ => Fatal::Mapping,
    })?;
    elf.check_segments().map_err(|_| Fatal::Mapping)?;
    let header = *elf.header();
    if elf.arch() != boot.arch || header.e_type != boot.linkage.e_type() {
        return Err(Fatal::TypeMismatch);
    }
    let phdrs = Phdrs::read(bytes, &header).ok_or(Fatal::Mapping)?;
    Ok(Image { addr, len, map_len, header, phdrs })
}
