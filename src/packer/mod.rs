//! Rewriting an ELF executable into a packed one.
//!
//! `pack` strips and filters the image, compresses it into a packed block,
//! patches the parameter block of a private copy of the matching stub,
//! optionally wraps the stub in stage-0, lays the file out, and emits it.
//! Nothing is produced unless the result is smaller than the image.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::codec::{self, CodecError, CodecId};
use crate::container::{self, PackedHeader};
use crate::elf::{self, Arch, Elf, PF_X, PT_INTERP};
use crate::filter::{self, Filter};
use crate::loader::{Linkage, MAX_PHDRS};
use crate::params::{self, Flags, ParameterBlock, ParamsError, PasswordCheck, Version};
use crate::password;
use crate::stage0::{self, Stage0Error};

mod layout;
mod options;
mod strip;
mod stubs;

pub use self::layout::{Placement, PAGE};
pub use self::options::{BadChoice, FilterChoice, PackOptions, Stage0Mode};
pub use self::strip::super_strip;
pub use self::stubs::{stage0_file_name, StubDir, StubKey, StubSource, STUB_DIR_VAR};

/// Loaders larger than this are candidates for a stage-0 wrapper.
pub const STAGE0_THRESHOLD: usize = 12 * 1024;

// Attempts at a layout whose stub space fits the patched stub.
const LAYOUT_ROUNDS: usize = 4;

/// A packing error.
#[derive(Debug)]
pub enum PackError {
    /// The input is not an ELF file we can pack.
    Elf(elf::FormatError),
    /// More program headers than the stub can copy.
    TooManyPhdrs { count: u16 },
    Codec(CodecError),
    Container(container::FormatError),
    /// The stub's parameter block could not be patched.
    Params(ParamsError),
    Stage0(Stage0Error),
    /// No stub binary for this combination.
    MissingStub { name: String },
    Io { path: PathBuf, err: io::Error },
    EmptyPassword,
    /// The stub kept growing with each layout.
    Unsettled { stub_len: usize },
    /// The packed file would not be smaller than the input.
    NotReduced { packed: u64, original: u64 },
}

impl PackError {
    /// Whether this failure only means "try another codec or filter".
    pub fn is_soft(&self) -> bool {
        matches!(self, PackError::NotReduced { .. })
    }
}

impl std::error::Error for PackError {}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PackError::Elf(err) => err.fmt(f),
            PackError::TooManyPhdrs { count } =>
                write!(f, "{} program headers; at most {} are supported", count, MAX_PHDRS),
            PackError::Codec(err) => write!(f, "compression failed: {}", err),
            PackError::Container(err) => err.fmt(f),
            PackError::Params(err) => write!(f, "stub: {}", err),
            PackError::Stage0(err) => err.fmt(f),
            PackError::MissingStub { name } => write!(f, "no stub {}", name),
            PackError::Io { path, err } => write!(f, "{}: {}", path.display(), err),
            PackError::EmptyPassword => write!(f, "empty password"),
            PackError::Unsettled { stub_len } => write!(f, "no layout fits a stub of {} bytes", stub_len),
            PackError::NotReduced { packed, original } =>
                write!(f, "packed size {} is not smaller than {}", packed, original),
        }
    }
}

impl From<elf::FormatError> for PackError {
    fn from(err: elf::FormatError) -> Self {
        PackError::Elf(err)
    }
}

impl From<CodecError> for PackError {
    fn from(err: CodecError) -> Self {
        PackError::Codec(err)
    }
}

impl From<container::FormatError> for PackError {
    fn from(err: container::FormatError) -> Self {
        PackError::Container(err)
    }
}

impl From<ParamsError> for PackError {
    fn from(err: ParamsError) -> Self {
        PackError::Params(err)
    }
}

impl From<Stage0Error> for PackError {
    fn from(err: Stage0Error) -> Self {
        PackError::Stage0(err)
    }
}

/// A packed file and how it was made.
#[derive(Clone, Debug)]
pub struct Packed {
    pub data: Vec<u8>,
    pub arch: Arch,
    pub codec: CodecId,
    pub filter: Filter,
    pub linkage: Linkage,
    pub stage0: bool,
    /// Size of the image that was compressed, after stripping.
    pub image_len: usize,
    pub block_len: usize,
    pub stub_len: usize,
    pub placement: Placement,
}

/// Packs the ELF executable `input`.
pub fn pack(input: &[u8], options: &PackOptions, stubs: &dyn StubSource) -> Result<Packed, PackError> {
    let elf = Elf::parse(input)?;
    elf.check_segments()?;
    let header = *elf.header();
    if usize::from(header.e_phnum) > MAX_PHDRS {
        return Err(PackError::TooManyPhdrs { count: header.e_phnum });
    }
    let arch = elf.arch();
    let linkage = Linkage::for_type(header.e_type);
    let has_interp = elf.find(PT_INTERP).is_some();
    let has_exec = elf.loads().any(|ph| ph.p_flags & PF_X != 0);
    debug!("input: {} {} bytes, {} program headers, {} linkage, interpreter {}",
        arch.name(), input.len(), header.e_phnum, linkage.name(), has_interp);
    for ph in elf.loads() {
        debug!("  load offset {:#x} vaddr {:#x} filesz {:#x} memsz {:#x} flags {:#x}",
            ph.p_offset, ph.p_vaddr, ph.p_filesz, ph.p_memsz, ph.p_flags);
    }

    let image = if options.strip { super_strip(input)? } else { input.to_vec() };
    let codec = options.codec;
    let filter = match options.filter {
        FilterChoice::Auto => filter::choose(arch, codec, &image, has_exec),
        FilterChoice::Bcj => Filter::Bcj,
        FilterChoice::None => Filter::None,
    };
    debug!("filter: {}", filter);

    let mut stream = image.clone();
    let filtered_len = filter.encode(arch, &mut stream);
    let compressed = codec.compress(&stream)?;
    debug!("compress: {} {} -> {} bytes", codec, stream.len(), compressed.len());

    let mut flags = filter.flags() | Flags::DIGEST;
    if options.manual_reloc {
        if linkage == Linkage::Dynamic && !has_interp {
            flags |= Flags::MANUAL_RELOC;
        } else {
            debug!("manual relocation: only for position-independent images without an interpreter");
        }
    }
    let filtered_size = match filter {
        Filter::Bcj => Some(u32::try_from(filtered_len).map_err(|_| container::FormatError::Size {
            field: "filtered size",
            value: filtered_len as u64,
        })?),
        Filter::None => None,
    };
    let block_header = PackedHeader {
        codec,
        original_size: image.len() as u64,
        entry_offset: header.e_entry,
        compressed_size: 0,
        filtered_size,
    };
    let block = container::build(block_header, &compressed, Some(codec::digest(&stream)))?;

    let check = match options.password.as_deref() {
        Some(pw) if password::trim_line(pw).is_empty() => return Err(PackError::EmptyPassword),
        Some(pw) => {
            let salt = rand::random::<u64>();
            Some(PasswordCheck { salt, obfuscated_hash: password::obfuscate(salt, password::hash(salt, pw)) })
        }
        None => None,
    };
    let params = ParameterBlock {
        version: if check.is_some() { Version::Password } else { Version::Plain },
        flags,
        virtual_start: 0,
        packed_data_vaddr: 0,
        password: check,
    };

    let key = StubKey { arch, linkage, codec, password: check.is_some() };
    let loader = stubs.loader(&key)?;
    let stage0 = select_stage0(options.stage0, arch, &loader, stubs)?;
    let (placement, stub) = settle(linkage, elf.max_vaddr(), &loader, stage0.as_deref(), &params, block.len() as u64)?;
    debug!("layout: stub {:#x} bytes at offset {:#x} vaddr {:#x}, block {:#x} bytes at offset {:#x} vaddr {:#x}",
        stub.len(), placement.stub_offset, placement.stub_vaddr,
        placement.block_len, placement.block_offset, placement.block_vaddr);

    let predicted = placement.file_len();
    debug!("size: {} -> {} bytes", image.len(), predicted);
    if predicted >= image.len() as u64 {
        return Err(PackError::NotReduced { packed: predicted, original: image.len() as u64 });
    }
    let data = placement.emit(arch, &stub, &block);
    Ok(Packed {
        data,
        arch,
        codec,
        filter,
        linkage,
        stage0: stage0.is_some(),
        image_len: image.len(),
        block_len: block.len(),
        stub_len: stub.len(),
        placement,
    })
}

/// Tries every codec with and without BCJ and keeps the smallest result.
/// Attempts that don't shrink the file or fail to compress are skipped.
pub fn pack_best(input: &[u8], options: &PackOptions, stubs: &dyn StubSource) -> Result<Packed, PackError> {
    let mut best: Option<Packed> = None;
    let mut skipped = None;
    for &codec in &CodecId::ALL {
        for &filter in &[FilterChoice::Bcj, FilterChoice::None] {
            let attempt = PackOptions { codec, filter, ..options.clone() };
            match pack(input, &attempt, stubs) {
                Ok(packed) => {
                    debug!("best: {} {} -> {} bytes", codec, packed.filter, packed.data.len());
                    if best.as_ref().map_or(true, |best| packed.data.len() < best.data.len()) {
                        best = Some(packed);
                    }
                }
                Err(err) if err.is_soft() || matches!(err, PackError::Codec(_)) => {
                    debug!("best: {} {:?} skipped: {}", codec, filter, err);
                    skipped = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }
    match (best, skipped) {
        (Some(best), _) => Ok(best),
        (None, Some(err)) => Err(err),
        (None, None) => Err(PackError::NotReduced { packed: 0, original: input.len() as u64 }),
    }
}

fn select_stage0(mode: Stage0Mode, arch: Arch, loader: &[u8], stubs: &dyn StubSource)
    -> Result<Option<Vec<u8>>, PackError>
{
    match mode {
        Stage0Mode::Never => Ok(None),
        Stage0Mode::Always => stubs.stage0(arch)?
            .map(Some)
            .ok_or_else(|| PackError::MissingStub { name: stage0_file_name(arch) }),
        Stage0Mode::Auto => {
            if loader.len() <= STAGE0_THRESHOLD {
                return Ok(None);
            }
            let code = match stubs.stage0(arch)? {
                Some(code) => code,
                None => {
                    debug!("stage-0: no {}", stage0_file_name(arch));
                    return Ok(None);
                }
            };
            let wrapped = stage0::wrap(&code, loader)?;
            debug!("stage-0: {} -> {} bytes", loader.len(), wrapped.len());
            Ok(if wrapped.len() < loader.len() { Some(code) } else { None })
        }
    }
}

/// The patched, possibly wrapped, stub.
fn build_stub(loader: &[u8], stage0: Option<&[u8]>, params: &ParameterBlock) -> Result<Vec<u8>, PackError> {
    let mut stub = loader.to_vec();
    params::patch(&mut stub, params)?;
    match stage0 {
        Some(code) => Ok(stage0::wrap(code, &stub)?),
        None => Ok(stub),
    }
}

/// Finds a layout whose stub space holds the stub patched with that
/// layout's addresses. A wrapped stub's length depends on the addresses.
fn settle(linkage: Linkage, image_end: u64, loader: &[u8], stage0: Option<&[u8]>, params: &ParameterBlock, block_len: u64)
    -> Result<(Placement, Vec<u8>), PackError>
{
    let mut space = build_stub(loader, stage0, params)?.len() as u64;
    for _ in 0..LAYOUT_ROUNDS {
        let placement = Placement::for_linkage(linkage, image_end, space, block_len);
        let (virtual_start, packed_data_vaddr) = placement.addresses();
        let stub = build_stub(loader, stage0, &ParameterBlock { virtual_start, packed_data_vaddr, ..*params })?;
        if stub.len() as u64 <= space {
            return Ok((placement, stub));
        }
        space = stub.len() as u64;
    }
    Err(PackError::Unsettled { stub_len: space as usize })
}
