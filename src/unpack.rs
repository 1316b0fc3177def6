//! Recovering the image from a packed file without running it.

use std::fmt;

use crate::codec::{CodecError, CodecId};
use crate::container::{self, PackedBlock, PackedHeader};
use crate::elf::{self, Elf};
use crate::filter::{Filter, FilterError};
use crate::params::{self, ParameterBlock, ParamsError};
use crate::scan;
use crate::stage0::{self, Stage0Error};

/// A depacking error.
#[derive(Debug)]
pub enum UnpackError {
    Elf(elf::FormatError),
    /// The entry point is outside the file.
    NoStub { entry: u64 },
    Stage0(Stage0Error),
    Params(ParamsError),
    /// No packed block where the parameters say or anywhere after the stub.
    NoBlock,
    Container(container::FormatError),
    Codec(CodecError),
    /// The decoder produced a different amount than the header declares.
    StreamSize { expected: u64, actual: u64 },
    Digest,
    Filter(FilterError),
}

impl std::error::Error for UnpackError {}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnpackError::Elf(err) => err.fmt(f),
            UnpackError::NoStub { entry } => write!(f, "entry point {:#x} is not in the file", entry),
            UnpackError::Stage0(err) => err.fmt(f),
            UnpackError::Params(err) => write!(f, "not a packed file: {}", err),
            UnpackError::NoBlock => write!(f, "no packed block found"),
            UnpackError::Container(err) => err.fmt(f),
            UnpackError::Codec(err) => write!(f, "decompression failed: {}", err),
            UnpackError::StreamSize { expected, actual } =>
                write!(f, "decompressed {} bytes, expected {}", actual, expected),
            UnpackError::Digest => write!(f, "digest mismatch"),
            UnpackError::Filter(err) => err.fmt(f),
        }
    }
}

impl From<elf::FormatError> for UnpackError {
    fn from(err: elf::FormatError) -> Self {
        UnpackError::Elf(err)
    }
}

impl From<Stage0Error> for UnpackError {
    fn from(err: Stage0Error) -> Self {
        UnpackError::Stage0(err)
    }
}

impl From<ParamsError> for UnpackError {
    fn from(err: ParamsError) -> Self {
        UnpackError::Params(err)
    }
}

impl From<container::FormatError> for UnpackError {
    fn from(err: container::FormatError) -> Self {
        UnpackError::Container(err)
    }
}

impl From<CodecError> for UnpackError {
    fn from(err: CodecError) -> Self {
        UnpackError::Codec(err)
    }
}

impl From<FilterError> for UnpackError {
    fn from(err: FilterError) -> Self {
        UnpackError::Filter(err)
    }
}

/// What `unpack` found on the way.
#[derive(Clone, Debug)]
pub struct Unpacked {
    pub image: Vec<u8>,
    pub params: ParameterBlock,
    pub header: PackedHeader,
    pub stage0: bool,
}

/// Returns the image that was packed into `file`.
pub fn unpack(file: &[u8]) -> Result<Vec<u8>, UnpackError> {
    inspect(file).map(|unpacked| unpacked.image)
}

/// Like `unpack`, also returning the parameter block and block header.
pub fn inspect(file: &[u8]) -> Result<Unpacked, UnpackError> {
    let elf = Elf::parse(file)?;
    elf.check_segments()?;
    let entry = elf.header().e_entry;
    let stub_start = elf.vaddr_to_offset(entry).ok_or(UnpackError::NoStub { entry })?;
    // The stub ends with the first segment to end after it starts.
    let stub_end = elf.loads()
        .map(|ph| ph.file_end())
        .filter(|&end| end > stub_start)
        .min()
        .ok_or(UnpackError::NoStub { entry })?;
    let code = &file[stub_start as usize..stub_end as usize];

    let wrapped = stage0::is_wrapped(code);
    let unwrapped;
    let stub = if wrapped {
        unwrapped = stage0::unwrap(code)?;
        &unwrapped[..]
    } else {
        code
    };
    let params = ParameterBlock::parse(&stub[params::find(stub)?..])?;
    debug!("unpack: version {:?} flags {:?} stage-0 {}", params.version, params.flags, wrapped);

    let block_at = match params.virtual_start {
        0 => find_block(&file[stub_end as usize..], &params)? + stub_end as usize,
        _ => elf.vaddr_to_offset(params.packed_data_vaddr).ok_or(UnpackError::NoBlock)? as usize,
    };
    let flags = params.flags;
    let block = PackedBlock::parse(&file[block_at..], flags)?;
    let header = block.header;
    debug!("unpack: {} block at {:#x}, {} -> {} bytes", header.codec, block_at,
        header.compressed_size, header.original_size);

    let expected = header.stream_size();
    let mut image = vec![0; header.codec.capacity(expected as usize)];
    let n = header.codec.decompress(block.compressed, &mut image)?;
    if n as u64 != expected {
        return Err(UnpackError::StreamSize { expected, actual: n as u64 });
    }
    image.truncate(n);
    if !block.digest_ok(&image) {
        return Err(UnpackError::Digest);
    }
    Filter::from_flags(flags).decode(elf.arch(), &mut image, header.original_size as usize)?;
    Ok(Unpacked { image, params, header, stage0: wrapped })
}

/// Scans `region` for a block of any codec, preferring the one found
/// furthest into the region.
fn find_block(region: &[u8], params: &ParameterBlock) -> Result<usize, UnpackError> {
    CodecId::ALL.iter()
        .filter_map(|&codec| scan::find_block_dyn(region, codec, params.flags))
        .max()
        .ok_or(UnpackError::NoBlock)
}
