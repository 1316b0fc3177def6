//! The stage-0 wrapper: a tiny first stage that inflates the real stub.
//!
//! A wrapped stub is the stage-0 code, which carries a `+zELF-S0` block, and
//! the `rle` stream of the real stub right after it:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 8    | magic `+zELF-S0`                        |
//! | 8      | 4    | unpacked length of the stub             |
//! | 12     | 4    | packed length (the `rle` body)          |
//! | 16     | 4    | offset of the body from stage-0's start |
//! | 20     | 4    | reserved                                |

use core::fmt;

use crate::codec::rle;
use crate::le::{align_up, read_u32, write_u32};
use crate::loader::{Backing, Fatal, Prot, System};

pub const MAGIC: [u8; 8] = *b"+zELF-S0";
pub const PARAMS_LEN: usize = 24;

/// A stage-0 error on the host side.
#[derive(Debug, PartialEq, Eq)]
pub enum Stage0Error {
    /// No `+zELF-S0` block in the stage-0 code.
    NotFound,
    /// The magic occurs more than once.
    Ambiguous,
    /// The block or the body runs past the end of the blob.
    Truncated { need: usize, len: usize },
    /// The stub didn't decode.
    Decode(rle::RleError),
    /// The stub is too large for the 32-bit length fields.
    TooLarge { len: usize },
}

#[cfg(feature = "std")]
impl std::error::Error for Stage0Error {}

impl fmt::Display for Stage0Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stage0Error::NotFound => write!(f, "no stage-0 parameter block"),
            Stage0Error::Ambiguous => write!(f, "stage-0 parameter block magic found twice"),
            Stage0Error::Truncated { need, len } =>
                write!(f, "stage-0 blob of {} bytes is shorter than {}", len, need),
            Stage0Error::Decode(err) => write!(f, "stage-0 stub: {}", err),
            Stage0Error::TooLarge { len } => write!(f, "stub of {} bytes is too large to wrap", len),
        }
    }
}

/// The `+zELF-S0` block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Params {
    pub unpacked_len: u32,
    pub packed_len: u32,
    pub data_offset: u32,
}

impl Params {
    /// Decodes the block after its magic. Stage-0 reads its own block this
    /// way so the magic is compared only on the host.
    pub fn decode(buf: &[u8]) -> Option<Params> {
        if buf.len() < PARAMS_LEN {
            return None;
        }
        Some(Params {
            unpacked_len: read_u32(buf, 8),
            packed_len: read_u32(buf, 12),
            data_offset: read_u32(buf, 16),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&MAGIC);
        write_u32(buf, 8, self.unpacked_len);
        write_u32(buf, 12, self.packed_len);
        write_u32(buf, 16, self.data_offset);
        write_u32(buf, 20, 0);
    }

    /// Size of the region the stub is inflated in.
    pub fn region_len(&self, page: u64) -> u64 {
        align_up(u64::from(self.unpacked_len.max(self.packed_len)), page)
    }
}

/// Offset of the single `+zELF-S0` magic in `code`.
pub fn find(code: &[u8]) -> Result<usize, Stage0Error> {
    let mut found = None;
    for i in 0..code.len().saturating_sub(MAGIC.len() - 1) {
        if code[i..i + MAGIC.len()] == MAGIC {
            if found.is_some() {
                return Err(Stage0Error::Ambiguous);
            }
            found = Some(i);
        }
    }
    found.ok_or(Stage0Error::NotFound)
}

/// Inflates the stub described by `params` for a stage-0 running at
/// `origin`. Returns the address of the executable stub, which is entered
/// at its first byte.
pub fn launch<S: System>(sys: &mut S, origin: u64, params: &Params, page: u64) -> Result<u64, Fatal> {
    let packed = params.packed_len as usize;
    let unpacked = params.unpacked_len as usize;
    let len = params.region_len(page);
    if unpacked == 0 || packed == 0 {
        return Err(Fatal::Params);
    }
    let region = sys.mmap(0, len, Prot::READ | Prot::WRITE, false, Backing::Anon)
        .map_err(|_| Fatal::Alloc)?;
    sys.copy(region, origin + u64::from(params.data_offset), packed)
        .map_err(|_| Fatal::PayloadNotFound)?;
    let buf = sys.memory_mut(region, len as usize).map_err(|_| Fatal::Alloc)?;
    rle::decompress_in_place(buf, packed, unpacked).map_err(|_| Fatal::Decompress)?;
    sys.mprotect(region, len, Prot::READ | Prot::EXEC).map_err(|_| Fatal::Mapping)?;
    Ok(region)
}

/// Wraps `stub` behind the stage-0 code `stage0`.
#[cfg(feature = "std")]
pub fn wrap(stage0: &[u8], stub: &[u8]) -> Result<Vec<u8>, Stage0Error> {
    let at = find(stage0)?;
    if at + PARAMS_LEN > stage0.len() {
        return Err(Stage0Error::Truncated { need: at + PARAMS_LEN, len: stage0.len() });
    }
    let too_large = || Stage0Error::TooLarge { len: stub.len() };
    let mut body = Vec::with_capacity(stub.len() / 2 + 16);
    rle::compress(&mut body, stub);
    let params = Params {
        unpacked_len: u32::try_from(stub.len()).map_err(|_| too_large())?,
        packed_len: u32::try_from(body.len()).map_err(|_| too_large())?,
        data_offset: u32::try_from(stage0.len()).map_err(|_| too_large())?,
    };
    let mut out = Vec::with_capacity(stage0.len() + body.len());
    out.extend_from_slice(stage0);
    params.write(&mut out[at..at + PARAMS_LEN]);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Whether `blob` starts with a stage-0 wrapper.
#[cfg(feature = "std")]
pub fn is_wrapped(blob: &[u8]) -> bool {
    find(blob).is_ok()
}

/// Recovers the stub from a wrapped blob.
#[cfg(feature = "std")]
pub fn unwrap(blob: &[u8]) -> Result<Vec<u8>, Stage0Error> {
    let at = find(blob)?;
    let params = Params::decode(&blob[at..])
        .ok_or(Stage0Error::Truncated { need: at + PARAMS_LEN, len: blob.len() })?;
    let start = params.data_offset as usize;
    let end = start + params.packed_len as usize;
    if end > blob.len() {
        return Err(Stage0Error::Truncated { need: end, len: blob.len() });
    }
    let unpacked = params.unpacked_len as usize;
    let mut buf = vec![0; unpacked.max(end - start)];
    buf[..end - start].copy_from_slice(&blob[start..end]);
    rle::decompress_in_place(&mut buf, end - start, unpacked).map_err(Stage0Error::Decode)?;
    buf.truncate(unpacked);
    Ok(buf)
}
