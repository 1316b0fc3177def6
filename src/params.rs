//! The parameter block: a small fixed-layout record embedded in every stub
//! binary and patched in place by the packer.
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 8    | magic `+zELF-PR`                        |
//! | 8      | 8    | version (low byte) and flags (bits 8..) |
//! | 16     | 8    | `virtual_start`                         |
//! | 24     | 8    | `packed_data_vaddr`                     |
//! | 32     | 8    | reserved (v1) / salt (v2)               |
//! | 40     | 8    | obfuscated password hash (v2 only)      |
//!
//! A stub is built with the address fields zeroed. The runtime derives its
//! ASLR delta as `own address - virtual_start` and never uses an absolute
//! address from here directly.

use core::fmt;

use bitflags::bitflags;

use crate::le::{read_u64, write_u64};

pub const MAGIC: [u8; 8] = *b"+zELF-PR";

/// Size of a version 1 block.
pub const V1_LEN: usize = 40;
/// Size of a version 2 (password) block.
pub const V2_LEN: usize = 48;

bitflags! {
    /// Feature bits carried above the version byte.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// The image was BCJ-filtered before compression.
        const BCJ = 1 << 0;
        /// A digest of the decompressed stream follows the compressed bytes.
        const DIGEST = 1 << 2;
        /// Relocate a position-independent image in the stub instead of
        /// handing it to an interpreter.
        const MANUAL_RELOC = 1 << 3;
    }
}

/// Format version of a parameter block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Plain = 1,
    Password = 2,
}

impl Version {
    pub fn len(self) -> usize {
        match self {
            Version::Plain => V1_LEN,
            Version::Password => V2_LEN,
        }
    }
}

/// A parameter block error.
#[derive(Debug, PartialEq, Eq)]
pub enum ParamsError {
    /// No magic found in the stub.
    NotFound,
    /// The magic occurs more than once, so the patch target is ambiguous.
    Ambiguous { first: usize, second: usize },
    /// The block runs past the end of the stub.
    Truncated { offset: usize, len: usize },
    /// Unknown version byte.
    Version { version: u8 },
    /// Flag bits we don't know about.
    UnknownFlags { bits: u32 },
}

#[cfg(feature = "std")]
impl std::error::Error for ParamsError {}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamsError::NotFound =>
                write!(f, "stub has no parameter block"),
            ParamsError::Ambiguous { first, second } =>
                write!(f, "parameter block magic found twice, at {:#x} and {:#x}", first, second),
            ParamsError::Truncated { offset, len } =>
                write!(f, "parameter block at {:#x} runs past the end of the stub ({} bytes)", offset, len),
            ParamsError::Version { version } =>
                write!(f, "unknown parameter block version {}", version),
            ParamsError::UnknownFlags { bits } =>
                write!(f, "unknown parameter block flags {:#x}", bits),
        }
    }
}

/// A decoded parameter block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterBlock {
    pub version: Version,
    pub flags: Flags,
    pub virtual_start: u64,
    pub packed_data_vaddr: u64,
    /// Salt and obfuscated hash, present in version 2.
    pub password: Option<PasswordCheck>,
}

/// What the stub needs to check a password.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordCheck {
    pub salt: u64,
    pub obfuscated_hash: u64,
}

impl ParameterBlock {
    /// Decodes a block from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, ParamsError> {
        if buf.len() < V1_LEN || buf[..8] != MAGIC {
            return Err(ParamsError::NotFound);
        }
        Self::decode(buf)
    }

    /// Like `parse` but without comparing the magic. A stub decoding its
    /// own block uses this so the magic appears exactly once in its image.
    pub fn decode(buf: &[u8]) -> Result<Self, ParamsError> {
        if buf.len() < V1_LEN {
            return Err(ParamsError::Truncated { offset: 0, len: buf.len() });
        }
        let word = read_u64(buf, 8);
        let version = match word as u8 {
            1 => Version::Plain,
            2 => Version::Password,
            version => return Err(ParamsError::Version { version }),
        };
        let bits = (word >> 8) as u32;
        let flags = Flags::from_bits(bits).ok_or(ParamsError::UnknownFlags { bits })?;
        let password = match version {
            Version::Plain => None,
            Version::Password => {
                if buf.len() < V2_LEN {
                    return Err(ParamsError::Truncated { offset: 0, len: buf.len() });
                }
                Some(PasswordCheck {
                    salt: read_u64(buf, 32),
                    obfuscated_hash: read_u64(buf, 40),
                })
            }
        };
        Ok(ParameterBlock {
            version,
            flags,
            virtual_start: read_u64(buf, 16),
            packed_data_vaddr: read_u64(buf, 24),
            password,
        })
    }

    /// The 64-bit version+flags word.
    pub fn word(&self) -> u64 {
        (self.version as u64) | (u64::from(self.flags.bits()) << 8)
    }

    /// Writes the block over the start of `buf`, which must be at least
    /// `self.version.len()` bytes.
    pub fn write(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&MAGIC);
        write_u64(buf, 8, self.word());
        write_u64(buf, 16, self.virtual_start);
        write_u64(buf, 24, self.packed_data_vaddr);
        match self.password {
            Some(check) => {
                write_u64(buf, 32, check.salt);
                write_u64(buf, 40, check.obfuscated_hash);
            }
            None => write_u64(buf, 32, 0),
        }
    }

    /// The ASLR delta for a stub running at `runtime_start`. Zero when the
    /// block was never given an address.
    pub fn delta(&self, runtime_start: u64) -> u64 {
        if self.virtual_start == 0 {
            0
        } else {
            runtime_start.wrapping_sub(self.virtual_start)
        }
    }

    /// The runtime address of the packed block for a stub at
    /// `runtime_start`, or `None` when the block must be found by scanning.
    pub fn packed_data_addr(&self, runtime_start: u64) -> Option<u64> {
        if self.packed_data_vaddr == 0 || self.virtual_start == 0 {
            None
        } else {
            Some(self.packed_data_vaddr.wrapping_add(self.delta(runtime_start)))
        }
    }
}

/// Finds the offset of the single parameter block magic in `stub`.
pub fn find(stub: &[u8]) -> Result<usize, ParamsError> {
    let mut found = None;
    let mut i = 0;
    while i + MAGIC.len() <= stub.len() {
        if stub[i..i + MAGIC.len()] == MAGIC {
            if let Some(first) = found {
                return Err(ParamsError::Ambiguous { first, second: i });
            }
            found = Some(i);
        }
        i += 1;
    }
    found.ok_or(ParamsError::NotFound)
}

/// Locates the block in a private copy of a stub and overwrites it with
/// `params`. The stub must have been built for the same version.
pub fn patch(stub: &mut [u8], params: &ParameterBlock) -> Result<usize, ParamsError> {
    let offset = find(stub)?;
    let len = params.version.len();
    if offset + len > stub.len() {
        return Err(ParamsError::Truncated { offset, len: stub.len() });
    }
    let existing = ParameterBlock::parse(&stub[offset..])
        .map_err(|_| ParamsError::Truncated { offset, len: stub.len() })?;
    if existing.version != params.version {
        return Err(ParamsError::Version { version: existing.version as u8 });
    }
    params.write(&mut stub[offset..offset + len]);
    Ok(offset)
}
