//! Compression codecs behind one byte-buffer contract.
//!
//! Each codec is a zero-sized type implementing `Codec`, so a stub built for
//! one codec links only that decoder. The host side dispatches on `CodecId`
//! at run time.
//!
//! Decoders never write past the end of `dst` and report how many bytes
//! they produced. Encoders exist only with the `std` feature.

use core::fmt;

pub mod lz4;
pub mod lzma;
pub mod rle;

pub use self::lz4::Lz4;
pub use self::lzma::Lzma;
pub use self::rle::Rle;
pub use self::rle::RleError;

/// A codec error.
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The compressed stream ended in the middle of a token.
    Truncated { at: usize },
    /// Decoding would write past the end of the output buffer.
    OutputOverflow { capacity: usize },
    /// A match refers to data before the start of the output.
    BadDistance { distance: usize, pos: usize },
    /// The stream header is invalid.
    BadHeader,
    /// The stream decoded but did not end the way it should.
    Corrupt { at: usize },
    /// Stream properties this decoder doesn't handle.
    Unsupported { what: &'static str },
    /// The EXEPACK-style decoder failed.
    Rle(RleError),
    /// The encoder failed.
    #[cfg(feature = "std")]
    Encoder(String),
}

#[cfg(feature = "std")]
impl std::error::Error for CodecError {}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Truncated { at } =>
                write!(f, "compressed stream truncated at index {}", at),
            CodecError::OutputOverflow { capacity } =>
                write!(f, "decompressed data exceed the {}-byte buffer", capacity),
            CodecError::BadDistance { distance, pos } =>
                write!(f, "match distance {} at output index {} reaches before the start", distance, pos),
            CodecError::BadHeader =>
                write!(f, "bad stream header"),
            CodecError::Corrupt { at } =>
                write!(f, "corrupt stream at index {}", at),
            CodecError::Unsupported { what } =>
                write!(f, "unsupported stream: {}", what),
            CodecError::Rle(err) => err.fmt(f),
            #[cfg(feature = "std")]
            CodecError::Encoder(msg) =>
                write!(f, "encoder: {}", msg),
        }
    }
}

impl From<RleError> for CodecError {
    fn from(err: RleError) -> Self {
        CodecError::Rle(err)
    }
}

/// A compression codec.
pub trait Codec {
    const ID: CodecId;

    /// Decodes all of `src` into `dst`, returning the number of bytes
    /// written.
    fn decompress(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;

    /// Cheap check that `stream` looks like the start of a stream this codec
    /// produced for an ELF image. Used to reject false marker matches.
    fn signature_ok(stream: &[u8]) -> bool;

    #[cfg(feature = "std")]
    fn compress(src: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Identifies a codec in packed files and on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    Lz4,
    Lzma,
    Rle,
}

const MIB: usize = 1 << 20;

impl CodecId {
    pub const ALL: [CodecId; 3] = [CodecId::Lz4, CodecId::Lzma, CodecId::Rle];

    pub fn name(self) -> &'static str {
        match self {
            CodecId::Lz4 => "lz4",
            CodecId::Lzma => "lzma",
            CodecId::Rle => "rle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().cloned().find(|id| id.name() == name)
    }

    /// The 6-byte marker that opens a packed block.
    pub fn marker(self) -> [u8; 6] {
        match self {
            CodecId::Lz4 => *b"zELFl4",
            CodecId::Lzma => *b"zELFla",
            CodecId::Rle => *b"zELFep",
        }
    }

    pub fn from_marker(marker: &[u8]) -> Option<Self> {
        Self::ALL.iter().cloned().find(|id| id.marker()[..] == *marker)
    }

    /// Size of the scratch buffer a decoder gets for an image of `original`
    /// bytes.
    pub fn capacity(self, original: usize) -> usize {
        match self {
            // Worst-case-window codec: fixed generous slack.
            CodecId::Lzma => original.saturating_add(32 * MIB),
            CodecId::Lz4 | CodecId::Rle =>
                original.saturating_add(original / 8).saturating_add(64 * 1024),
        }
    }

    pub fn decompress(self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        match self {
            CodecId::Lz4 => Lz4::decompress(src, dst),
            CodecId::Lzma => Lzma::decompress(src, dst),
            CodecId::Rle => Rle::decompress(src, dst),
        }
    }

    pub fn signature_ok(self, stream: &[u8]) -> bool {
        match self {
            CodecId::Lz4 => Lz4::signature_ok(stream),
            CodecId::Lzma => Lzma::signature_ok(stream),
            CodecId::Rle => Rle::signature_ok(stream),
        }
    }

    #[cfg(feature = "std")]
    pub fn compress(self, src: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecId::Lz4 => Lz4::compress(src),
            CodecId::Lzma => Lzma::compress(src),
            CodecId::Rle => Rle::compress(src),
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// FNV-1a 32 over a decompressed stream, stored after the compressed bytes
/// when `Flags::DIGEST` is set.
pub fn digest(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}
