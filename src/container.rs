//! The packed block: a self-describing envelope around the compressed image.
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 6    | codec marker (`zELFl4`, ...)       |
//! | 6      | 8    | original (unfiltered) size         |
//! | 14     | 8    | entry point of the original image  |
//! | 22     | 4    | compressed size                    |
//! | 26     | 4    | filtered size (modern layout only) |
//!
//! The compressed bytes follow the header. With `Flags::DIGEST` a 4-byte
//! FNV-1a 32 of the decompressed stream follows them.
//!
//! Blocks written without a filter use the legacy layout, which omits the
//! filtered size, so the layout is implied by the parameter block flags.

use core::fmt;

use crate::codec::CodecId;
use crate::le::{read_u32, read_u64};
use crate::params::Flags;

pub const MARKER_LEN: usize = 6;
pub const MODERN_HEADER_LEN: usize = 30;
pub const LEGACY_HEADER_LEN: usize = 26;
pub const DIGEST_LEN: usize = 4;

/// Largest original or compressed size a block may declare.
pub const MAX_SIZE: u64 = 512 << 20;

/// A packed block format error.
#[derive(Debug, PartialEq, Eq)]
pub enum FormatError {
    /// Fewer bytes than a header needs.
    Truncated { len: usize, need: usize },
    /// The first six bytes are not a known codec marker.
    Marker,
    /// A declared size is zero or larger than `MAX_SIZE`.
    Size { field: &'static str, value: u64 },
    /// The compressed size is out of proportion to the original size.
    Ratio { original: u64, compressed: u64 },
    /// The filtered size is outside the range a filter can produce.
    FilteredSize { original: u64, filtered: u64 },
}

#[cfg(feature = "std")]
impl std::error::Error for FormatError {}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::Truncated { len, need } =>
                write!(f, "packed block of {} bytes is shorter than {}", len, need),
            FormatError::Marker =>
                write!(f, "unknown packed block marker"),
            FormatError::Size { field, value } =>
                write!(f, "implausible {} {}", field, value),
            FormatError::Ratio { original, compressed } =>
                write!(f, "compressed size {} is implausible for original size {}", compressed, original),
            FormatError::FilteredSize { original, filtered } =>
                write!(f, "filtered size {} is implausible for original size {}", filtered, original),
        }
    }
}

/// Which header layout a block uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Modern,
    Legacy,
}

impl Layout {
    pub fn for_flags(flags: Flags) -> Layout {
        if flags.contains(Flags::BCJ) { Layout::Modern } else { Layout::Legacy }
    }

    pub fn header_len(self) -> usize {
        match self {
            Layout::Modern => MODERN_HEADER_LEN,
            Layout::Legacy => LEGACY_HEADER_LEN,
        }
    }
}

/// A decoded packed block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedHeader {
    pub codec: CodecId,
    pub original_size: u64,
    pub entry_offset: u64,
    pub compressed_size: u32,
    /// Present in the modern layout.
    pub filtered_size: Option<u32>,
}

impl PackedHeader {
    pub fn layout(&self) -> Layout {
        if self.filtered_size.is_some() { Layout::Modern } else { Layout::Legacy }
    }

    pub fn len(&self) -> usize {
        self.layout().header_len()
    }

    /// Parses a header laid out as `layout` at the start of `buf`. Checks
    /// only the marker; see `check_plausible`.
    pub fn parse(buf: &[u8], layout: Layout) -> Result<Self, FormatError> {
        let need = layout.header_len();
        if buf.len() < need {
            return Err(FormatError::Truncated { len: buf.len(), need });
        }
        let codec = CodecId::from_marker(&buf[..MARKER_LEN]).ok_or(FormatError::Marker)?;
        Ok(PackedHeader {
            codec,
            original_size: read_u64(buf, 6),
            entry_offset: read_u64(buf, 14),
            compressed_size: read_u32(buf, 22),
            filtered_size: match layout {
                Layout::Modern => Some(read_u32(buf, 26)),
                Layout::Legacy => None,
            },
        })
    }

    /// Serializes the header. Only the first `self.len()` bytes are used.
    pub fn to_bytes(&self) -> [u8; MODERN_HEADER_LEN] {
        let mut out = [0; MODERN_HEADER_LEN];
        out[..MARKER_LEN].copy_from_slice(&self.codec.marker());
        out[6..14].copy_from_slice(&self.original_size.to_le_bytes());
        out[14..22].copy_from_slice(&self.entry_offset.to_le_bytes());
        out[22..26].copy_from_slice(&self.compressed_size.to_le_bytes());
        if let Some(filtered) = self.filtered_size {
            out[26..30].copy_from_slice(&filtered.to_le_bytes());
        }
        out
    }

    /// Size of the decompressed stream: the filtered size when there is one.
    pub fn stream_size(&self) -> u64 {
        match self.filtered_size {
            Some(filtered) => u64::from(filtered),
            None => self.original_size,
        }
    }

    /// Header, compressed bytes, and digest trailer together.
    pub fn block_len(&self, digest: bool) -> usize {
        self.len() + self.compressed_size as usize + if digest { DIGEST_LEN } else { 0 }
    }

    /// Rejects sizes no packer would have written.
    pub fn check_plausible(&self) -> Result<(), FormatError> {
        let original = self.original_size;
        let compressed = u64::from(self.compressed_size);
        if original == 0 || original > MAX_SIZE {
            return Err(FormatError::Size { field: "original size", value: original });
        }
        if compressed == 0 || compressed > MAX_SIZE {
            return Err(FormatError::Size { field: "compressed size", value: compressed });
        }
        if compressed >= 4 * original + (1 << 20) {
            return Err(FormatError::Ratio { original, compressed });
        }
        if let Some(filtered) = self.filtered_size {
            let filtered = u64::from(filtered);
            if filtered < original || filtered > original + original / 8 + (64 << 10) {
                return Err(FormatError::FilteredSize { original, filtered });
            }
        }
        Ok(())
    }
}

/// A packed block located in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedBlock<'a> {
    pub header: PackedHeader,
    pub compressed: &'a [u8],
    pub digest: Option<u32>,
}

impl<'a> PackedBlock<'a> {
    /// Parses and checks a whole block at the start of `buf`.
    pub fn parse(buf: &'a [u8], flags: Flags) -> Result<Self, FormatError> {
        let header = PackedHeader::parse(buf, Layout::for_flags(flags))?;
        header.check_plausible()?;
        let has_digest = flags.contains(Flags::DIGEST);
        let need = header.block_len(has_digest);
        if buf.len() < need {
            return Err(FormatError::Truncated { len: buf.len(), need });
        }
        let start = header.len();
        let end = start + header.compressed_size as usize;
        let digest = if has_digest { Some(read_u32(buf, end)) } else { None };
        Ok(PackedBlock { header, compressed: &buf[start..end], digest })
    }

    /// Whether `stream` is what this block decompresses to.
    pub fn digest_ok(&self, stream: &[u8]) -> bool {
        match self.digest {
            Some(digest) => crate::codec::digest(stream) == digest,
            None => true,
        }
    }
}

/// Builds a complete block from a header and its compressed bytes, setting
/// `compressed_size` from `compressed`. `digest` is over the decompressed
/// stream.
#[cfg(feature = "std")]
pub fn build(mut header: PackedHeader, compressed: &[u8], digest: Option<u32>) -> Result<Vec<u8>, FormatError> {
    header.compressed_size = u32::try_from(compressed.len())
        .map_err(|_| FormatError::Size { field: "compressed size", value: compressed.len() as u64 })?;
    header.check_plausible()?;
    let mut out = Vec::with_capacity(header.block_len(digest.is_some()));
    out.extend_from_slice(&header.to_bytes()[..header.len()]);
    out.extend_from_slice(compressed);
    if let Some(digest) = digest {
        out.extend_from_slice(&digest.to_le_bytes());
    }
    Ok(out)
}
