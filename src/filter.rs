//! Reversible branch-address filters.
//!
//! Both filters turn relative branch targets into absolute ones so repeated
//! calls to the same function become repeated byte strings. They work in
//! place, keep the length, and use position 0 as the origin of the buffer.
//!
//! # References
//!
//! * `src/liblzma/simple/x86.c` and `src/liblzma/simple/arm64.c` in XZ Utils.

use core::fmt;

use crate::elf::Arch;
use crate::params::Flags;

/// A filter applied to the whole image before compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    None,
    Bcj,
}

/// A filter error.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterError {
    /// A length-preserving filter was handed a stream of the wrong size.
    Length { filtered: usize, original: usize },
}

#[cfg(feature = "std")]
impl std::error::Error for FilterError {}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FilterError::Length { filtered, original } =>
                write!(f, "filtered stream is {} bytes, expected {}", filtered, original),
        }
    }
}

impl Filter {
    pub fn from_flags(flags: Flags) -> Filter {
        if flags.contains(Flags::BCJ) { Filter::Bcj } else { Filter::None }
    }

    pub fn flags(self) -> Flags {
        match self {
            Filter::None => Flags::empty(),
            Filter::Bcj => Flags::BCJ,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Filter::None => "none",
            Filter::Bcj => "bcj",
        }
    }

    /// Transforms `buf` for compression and returns the filtered length.
    pub fn encode(self, arch: Arch, buf: &mut [u8]) -> usize {
        match (self, arch) {
            (Filter::None, _) => (),
            (Filter::Bcj, Arch::X86_64) => bcj_x86(buf, true),
            (Filter::Bcj, Arch::Aarch64) => bcj_arm64(buf, true),
        }
        buf.len()
    }

    /// Reverses `encode`. Returns the number of original bytes in `buf`.
    pub fn decode(self, arch: Arch, buf: &mut [u8], original_len: usize) -> Result<usize, FilterError> {
        if buf.len() != original_len {
            return Err(FilterError::Length { filtered: buf.len(), original: original_len });
        }
        match (self, arch) {
            (Filter::None, _) => (),
            (Filter::Bcj, Arch::X86_64) => bcj_x86(buf, false),
            (Filter::Bcj, Arch::Aarch64) => bcj_arm64(buf, false),
        }
        Ok(original_len)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_ms_byte(b: u8) -> bool {
    b == 0x00 || b == 0xff
}

/// x86 CALL/JMP rel32 conversion.
fn bcj_x86(buf: &mut [u8], encoding: bool) {
    const ALLOWED: [bool; 8] = [true, true, true, false, true, false, false, false];
    const BIT_NUMBER: [u32; 8] = [0, 1, 2, 2, 3, 3, 3, 3];

    if buf.len() < 5 {
        return;
    }
    let mut prev_mask = 0u32;
    let mut prev_pos = 0u32.wrapping_sub(5);
    let limit = buf.len() - 5;
    let mut i = 0;
    while i <= limit {
        let opcode = buf[i];
        if opcode != 0xe8 && opcode != 0xe9 {
            i += 1;
            continue;
        }
        let pos = i as u32;
        let offset = pos.wrapping_sub(prev_pos);
        prev_pos = pos;
        if offset > 5 {
            prev_mask = 0;
        } else {
            for _ in 0..offset {
                prev_mask &= 0x77;
                prev_mask <<= 1;
            }
        }

        let b = buf[i + 4];
        if is_ms_byte(b) && ALLOWED[((prev_mask >> 1) & 7) as usize] && (prev_mask >> 1) < 0x10 {
            let mut src = u32::from_le_bytes([buf[i + 1], buf[i + 2], buf[i + 3], b]);
            let mut dest;
            loop {
                dest = if encoding {
                    src.wrapping_add(pos.wrapping_add(5))
                } else {
                    src.wrapping_sub(pos.wrapping_add(5))
                };
                if prev_mask == 0 {
                    break;
                }
                let index = BIT_NUMBER[(prev_mask >> 1) as usize];
                if !is_ms_byte((dest >> (24 - index * 8)) as u8) {
                    break;
                }
                src = dest ^ ((1u32 << (32 - index * 8)) - 1);
            }
            // Sign-extend bit 24 into the top byte.
            let top = !(((dest >> 24) & 1).wrapping_sub(1)) as u8;
            buf[i + 1..i + 4].copy_from_slice(&dest.to_le_bytes()[..3]);
            buf[i + 4] = top;
            i += 5;
            prev_mask = 0;
        } else {
            i += 1;
            prev_mask |= 1;
            if is_ms_byte(b) {
                prev_mask |= 0x10;
            }
        }
    }
}

/// AArch64 B/BL imm26 and ADRP conversion.
fn bcj_arm64(buf: &mut [u8], encoding: bool) {
    let len = buf.len() & !3;
    for i in (0..len).step_by(4) {
        let mut instr = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let pc = i as u32;
        let op6 = instr >> 26;
        if op6 == 0x05 || op6 == 0x25 {
            let adj = pc >> 2;
            let imm = instr & 0x03ff_ffff;
            let imm = if encoding { imm.wrapping_add(adj) } else { imm.wrapping_sub(adj) };
            instr = (instr & 0xfc00_0000) | (imm & 0x03ff_ffff);
        } else if instr & 0x9f00_0000 == 0x9000_0000 {
            let addr = ((instr >> 29) & 3) | ((instr >> 3) & 0x001f_fffc);
            // Only pages within +/-512 MiB, so decoding sees the same test.
            if addr.wrapping_add(0x0002_0000) & 0x001c_0000 != 0 {
                continue;
            }
            let adj = pc >> 12;
            let addr = if encoding { addr.wrapping_add(adj) } else { addr.wrapping_sub(adj) };
            instr &= 0x9000_001f;
            instr |= (addr & 3) << 29;
            instr |= (addr & 0x0003_fffc) << 3;
            instr |= 0u32.wrapping_sub(addr & 0x0002_0000) & 0x00e0_0000;
        } else {
            continue;
        }
        buf[i..i + 4].copy_from_slice(&instr.to_le_bytes());
    }
}

// Images smaller than this don't repay the filter.
#[cfg(feature = "std")]
const MIN_AUTO_SIZE: usize = 16 * 1024;

/// Savings, in thousandths of the plain size, that BCJ must reach before
/// the automatic choice picks it. `None` means never pick it.
#[cfg(feature = "std")]
fn auto_threshold_permille(codec: crate::codec::CodecId) -> Option<usize> {
    use crate::codec::CodecId;
    match codec {
        CodecId::Lz4 | CodecId::Lzma => Some(3),
        CodecId::Rle => None,
    }
}

/// Picks a filter for `image` by compressing it with and without BCJ using
/// the fast codec as a proxy.
#[cfg(feature = "std")]
pub fn choose(arch: Arch, codec: crate::codec::CodecId, image: &[u8], has_exec: bool) -> Filter {
    use crate::codec::lz4;

    let threshold = match auto_threshold_permille(codec) {
        Some(threshold) if has_exec && image.len() >= MIN_AUTO_SIZE => threshold,
        _ => {
            debug!("filter: none ({} bytes, exec segment {})", image.len(), has_exec);
            return Filter::None;
        }
    };
    let plain = lz4::compress(image).len();
    let mut filtered = image.to_vec();
    Filter::Bcj.encode(arch, &mut filtered);
    let bcj = lz4::compress(&filtered).len();
    let saved = plain.saturating_sub(bcj);
    debug!("filter: proxy sizes plain {} bcj {} (saves {}/1000)", plain, bcj, saved * 1000 / plain.max(1));
    if saved * 1000 >= plain * threshold {
        Filter::Bcj
    } else {
        Filter::None
    }
}
