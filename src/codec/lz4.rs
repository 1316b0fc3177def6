//! LZ4 block format, without the frame layer.
//!
//! A block is a run of sequences. Each sequence is a token byte (high nibble
//! literal length, low nibble match length minus 4), optional extra length
//! bytes, the literals, a 16-bit little-endian match offset, and optional
//! extra match length bytes. The final sequence carries only literals.
//!
//! # References
//!
//! * <https://github.com/lz4/lz4/blob/dev/doc/lz4_Block_format.md>

use super::{Codec, CodecError, CodecId};
use crate::elf::ELFMAG;

const MIN_MATCH: usize = 4;

/// The LZ4 block codec.
pub struct Lz4;

/// Reads an extended length starting at `src[*i]` and adds it to `len`.
fn read_length(src: &[u8], i: &mut usize, mut len: usize) -> Result<usize, CodecError> {
    loop {
        let b = *src.get(*i).ok_or(CodecError::Truncated { at: *i })?;
        *i += 1;
        len = len.checked_add(usize::from(b)).ok_or(CodecError::Corrupt { at: *i })?;
        if b != 0xff {
            return Ok(len);
        }
    }
}

impl Codec for Lz4 {
    const ID: CodecId = CodecId::Lz4;

    fn decompress(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        let mut i = 0;
        let mut o: usize = 0;
        loop {
            let token = *src.get(i).ok_or(CodecError::Truncated { at: i })?;
            i += 1;

            let mut literals = usize::from(token >> 4);
            if literals == 15 {
                literals = read_length(src, &mut i, literals)?;
            }
            let lit_end = i.checked_add(literals).filter(|&end| end <= src.len())
                .ok_or(CodecError::Truncated { at: i })?;
            let out_end = o.checked_add(literals).filter(|&end| end <= dst.len())
                .ok_or(CodecError::OutputOverflow { capacity: dst.len() })?;
            dst[o..out_end].copy_from_slice(&src[i..lit_end]);
            i = lit_end;
            o = out_end;

            // The last sequence ends right after its literals.
            if i == src.len() {
                return Ok(o);
            }

            if i + 2 > src.len() {
                return Err(CodecError::Truncated { at: i });
            }
            let distance = usize::from(u16::from_le_bytes([src[i], src[i + 1]]));
            i += 2;
            if distance == 0 || distance > o {
                return Err(CodecError::BadDistance { distance, pos: o });
            }

            let mut len = usize::from(token & 0x0f);
            if len == 15 {
                len = read_length(src, &mut i, len)?;
            }
            len += MIN_MATCH;
            if o + len > dst.len() {
                return Err(CodecError::OutputOverflow { capacity: dst.len() });
            }
            // Byte at a time: the match may overlap its own output.
            for k in o..o + len {
                dst[k] = dst[k - distance];
            }
            o += len;
        }
    }

    fn signature_ok(stream: &[u8]) -> bool {
        // The first sequence of an ELF image opens with at least the four
        // magic bytes as literals.
        let token = match stream.first() {
            Some(&token) => token,
            None => return false,
        };
        let mut i = 1;
        let mut literals = usize::from(token >> 4);
        if literals == 15 {
            literals = match read_length(stream, &mut i, literals) {
                Ok(literals) => literals,
                Err(_) => return false,
            };
        }
        let run_fits = i.checked_add(literals).map_or(false, |end| end <= stream.len());
        literals >= ELFMAG.len() && run_fits && stream.get(i..i + ELFMAG.len()) == Some(&ELFMAG[..])
    }

    #[cfg(feature = "std")]
    fn compress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(compress(src))
    }
}

#[cfg(feature = "std")]
fn push_length(out: &mut Vec<u8>, mut len: usize) {
    while len >= 0xff {
        out.push(0xff);
        len -= 0xff;
    }
    out.push(len as u8);
}

#[cfg(feature = "std")]
fn push_sequence(out: &mut Vec<u8>, literals: &[u8], m: Option<(usize, usize)>) {
    let lit_nibble = literals.len().min(15) as u8;
    let match_nibble = match m {
        Some((_, len)) => (len - MIN_MATCH).min(15) as u8,
        None => 0,
    };
    out.push(lit_nibble << 4 | match_nibble);
    if literals.len() >= 15 {
        push_length(out, literals.len() - 15);
    }
    out.extend_from_slice(literals);
    if let Some((distance, len)) = m {
        out.extend_from_slice(&(distance as u16).to_le_bytes());
        if len - MIN_MATCH >= 15 {
            push_length(out, len - MIN_MATCH - 15);
        }
    }
}

/// Greedy single-probe hash compressor.
#[cfg(feature = "std")]
pub(crate) fn compress(src: &[u8]) -> Vec<u8> {
    // The format requires the last 5 bytes to be literals and the last
    // match to start at least 12 bytes before the end.
    const LAST_LITERALS: usize = 5;
    const MF_LIMIT: usize = 12;
    const HASH_LOG: u32 = 16;
    const MAX_DISTANCE: usize = 0xffff;

    let mut out = Vec::with_capacity(src.len() / 2 + 16);
    let mut table = vec![usize::MAX; 1 << HASH_LOG];
    let hash = |i: usize| -> usize {
        let v = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
        (v.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
    };

    let mut anchor = 0;
    let mut i = 0;
    if src.len() > MF_LIMIT {
        let match_limit = src.len() - MF_LIMIT;
        let extend_limit = src.len() - LAST_LITERALS;
        while i < match_limit {
            let h = hash(i);
            let candidate = table[h];
            table[h] = i;
            if candidate != usize::MAX && i - candidate <= MAX_DISTANCE
                && src[candidate..candidate + MIN_MATCH] == src[i..i + MIN_MATCH]
            {
                let mut len = MIN_MATCH;
                while i + len < extend_limit && src[candidate + len] == src[i + len] {
                    len += 1;
                }
                push_sequence(&mut out, &src[anchor..i], Some((i - candidate, len)));
                i += len;
                anchor = i;
                if i < match_limit {
                    table[hash(i - 2)] = i - 2;
                }
            } else {
                i += 1;
            }
        }
    }
    push_sequence(&mut out, &src[anchor..], None);
    out
}
