//! Raw LZMA1 with an end-of-stream marker.
//!
//! A stream is the 5-byte LZMA properties header (the `lc`/`lp`/`pb` byte
//! and a little-endian dictionary size) followed by range-coded data that
//! must end with the EOS marker. This is the `.lzma` "alone" format minus
//! its 8-byte uncompressed size field.
//!
//! The decoder writes straight into the output buffer, which doubles as the
//! dictionary. It keeps all probability tables on the stack and rejects
//! streams with `lc + lp > 4`.
//!
//! # References
//!
//! * `DOC/lzma-specification.txt` and `LzmaSpec.cpp` in the LZMA SDK.

use super::{Codec, CodecError, CodecId};
use crate::le::read_u32;

/// The raw LZMA codec.
pub struct Lzma;

pub const HEADER_LEN: usize = 5;

const MIN_DICT: u32 = 1 << 12;
const MAX_DICT: u32 = 1 << 28;

const NUM_STATES: usize = 12;
const POS_BITS_MAX: usize = 4;
const LEN_TO_POS_STATES: usize = 4;
const END_POS_MODEL_INDEX: u32 = 14;
const NUM_FULL_DISTANCES: usize = 1 << (END_POS_MODEL_INDEX >> 1);
const ALIGN_BITS: u32 = 4;
const MATCH_MIN_LEN: usize = 2;
const MAX_LC_LP: u32 = 4;

const PROB_INIT: u16 = 1 << 10;
const TOP: u32 = 1 << 24;

/// Decoded properties byte and dictionary size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Props {
    pub lc: u32,
    pub lp: u32,
    pub pb: u32,
    pub dict_size: u32,
}

impl Props {
    pub fn parse(header: &[u8]) -> Result<Props, CodecError> {
        if header.len() < HEADER_LEN {
            return Err(CodecError::Truncated { at: header.len() });
        }
        let mut d = u32::from(header[0]);
        if d >= 9 * 5 * 5 {
            return Err(CodecError::BadHeader);
        }
        let lc = d % 9;
        d /= 9;
        let lp = d % 5;
        let pb = d / 5;
        let dict_size = read_u32(header, 1).max(MIN_DICT);
        Ok(Props { lc, lp, pb, dict_size })
    }
}

struct RangeDecoder<'a> {
    src: &'a [u8],
    pos: usize,
    range: u32,
    code: u32,
}

impl<'a> RangeDecoder<'a> {
    fn new(src: &'a [u8]) -> Result<Self, CodecError> {
        if src.len() < 5 {
            return Err(CodecError::Truncated { at: src.len() });
        }
        if src[0] != 0 {
            return Err(CodecError::BadHeader);
        }
        let code = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if code == u32::MAX {
            return Err(CodecError::Corrupt { at: 1 });
        }
        Ok(RangeDecoder { src, pos: 5, range: u32::MAX, code })
    }

    #[inline]
    fn normalize(&mut self) -> Result<(), CodecError> {
        if self.range < TOP {
            let b = *self.src.get(self.pos).ok_or(CodecError::Truncated { at: self.pos })?;
            self.pos += 1;
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(b);
        }
        Ok(())
    }

    #[inline]
    fn bit(&mut self, prob: &mut u16) -> Result<u32, CodecError> {
        let bound = (self.range >> 11) * u32::from(*prob);
        let bit = if self.code < bound {
            *prob += ((1 << 11) - *prob) >> 5;
            self.range = bound;
            0
        } else {
            *prob -= *prob >> 5;
            self.code -= bound;
            self.range -= bound;
            1
        };
        self.normalize()?;
        Ok(bit)
    }

    fn direct_bits(&mut self, count: u32) -> Result<u32, CodecError> {
        let mut res = 0u32;
        for _ in 0..count {
            self.range >>= 1;
            self.code = self.code.wrapping_sub(self.range);
            let t = 0u32.wrapping_sub(self.code >> 31);
            self.code = self.code.wrapping_add(self.range & t);
            if self.code == self.range {
                return Err(CodecError::Corrupt { at: self.pos });
            }
            self.normalize()?;
            res = (res << 1).wrapping_add(t.wrapping_add(1));
        }
        Ok(res)
    }
}

fn bit_tree(rc: &mut RangeDecoder, probs: &mut [u16], num_bits: u32) -> Result<u32, CodecError> {
    let mut m = 1usize;
    for _ in 0..num_bits {
        m = (m << 1) + rc.bit(&mut probs[m])? as usize;
    }
    Ok(m as u32 - (1 << num_bits))
}

fn bit_tree_reverse(rc: &mut RangeDecoder, probs: &mut [u16], num_bits: u32) -> Result<u32, CodecError> {
    let mut m = 1usize;
    let mut symbol = 0;
    for i in 0..num_bits {
        let bit = rc.bit(&mut probs[m])?;
        m = (m << 1) + bit as usize;
        symbol |= bit << i;
    }
    Ok(symbol)
}

struct LenDecoder {
    choice: u16,
    choice2: u16,
    low: [[u16; 8]; 1 << POS_BITS_MAX],
    mid: [[u16; 8]; 1 << POS_BITS_MAX],
    high: [u16; 256],
}

impl LenDecoder {
    fn new() -> Self {
        LenDecoder {
            choice: PROB_INIT,
            choice2: PROB_INIT,
            low: [[PROB_INIT; 8]; 1 << POS_BITS_MAX],
            mid: [[PROB_INIT; 8]; 1 << POS_BITS_MAX],
            high: [PROB_INIT; 256],
        }
    }

    fn decode(&mut self, rc: &mut RangeDecoder, pos_state: usize) -> Result<usize, CodecError> {
        if rc.bit(&mut self.choice)? == 0 {
            return Ok(bit_tree(rc, &mut self.low[pos_state], 3)? as usize);
        }
        if rc.bit(&mut self.choice2)? == 0 {
            return Ok(8 + bit_tree(rc, &mut self.mid[pos_state], 3)? as usize);
        }
        Ok(16 + bit_tree(rc, &mut self.high, 8)? as usize)
    }
}

struct Model {
    literal: [u16; 0x300 << MAX_LC_LP],
    is_match: [u16; NUM_STATES << POS_BITS_MAX],
    is_rep: [u16; NUM_STATES],
    is_rep_g0: [u16; NUM_STATES],
    is_rep_g1: [u16; NUM_STATES],
    is_rep_g2: [u16; NUM_STATES],
    is_rep0_long: [u16; NUM_STATES << POS_BITS_MAX],
    pos_slot: [[u16; 1 << 6]; LEN_TO_POS_STATES],
    pos: [u16; 1 + NUM_FULL_DISTANCES - END_POS_MODEL_INDEX as usize],
    align: [u16; 1 << ALIGN_BITS],
    len: LenDecoder,
    rep_len: LenDecoder,
}

impl Model {
    fn new() -> Self {
        Model {
            literal: [PROB_INIT; 0x300 << MAX_LC_LP],
            is_match: [PROB_INIT; NUM_STATES << POS_BITS_MAX],
            is_rep: [PROB_INIT; NUM_STATES],
            is_rep_g0: [PROB_INIT; NUM_STATES],
            is_rep_g1: [PROB_INIT; NUM_STATES],
            is_rep_g2: [PROB_INIT; NUM_STATES],
            is_rep0_long: [PROB_INIT; NUM_STATES << POS_BITS_MAX],
            pos_slot: [[PROB_INIT; 1 << 6]; LEN_TO_POS_STATES],
            pos: [PROB_INIT; 1 + NUM_FULL_DISTANCES - END_POS_MODEL_INDEX as usize],
            align: [PROB_INIT; 1 << ALIGN_BITS],
            len: LenDecoder::new(),
            rep_len: LenDecoder::new(),
        }
    }

    fn distance(&mut self, rc: &mut RangeDecoder, len: usize) -> Result<u32, CodecError> {
        let len_state = len.min(LEN_TO_POS_STATES - 1);
        let slot = bit_tree(rc, &mut self.pos_slot[len_state], 6)?;
        if slot < 4 {
            return Ok(slot);
        }
        let direct = (slot >> 1) - 1;
        let mut dist = (2 | (slot & 1)) << direct;
        if slot < END_POS_MODEL_INDEX {
            let base = (dist - slot) as usize;
            dist += bit_tree_reverse(rc, &mut self.pos[base..], direct)?;
        } else {
            dist += rc.direct_bits(direct - ALIGN_BITS)? << ALIGN_BITS;
            dist += bit_tree_reverse(rc, &mut self.align, ALIGN_BITS)?;
        }
        Ok(dist)
    }
}

fn next_state_literal(state: usize) -> usize {
    match state {
        0..=3 => 0,
        4..=9 => state - 3,
        _ => state - 6,
    }
}

impl Codec for Lzma {
    const ID: CodecId = CodecId::Lzma;

    fn decompress(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        let props = Props::parse(src)?;
        if props.lc + props.lp > MAX_LC_LP {
            return Err(CodecError::Unsupported { what: "lc + lp above 4" });
        }
        let mut rc = RangeDecoder::new(&src[HEADER_LEN..])?;
        let mut model = Model::new();

        let lc = props.lc;
        let lp_mask = (1usize << props.lp) - 1;
        let pb_mask = (1usize << props.pb) - 1;
        let dict_size = props.dict_size as usize;

        let mut state = 0usize;
        let mut reps = [0usize; 4];
        let mut pos = 0usize;

        loop {
            let pos_state = pos & pb_mask;

            if rc.bit(&mut model.is_match[(state << POS_BITS_MAX) + pos_state])? == 0 {
                if pos >= dst.len() {
                    return Err(CodecError::OutputOverflow { capacity: dst.len() });
                }
                let prev = if pos > 0 { dst[pos - 1] } else { 0 };
                let lit_state = ((pos & lp_mask) << lc) + (usize::from(prev) >> (8 - lc));
                let probs = &mut model.literal[0x300 * lit_state..0x300 * (lit_state + 1)];
                let mut symbol = 1usize;
                if state >= 7 {
                    let mut match_byte = u32::from(dst[pos - reps[0] - 1]);
                    while symbol < 0x100 {
                        let match_bit = ((match_byte >> 7) & 1) as usize;
                        match_byte <<= 1;
                        let bit = rc.bit(&mut probs[((1 + match_bit) << 8) + symbol])? as usize;
                        symbol = (symbol << 1) | bit;
                        if match_bit != bit {
                            break;
                        }
                    }
                }
                while symbol < 0x100 {
                    symbol = (symbol << 1) | rc.bit(&mut probs[symbol])? as usize;
                }
                dst[pos] = (symbol - 0x100) as u8;
                pos += 1;
                state = next_state_literal(state);
                continue;
            }

            let len;
            if rc.bit(&mut model.is_rep[state])? != 0 {
                if pos == 0 {
                    return Err(CodecError::Corrupt { at: rc.pos });
                }
                if rc.bit(&mut model.is_rep_g0[state])? == 0 {
                    if rc.bit(&mut model.is_rep0_long[(state << POS_BITS_MAX) + pos_state])? == 0 {
                        // Short rep: one byte from rep0.
                        state = if state < 7 { 9 } else { 11 };
                        if pos >= dst.len() {
                            return Err(CodecError::OutputOverflow { capacity: dst.len() });
                        }
                        dst[pos] = dst[pos - reps[0] - 1];
                        pos += 1;
                        continue;
                    }
                } else {
                    let dist;
                    if rc.bit(&mut model.is_rep_g1[state])? == 0 {
                        dist = reps[1];
                    } else {
                        if rc.bit(&mut model.is_rep_g2[state])? == 0 {
                            dist = reps[2];
                        } else {
                            dist = reps[3];
                            reps[3] = reps[2];
                        }
                        reps[2] = reps[1];
                    }
                    reps[1] = reps[0];
                    reps[0] = dist;
                }
                len = model.rep_len.decode(&mut rc, pos_state)?;
                state = if state < 7 { 8 } else { 11 };
            } else {
                reps[3] = reps[2];
                reps[2] = reps[1];
                reps[1] = reps[0];
                len = model.len.decode(&mut rc, pos_state)?;
                state = if state < 7 { 7 } else { 10 };
                let dist = model.distance(&mut rc, len)?;
                if dist == u32::MAX {
                    // End marker.
                    if rc.code != 0 {
                        return Err(CodecError::Corrupt { at: rc.pos });
                    }
                    return Ok(pos);
                }
                reps[0] = dist as usize;
                if reps[0] >= dict_size || reps[0] >= pos {
                    return Err(CodecError::BadDistance { distance: reps[0] + 1, pos });
                }
            }

            let len = len + MATCH_MIN_LEN;
            if pos + len > dst.len() {
                return Err(CodecError::OutputOverflow { capacity: dst.len() });
            }
            let from = pos - reps[0] - 1;
            for k in 0..len {
                dst[pos + k] = dst[from + k];
            }
            pos += len;
        }
    }

    fn signature_ok(stream: &[u8]) -> bool {
        let props = match Props::parse(stream) {
            Ok(props) => props,
            Err(_) => return false,
        };
        let dict = read_u32(stream, 1);
        (MIN_DICT..=MAX_DICT).contains(&dict)
            && props.lc + props.lp <= MAX_LC_LP
            && stream.get(HEADER_LEN) == Some(&0)
    }

    #[cfg(feature = "std")]
    fn compress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
        compress(src, 9)
    }
}

/// Dictionary size for an input of `len` bytes: the next power of two,
/// kept between 64 KiB and 64 MiB.
pub fn dict_size(len: usize) -> u32 {
    len.max(1 << 16).next_power_of_two().clamp(1 << 16, 1 << 26) as u32
}

/// Compresses with liblzma's `.lzma` encoder and drops the size field.
#[cfg(feature = "std")]
pub(crate) fn compress(src: &[u8], preset: u32) -> Result<Vec<u8>, CodecError> {
    use std::io::Write;
    use xz2::stream::{LzmaOptions, Stream};

    const ALONE_HEADER_LEN: usize = HEADER_LEN + 8;

    let encoder_error = |err: &dyn std::fmt::Display| CodecError::Encoder(err.to_string());

    let mut options = LzmaOptions::new_preset(preset).map_err(|e| encoder_error(&e))?;
    options.dict_size(dict_size(src.len()));
    let stream = Stream::new_lzma_encoder(&options).map_err(|e| encoder_error(&e))?;
    let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(src).map_err(|e| encoder_error(&e))?;
    let alone = encoder.finish().map_err(|e| encoder_error(&e))?;
    if alone.len() < ALONE_HEADER_LEN {
        return Err(CodecError::Encoder(format!("{}-byte .lzma stream", alone.len())));
    }

    let mut out = Vec::with_capacity(alone.len() - 8);
    out.extend_from_slice(&alone[..HEADER_LEN]);
    out.extend_from_slice(&alone[ALONE_HEADER_LEN..]);
    Ok(out)
}
