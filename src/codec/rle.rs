//! Copy/Fill run-length codec in the style of Microsoft EXEPACK.
//!
//! A stream is a little-endian `u32` uncompressed length followed by the
//! command stream. Commands are read back to front and their output is also
//! written back to front, into the same buffer that holds the compressed
//! data, so decompression needs no second buffer. That property is what the
//! stage-0 wrapper relies on.
//!
//! Command encoding, as seen when reading backwards: a command byte (0xb2
//! Copy, 0xb0 Fill, low bit set on the final command), a 16-bit length, and
//! then either the fill byte or `length` literal bytes. Bytes before the
//! final command are copied through unchanged (the "runout").
//!
//! # References
//!
//! * <http://www.shikadi.net/moddingwiki/Microsoft_EXEPACK#Decompression_algorithm>

use core::fmt;

use super::{Codec, CodecError, CodecId};
use crate::le::read_u16;

const COPY: u8 = 0xb2;
const FILL: u8 = 0xb0;
const FINAL: u8 = 0x01;

/// An error from the back-to-front decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum RleError {
    /// Decompression reached the beginning of the compressed data before
    /// finding a termination command.
    SrcOverflow,
    /// A Fill command would extend past the beginning of the uncompressed data.
    FillOverflow { dst: usize, src: usize, command: u8, length: usize, fill: u8 },
    /// A Copy command would extend past the beginning of the uncompressed data.
    CopyOverflow { dst: usize, src: usize, command: u8, length: usize },
    /// The command byte was not any recognized command (Copy or Fill).
    UnknownCommand { src: usize, command: u8 },
    /// Decompression left a gap of uninitialized bytes between the decompressed
    /// data and the end of the original compressed data.
    Gap { dst: usize, compressed_len: usize },
}

#[cfg(feature = "std")]
impl std::error::Error for RleError {}

impl fmt::Display for RleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RleError::SrcOverflow =>
                write!(f, "read overflow: reached the end of compressed data before seeing a termination command"),
            RleError::FillOverflow { dst, length, fill, .. } =>
                write!(f, "write overflow: fill {}×'\\{:02x}' at index {}", length, fill, dst),
            RleError::CopyOverflow { dst, length, .. } =>
                write!(f, "write overflow: copy {} bytes at index {}", length, dst),
            RleError::UnknownCommand { src, command } =>
                write!(f, "unknown command {:#02x} at index {}", command, src),
            RleError::Gap { dst, compressed_len } =>
                write!(f, "decompression left a gap of unwritten bytes between write index {} and original read index {}", dst, compressed_len),
        }
    }
}

/// The EXEPACK-style codec.
pub struct Rle;

impl Codec for Rle {
    const ID: CodecId = CodecId::Rle;

    fn decompress(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        if src.len() < 4 {
            return Err(CodecError::Truncated { at: src.len() });
        }
        let uncompressed_len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let body = &src[4..];
        if dst.len() < body.len().max(uncompressed_len) {
            return Err(CodecError::OutputOverflow { capacity: dst.len() });
        }
        dst[..body.len()].copy_from_slice(body);
        decompress_in_place(dst, body.len(), uncompressed_len)?;
        Ok(uncompressed_len)
    }

    fn signature_ok(stream: &[u8]) -> bool {
        // Decoding starts from the last byte, which is always a command.
        match stream.last() {
            Some(&command) if stream.len() >= 7 => command & 0xfe == COPY || command & 0xfe == FILL,
            _ => false,
        }
    }

    #[cfg(feature = "std")]
    fn compress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
        let len = u32::try_from(src.len())
            .map_err(|_| CodecError::Encoder(format!("input of {} bytes is too large", src.len())))?;
        let mut output = Vec::with_capacity(src.len() / 2 + 16);
        output.extend_from_slice(&len.to_le_bytes());
        compress(&mut output, src);
        Ok(output)
    }
}

/// The basic compression loop. The compressed data are read (going forwards)
/// from `input` and written into the end of `output`.
#[cfg(feature = "std")]
pub(crate) fn compress(output: &mut Vec<u8>, input: &[u8]) {
    // The algorithm uses dynamic programming over three notional cost
    // tables. "Cost" is the minimum number of bytes needed to compress a
    // prefix of the input:
    //
    //  * C[i] = the cost to compress input[..i], if we are in a Copy command at
    //           index i.
    //  * F[i] = the cost to compress input[..i], if we are in a Fill command at
    //           index i.
    //  * R[i] = the cost to compress input[..i], if we do not use any Copy or
    //           Fill commands up to index i. The R stands for "runout".
    //
    // with C[-1] = F[-1] = R[-1] = 0 and
    //   C[i] = min(min(C[i-1], F[i-1], R[i-1]) + 4, C[i-1] + 1)
    //   F[i] = min(min(C[i-1], F[i-1], R[i-1]) + 4, F[i-1] + 0 if input[i] == input[i-1])
    //   R[i] = i + 1, plus 3 at the last index for the mandatory dummy command.
    //
    // Along with every cost we store the command length that got us there,
    // pick the cheapest command at each index, walk the resulting table from
    // the end keeping only reachable commands, and emit them front to back.
    //
    // A greedy choice (Fill for runs of 5 or more, Copy otherwise) is worse:
    //      ... 01 02 03 04 05 cc cc cc cc cc 01 02 03 04 05
    // costs 20 bytes as Copy/Fill/Copy but 18 as one long Copy.

    // The maximum length of a Copy or Fill command.
    const MAX_LEN: u16 = 0xffff;

    #[derive(Clone, Copy)]
    enum Command {
        Copy(u16),
        Fill(u16),
        Runout,
    }
    let mut commands: Vec<Command> = Vec::with_capacity(input.len());

    #[derive(Clone, Copy)]
    struct Entry {
        cost: usize,
        len: u16,
    }
    // Each recurrence only looks one index back, so keep just the most
    // recent entries: at the top of the loop copy.cost == C[i-1],
    // fill.cost == F[i-1], runout_cost == R[i-1].
    let mut copy = Entry { cost: 0, len: 0 };
    let mut fill = Entry { cost: 0, len: 0 };
    let mut runout_cost: usize = 0;
    for i in 0..input.len() {
        let prev_min_cost = copy.cost.min(fill.cost).min(runout_cost);

        let start = Entry { cost: prev_min_cost + 4, len: 1 };
        copy = if i > 0 && copy.len < MAX_LEN && copy.cost + 1 < start.cost {
            Entry { cost: copy.cost + 1, len: copy.len + 1 }
        } else {
            start
        };
        fill = if i > 0 && input[i] == input[i - 1] && fill.len < MAX_LEN && fill.cost < start.cost {
            Entry { cost: fill.cost, len: fill.len + 1 }
        } else {
            start
        };

        runout_cost = if i < input.len() - 1 {
            i + 1
        } else {
            i + 1 + 3
        };

        // Ties go to the runout, then Copy.
        let mut cmd = (runout_cost, Command::Runout);
        if copy.cost < cmd.0 {
            cmd = (copy.cost, Command::Copy(copy.len));
        }
        if fill.cost < cmd.0 {
            cmd = (fill.cost, Command::Fill(fill.len));
        }
        commands.push(cmd.1);
    }

    // Retain only the commands that are reachable, starting from the end.
    let mut commands_subset = Vec::new();
    let mut i = commands.len();
    while i > 0 {
        let cmd = commands[i - 1];
        match cmd {
            Command::Copy(len) => i -= usize::from(len),
            Command::Fill(len) => i -= usize::from(len),
            Command::Runout => break,
        }
        commands_subset.push(cmd);
    }

    // i now points to the end of the runout, which is copied as a block.
    output.extend_from_slice(&input[..i]);

    let mut is_final = FINAL;
    // commands_subset is in decompression order (back to front).
    for cmd in commands_subset.into_iter().rev() {
        match cmd {
            Command::Copy(len) => {
                output.extend_from_slice(&input[i..(i + usize::from(len))]);
                output.extend_from_slice(&len.to_le_bytes());
                output.push(COPY | is_final);
                i += usize::from(len);
            }
            Command::Fill(len) => {
                output.push(input[i]);
                output.extend_from_slice(&len.to_le_bytes());
                output.push(FILL | is_final);
                i += usize::from(len);
            }
            Command::Runout => unreachable!(),
        }
        is_final = 0;
    }
    // With no Copy or Fill command at all, append a length-zero Copy so the
    // decoder has something to terminate on.
    if is_final != 0 {
        output.extend_from_slice(&0u16.to_le_bytes());
        output.push(COPY | FINAL);
    }
}

/// The basic decompression loop. The compressed data are read (going
/// backwards) from `buf[..compressed_len]`, and written (also going
/// backwards) into `buf[..uncompressed_len]`. `buf` must be at least as long
/// as either length.
pub fn decompress_in_place(buf: &mut [u8], compressed_len: usize, uncompressed_len: usize)
-> Result<(), RleError> {
    let mut src = compressed_len;
    let mut dst = uncompressed_len;

    loop {
        // Read the command byte.
        src = src.checked_sub(1).ok_or(RleError::SrcOverflow)?;
        let command = buf[src];

        // Read the 16-bit length.
        src = src.checked_sub(2).ok_or(RleError::SrcOverflow)?;
        let length = usize::from(read_u16(buf, src));

        match command & 0xfe {
            FILL => {
                src = src.checked_sub(1).ok_or(RleError::SrcOverflow)?;
                let fill = buf[src];
                dst = dst.checked_sub(length).ok_or(RleError::FillOverflow { dst, src, command, length, fill })?;
                for b in &mut buf[dst..dst + length] {
                    *b = fill;
                }
            }
            COPY => {
                src = src.checked_sub(length).ok_or(RleError::SrcOverflow)?;
                dst = dst.checked_sub(length).ok_or(RleError::CopyOverflow { dst, src, command, length })?;
                // Back to front, so that an overlapping dst > src is safe.
                for i in (0..length).rev() {
                    buf[dst + i] = buf[src + i];
                }
            }
            _ => {
                return Err(RleError::UnknownCommand { src: src + 2, command });
            }
        }

        if command & FINAL != 0 {
            break;
        }
    }

    if compressed_len < dst {
        // The dst pointer did not catch up to the end of the original
        // compressed data, leaving a gap of uninitialized bytes.
        return Err(RleError::Gap { dst, compressed_len });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // non-mutating version of decompress_in_place, returning the trimmed,
    // decompressed output.
    fn decompress_new(buf: &[u8], src: usize, dst: usize) -> Result<Vec<u8>, RleError> {
        let mut work: Vec<_> = buf.to_vec();
        if work.len() < dst {
            work.resize(dst, 0);
        }
        decompress_in_place(&mut work, src, dst)?;
        work.truncate(dst);
        Ok(work)
    }

    #[test]
    fn test_decompress_boguscommand() {
        assert_eq!(decompress_new(&[0x00, 0x00, 0xaa], 3, 3), Err(RleError::UnknownCommand { src: 2, command: 0xaa }));
        assert_eq!(decompress_new(&[0x34, 0x12, 0xaa, 0xbb, 0x01, 0x00, COPY], 7, 7), Err(RleError::UnknownCommand { src: 2, command: 0xaa }));
        assert_eq!(decompress_new(&[0x00, 0x34, 0x12, 0xaa, 0xbb, 0x01, 0x00, FILL], 8, 8), Err(RleError::UnknownCommand { src: 3, command: 0xaa }));
    }

    #[test]
    fn test_decompress_srcoverflow() {
        for input in &[
            // empty buffer
            &[] as &[u8],
            // EOF before reading length
            &[FILL | FINAL],
            &[COPY | FINAL],
            // EOF while reading length
            &[0x12, FILL | FINAL],
            &[0x12, COPY | FINAL],
            // EOF before reading fill byte
            &[0x00, 0x00, FILL | FINAL],
            // EOF while reading copy body
            &[0x01, 0x00, COPY | FINAL],
            &[0xaa, 0xaa, 0x08, 0x00, COPY],
        ] {
            assert_eq!(decompress_new(input, input.len(), input.len()), Err(RleError::SrcOverflow), "{:?}", input);
        }
    }

    #[test]
    fn test_decompress_overflow() {
        for &(input, dst) in &[
            (&[0xaa, 0x01, 0x00, FILL | FINAL] as &[u8], 0),
            (&[0xaa, 0x10, 0x00, FILL | FINAL], 15),
        ] {
            match decompress_new(input, input.len(), dst) {
                Err(RleError::FillOverflow { fill: 0xaa, .. }) => (),
                x => panic!("{:?} {:?}", x, (input, dst)),
            }
        }
        for &(input, dst) in &[
            (&[0xaa, 0x01, 0x00, COPY | FINAL] as &[u8], 0),
            (&[0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0x05, 0x00, COPY | FINAL], 2),
        ] {
            match decompress_new(input, input.len(), dst) {
                Err(RleError::CopyOverflow { .. }) => (),
                x => panic!("{:?} {:?}", x, (input, dst)),
            }
        }
    }

    #[test]
    fn test_decompress_gap() {
        for &(input, dst) in &[
            (&[0x00, 0x00, COPY | FINAL] as &[u8], 4),
            (&[0xaa, 0x01, 0x00, COPY | FINAL], 6),
            (&[0xaa, 0x10, 0x00, FILL | FINAL], 21),
        ] {
            match decompress_new(input, input.len(), dst) {
                Err(RleError::Gap { .. }) => (),
                x => panic!("{:?} {:?}", x, (input, dst)),
            }
        }
    }

    #[test]
    fn test_decompress_ok() {
        for &(input, dst, output) in &[
            (&[0x01u8, 0x02, 0x03, 0x04, 0x05, 0x05, 0x00, COPY | FINAL] as &[u8], 5,
             &[0x01u8, 0x02, 0x03, 0x04, 0x05] as &[u8]),
            (&[0x01, 0x02, 0x03, 0x04, 0x05, 0x02, 0x00, COPY | FINAL], 5,
             &[0x01, 0x02, 0x03, 0x04, 0x05]),
            (&[0xaa, 0x04, 0x00, FILL | FINAL], 4,
             &[0xaa, 0xaa, 0xaa, 0xaa]),
            // allow reuse of src bytes, even if they are command bytes
            (&[0x00, 0x00, COPY | FINAL, 0xaa, 0x07, 0x00, FILL], 10,
             &[0x00, 0x00, COPY | FINAL, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]),
            (&[0xaa, 0x04, 0x00, FILL | FINAL], 8,
             &[0xaa, 0x04, 0x00, FILL | FINAL, 0xaa, 0xaa, 0xaa, 0xaa]),
            (&[0x01, 0x02, 0x02, 0x00, COPY | FINAL, 0x00, 0x00, COPY], 5,
             &[0x01, 0x02, 0x02, 0x01, 0x02]),
        ] {
            assert_eq!(&decompress_new(input, input.len(), dst).unwrap(), &output, "{:?}", input);
        }
    }

    #[test]
    fn test_compress_roundtrip() {
        for input in &[
            &[] as &[u8],
            &[1],
            &[1, 2, 3, 4, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 1, 2, 3, 4],
            b"Hellllllllllllllllo, world\n",
            // try compressing command codes themselves
            &[FILL, FILL, FILL, FILL, FILL, FILL, FILL, FILL],
            &[COPY | FINAL, COPY | FINAL, COPY | FINAL, COPY | FINAL, COPY | FINAL, COPY | FINAL],
            // long inputs
            &[0xff; 0xffff + 2],
            &[0x00; 0xffff * 2],
        ] {
            let compressed = Rle::compress(input).unwrap();
            let mut work = vec![0; compressed.len().max(input.len())];
            assert_eq!(Rle::decompress(&compressed, &mut work), Ok(input.len()));
            assert_eq!(&work[..input.len()], *input);
        }
    }

    // Test that compress gets below certain thresholds for certain inputs.
    #[test]
    fn test_compress_density() {
        for &(limit, input) in &[
            // empty input should compress to a length-zero Copy
            (3, &[] as &[u8]),
            (4, &[1]),
            (4, &[1, 1]),
            // cheaper to do the latter part as a long Copy instead of switching
            // Copy, Fill, Copy, Fill
            (22, &[9, 9, 9, 9, 9, 9, 9, 9, 1, 2, 3, 4, 5, 9, 9, 9, 9, 9, 1, 2, 3, 4, 5]),
        ] {
            let mut work = Vec::new();
            compress(&mut work, input);
            assert!(work.len() <= limit, "{} {:?}", work.len(), work);
        }
    }

    #[test]
    fn test_signature() {
        let compressed = Rle::compress(b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0").unwrap();
        assert!(Rle::signature_ok(&compressed));
        assert!(!Rle::signature_ok(&[0x00, 0x00, COPY]));
        assert!(Rle::signature_ok(&[4, 0, 0, 0, 0x00, 0x00, COPY]));
        assert!(!Rle::signature_ok(&[1, 2, 3, 4, 5, 6, 7]));
        assert!(!Rle::signature_ok(&[]));
    }

    #[test]
    fn test_output_too_small() {
        let compressed = Rle::compress(&[0u8; 1000]).unwrap();
        let mut work = vec![0; 999];
        assert_eq!(Rle::decompress(&compressed, &mut work), Err(CodecError::OutputOverflow { capacity: 999 }));
    }
}
