//! Finding a packed block in process memory by its marker.
//!
//! Used when the parameter block carries no address for the packed data.
//! The candidate regions come from `/proc/self/maps`, starting at the
//! mapping that contains the stub.

use crate::codec::{Codec, CodecId};
use crate::container::{PackedBlock, MARKER_LEN};
use crate::params::Flags;

/// Most mappings looked at past the one holding the stub.
pub const MAX_VMAS: usize = 16;
/// How far past the stub's mapping the search may go.
pub const MAX_SPAN: u64 = 512 << 20;

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub perms: [u8; 4],
}

impl Vma {
    pub fn readable(&self) -> bool {
        self.perms[0] == b'r'
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

fn parse_hex(s: &[u8]) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    let mut v = 0u64;
    for &c in s {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return None,
        };
        v = v << 4 | u64::from(digit);
    }
    Some(v)
}

/// Parses `start-end perms ...`.
pub fn parse_line(line: &[u8]) -> Option<Vma> {
    let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let dash = range.iter().position(|&b| b == b'-')?;
    let start = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;
    if perms.len() < 4 || end <= start {
        return None;
    }
    Some(Vma { start, end, perms: [perms[0], perms[1], perms[2], perms[3]] })
}

/// The mappings in a maps file, skipping lines that don't parse.
pub fn vmas(maps: &[u8]) -> impl Iterator<Item = Vma> + '_ {
    maps.split(|&b| b == b'\n').filter_map(parse_line)
}

/// A run of adjacent readable mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Iterator over the search regions for a stub at `addr`.
pub struct Regions<I> {
    vmas: I,
    limit: u64,
    seen: usize,
    pending: Option<Region>,
    started: bool,
    addr: u64,
    done: bool,
}

/// The regions to search for a stub running at `addr`: the readable run
/// containing it first, then later runs, within `MAX_VMAS` mappings and
/// `MAX_SPAN` bytes.
pub fn regions(maps: &[u8], addr: u64) -> Regions<impl Iterator<Item = Vma> + '_> {
    Regions { vmas: vmas(maps), limit: 0, seen: 0, pending: None, started: false, addr, done: false }
}

impl<I: Iterator<Item = Vma>> Iterator for Regions<I> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        if self.done {
            return None;
        }
        loop {
            let vma = match self.vmas.next() {
                Some(vma) => vma,
                None => {
                    self.done = true;
                    return self.pending.take();
                }
            };
            if !self.started {
                if !vma.contains(self.addr) {
                    continue;
                }
                self.started = true;
                self.limit = vma.start.saturating_add(MAX_SPAN);
            }
            self.seen += 1;
            if self.seen > MAX_VMAS + 1 || vma.start >= self.limit {
                self.done = true;
                return self.pending.take();
            }
            if !vma.readable() {
                if let Some(region) = self.pending.take() {
                    return Some(region);
                }
                continue;
            }
            match self.pending {
                Some(ref mut region) if region.end == vma.start => region.end = vma.end,
                Some(region) => {
                    self.pending = Some(Region { start: vma.start, end: vma.end });
                    return Some(region);
                }
                None => self.pending = Some(Region { start: vma.start, end: vma.end }),
            }
        }
    }
}

fn find_with(region: &[u8], marker: [u8; MARKER_LEN], flags: Flags, signature_ok: impl Fn(&[u8]) -> bool)
    -> Option<usize>
{
    let mut best: Option<(usize, usize)> = None;
    if region.len() < MARKER_LEN {
        return None;
    }
    for i in 0..=region.len() - MARKER_LEN {
        if region[i..i + MARKER_LEN] != marker {
            continue;
        }
        let block = match PackedBlock::parse(&region[i..], flags) {
            Ok(block) => block,
            Err(_) => continue,
        };
        if !signature_ok(block.compressed) {
            continue;
        }
        let end = i + block.header.block_len(flags.contains(Flags::DIGEST));
        // The block ending closest to the end of the region wins.
        if best.map_or(true, |(_, best_end)| end >= best_end) {
            best = Some((i, end));
        }
    }
    best.map(|(offset, _)| offset)
}

/// Offset of the most plausible `C` block in `region`.
pub fn find_block<C: Codec>(region: &[u8], flags: Flags) -> Option<usize> {
    find_with(region, C::ID.marker(), flags, C::signature_ok)
}

/// Like `find_block`, choosing the codec at run time.
pub fn find_block_dyn(region: &[u8], codec: CodecId, flags: Flags) -> Option<usize> {
    find_with(region, codec.marker(), flags, |stream| codec.signature_ok(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &[u8] = b"\
00400000-00401000 r--p 00000000 08:01 1234    /tmp/packed
00401000-00403000 r-xp 00001000 08:01 1234    /tmp/packed
00403000-00404000 rw-p 00003000 08:01 1234    /tmp/packed
00500000-00501000 ---p 00000000 00:00 0
00501000-00502000 r--p 00000000 00:00 0
7ffd1a2b3000-7ffd1a2d4000 rw-p 00000000 00:00 0                          [stack]
garbage line
";

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line(b"7f0a1b2c3000-7f0a1b2c5000 r-xp 00000000 08:01 42 /lib/x.so"),
            Some(Vma { start: 0x7f0a1b2c3000, end: 0x7f0a1b2c5000, perms: *b"r-xp" }));
        for &line in &[&b""[..], &b"garbage line"[..], &b"1000-0800 r--p"[..], &b"1000-2000"[..], &b"10g0-2000 r--p"[..]] {
            assert_eq!(parse_line(line), None, "{:?}", line);
        }
        assert_eq!(vmas(MAPS).count(), 6);
    }

    #[test]
    fn test_regions() {
        let found: Vec<Region> = regions(MAPS, 0x401234).collect();
        // The stack is too far away.
        assert_eq!(found, vec![
            Region { start: 0x401000, end: 0x404000 },
            Region { start: 0x501000, end: 0x502000 },
        ]);
        assert_eq!(regions(MAPS, 0x10).count(), 0);
    }

    #[test]
    fn test_regions_vma_limit() {
        let mut maps = Vec::new();
        for i in 0..40u64 {
            let start = 0x10000 + i * 0x2000;
            maps.extend_from_slice(format!("{:x}-{:x} r--p 0 0:0 0\n", start, start + 0x1000).as_bytes());
        }
        assert_eq!(regions(&maps, 0x10000).count(), MAX_VMAS + 1);
    }
}
