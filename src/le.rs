//! Little-endian field access on byte slices.
//!
//! Callers check bounds before calling; an out-of-range index panics like
//! ordinary slice indexing.

pub fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

pub fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

pub fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn write_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Round `n` up to the next multiple of `m`, which must be a power of two.
pub fn align_up(n: u64, m: u64) -> u64 {
    (n + (m - 1)) & !(m - 1)
}

/// Round `n` down to a multiple of `m`, which must be a power of two.
pub fn align_down(n: u64, m: u64) -> u64 {
    n & !(m - 1)
}
