//! Salted password hashing for the execution gate.
//!
//! This is not encryption: the payload is stored in the clear and the hash
//! only decides whether the stub proceeds.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const GOLDEN: u64 = 0x9e37_79b9_7f4a_7c15;

fn fnv1a(mut h: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Strips the line terminator a terminal read leaves behind.
pub fn trim_line(mut password: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = password {
        password = rest;
    }
    password
}

/// FNV-1a 64 over the salt's little-endian bytes followed by the trimmed
/// password.
pub fn hash(salt: u64, password: &[u8]) -> u64 {
    let h = fnv1a(FNV_OFFSET, &salt.to_le_bytes());
    fnv1a(h, trim_line(password))
}

fn mask(salt: u64) -> u64 {
    salt.wrapping_mul(GOLDEN) ^ (salt >> 13)
}

/// The value stored in the parameter block.
pub fn obfuscate(salt: u64, hash: u64) -> u64 {
    hash ^ mask(salt)
}

/// Reverses `obfuscate`.
pub fn expected(salt: u64, obfuscated: u64) -> u64 {
    obfuscated ^ mask(salt)
}

/// Checks `typed` against a stored check value.
pub fn verify(salt: u64, obfuscated: u64, typed: &[u8]) -> bool {
    hash(salt, typed) == expected(salt, obfuscated)
}
