use std::env;
use std::fs;
use std::path;

use elfpack::codec::CodecId;
use elfpack::elf::{Arch, Header, ProgramHeader, EHDR_SIZE, PF_R, PF_W, PF_X, PHDR_SIZE, PT_LOAD};
use elfpack::loader::Linkage;
use elfpack::packer::{self, StubKey};
use elfpack::params::{Flags, ParameterBlock, PasswordCheck, Version};
use elfpack::stage0;

// call fs::write if the environment variable ELFPACK_TEST_SAVE is set.
pub fn maybe_save<P: AsRef<path::Path>>(path: P, data: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("ELFPACK_TEST_SAVE").is_some() {
        fs::write(path, data)?;
    }
    Ok(())
}

/// Bytes with the repetition of machine code: a handful of short patterns
/// with varying operands.
pub fn code_like(len: usize, seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut x = seed.wrapping_mul(2_654_435_761) | 1;
    while out.len() < len {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        match x % 3 {
            0 => out.extend_from_slice(&[0x48, 0x89, 0xc7]),
            1 => out.extend_from_slice(&[0xe8, (x >> 8) as u8, (x >> 16) as u8 & 0x07, 0, 0]),
            _ => out.extend_from_slice(&[0x0f, 0x1f, 0x40, 0x00]),
        }
    }
    out.truncate(len);
    out
}

/// A 40 KiB program: headers, 8 KiB of text, and data that is mostly zeros.
/// `ET_EXEC` images are linked at 0x400000, `ET_DYN` ones at 0.
pub fn sample_image(arch: Arch, e_type: u16) -> Vec<u8> {
    let base = if e_type == elfpack::elf::ET_EXEC { 0x400000 } else { 0 };
    let loads = [
        (0x0000, 0x1000, 0x1000, PF_R),
        (0x1000, 0x2000, 0x2000, PF_R | PF_X),
        (0x3000, 0x7000, 0x9000, PF_R | PF_W),
    ];
    let mut image = vec![0u8; 0xa000];
    Header::new(arch, e_type, base + 0x1000, loads.len() as u16).write(&mut image);
    for (i, &(offset, filesz, memsz, flags)) in loads.iter().enumerate() {
        let ph = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: base + offset,
            p_paddr: base + offset,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: 0x1000,
        };
        let at = EHDR_SIZE + i * PHDR_SIZE;
        ph.write(&mut image[at..at + PHDR_SIZE]);
    }
    image[0x1000..0x3000].copy_from_slice(&code_like(0x2000, 3));
    for (i, b) in image[0x3000..0x3800].iter_mut().enumerate() {
        *b = (i % 200) as u8 + 1;
    }
    image[0x9ff0..0x9fff].copy_from_slice(b"end of the data");
    image[0x9fff] = 1;
    image
}

/// `sample_image` with every byte after the headers scrambled, so it
/// cannot get smaller.
pub fn incompressible_image() -> Vec<u8> {
    let mut image = sample_image(Arch::X86_64, elfpack::elf::ET_EXEC);
    let mut x: u32 = 0x1234_5678;
    for b in image[0x1000..].iter_mut() {
        x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
        *b = (x >> 23) as u8;
    }
    image
}

/// Writes stand-in stub binaries for every variant to `dir`: `len` bytes of
/// filler carrying an unpatched parameter block, and a stage-0 for each
/// architecture.
pub fn write_stubs<P: AsRef<path::Path>>(dir: P, len: usize) -> Result<(), Box<dyn std::error::Error>> {
    let dir = dir.as_ref();
    for &arch in &[Arch::X86_64, Arch::Aarch64] {
        for &linkage in &[Linkage::Static, Linkage::Dynamic] {
            for &codec in &CodecId::ALL {
                for &password in &[false, true] {
                    let key = StubKey { arch, linkage, codec, password };
                    let mut stub = code_like(len.min(0x400), 9);
                    stub.resize(len, 0);
                    let (version, password) = if password {
                        (Version::Password, Some(PasswordCheck { salt: 0, obfuscated_hash: 0 }))
                    } else {
                        (Version::Plain, None)
                    };
                    ParameterBlock { version, flags: Flags::empty(), virtual_start: 0, packed_data_vaddr: 0, password }
                        .write(&mut stub[0x40..]);
                    fs::write(dir.join(key.file_name()), &stub)?;
                }
            }
        }
        let mut stage0 = vec![0x90; 0x80];
        stage0::Params { unpacked_len: 0, packed_len: 0, data_offset: 0 }.write(&mut stage0[0x40..]);
        fs::write(dir.join(packer::stage0_file_name(arch)), &stage0)?;
    }
    Ok(())
}
