use elfpack::codec::{self, CodecError, CodecId};
use elfpack::elf::{Arch, ET_EXEC};

#[test]
fn test_roundtrip() {
    let inputs: &[&[u8]] = &[
        &[1],
        &[1, 2, 3, 4, 5],
        &[1, 2, 3, 4, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 1, 2, 3, 4],
        &[0xb0, 0xb0, 0xb0, 0xb0, 0xb0, 0xb0, 0xb0, 0xb0],
        &[0xb2, 0xb2, 0xb2, 0xb2, 0xb2, 0xb2, 0xb2, 0xb2],
        &[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        &[0xff; 0xffff + 2],
        &[0; 0x20000],
    ];

    for &codec in &CodecId::ALL {
        for input in inputs.iter() {
            let compressed = codec.compress(input).unwrap();
            let mut out = vec![0; codec.capacity(input.len())];
            let n = codec.decompress(&compressed, &mut out).unwrap();
            assert_eq!(&out[..n], *input, "{} {:?}", codec, &input[..input.len().min(16)]);
        }
    }
}

#[test]
fn test_compresses_image() {
    let image = common::sample_image(Arch::X86_64, ET_EXEC);
    for &codec in &CodecId::ALL {
        let compressed = codec.compress(&image).unwrap();
        assert!(compressed.len() < image.len() / 2, "{}: {} bytes", codec, compressed.len());
        assert!(codec.signature_ok(&compressed), "{}", codec);
    }
}

#[test]
fn test_output_overflow() {
    let input = common::code_like(0x4000, 2);
    for &codec in &CodecId::ALL {
        let compressed = codec.compress(&input).unwrap();
        let mut out = vec![0; 0x1000];
        match codec.decompress(&compressed, &mut out) {
            Err(CodecError::OutputOverflow { .. }) | Err(CodecError::Corrupt { .. })
                | Err(CodecError::Truncated { .. }) | Err(CodecError::Rle(_)) => (),
            x => panic!("{}: {:?}", codec, x),
        }
    }
}

#[test]
fn test_truncated_stream() {
    let input = common::code_like(0x4000, 4);
    for &codec in &CodecId::ALL {
        let compressed = codec.compress(&input).unwrap();
        let cut = &compressed[..compressed.len() / 2];
        let mut out = vec![0; codec.capacity(input.len())];
        match codec.decompress(cut, &mut out) {
            Err(_) => (),
            Ok(n) => assert_ne!(&out[..n], &input[..], "{}", codec),
        }
    }
}

#[test]
fn test_markers() {
    for &codec in &CodecId::ALL {
        assert_eq!(CodecId::from_marker(&codec.marker()), Some(codec));
        assert_eq!(CodecId::from_name(codec.name()), Some(codec));
        assert_eq!(&codec.marker()[..4], b"zELF");
    }
    assert_eq!(CodecId::from_marker(b"zELFxx"), None);
    assert_eq!(CodecId::from_name("zstd"), None);
}

#[test]
fn test_digest() {
    assert_eq!(codec::digest(b""), 0x811c_9dc5);
    assert_eq!(codec::digest(b"a"), 0xe40c_292c);
    assert_ne!(codec::digest(b"ab"), codec::digest(b"ba"));
}

pub mod common;
