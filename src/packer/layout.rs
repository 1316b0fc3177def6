//! Where the stub and the packed block go in the output file.
//!
//! Fixed-address images get two segments placed past the image's highest
//! address, so the stub never overlaps what it maps:
//!
//! ```text
//! 0x0000  ELF header, program headers
//! 0x1000  stub            R X   vaddr align_up(image end, 1 MiB) + 0x1000
//!         packed block    R     next page, same offset within the page
//! ```
//!
//! Position-independent images are rebuilt as a minimal file loaded at 0.
//! The packer can't know where the kernel will put it, so the parameter
//! block carries no addresses and the stub scans for the block:
//!
//! ```text
//! 0x000   ELF header, program headers   LOAD vaddr 0       R W
//! 0x100   stub                          LOAD vaddr 0x5000  R X (whole file)
//!         packed block
//! ```

use crate::elf::{Arch, Header, ProgramHeader, ET_DYN, ET_EXEC, EHDR_SIZE, PF_R, PF_W, PF_X, PHDR_SIZE, PT_GNU_STACK, PT_LOAD};
use crate::le::align_up;
use crate::loader::Linkage;

pub const PAGE: u64 = 0x1000;

const STATIC_STUB_OFFSET: u64 = 0x1000;
const STATIC_BOUNDARY: u64 = 0x10_0000;
const DYNAMIC_STUB_OFFSET: u64 = 0x100;
const DYNAMIC_TEXT_VADDR: u64 = 0x5000;
const PHNUM: usize = 3;

/// A computed file layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub linkage: Linkage,
    pub stub_offset: u64,
    pub stub_vaddr: u64,
    /// Bytes reserved for the stub; the stub is zero-padded to this.
    pub stub_space: u64,
    pub block_offset: u64,
    pub block_vaddr: u64,
    pub block_len: u64,
}

impl Placement {
    /// The layout for a fixed-address image whose segments end at
    /// `image_end`.
    pub fn fixed(image_end: u64, stub_space: u64, block_len: u64) -> Self {
        let stub_offset = STATIC_STUB_OFFSET;
        let stub_vaddr = align_up(image_end, STATIC_BOUNDARY) + STATIC_STUB_OFFSET;
        let block_offset = stub_offset + stub_space;
        let block_vaddr = align_up(stub_vaddr + stub_space, PAGE) + block_offset % PAGE;
        Placement {
            linkage: Linkage::Static,
            stub_offset,
            stub_vaddr,
            stub_space,
            block_offset,
            block_vaddr,
            block_len,
        }
    }

    /// The minimal layout for a position-independent image.
    pub fn minimal(stub_space: u64, block_len: u64) -> Self {
        let text = DYNAMIC_TEXT_VADDR.max(align_up(DYNAMIC_STUB_OFFSET + stub_space, PAGE));
        let block_offset = DYNAMIC_STUB_OFFSET + stub_space;
        Placement {
            linkage: Linkage::Dynamic,
            stub_offset: DYNAMIC_STUB_OFFSET,
            stub_vaddr: text + DYNAMIC_STUB_OFFSET,
            stub_space,
            block_offset,
            block_vaddr: text + block_offset,
            block_len,
        }
    }

    pub fn for_linkage(linkage: Linkage, image_end: u64, stub_space: u64, block_len: u64) -> Self {
        match linkage {
            Linkage::Static => Placement::fixed(image_end, stub_space, block_len),
            Linkage::Dynamic => Placement::minimal(stub_space, block_len),
        }
    }

    pub fn file_len(&self) -> u64 {
        self.block_offset + self.block_len
    }

    pub fn entry(&self) -> u64 {
        self.stub_vaddr
    }

    /// `virtual_start` and `packed_data_vaddr` for the parameter block.
    /// Zero means the stub scans.
    pub fn addresses(&self) -> (u64, u64) {
        match self.linkage {
            Linkage::Static => (self.stub_vaddr, self.block_vaddr),
            Linkage::Dynamic => (0, 0),
        }
    }

    fn e_type(&self) -> u16 {
        match self.linkage {
            Linkage::Static => ET_EXEC,
            Linkage::Dynamic => ET_DYN,
        }
    }

    pub fn program_headers(&self) -> [ProgramHeader; PHNUM] {
        let load = |offset, vaddr, len, flags| ProgramHeader {
            p_type: PT_LOAD,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: len,
            p_memsz: len,
            p_align: PAGE,
        };
        let stack = ProgramHeader { p_type: PT_GNU_STACK, p_flags: PF_R | PF_W, p_align: 0x10, ..ProgramHeader::default() };
        match self.linkage {
            Linkage::Static => [
                load(self.stub_offset, self.stub_vaddr, self.stub_space, PF_R | PF_X),
                load(self.block_offset, self.block_vaddr, self.block_len, PF_R),
                stack,
            ],
            Linkage::Dynamic => {
                let text = self.stub_vaddr - self.stub_offset;
                [
                    load(0, 0, self.stub_offset + self.stub_space, PF_R | PF_W),
                    load(0, text, self.file_len(), PF_R | PF_X),
                    stack,
                ]
            }
        }
    }

    /// Writes the whole output file. `stub` must fit in `stub_space` and
    /// `block` must be `block_len` bytes.
    pub fn emit(&self, arch: Arch, stub: &[u8], block: &[u8]) -> Vec<u8> {
        debug_assert!(stub.len() as u64 <= self.stub_space);
        debug_assert_eq!(block.len() as u64, self.block_len);
        let mut out = vec![0u8; self.file_len() as usize];
        Header::new(arch, self.e_type(), self.entry(), PHNUM as u16).write(&mut out);
        for (i, ph) in self.program_headers().iter().enumerate() {
            let at = EHDR_SIZE + i * PHDR_SIZE;
            ph.write(&mut out[at..at + PHDR_SIZE]);
        }
        let stub_at = self.stub_offset as usize;
        out[stub_at..stub_at + stub.len()].copy_from_slice(stub);
        let block_at = self.block_offset as usize;
        out[block_at..].copy_from_slice(block);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Elf;

    #[test]
    fn test_fixed() {
        let p = Placement::fixed(0x4a_3456, 0x1_2345, 0x8_0000);
        assert_eq!(p.stub_vaddr, 0x50_1000);
        assert_eq!(p.block_offset, 0x1_3345);
        assert_eq!(p.block_vaddr, 0x51_4345);
        assert_eq!(p.file_len(), 0x9_3345);
        assert_eq!(p.addresses(), (0x50_1000, 0x51_4345));
        for ph in p.program_headers().iter().filter(|ph| ph.is_load()) {
            assert_eq!(ph.p_offset % PAGE, ph.p_vaddr % PAGE, "{:?}", ph);
        }
        // Already on a boundary: the stub still starts past the image.
        assert_eq!(Placement::fixed(0x60_0000, 0x100, 0x100).stub_vaddr, 0x60_1000);
    }

    #[test]
    fn test_minimal() {
        let p = Placement::minimal(0x800, 0x2000);
        assert_eq!((p.stub_offset, p.stub_vaddr), (0x100, 0x5100));
        assert_eq!(p.addresses(), (0, 0));
        assert_eq!(p.file_len(), 0x2900);
        let phdrs = p.program_headers();
        assert_eq!((phdrs[0].p_vaddr, phdrs[0].p_filesz), (0, 0x900));
        assert_eq!((phdrs[1].p_vaddr, phdrs[1].p_filesz), (0x5000, 0x2900));

        // A stub too large for the gap pushes the text segment up.
        let big = Placement::minimal(0x6000, 0x10);
        assert_eq!(big.stub_vaddr, 0x7100);
        let phdrs = big.program_headers();
        assert!(phdrs[0].vaddr_end() <= phdrs[1].p_vaddr);
    }

    #[test]
    fn test_emit() {
        let stub = [0xcc; 0x300];
        let block = [0x5a; 0x40];
        for &p in &[Placement::fixed(0x40_2000, 0x300, 0x40), Placement::minimal(0x300, 0x40)] {
            let out = p.emit(Arch::Aarch64, &stub, &block);
            let elf = Elf::parse(&out).unwrap();
            elf.check_segments().unwrap();
            assert_eq!(elf.arch(), Arch::Aarch64);
            assert_eq!(elf.header().e_entry, p.entry());
            let at = elf.vaddr_to_offset(p.entry()).unwrap() as usize;
            assert_eq!(&out[at..at + stub.len()], &stub[..]);
            let at = elf.vaddr_to_offset(p.block_vaddr).unwrap() as usize;
            assert_eq!(&out[at..], &block[..]);
        }
    }
}
