//! Just enough of ELF64 to pack a program and to load it again.
//!
//! Only 64-bit little-endian images for x86_64 and aarch64 are accepted. The
//! structures here are plain copies of the on-disk records; nothing borrows
//! the underlying buffer for longer than a single call, so the loader can
//! re-read headers out of memory it is still mapping.
//!
//! # References
//!
//! * <https://refspecs.linuxfoundation.org/elf/gabi4+/ch4.eheader.html>
//! * <https://refspecs.linuxfoundation.org/elf/gabi4+/ch5.pheader.html>

use core::fmt;

use crate::le::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
pub const DYN_SIZE: usize = 16;
pub const RELA_SIZE: usize = 24;

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;
pub const PT_GNU_STACK: u32 = 0x6474_e551;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const DT_NULL: u64 = 0;
pub const DT_PLTRELSZ: u64 = 2;
pub const DT_PLTGOT: u64 = 3;
pub const DT_HASH: u64 = 4;
pub const DT_STRTAB: u64 = 5;
pub const DT_SYMTAB: u64 = 6;
pub const DT_RELA: u64 = 7;
pub const DT_RELASZ: u64 = 8;
pub const DT_RELAENT: u64 = 9;
pub const DT_INIT: u64 = 12;
pub const DT_FINI: u64 = 13;
pub const DT_JMPREL: u64 = 0x17;
pub const DT_INIT_ARRAY: u64 = 0x19;
pub const DT_FINI_ARRAY: u64 = 0x1a;
pub const DT_PREINIT_ARRAY: u64 = 0x20;
pub const DT_RELRSZ: u64 = 0x23;
pub const DT_RELR: u64 = 0x24;
pub const DT_RELRENT: u64 = 0x25;
pub const DT_GNU_HASH: u64 = 0x6fff_fef5;
pub const DT_VERSYM: u64 = 0x6fff_fff0;
pub const DT_VERDEF: u64 = 0x6fff_fffc;
pub const DT_VERNEED: u64 = 0x6fff_fffe;

/// Dynamic tags whose value is an address inside the image.
pub const DT_POINTER_TAGS: [u64; 15] = [
    DT_PLTGOT, DT_HASH, DT_STRTAB, DT_SYMTAB, DT_RELA, DT_INIT, DT_FINI,
    DT_JMPREL, DT_INIT_ARRAY, DT_FINI_ARRAY, DT_PREINIT_ARRAY, DT_RELR,
    DT_GNU_HASH, DT_VERSYM, DT_VERNEED,
];

pub const R_X86_64_RELATIVE: u32 = 8;
pub const R_AARCH64_RELATIVE: u32 = 1027;

pub const AT_NULL: u64 = 0;
pub const AT_IGNORE: u64 = 1;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_BASE: u64 = 7;
pub const AT_ENTRY: u64 = 9;

/// A target architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn from_machine(machine: u16) -> Option<Self> {
        match machine {
            EM_X86_64 => Some(Arch::X86_64),
            EM_AARCH64 => Some(Arch::Aarch64),
            _ => None,
        }
    }

    pub fn machine(self) -> u16 {
        match self {
            Arch::X86_64 => EM_X86_64,
            Arch::Aarch64 => EM_AARCH64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" => Some(Arch::X86_64),
            "aarch64" => Some(Arch::Aarch64),
            _ => None,
        }
    }

    /// The `R_*_RELATIVE` relocation type.
    pub fn relative_reloc(self) -> u32 {
        match self {
            Arch::X86_64 => R_X86_64_RELATIVE,
            Arch::Aarch64 => R_AARCH64_RELATIVE,
        }
    }

    /// The interpreter used when none can be discovered, NUL-terminated.
    pub fn default_interp(self) -> &'static [u8] {
        match self {
            Arch::X86_64 => b"/lib64/ld-linux-x86-64.so.2\0",
            Arch::Aarch64 => b"/lib/ld-linux-aarch64.so.1\0",
        }
    }

    /// Machine code of the hatch trampoline: a system call, then zeroing of
    /// the registers that held its number, arguments, and clobbers, then a
    /// return to the caller.
    pub fn hatch_code(self) -> &'static [u8] {
        match self {
            // syscall; xor eax/edi/esi/ecx/r11d; pop %rdx; ret
            Arch::X86_64 => &[
                0x0f, 0x05,
                0x31, 0xc0,
                0x31, 0xff,
                0x31, 0xf6,
                0x31, 0xc9,
                0x45, 0x31, 0xdb,
                0x5a,
                0xc3,
            ],
            // svc #0; mov x0, xzr; mov x1, xzr; mov x8, xzr; ret
            Arch::Aarch64 => &[
                0x01, 0x00, 0x00, 0xd4,
                0xe0, 0x03, 0x1f, 0xaa,
                0xe1, 0x03, 0x1f, 0xaa,
                0xe8, 0x03, 0x1f, 0xaa,
                0xc0, 0x03, 0x5f, 0xd6,
            ],
        }
    }
}

/// An ELF format error.
#[derive(Debug, PartialEq, Eq)]
pub enum FormatError {
    /// The buffer is too short to hold an ELF header.
    TooShort { len: usize },
    /// The first four bytes are not `\x7fELF`.
    Magic,
    /// Not `ELFCLASS64`.
    Class { class: u8 },
    /// Not little-endian.
    Endian { data: u8 },
    /// Neither x86_64 nor aarch64.
    Machine { machine: u16 },
    /// Neither `ET_EXEC` nor `ET_DYN`.
    Type { e_type: u16 },
    /// `e_phentsize` is not the size of an ELF64 program header.
    PhentSize { phentsize: u16 },
    /// The program header table extends past the end of the buffer.
    PhdrPastEnd { phoff: u64, phnum: u16, len: usize },
    /// There are no `PT_LOAD` segments.
    NoLoadSegments,
    /// A segment's file range extends past the end of the buffer.
    SegmentPastEnd { index: usize, offset: u64, filesz: u64, len: usize },
}

#[cfg(feature = "std")]
impl std::error::Error for FormatError {}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::TooShort { len } =>
                write!(f, "file of {} bytes is too short for an ELF header", len),
            FormatError::Magic =>
                write!(f, "not an ELF file"),
            FormatError::Class { class } =>
                write!(f, "ELF class {} is not ELFCLASS64", class),
            FormatError::Endian { data } =>
                write!(f, "ELF data encoding {} is not little-endian", data),
            FormatError::Machine { machine } =>
                write!(f, "unsupported machine {}", machine),
            FormatError::Type { e_type } =>
                write!(f, "ELF type {} is neither ET_EXEC nor ET_DYN", e_type),
            FormatError::PhentSize { phentsize } =>
                write!(f, "program header entry size {} is not {}", phentsize, PHDR_SIZE),
            FormatError::PhdrPastEnd { phoff, phnum, len } =>
                write!(f, "{} program headers at offset {:#x} extend past the end of the file ({} bytes)", phnum, phoff, len),
            FormatError::NoLoadSegments =>
                write!(f, "no PT_LOAD segments"),
            FormatError::SegmentPastEnd { index, offset, filesz, len } =>
                write!(f, "segment {} (offset {:#x}, filesz {:#x}) extends past the end of the file ({} bytes)", index, offset, filesz, len),
        }
    }
}

/// An ELF64 file header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Header {
    /// Parses the first 64 bytes of `buf`. Only the magic is checked here;
    /// see `validate` for the rest.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < EHDR_SIZE {
            return Err(FormatError::TooShort { len: buf.len() });
        }
        if buf[..4] != ELFMAG {
            return Err(FormatError::Magic);
        }
        let mut e_ident = [0; 16];
        e_ident.copy_from_slice(&buf[..16]);
        Ok(Header {
            e_ident,
            e_type: read_u16(buf, 16),
            e_machine: read_u16(buf, 18),
            e_version: read_u32(buf, 20),
            e_entry: read_u64(buf, 24),
            e_phoff: read_u64(buf, 32),
            e_shoff: read_u64(buf, 40),
            e_flags: read_u32(buf, 48),
            e_ehsize: read_u16(buf, 52),
            e_phentsize: read_u16(buf, 54),
            e_phnum: read_u16(buf, 56),
            e_shentsize: read_u16(buf, 58),
            e_shnum: read_u16(buf, 60),
            e_shstrndx: read_u16(buf, 62),
        })
    }

    /// A fresh header for an output file.
    pub fn new(arch: Arch, e_type: u16, e_entry: u64, e_phnum: u16) -> Self {
        let mut e_ident = [0; 16];
        e_ident[..4].copy_from_slice(&ELFMAG);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = EV_CURRENT;
        Header {
            e_ident,
            e_type,
            e_machine: arch.machine(),
            e_version: 1,
            e_entry,
            e_phoff: EHDR_SIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: EHDR_SIZE as u16,
            e_phentsize: PHDR_SIZE as u16,
            e_phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    /// Checks class, byte order, machine, and type, returning the
    /// architecture.
    pub fn validate(&self) -> Result<Arch, FormatError> {
        if self.e_ident[4] != ELFCLASS64 {
            return Err(FormatError::Class { class: self.e_ident[4] });
        }
        if self.e_ident[5] != ELFDATA2LSB {
            return Err(FormatError::Endian { data: self.e_ident[5] });
        }
        let arch = Arch::from_machine(self.e_machine)
            .ok_or(FormatError::Machine { machine: self.e_machine })?;
        if self.e_type != ET_EXEC && self.e_type != ET_DYN {
            return Err(FormatError::Type { e_type: self.e_type });
        }
        Ok(arch)
    }

    pub fn is_pie(&self) -> bool {
        self.e_type == ET_DYN
    }

    /// The file offset one past the end of the program header table.
    pub fn phdr_table_end(&self) -> u64 {
        self.e_phoff.saturating_add(u64::from(self.e_phnum) * PHDR_SIZE as u64)
    }

    /// Writes the header into the first 64 bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[..16].copy_from_slice(&self.e_ident);
        write_u16(out, 16, self.e_type);
        write_u16(out, 18, self.e_machine);
        write_u32(out, 20, self.e_version);
        write_u64(out, 24, self.e_entry);
        write_u64(out, 32, self.e_phoff);
        write_u64(out, 40, self.e_shoff);
        write_u32(out, 48, self.e_flags);
        write_u16(out, 52, self.e_ehsize);
        write_u16(out, 54, self.e_phentsize);
        write_u16(out, 56, self.e_phnum);
        write_u16(out, 58, self.e_shentsize);
        write_u16(out, 60, self.e_shnum);
        write_u16(out, 62, self.e_shstrndx);
    }
}

/// An ELF64 program header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl ProgramHeader {
    /// Parses the 56 bytes at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Self {
        ProgramHeader {
            p_type: read_u32(buf, 0),
            p_flags: read_u32(buf, 4),
            p_offset: read_u64(buf, 8),
            p_vaddr: read_u64(buf, 16),
            p_paddr: read_u64(buf, 24),
            p_filesz: read_u64(buf, 32),
            p_memsz: read_u64(buf, 40),
            p_align: read_u64(buf, 48),
        }
    }

    /// Reads program header `index` of the image in `image` described by
    /// `header`. Returns `None` if it lies outside `image`.
    pub fn read(image: &[u8], header: &Header, index: usize) -> Option<Self> {
        let start = usize::try_from(header.e_phoff).ok()?.checked_add(index.checked_mul(PHDR_SIZE)?)?;
        let end = start.checked_add(PHDR_SIZE)?;
        if index >= usize::from(header.e_phnum) || end > image.len() {
            return None;
        }
        Some(Self::parse(&image[start..end]))
    }

    pub fn write(&self, out: &mut [u8]) {
        write_u32(out, 0, self.p_type);
        write_u32(out, 4, self.p_flags);
        write_u64(out, 8, self.p_offset);
        write_u64(out, 16, self.p_vaddr);
        write_u64(out, 24, self.p_paddr);
        write_u64(out, 32, self.p_filesz);
        write_u64(out, 40, self.p_memsz);
        write_u64(out, 48, self.p_align);
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    pub fn vaddr_end(&self) -> u64 {
        self.p_vaddr.saturating_add(self.p_memsz)
    }

    pub fn file_end(&self) -> u64 {
        self.p_offset.saturating_add(self.p_filesz)
    }
}

/// A parsed and bounds-checked view of a whole ELF file in memory.
#[derive(Clone, Copy, Debug)]
pub struct Elf<'a> {
    data: &'a [u8],
    header: Header,
}

impl<'a> Elf<'a> {
    /// Parses and validates `data`: header fields, program header table
    /// bounds, and the presence of at least one loadable segment.
    pub fn parse(data: &'a [u8]) -> Result<Self, FormatError> {
        let header = Header::parse(data)?;
        header.validate()?;
        if header.e_phnum > 0 && usize::from(header.e_phentsize) != PHDR_SIZE {
            return Err(FormatError::PhentSize { phentsize: header.e_phentsize });
        }
        if header.phdr_table_end() > data.len() as u64 || header.e_phoff > data.len() as u64 {
            return Err(FormatError::PhdrPastEnd {
                phoff: header.e_phoff,
                phnum: header.e_phnum,
                len: data.len(),
            });
        }
        let elf = Elf { data, header };
        if !elf.program_headers().any(|ph| ph.is_load()) {
            return Err(FormatError::NoLoadSegments);
        }
        Ok(elf)
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn arch(&self) -> Arch {
        // Checked in parse.
        Arch::from_machine(self.header.e_machine).unwrap_or(Arch::X86_64)
    }

    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        let data = self.data;
        let header = self.header;
        (0..usize::from(header.e_phnum)).filter_map(move |i| ProgramHeader::read(data, &header, i))
    }

    pub fn loads(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        self.program_headers().filter(|ph| ph.is_load())
    }

    pub fn find(&self, p_type: u32) -> Option<ProgramHeader> {
        self.program_headers().find(|ph| ph.p_type == p_type)
    }

    /// The interpreter path from `PT_INTERP`, including its terminating NUL.
    pub fn interp(&self) -> Option<&'a [u8]> {
        let ph = self.find(PT_INTERP)?;
        let start = usize::try_from(ph.p_offset).ok()?;
        let end = start.checked_add(usize::try_from(ph.p_filesz).ok()?)?;
        let s = self.data.get(start..end)?;
        match s.iter().position(|&b| b == 0) {
            Some(nul) if nul > 0 => Some(&s[..=nul]),
            _ => None,
        }
    }

    /// Checks that every segment's file range is inside the buffer.
    pub fn check_segments(&self) -> Result<(), FormatError> {
        for (index, ph) in self.program_headers().enumerate() {
            if ph.p_type == PT_NULL {
                continue;
            }
            if ph.p_offset > self.data.len() as u64 || ph.file_end() > self.data.len() as u64 {
                return Err(FormatError::SegmentPastEnd {
                    index,
                    offset: ph.p_offset,
                    filesz: ph.p_filesz,
                    len: self.data.len(),
                });
            }
        }
        Ok(())
    }

    /// Translates a virtual address into a file offset through the
    /// loadable segments.
    pub fn vaddr_to_offset(&self, vaddr: u64) -> Option<u64> {
        self.loads()
            .find(|ph| vaddr >= ph.p_vaddr && vaddr - ph.p_vaddr < ph.p_filesz)
            .map(|ph| ph.p_offset + (vaddr - ph.p_vaddr))
    }

    /// The highest `p_vaddr + p_memsz` over all loadable segments.
    pub fn max_vaddr(&self) -> u64 {
        self.loads().map(|ph| ph.vaddr_end()).max().unwrap_or(0)
    }
}
