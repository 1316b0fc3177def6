use crate::codec::{CodecId, Lz4, Lzma, Rle};
use crate::elf::*;
use crate::filter::Filter;
use crate::le::align_down;
use crate::loader::{self, Boot, Fatal, Handoff, Linkage, Mode, Prot};
use crate::packer::{self, FilterChoice, PackError, PackOptions, Packed, Stage0Mode, STAGE0_THRESHOLD};
use crate::params::{self, Flags, ParameterBlock, Version};
use crate::password;
use crate::scan::Region;
use crate::stage0;
use crate::tests::{self, FakeSystem, MemoryStubs, PhdrSpec, PAGE};

// Where the kernel puts a position-independent packed file.
const PIE_BASE: u64 = 0x0400_0000;

fn table(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i % 251) as u8 + 1;
    }
}

/// A fixed-address executable: headers, text, and data with a run of
/// zeros in the middle and bss after it.
pub(super) fn fixed_image(arch: Arch) -> Vec<u8> {
    let mut image = tests::minimal_elf(arch, ET_EXEC, 0x401000, &[
        PhdrSpec::load(0, 0x400000, 0x1000, 0x1000, PF_R),
        PhdrSpec::load(0x1000, 0x401000, 0x2000, 0x2000, PF_R | PF_X),
        PhdrSpec::load(0x3000, 0x403000, 0x8000, 0xa000, PF_R | PF_W),
    ], 0xb000);
    image[0x1000..0x3000].copy_from_slice(&tests::code_like(0x2000, 21));
    table(&mut image[0x3000..0x4000]);
    table(&mut image[0xa000..0xb000]);
    image
}

/// The same program linked at 0, with an interpreter.
pub(super) fn pie_image() -> Vec<u8> {
    let interp = b"/lib/ld-fake.so\0";
    let mut image = tests::minimal_elf(Arch::X86_64, ET_DYN, 0x1000, &[
        PhdrSpec { p_type: PT_INTERP, offset: 0x200, vaddr: 0x200, filesz: interp.len() as u64, memsz: interp.len() as u64, flags: PF_R, align: 1 },
        PhdrSpec::load(0, 0, 0x1000, 0x1000, PF_R),
        PhdrSpec::load(0x1000, 0x1000, 0x2000, 0x2000, PF_R | PF_X),
        PhdrSpec::load(0x3000, 0x3000, 0x8000, 0xa000, PF_R | PF_W),
    ], 0xb000);
    image[0x200..0x200 + interp.len()].copy_from_slice(interp);
    image[0x1000..0x3000].copy_from_slice(&tests::code_like(0x2000, 22));
    table(&mut image[0x3000..0x4000]);
    table(&mut image[0xa000..0xb000]);
    image
}

pub(super) fn small_stubs() -> MemoryStubs {
    MemoryStubs::all(0x800)
}

/// Maps the loadable segments of a packed file at `base` the way the
/// kernel does and returns the address space with an entry stack.
fn exec(packed: &Packed, base: u64) -> (FakeSystem, u64) {
    let file = &packed.data;
    let elf = Elf::parse(file).unwrap();
    let mut sys = FakeSystem::new();
    for ph in elf.loads() {
        let start = base + ph.p_vaddr;
        let lead = start - align_down(start, PAGE);
        let bytes = &file[(ph.p_offset - lead) as usize..ph.file_end() as usize];
        sys.map_bytes(start - lead, bytes, Prot::from_segment_flags(ph.p_flags));
    }
    let entry = base + elf.header().e_entry;
    let sp = sys.push_stack(&["packed"], &["TERM=dumb"], &[
        (AT_PHDR, base + elf.header().e_phoff),
        (AT_PHENT, PHDR_SIZE as u64),
        (AT_PHNUM, u64::from(elf.header().e_phnum)),
        (AT_PAGESZ, PAGE),
        (AT_BASE, 0),
        (AT_ENTRY, entry),
    ]);
    let maps = sys.render_maps();
    sys.add_file("/proc/self/maps", maps);
    (sys, sp)
}

/// What a stub at `origin` knows after decoding its own parameter block.
fn boot(packed: &Packed, sp: u64, origin: u64, stub: &[u8]) -> Boot {
    let params = ParameterBlock::decode(&stub[params::find(stub).unwrap()..]).unwrap();
    Boot {
        arch: packed.arch,
        linkage: packed.linkage,
        sp,
        origin,
        own: Region { start: origin, end: origin + packed.placement.stub_space },
        params,
    }
}

fn run(sys: &mut FakeSystem, boot: &Boot, codec: CodecId) -> Result<Handoff, Fatal> {
    match codec {
        CodecId::Lz4 => loader::run::<_, Lz4>(sys, boot),
        CodecId::Lzma => loader::run::<_, Lzma>(sys, boot),
        CodecId::Rle => loader::run::<_, Rle>(sys, boot),
    }
}

/// Packs `image`, runs the stub on the result, and checks that the image's
/// segments came back.
fn pack_and_run(image: &[u8], options: &PackOptions, base: u64) -> (Packed, FakeSystem, Handoff) {
    let packed = packer::pack(image, options, &small_stubs()).unwrap();
    tests::maybe_save(format!("packed-{}-{}.elf", packed.linkage.name(), packed.codec), &packed.data).unwrap();
    assert!(packed.data.len() < image.len());
    let (mut sys, sp) = exec(&packed, base);
    let origin = base + packed.placement.stub_vaddr;
    let stub = sys.peek(origin, packed.stub_len).to_vec();
    let boot = boot(&packed, sp, origin, &stub);
    let handoff = run(&mut sys, &boot, packed.codec).unwrap();
    (packed, sys, handoff)
}

#[test]
fn test_pack_fixed_address() {
    let image = fixed_image(Arch::X86_64);
    for &codec in &CodecId::ALL {
        let options = PackOptions { codec, ..PackOptions::default() };
        let (packed, sys, handoff) = pack_and_run(&image, &options, 0);
        assert_eq!(packed.linkage, Linkage::Static);
        assert!(packed.placement.stub_vaddr > 0x40d000, "{:?}", packed.placement);

        let elf = Elf::parse(&packed.data).unwrap();
        assert_eq!(elf.header().e_type, ET_EXEC);
        assert!(elf.find(PT_INTERP).is_none());
        let params = ParameterBlock::parse(&packed.data[elf.vaddr_to_offset(elf.header().e_entry).unwrap() as usize + 0x40..]).unwrap();
        assert_eq!(params.virtual_start, packed.placement.stub_vaddr);
        assert_eq!(params.packed_data_vaddr, packed.placement.block_vaddr);
        assert!(params.flags.contains(Flags::DIGEST));

        assert_eq!(handoff.mode, Mode::StaticHandoff, "{}", codec);
        assert_eq!(handoff.entry, 0x401000);
        assert_eq!(sys.peek(0x401000, 0x2000), &image[0x1000..0x3000]);
        assert_eq!(sys.peek(0x403000, 0x8000), &image[0x3000..0xb000]);
        assert!(sys.peek(0x40b000, 0x2000).iter().all(|&b| b == 0));
        assert_eq!(sys.prot_at(0x401000), Some(Prot::READ | Prot::EXEC));
    }
}

#[test]
fn test_pack_position_independent() {
    let image = pie_image();
    let packed = packer::pack(&image, &PackOptions::default(), &small_stubs()).unwrap();
    assert_eq!(packed.linkage, Linkage::Dynamic);
    assert!(packed.data.len() < image.len());

    let elf = Elf::parse(&packed.data).unwrap();
    assert_eq!(elf.header().e_type, ET_DYN);
    assert_eq!(elf.header().e_entry, 0x5100);
    assert!(elf.find(PT_INTERP).is_none());
    assert_eq!(elf.find(PT_GNU_STACK).map(|ph| ph.p_flags), Some(PF_R | PF_W));
    // The stub scans for the block.
    let params = ParameterBlock::parse(&packed.data[0x140..]).unwrap();
    assert_eq!((params.virtual_start, params.packed_data_vaddr), (0, 0));

    let mut stubs = small_stubs();
    stubs.files.clear();
    match packer::pack(&image, &PackOptions::default(), &stubs) {
        Err(PackError::MissingStub { name }) => assert_eq!(name, "loader-x86_64-dynamic-lz4.bin"),
        x => panic!("{:?}", x),
    }
}

#[test]
fn test_pack_hands_off_to_interpreter() {
    let image = pie_image();
    let packed = packer::pack(&image, &PackOptions::default(), &small_stubs()).unwrap();
    let (mut sys, sp) = exec(&packed, PIE_BASE);
    sys.add_file("/lib/ld-fake.so", super::loader::fake_interp());
    let origin = PIE_BASE + packed.placement.stub_vaddr;
    let stub = sys.peek(origin, packed.stub_len).to_vec();
    let boot = boot(&packed, sp, origin, &stub);
    let handoff = run(&mut sys, &boot, packed.codec).unwrap();

    assert_eq!(handoff.mode, Mode::DynamicBootstrap);
    let auxv = sys.auxv(handoff.sp);
    let get = |tag| auxv.iter().find(|&&(t, _)| t == tag).map(|&(_, v)| v).unwrap();
    let bias = get(AT_ENTRY) - 0x1000;
    assert_eq!(handoff.entry, get(AT_BASE) + 0x1234);
    assert_eq!(get(AT_PHNUM), 4);
    assert_eq!(sys.peek(bias + 0x1000, 0x2000), &image[0x1000..0x3000]);
    assert_eq!(sys.auxv_terminator(handoff.sp), handoff.hatch.unwrap());
    assert_eq!(handoff.unmap, Some(Region { start: PIE_BASE + 0x5000, end: PIE_BASE + 0x6000 }));
}

#[test]
fn test_pack_manual_reloc() {
    // Without an interpreter the flag is kept.
    let mut image = pie_image();
    image[EHDR_SIZE..EHDR_SIZE + 4].copy_from_slice(&PT_NULL.to_le_bytes());
    let options = PackOptions { manual_reloc: true, ..PackOptions::default() };
    let (packed, _, handoff) = pack_and_run(&image, &options, PIE_BASE);
    assert_eq!(handoff.mode, Mode::ManualRelocate);
    let params = ParameterBlock::parse(&packed.data[0x140..]).unwrap();
    assert!(params.flags.contains(Flags::MANUAL_RELOC));

    // With one it is ignored.
    let packed = packer::pack(&pie_image(), &options, &small_stubs()).unwrap();
    let params = ParameterBlock::parse(&packed.data[0x140..]).unwrap();
    assert!(!params.flags.contains(Flags::MANUAL_RELOC));
}

#[test]
fn test_pack_filters() {
    let image = fixed_image(Arch::Aarch64);
    for &(choice, expected) in &[(FilterChoice::Bcj, Filter::Bcj), (FilterChoice::None, Filter::None)] {
        let options = PackOptions { filter: choice, ..PackOptions::default() };
        let (packed, sys, handoff) = pack_and_run(&image, &options, 0);
        assert_eq!(packed.filter, expected);
        assert_eq!(packed.arch, Arch::Aarch64);
        assert_eq!(handoff.entry, 0x401000);
        assert_eq!(sys.peek(0x401000, 0x2000), &image[0x1000..0x3000], "{:?}", choice);
    }
}

#[test]
fn test_pack_password() {
    let image = fixed_image(Arch::X86_64);
    let options = PackOptions { password: Some(b"hunter2".to_vec()), ..PackOptions::default() };
    let packed = packer::pack(&image, &options, &small_stubs()).unwrap();
    let stub = &packed.data[packed.placement.stub_offset as usize..][..packed.stub_len];
    let params = ParameterBlock::parse(&stub[params::find(stub).unwrap()..]).unwrap();
    assert_eq!(params.version, Version::Password);
    let check = params.password.unwrap();
    assert!(password::verify(check.salt, check.obfuscated_hash, b"hunter2\n"));
    assert!(!password::verify(check.salt, check.obfuscated_hash, b"hunter3"));

    let (mut sys, sp) = exec(&packed, 0);
    sys.stdin = b"hunter2\n".to_vec();
    let origin = packed.placement.stub_vaddr;
    let boot = boot(&packed, sp, origin, stub);
    assert_eq!(run(&mut sys, &boot, packed.codec).map(|h| h.entry), Ok(0x401000));

    let options = PackOptions { password: Some(b"\n".to_vec()), ..PackOptions::default() };
    match packer::pack(&image, &options, &small_stubs()) {
        Err(PackError::EmptyPassword) => (),
        x => panic!("{:?}", x),
    }
}

#[test]
fn test_pack_not_reduced() {
    // Too small to win anything.
    let mut image = tests::minimal_elf(Arch::X86_64, ET_EXEC, 0x401000, &[
        PhdrSpec::load(0, 0x400000, 0x200, 0x200, PF_R | PF_X),
    ], 0x200);
    image[0x100..0x200].copy_from_slice(&tests::code_like(0x100, 4));
    for &codec in &CodecId::ALL {
        match packer::pack(&image, &PackOptions { codec, ..PackOptions::default() }, &small_stubs()) {
            Err(err @ PackError::NotReduced { .. }) => assert!(err.is_soft()),
            x => panic!("{:?}", x),
        }
    }
    match packer::pack_best(&image, &PackOptions::default(), &small_stubs()) {
        Err(err) => assert!(err.is_soft(), "{:?}", err),
        x => panic!("{:?}", x),
    }
}

#[test]
fn test_pack_rejects() {
    match packer::pack(b"\x7fELF", &PackOptions::default(), &small_stubs()) {
        Err(PackError::Elf(FormatError::TooShort { len: 4 })) => (),
        x => panic!("{:?}", x),
    }
    let mut image = fixed_image(Arch::X86_64);
    image[18..20].copy_from_slice(&3u16.to_le_bytes());
    match packer::pack(&image, &PackOptions::default(), &small_stubs()) {
        Err(PackError::Elf(FormatError::Machine { machine: 3 })) => (),
        x => panic!("{:?}", x),
    }
    let mut image = fixed_image(Arch::X86_64);
    image[56..58].copy_from_slice(&65u16.to_le_bytes());
    match packer::pack(&image, &PackOptions::default(), &small_stubs()) {
        Err(PackError::TooManyPhdrs { count: 65 }) => (),
        x => panic!("{:?}", x),
    }
    let mut image = fixed_image(Arch::X86_64);
    image[32..40].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
    match packer::pack(&image, &PackOptions::default(), &small_stubs()) {
        Err(PackError::Elf(FormatError::PhdrPastEnd { .. })) => (),
        x => panic!("{:?}", x),
    }
}

#[test]
fn test_pack_best() {
    let image = fixed_image(Arch::X86_64);
    let best = packer::pack_best(&image, &PackOptions::default(), &small_stubs()).unwrap();
    for &codec in &CodecId::ALL {
        for &filter in &[FilterChoice::Bcj, FilterChoice::None] {
            let options = PackOptions { codec, filter, ..PackOptions::default() };
            if let Ok(packed) = packer::pack(&image, &options, &small_stubs()) {
                assert!(best.data.len() <= packed.data.len(), "{} {:?}", codec, filter);
            }
        }
    }
}

#[test]
fn test_pack_stage0() {
    let image = fixed_image(Arch::X86_64);
    let big = MemoryStubs::all(STAGE0_THRESHOLD + 0x1000);

    let packed = packer::pack(&image, &PackOptions::default(), &big).unwrap();
    assert!(packed.stage0);
    assert!(packed.stub_len < STAGE0_THRESHOLD);

    // Stage-0 inflates the stub, which then finds the block through the
    // addresses patched before wrapping.
    let (mut sys, sp) = exec(&packed, 0);
    let origin = packed.placement.stub_vaddr;
    let code = sys.peek(origin, packed.stub_len).to_vec();
    let s0 = stage0::Params::decode(&code[stage0::find(&code).unwrap()..]).unwrap();
    let inflated = stage0::launch(&mut sys, origin, &s0, PAGE).unwrap();
    let stub = sys.peek(inflated, s0.unpacked_len as usize).to_vec();
    let mut boot = boot(&packed, sp, origin, &stub);
    boot.own = Region { start: inflated, end: inflated + s0.region_len(PAGE) };
    let handoff = run(&mut sys, &boot, packed.codec).unwrap();
    assert_eq!(handoff.entry, 0x401000);
    assert_eq!(sys.peek(0x403000, 0x1000), &image[0x3000..0x4000]);

    let options = PackOptions { stage0: Stage0Mode::Never, ..PackOptions::default() };
    let packed = packer::pack(&image, &options, &big).unwrap();
    assert!(!packed.stage0);
    assert_eq!(packed.stub_len, STAGE0_THRESHOLD + 0x1000);

    // Small stubs are wrapped only on request.
    let packed = packer::pack(&image, &PackOptions::default(), &small_stubs()).unwrap();
    assert!(!packed.stage0);
    let options = PackOptions { stage0: Stage0Mode::Always, ..PackOptions::default() };
    assert!(packer::pack(&image, &options, &small_stubs()).unwrap().stage0);

    let mut missing = small_stubs();
    missing.files.remove("stage0-x86_64.bin");
    match packer::pack(&image, &options, &missing) {
        Err(PackError::MissingStub { name }) => assert_eq!(name, "stage0-x86_64.bin"),
        x => panic!("{:?}", x),
    }
}
