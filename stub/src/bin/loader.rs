//! The loader stub. Cargo features pick the variant: one of `static` and
//! `dynamic`, one of `lz4`, `lzma`, and `rle`, and optionally `password`.

#![no_std]
#![no_main]

use elfpack::codec;
use elfpack::loader::{self, Boot, Fatal, Linkage};
use elfpack::params::{ParameterBlock, Version, V2_LEN};
use elfpack::scan::Region;
use elfpack_stub::linux::{self, Linux};
use elfpack_stub::{arch, params_template, read_patched, stub_end};

#[cfg(all(feature = "static", not(feature = "dynamic")))]
const LINKAGE: Linkage = Linkage::Static;
#[cfg(all(feature = "dynamic", not(feature = "static")))]
const LINKAGE: Linkage = Linkage::Dynamic;
#[cfg(not(any(
    all(feature = "static", not(feature = "dynamic")),
    all(feature = "dynamic", not(feature = "static")),
)))]
compile_error!("build the loader with exactly one of the `static` and `dynamic` features");

#[cfg(all(feature = "lz4", not(any(feature = "lzma", feature = "rle"))))]
type Codec = codec::Lz4;
#[cfg(all(feature = "lzma", not(any(feature = "lz4", feature = "rle"))))]
type Codec = codec::Lzma;
#[cfg(all(feature = "rle", not(any(feature = "lz4", feature = "lzma"))))]
type Codec = codec::Rle;
#[cfg(not(any(
    all(feature = "lz4", not(any(feature = "lzma", feature = "rle"))),
    all(feature = "lzma", not(any(feature = "lz4", feature = "rle"))),
    all(feature = "rle", not(any(feature = "lz4", feature = "lzma"))),
)))]
compile_error!("build the loader with exactly one of the `lz4`, `lzma`, and `rle` features");

#[cfg(feature = "password")]
const VERSION: Version = Version::Password;
#[cfg(not(feature = "password"))]
const VERSION: Version = Version::Plain;

#[used]
#[link_section = ".rodata.params"]
static PARAMS: [u8; V2_LEN] = params_template(VERSION);

#[no_mangle]
pub extern "C" fn stub_main(sp: u64, here: u64, origin: u64) -> ! {
    let mut sys = Linux;
    let fatal = match boot(sp, here, origin).and_then(|boot| loader::run::<_, Codec>(&mut sys, &boot)) {
        Ok(handoff) => unsafe { arch::transfer(&handoff) },
        Err(fatal) => fatal,
    };
    linux::exit(fatal.code())
}

fn boot(sp: u64, here: u64, origin: u64) -> Result<Boot, Fatal> {
    let params = ParameterBlock::decode(&read_patched(&PARAMS)).map_err(|_| Fatal::Params)?;
    if params.version != VERSION {
        return Err(Fatal::Params);
    }
    Ok(Boot {
        arch: arch::ARCH,
        linkage: LINKAGE,
        sp,
        // Stage-0 runs where the packer put the stub and passes that address.
        origin: if origin != 0 { origin } else { here },
        own: Region { start: here, end: stub_end() },
        params,
    })
}
