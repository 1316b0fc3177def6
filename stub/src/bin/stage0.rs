//! Stage-0: inflates the `rle` stream that follows it and enters the loader
//! it contains.

#![no_std]
#![no_main]

use elfpack::loader::Fatal;
use elfpack::stage0::{self, PARAMS_LEN};
use elfpack_stub::linux::{self, Linux};
use elfpack_stub::{arch, read_patched, stage0_template};

const PAGE: u64 = 0x1000;

#[used]
#[link_section = ".rodata.params"]
static PARAMS: [u8; PARAMS_LEN] = stage0_template();

#[no_mangle]
pub extern "C" fn stub_main(sp: u64, here: u64, _origin: u64) -> ! {
    let mut sys = Linux;
    let fatal = match stage0::Params::decode(&read_patched(&PARAMS)) {
        Some(params) => match stage0::launch(&mut sys, here, &params, PAGE) {
            Ok(entry) => unsafe { arch::enter_stub(sp, entry, here) },
            Err(fatal) => fatal,
        },
        None => Fatal::Params,
    };
    linux::exit(fatal.code())
}
