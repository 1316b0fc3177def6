//! LocatePayload: the patched address when there is one, a maps scan
//! otherwise.

use super::{Boot, Fatal, System};
use crate::codec::Codec;
use crate::container::{Layout, PackedHeader, MARKER_LEN};
use crate::scan;

const MAPS_PATH: &[u8] = b"/proc/self/maps\0";
const MAPS_BUF_LEN: usize = 16 * 1024;

pub(super) fn locate<S: System, C: Codec>(sys: &mut S, boot: &Boot) -> Result<u64, Fatal> {
    match boot.params.packed_data_addr(boot.origin) {
        Some(addr) => {
            check_direct::<S, C>(sys, boot, addr)?;
            Ok(addr)
        }
        None => scan_maps::<S, C>(sys, boot),
    }
}

fn check_direct<S: System, C: Codec>(sys: &S, boot: &Boot, addr: u64) -> Result<(), Fatal> {
    let layout = Layout::for_flags(boot.params.flags);
    let bytes = sys.memory(addr, layout.header_len()).map_err(|_| Fatal::PayloadNotFound)?;
    if bytes[..MARKER_LEN] != C::ID.marker() {
        return Err(Fatal::Marker);
    }
    let header = PackedHeader::parse(bytes, layout).map_err(|_| Fatal::Marker)?;
    header.check_plausible().map_err(|_| Fatal::Params)
}

fn scan_maps<S: System, C: Codec>(sys: &mut S, boot: &Boot) -> Result<u64, Fatal> {
    let fd = sys.open(MAPS_PATH).map_err(|_| Fatal::PayloadNotFound)?;
    let mut maps = [0u8; MAPS_BUF_LEN];
    let read = sys.read_all(fd, &mut maps);
    sys.close(fd);
    let n = read.map_err(|_| Fatal::PayloadNotFound)?;

    for region in scan::regions(&maps[..n], boot.origin) {
        let bytes = match sys.memory(region.start, region.len() as usize) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        if let Some(offset) = scan::find_block::<C>(bytes, boot.params.flags) {
            return Ok(region.start + offset as u64);
        }
    }
    Err(Fatal::PayloadNotFound)
}
