#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::macros::{map, xdp};
use aya_ebpf::maps::HashMap;
use aya_ebpf::programs::XdpContext;
use fdrop_common::frame::{
    ETH_HDR_LEN, ETH_P_IP, ETH_PROTO_OFFSET, IPV4_MIN_HDR_LEN, IPV4_SADDR_OFFSET, VLAN_HDR_LEN,
    VLAN_MAX_DEPTH, is_vlan,
};
use fdrop_common::{DEFAULT_CAPACITY, Increment, SrcKey, Verdict};

// Elements must stay valid for the whole program run after a concurrent
// delete, which only holds for non-preallocated hash maps.
const BPF_F_NO_PREALLOC: u32 = 1;

// Pinned by name under the loader's map pin path, so an existing pin is reused
// instead of a fresh map being created.
#[map(name = "fdrop_map_v1")]
static FDROP_MAP: HashMap<SrcKey, u64> =
    HashMap::<SrcKey, u64>::pinned(DEFAULT_CAPACITY, BPF_F_NO_PREALLOC);

#[xdp]
pub fn fdrop_simple(ctx: XdpContext) -> u32 {
    classify(&ctx) as u32
}

fn classify(ctx: &XdpContext) -> Verdict {
    let data = ctx.data();
    let data_end = ctx.data_end();
    match source_key(data, data_end) {
        Some(key) => Verdict::from(increment_if_present(&key)),
        None => Verdict::Pass,
    }
}

fn source_key(data: usize, data_end: usize) -> Option<SrcKey> {
    if data + ETH_HDR_LEN > data_end {
        return None;
    }
    let mut proto = read_be16(data + ETH_PROTO_OFFSET);
    let mut offset = ETH_HDR_LEN;

    for _ in 0..VLAN_MAX_DEPTH {
        if !is_vlan(proto) || data + offset + VLAN_HDR_LEN > data_end {
            break;
        }
        proto = read_be16(data + offset + 2);
        offset += VLAN_HDR_LEN;
    }

    if proto != ETH_P_IP {
        return None;
    }

    let ip = data + offset;
    if ip + IPV4_MIN_HDR_LEN > data_end {
        return None;
    }
    let ihl = unsafe { *(ip as *const u8) } & 0x0f;
    let header_len = (ihl as usize) * 4;
    if header_len < IPV4_MIN_HDR_LEN || ip + header_len > data_end {
        return None;
    }

    let saddr = unsafe { core::ptr::read_unaligned((ip + IPV4_SADDR_OFFSET) as *const u32) };
    Some(SrcKey(saddr))
}

#[inline(always)]
fn read_be16(addr: usize) -> u16 {
    u16::from_be(unsafe { core::ptr::read_unaligned(addr as *const u16) })
}

// Add in place, then confirm the row is still the one we bumped. A delete
// racing with the add leaves the increment on an unlinked element.
fn increment_if_present(key: &SrcKey) -> Increment {
    let Some(counter) = FDROP_MAP.get_ptr_mut(key) else {
        return Increment::NotPresent;
    };
    unsafe { AtomicU64::from_ptr(counter) }.fetch_add(1, Ordering::Relaxed);

    match FDROP_MAP.get_ptr(key) {
        Some(current) if core::ptr::eq(current, counter) => Increment::Incremented,
        _ => Increment::Vanished,
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
