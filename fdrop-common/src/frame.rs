//! Header layout of the frames the classifier looks at, plus a bounds-checked
//! parser over byte slices for userspace callers.
//!
//! The XDP program walks the same offsets with verifier-checked pointers.

use crate::SrcKey;

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_PROTO_OFFSET: usize = 12;
pub const VLAN_HDR_LEN: usize = 4;
/// Tags skipped before giving up on finding the network header.
pub const VLAN_MAX_DEPTH: usize = 2;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88A8;

pub const IPV4_MIN_HDR_LEN: usize = 20;
pub const IPV4_SADDR_OFFSET: usize = 12;

/// Why a frame carries no source address worth looking up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Skip {
    /// The frame ends before a header it announces.
    Truncated,
    /// Not an IPv4 frame.
    NotIpv4,
    /// IPv4 header length field below the 20 byte minimum.
    BadHeaderLength,
}

#[inline]
pub const fn is_vlan(proto: u16) -> bool {
    proto == ETH_P_8021Q || proto == ETH_P_8021AD
}

/// Returns the IPv4 source address of an Ethernet frame.
///
/// Up to [`VLAN_MAX_DEPTH`] VLAN tags are skipped. A tag cut short by the end
/// of the frame stops the walk and leaves the frame classified as non-IPv4.
pub fn ipv4_source(frame: &[u8]) -> Result<SrcKey, Skip> {
    let mut proto = read_be16(frame, ETH_PROTO_OFFSET).ok_or(Skip::Truncated)?;
    let mut offset = ETH_HDR_LEN;

    for _ in 0..VLAN_MAX_DEPTH {
        if !is_vlan(proto) {
            break;
        }
        match read_be16(frame, offset + 2) {
            Some(inner) => proto = inner,
            None => break,
        }
        offset += VLAN_HDR_LEN;
    }

    if proto != ETH_P_IP {
        return Err(Skip::NotIpv4);
    }

    let ip = frame
        .get(offset..offset + IPV4_MIN_HDR_LEN)
        .ok_or(Skip::Truncated)?;
    let header_len = usize::from(ip[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HDR_LEN {
        return Err(Skip::BadHeaderLength);
    }
    if frame.len() < offset + header_len {
        return Err(Skip::Truncated);
    }

    let saddr = &ip[IPV4_SADDR_OFFSET..IPV4_SADDR_OFFSET + 4];
    Ok(SrcKey::from_octets([saddr[0], saddr[1], saddr[2], saddr[3]]))
}

fn read_be16(frame: &[u8], offset: usize) -> Option<u16> {
    let bytes = frame.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
