#![no_std]

// Types shared between the XDP classifier and the userspace tools.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

use core::{fmt, net::Ipv4Addr};

pub mod frame;

/// Name of the block-list map inside the eBPF object and of its pin file.
pub const MAP_NAME: &str = "fdrop_map_v1";
/// Entry point of the XDP classifier inside the eBPF object.
pub const PROGRAM_NAME: &str = "fdrop_simple";
/// Rows the block-list holds unless told otherwise.
pub const DEFAULT_CAPACITY: u32 = 4096;

pub const KEY_SIZE: u32 = core::mem::size_of::<SrcKey>() as u32;
pub const VALUE_SIZE: u32 = core::mem::size_of::<u64>() as u32;

/// IPv4 source address exactly as it sits in the packet header.
///
/// The wrapped integer holds the four header bytes in network order, read
/// without swapping, so the kernel and userspace agree on the key bytes.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SrcKey(pub u32);

impl SrcKey {
    pub const fn from_octets(octets: [u8; 4]) -> Self {
        Self(u32::from_ne_bytes(octets))
    }

    pub const fn octets(self) -> [u8; 4] {
        self.0.to_ne_bytes()
    }
}

impl From<Ipv4Addr> for SrcKey {
    fn from(addr: Ipv4Addr) -> Self {
        Self::from_octets(addr.octets())
    }
}

impl From<SrcKey> for Ipv4Addr {
    fn from(key: SrcKey) -> Self {
        Ipv4Addr::from(key.octets())
    }
}

impl fmt::Display for SrcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Per-packet outcome. Discriminants are the XDP action codes.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Verdict {
    Aborted = 0,
    Drop = 1,
    Pass = 2,
}

/// Result of bumping the counter of one row.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Increment {
    /// The row existed and its counter went up by one.
    Incremented,
    /// No row for the key.
    NotPresent,
    /// The row was found but removed before the update committed.
    Vanished,
}

impl From<Increment> for Verdict {
    fn from(outcome: Increment) -> Self {
        match outcome {
            Increment::Incremented => Verdict::Drop,
            Increment::NotPresent => Verdict::Pass,
            Increment::Vanished => Verdict::Aborted,
        }
    }
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for the key so it can be used with
// aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::SrcKey;
    use aya::Pod;

    unsafe impl Pod for SrcKey {}
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn key_keeps_header_byte_order() {
        let key = SrcKey::from(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(key.octets(), [10, 0, 0, 5]);
        assert_eq!(key.0.to_ne_bytes(), [10, 0, 0, 5]);
        assert_eq!(Ipv4Addr::from(key), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn key_displays_dotted_quad() {
        assert_eq!(SrcKey::from_octets([192, 168, 1, 254]).to_string(), "192.168.1.254");
    }

    #[test]
    fn verdict_follows_increment_outcome() {
        assert_eq!(Verdict::from(Increment::Incremented), Verdict::Drop);
        assert_eq!(Verdict::from(Increment::NotPresent), Verdict::Pass);
        assert_eq!(Verdict::from(Increment::Vanished), Verdict::Aborted);
        assert_eq!(Verdict::Aborted as u32, 0);
        assert_eq!(Verdict::Drop as u32, 1);
        assert_eq!(Verdict::Pass as u32, 2);
    }

    #[test]
    fn schema_sizes() {
        assert_eq!(KEY_SIZE, 4);
        assert_eq!(VALUE_SIZE, 8);
    }
}
