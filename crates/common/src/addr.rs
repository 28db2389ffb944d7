//! Address-block allocation and peer address derivation
//!
//! Each device owns a randomly placed block: IPv4 under 10/8, IPv6 under
//! fdf9::/16. Non-overlap across devices is probabilistic (large random
//! offsets from a CSPRNG), not checked. Within a block, addresses are a pure
//! function of the peer ordinal.

use crate::rng::RandomSource;
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Low addresses in every block, reserved for the device itself and future
/// use. Peer ordinal 1 lands at base + 39.
pub const RESERVED_ADDRS: u32 = 38;

/// Prefix length advertised on the device's own interface address; /18 and
/// /114 leave room for roughly 16k peers per device.
pub const IPV4_PREFIX: u8 = 18;
pub const IPV6_PREFIX: u8 = 114;

/// Addresses in a device block under the prefixes above.
pub const BLOCK_CAPACITY: u32 = 1 << 14;

const IPV4_ROOT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
const IPV6_ROOT: Ipv6Addr = Ipv6Addr::new(0xfdf9, 0, 0, 0, 0, 0, 0, 0);

/// Pick a fresh device block: 10.0.0.0 plus a random 16-bit multiple of 256,
/// and fdf9:: plus a random 32-bit multiple of 2^80.
pub fn allocate_block(rng: &dyn RandomSource) -> (Ipv4Addr, Ipv6Addr) {
    let v4 = u32::from(IPV4_ROOT) + ((rng.below(1 << 16) as u32) << 8);
    let v6 = u128::from(IPV6_ROOT) + ((rng.below(1 << 32) as u128) << 80);
    (Ipv4Addr::from(v4), Ipv6Addr::from(v6))
}

/// The device's own IPv4 interface address: base + 1, advertised with the
/// block prefix so peers can route back.
pub fn device_ipv4(base: Ipv4Addr) -> Ipv4Network {
    let addr = Ipv4Addr::from(u32::from(base) + 1);
    Ipv4Network::new(addr, IPV4_PREFIX).expect("constant prefix is valid")
}

/// The device's own IPv6 interface address: base + 1 with the block prefix.
pub fn device_ipv6(base: Ipv6Addr) -> Ipv6Network {
    let addr = Ipv6Addr::from(u128::from(base) + 1);
    Ipv6Network::new(addr, IPV6_PREFIX).expect("constant prefix is valid")
}

/// A peer's two addresses: base + RESERVED_ADDRS + ordinal in each family.
///
/// Pure and reproducible for a fixed base and ordinal. Ordinals beyond the
/// block capacity silently spill past the block; staying under capacity is
/// the caller's contract.
pub fn peer_addresses(v4_base: Ipv4Addr, v6_base: Ipv6Addr, ordinal: i64) -> (Ipv4Addr, Ipv6Addr) {
    let offset = RESERVED_ADDRS as i64 + ordinal;
    let v4 = u32::from(v4_base).wrapping_add(offset as u32);
    let v6 = u128::from(v6_base).wrapping_add(offset as u128);
    (Ipv4Addr::from(v4), Ipv6Addr::from(v6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SeededRandom;
    use std::collections::HashSet;

    #[test]
    fn test_block_shape() {
        let rng = SeededRandom::new(3);
        for _ in 0..100 {
            let (v4, v6) = allocate_block(&rng);
            let v4 = u32::from(v4);
            assert_eq!(v4 >> 24, 10, "IPv4 base stays under 10/8");
            assert_eq!(v4 & 0xff, 0, "IPv4 base is 256-aligned");
            let v6 = u128::from(v6);
            assert_eq!(v6 >> 112, 0xfdf9);
            assert_eq!(v6 & ((1 << 80) - 1), 0, "IPv6 base is 2^80-aligned");
        }
    }

    #[test]
    fn test_device_addresses() {
        let base: Ipv4Addr = "10.110.169.0".parse().unwrap();
        assert_eq!(device_ipv4(base).to_string(), "10.110.169.1/18");

        let base: Ipv6Addr = "fdf9:1234::".parse().unwrap();
        assert_eq!(device_ipv6(base).to_string(), "fdf9:1234::1/114");
    }

    #[test]
    fn test_peer_addresses_deterministic() {
        let v4: Ipv4Addr = "10.3.7.0".parse().unwrap();
        let v6: Ipv6Addr = "fdf9:aa::".parse().unwrap();
        let first = peer_addresses(v4, v6, 1);
        assert_eq!(first, peer_addresses(v4, v6, 1));
        assert_eq!(first.0.to_string(), "10.3.7.39");
        assert_eq!(first.1.to_string(), "fdf9:aa::27");
    }

    #[test]
    fn test_no_collisions_below_capacity() {
        let v4: Ipv4Addr = "10.200.4.0".parse().unwrap();
        let v6: Ipv6Addr = "fdf9:77::".parse().unwrap();
        let mut seen = HashSet::new();
        let limit = (BLOCK_CAPACITY - RESERVED_ADDRS) as i64;
        for ordinal in 0..limit {
            assert!(seen.insert(peer_addresses(v4, v6, ordinal)));
        }
    }

    #[test]
    fn test_capacity_boundary_spills() {
        // Ordinals past the block capacity are an unchecked caller error:
        // the derived address walks out of the 2^14-address window.
        let v4: Ipv4Addr = "10.200.4.0".parse().unwrap();
        let v6: Ipv6Addr = "fdf9:77::".parse().unwrap();
        let past_capacity = (BLOCK_CAPACITY - RESERVED_ADDRS) as i64;
        let (spilled, _) = peer_addresses(v4, v6, past_capacity);
        assert_eq!(
            u32::from(spilled) - u32::from(v4),
            BLOCK_CAPACITY,
            "first out-of-capacity ordinal lands one past the block"
        );
    }
}
