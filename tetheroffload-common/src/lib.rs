#![cfg_attr(not(test), no_std)]

//! Kernel record layouts shared between the tethering offload coordinator and
//! the forwarding program. All structs are `#[repr(C)]` without padding so the
//! in-memory representation is exactly the map key/value layout.

/// Quota value meaning "no data limit".
pub const QUOTA_UNLIMITED: i64 = -1;

/// EtherType of IPv6.
pub const ETH_P_IPV6: u16 = 0x86dd;

/// Default ethernet MTU used as the path MTU for offloaded IPv6 flows.
pub const ETHER_MTU: u16 = 1500;

/// All-zero MAC address, used by the neighbor-agnostic upstream binding.
pub const ZERO_MAC: [u8; 6] = [0; 6];

fn put(buf: &mut [u8], offset: usize, src: &[u8]) -> usize {
    buf[offset..offset + src.len()].copy_from_slice(src);
    offset + src.len()
}

/// Key of the downstream IPv6 map: traffic entering on `iif` for neighbor `neigh6`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TetherDownstream6Key {
    /// Input (upstream) interface index
    pub iif: u32,
    /// Neighbor IPv6 address, network byte order
    pub neigh6: [u8; 16],
}

// SAFETY: TetherDownstream6Key is a plain old data type without padding
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TetherDownstream6Key {}

impl TetherDownstream6Key {
    pub const fn new(iif: u32, neigh6: [u8; 16]) -> Self {
        Self { iif, neigh6 }
    }

    /// iif (4) + neigh6 (16)
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        let off = put(&mut buf, 0, &self.iif.to_ne_bytes());
        put(&mut buf, off, &self.neigh6);
        buf
    }
}

/// Key of the upstream IPv6 map: one entry per downstream interface
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TetherUpstream6Key {
    /// Input (downstream) interface index
    pub iif: u32,
}

// SAFETY: single u32 field
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TetherUpstream6Key {}

impl TetherUpstream6Key {
    pub const fn new(iif: u32) -> Self {
        Self { iif }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.iif.to_ne_bytes()
    }
}

/// Value shared by the downstream and upstream IPv6 maps
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tether6Value {
    /// Output interface to redirect to
    pub oif: u32,
    pub eth_dst_mac: [u8; 6],
    pub eth_src_mac: [u8; 6],
    /// EtherType, stored in network byte order
    pub eth_proto: u16,
    /// Path MTU of the output route
    pub pmtu: u16,
}

// SAFETY: Tether6Value is a plain old data type without padding
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for Tether6Value {}

impl Tether6Value {
    pub const fn new(
        oif: u32,
        eth_dst_mac: [u8; 6],
        eth_src_mac: [u8; 6],
        eth_proto: u16,
        pmtu: u16,
    ) -> Self {
        Self {
            oif,
            eth_dst_mac,
            eth_src_mac,
            eth_proto: eth_proto.to_be(),
            pmtu,
        }
    }

    /// EtherType in host byte order
    pub const fn eth_proto(&self) -> u16 {
        u16::from_be(self.eth_proto)
    }

    /// oif (4) + ethDstMac (6) + ethSrcMac (6) + ethProto (2) + pmtu (2)
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        let mut off = put(&mut buf, 0, &self.oif.to_ne_bytes());
        off = put(&mut buf, off, &self.eth_dst_mac);
        off = put(&mut buf, off, &self.eth_src_mac);
        off = put(&mut buf, off, &self.eth_proto.to_ne_bytes());
        put(&mut buf, off, &self.pmtu.to_ne_bytes());
        buf
    }
}

/// Key of the IPv4 downstream/upstream maps. Only cleared by userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tether4Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub l4_proto: u8,
    pub pad: u8,
    pub src4: [u8; 4],
    pub dst4: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
}

// SAFETY: Tether4Key is a plain old data type without padding
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for Tether4Key {}

/// Value of the IPv4 downstream/upstream maps. Only cleared by userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tether4Value {
    pub oif: u32,
    pub eth_dst_mac: [u8; 6],
    pub eth_src_mac: [u8; 6],
    pub eth_proto: u16,
    pub pmtu: u16,
    pub src46: [u8; 16],
    pub dst46: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub last_used: u64,
}

// SAFETY: Tether4Value is a plain old data type without padding
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for Tether4Value {}

/// Key of the per-interface stats map
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TetherStatsKey {
    pub ifindex: u32,
}

// SAFETY: single u32 field
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TetherStatsKey {}

impl TetherStatsKey {
    pub const fn new(ifindex: u32) -> Self {
        Self { ifindex }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.ifindex.to_ne_bytes()
    }
}

/// Cumulative forwarded traffic of one upstream interface, maintained by the kernel
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TetherStatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

// SAFETY: TetherStatsValue is a plain old data type with all u64 fields
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TetherStatsValue {}

impl TetherStatsValue {
    pub const fn new() -> Self {
        Self {
            rx_packets: 0,
            rx_bytes: 0,
            rx_errors: 0,
            tx_packets: 0,
            tx_bytes: 0,
            tx_errors: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        let mut buf = [0u8; 48];
        let mut off = 0;
        for counter in [
            self.rx_packets,
            self.rx_bytes,
            self.rx_errors,
            self.tx_packets,
            self.tx_bytes,
            self.tx_errors,
        ] {
            off = put(&mut buf, off, &counter.to_ne_bytes());
        }
        buf
    }
}

/// Key of the per-interface limit map
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TetherLimitKey {
    pub ifindex: u32,
}

// SAFETY: single u32 field
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TetherLimitKey {}

impl TetherLimitKey {
    pub const fn new(ifindex: u32) -> Self {
        Self { ifindex }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.ifindex.to_ne_bytes()
    }
}

/// Remaining data limit of one upstream interface in bytes, `QUOTA_UNLIMITED` for none
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TetherLimitValue {
    pub limit: i64,
}

// SAFETY: single i64 field
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TetherLimitValue {}

impl TetherLimitValue {
    pub const fn new(limit: i64) -> Self {
        Self { limit }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.limit.to_ne_bytes()
    }
}
