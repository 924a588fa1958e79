// Forwarding rule model and kernel record builders

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use tetheroffload_common::{ETH_P_IPV6, ETHER_MTU, Tether6Value, TetherDownstream6Key};

/// Ethernet MAC address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("MAC address too short: {}", s))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| anyhow!("Invalid MAC address octet '{}' in {}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(anyhow!("MAC address too long: {}", s));
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Opaque identifier of a traffic-serving downstream (one per served interface)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownstreamId(pub String);

impl DownstreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DownstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IPv6 forwarding rule: traffic arriving on the upstream for `neighbor` is
/// rewritten with the given MACs and sent out of the downstream interface.
///
/// Rules are immutable. Moving a rule to another upstream builds a new one
/// with [`ForwardingRule::on_new_upstream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub upstream_if_index: u32,
    pub downstream_if_index: u32,
    pub neighbor: Ipv6Addr,
    /// MAC of the downstream interface (ethernet source)
    pub downstream_mac: MacAddr,
    /// MAC of the neighbor (ethernet destination)
    pub neighbor_mac: MacAddr,
}

impl ForwardingRule {
    pub fn new(
        upstream_if_index: u32,
        downstream_if_index: u32,
        neighbor: Ipv6Addr,
        downstream_mac: MacAddr,
        neighbor_mac: MacAddr,
    ) -> Self {
        Self {
            upstream_if_index,
            downstream_if_index,
            neighbor,
            downstream_mac,
            neighbor_mac,
        }
    }

    /// Same rule bound to a different upstream interface
    pub fn on_new_upstream(&self, upstream_if_index: u32) -> Self {
        Self {
            upstream_if_index,
            ..*self
        }
    }

    pub fn downstream6_key(&self) -> TetherDownstream6Key {
        TetherDownstream6Key::new(self.upstream_if_index, self.neighbor.octets())
    }

    pub fn tether6_value(&self) -> Tether6Value {
        Tether6Value::new(
            self.downstream_if_index,
            self.neighbor_mac.octets(),
            self.downstream_mac.octets(),
            ETH_P_IPV6,
            ETHER_MTU,
        )
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} -> {} [{} -> {}]",
            self.neighbor,
            self.upstream_if_index,
            self.downstream_if_index,
            self.downstream_mac,
            self.neighbor_mac
        )
    }
}
