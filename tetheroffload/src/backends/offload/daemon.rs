// Privileged offload daemon client surface used by the legacy backend

use anyhow::Result;
use std::net::Ipv6Addr;

use crate::rule::{ForwardingRule, MacAddr};
use crate::stats::InterfaceStats;

/// Rule as sent over the daemon RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleParcel {
    pub input_if_index: u32,
    pub output_if_index: u32,
    pub destination: Ipv6Addr,
    pub prefix_length: u8,
    pub src_l2_address: MacAddr,
    pub dst_l2_address: MacAddr,
}

impl From<&ForwardingRule> for RuleParcel {
    fn from(rule: &ForwardingRule) -> Self {
        Self {
            input_if_index: rule.upstream_if_index,
            output_if_index: rule.downstream_if_index,
            destination: rule.neighbor,
            prefix_length: 128,
            src_l2_address: rule.downstream_mac,
            dst_l2_address: rule.neighbor_mac,
        }
    }
}

/// RPC client of the privileged daemon that owns the forwarding tables
pub trait OffloadDaemon: Send {
    fn rule_add(&mut self, rule: &RuleParcel) -> Result<()>;

    fn rule_remove(&mut self, rule: &RuleParcel) -> Result<()>;

    /// Complete current cumulative table
    fn get_stats(&mut self) -> Result<Vec<InterfaceStats>>;

    fn set_interface_quota(&mut self, if_index: u32, quota_bytes: i64) -> Result<()>;

    /// Read and drop the counters and quota of one interface
    fn get_and_clear_stats(&mut self, if_index: u32) -> Result<InterfaceStats>;
}
