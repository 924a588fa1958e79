// Legacy backend: every operation is one RPC to the offload daemon

use anyhow::{Context, Result};

use super::daemon::{OffloadDaemon, RuleParcel};
use super::{BackendMode, OffloadBackend};
use crate::rule::ForwardingRule;
use crate::stats::InterfaceStats;

pub struct LegacyBackend {
    daemon: Box<dyn OffloadDaemon>,
}

impl LegacyBackend {
    pub fn new(daemon: Box<dyn OffloadDaemon>) -> Self {
        Self { daemon }
    }
}

impl OffloadBackend for LegacyBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Legacy
    }

    fn add_rule(&mut self, rule: &ForwardingRule) -> Result<()> {
        self.daemon
            .rule_add(&RuleParcel::from(rule))
            .with_context(|| format!("Daemon failed to add rule {}", rule))
    }

    fn remove_rule(&mut self, rule: &ForwardingRule) -> Result<()> {
        self.daemon
            .rule_remove(&RuleParcel::from(rule))
            .with_context(|| format!("Daemon failed to remove rule {}", rule))
    }

    fn get_all_stats(&mut self) -> Result<Vec<InterfaceStats>> {
        self.daemon
            .get_stats()
            .context("Daemon failed to report offload stats")
    }

    fn set_quota(&mut self, if_index: u32, quota_bytes: i64, _is_init: bool) -> Result<()> {
        self.daemon
            .set_interface_quota(if_index, quota_bytes)
            .with_context(|| format!("Daemon failed to set quota on interface {}", if_index))
    }

    fn get_and_clear_stats(&mut self, if_index: u32) -> Result<InterfaceStats> {
        self.daemon
            .get_and_clear_stats(if_index)
            .with_context(|| format!("Daemon failed to clear stats of interface {}", if_index))
    }
}
