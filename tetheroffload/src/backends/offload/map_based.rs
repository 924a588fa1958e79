// Map-based backend: rules, stats and limits live directly in pinned kernel maps

use anyhow::{Context, Result, anyhow, bail};
use tetheroffload_common::{
    ETH_P_IPV6, ETHER_MTU, Tether6Value, TetherLimitKey, TetherLimitValue, TetherStatsKey,
    TetherStatsValue, TetherUpstream6Key, ZERO_MAC,
};

use super::map::MapSet;
use super::{BackendMode, OffloadBackend};
use crate::rule::ForwardingRule;
use crate::stats::{ForwardedStats, InterfaceStats};

pub struct MapBackend {
    maps: MapSet,
}

impl MapBackend {
    pub fn new(maps: MapSet) -> Self {
        Self { maps }
    }
}

impl OffloadBackend for MapBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::MapBased
    }

    fn add_rule(&mut self, rule: &ForwardingRule) -> Result<()> {
        self.maps
            .downstream6
            .update(rule.downstream6_key(), rule.tether6_value())
            .with_context(|| format!("Could not update entry for rule {}", rule))
    }

    fn remove_rule(&mut self, rule: &ForwardingRule) -> Result<()> {
        let removed = self
            .maps
            .downstream6
            .delete(&rule.downstream6_key())
            .with_context(|| format!("Could not delete entry for rule {}", rule))?;
        if !removed {
            log::warn!("Rule {} was not in the downstream map", rule);
        }
        Ok(())
    }

    fn start_upstream_forwarding(&mut self, downstream_if: u32, upstream_if: u32) -> Result<()> {
        let key = TetherUpstream6Key::new(downstream_if);
        let value = Tether6Value::new(upstream_if, ZERO_MAC, ZERO_MAC, ETH_P_IPV6, ETHER_MTU);
        self.maps.upstream6.insert(key, value).with_context(|| {
            format!(
                "Could not insert upstream binding {} -> {}",
                downstream_if, upstream_if
            )
        })
    }

    fn stop_upstream_forwarding(&mut self, downstream_if: u32, upstream_if: u32) -> Result<()> {
        let removed = self
            .maps
            .upstream6
            .delete(&TetherUpstream6Key::new(downstream_if))
            .with_context(|| {
                format!(
                    "Could not delete upstream binding {} -> {}",
                    downstream_if, upstream_if
                )
            })?;
        if !removed {
            log::warn!(
                "Upstream binding {} -> {} was not in the upstream map",
                downstream_if,
                upstream_if
            );
        }
        Ok(())
    }

    fn get_all_stats(&mut self) -> Result<Vec<InterfaceStats>> {
        let mut all = Vec::new();
        self.maps
            .stats
            .for_each(&mut |key, value| {
                all.push(InterfaceStats::new(key.ifindex, ForwardedStats::from(value)));
            })
            .context("Could not read the stats map")?;
        Ok(all)
    }

    fn set_quota(&mut self, if_index: u32, quota_bytes: i64, is_init: bool) -> Result<()> {
        let key = TetherStatsKey::new(if_index);
        let existing = self
            .maps
            .stats
            .get(&key)
            .with_context(|| format!("Could not read stats entry of interface {}", if_index))?;

        // The limit is only meaningful next to a stats entry the program can count into
        if is_init {
            match existing {
                Some(_) => log::warn!(
                    "Stats entry of interface {} already exists, keeping its counters",
                    if_index
                ),
                None => self
                    .maps
                    .stats
                    .insert(key, TetherStatsValue::new())
                    .with_context(|| {
                        format!("Could not create stats entry of interface {}", if_index)
                    })?,
            }
        } else if existing.is_none() {
            bail!("Stats entry of interface {} is missing", if_index);
        }

        self.maps
            .limit
            .update(
                TetherLimitKey::new(if_index),
                TetherLimitValue::new(quota_bytes),
            )
            .with_context(|| format!("Could not update limit of interface {}", if_index))
    }

    fn get_and_clear_stats(&mut self, if_index: u32) -> Result<InterfaceStats> {
        let key = TetherStatsKey::new(if_index);
        let value = self
            .maps
            .stats
            .get(&key)
            .with_context(|| format!("Could not read stats entry of interface {}", if_index))?
            .ok_or_else(|| anyhow!("No stats entry for interface {}", if_index))?;

        self.maps
            .stats
            .delete(&key)
            .with_context(|| format!("Could not delete stats entry of interface {}", if_index))?;

        // Past this point the snapshot is always returned
        match self.maps.limit.delete(&TetherLimitKey::new(if_index)) {
            Ok(true) => {}
            Ok(false) => log::warn!("No limit entry for interface {}", if_index),
            Err(e) => log::error!(
                "❌ Could not delete limit of interface {}: {:#}",
                if_index,
                e
            ),
        }

        Ok(InterfaceStats::new(if_index, ForwardedStats::from(&value)))
    }

    fn clear_all(&mut self) -> Result<()> {
        let results = [
            ("downstream4", self.maps.downstream4.clear()),
            ("upstream4", self.maps.upstream4.clear()),
            ("downstream6", self.maps.downstream6.clear()),
            ("upstream6", self.maps.upstream6.clear()),
            ("stats", self.maps.stats.clear()),
            ("limit", self.maps.limit.clear()),
        ];

        let errors: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| format!("{}: {:#}", name, e)))
            .collect();

        if errors.is_empty() {
            log::debug!("Cleared all offload maps");
            Ok(())
        } else {
            Err(anyhow!("Failed to clear offload maps: {:?}", errors))
        }
    }
}
