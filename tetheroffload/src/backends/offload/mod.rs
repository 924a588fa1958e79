// Offload backend trait and implementations

use anyhow::Result;
use std::fmt;

use crate::rule::ForwardingRule;
use crate::stats::InterfaceStats;

pub mod daemon;
pub mod legacy;
pub mod map;
pub mod map_based;

pub use daemon::OffloadDaemon;
pub use legacy::LegacyBackend;
pub use map::{OffloadMaps, open_pinned_maps};
pub use map_based::MapBackend;

/// Kernel-facing mechanism behind the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Every operation is an RPC to the privileged daemon
    Legacy,
    /// Direct access to the pinned kernel maps
    MapBased,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Legacy => write!(f, "legacy"),
            BackendMode::MapBased => write!(f, "map-based"),
        }
    }
}

/// Uniform rule/stats/quota operations over the kernel forwarding path
pub trait OffloadBackend: Send {
    /// Backend mode, fixed at construction
    fn mode(&self) -> BackendMode;

    /// Install a downstream forwarding rule
    fn add_rule(&mut self, rule: &ForwardingRule) -> Result<()>;

    /// Remove a downstream forwarding rule
    fn remove_rule(&mut self, rule: &ForwardingRule) -> Result<()>;

    /// Rebind a rule to a different upstream
    fn update_rule(&mut self, old: &ForwardingRule, new: &ForwardingRule) -> Result<()> {
        self.remove_rule(old)?;
        self.add_rule(new)
    }

    /// Install the neighbor-agnostic upstream binding of a downstream.
    /// Default implementation does nothing (the daemon manages it itself).
    fn start_upstream_forwarding(&mut self, _downstream_if: u32, _upstream_if: u32) -> Result<()> {
        Ok(())
    }

    /// Remove the upstream binding of a downstream
    fn stop_upstream_forwarding(&mut self, _downstream_if: u32, _upstream_if: u32) -> Result<()> {
        Ok(())
    }

    /// Full cumulative snapshot of every interface with counters
    fn get_all_stats(&mut self) -> Result<Vec<InterfaceStats>>;

    /// Push a data limit. `is_init` is set on the first rule of an upstream.
    fn set_quota(&mut self, if_index: u32, quota_bytes: i64, is_init: bool) -> Result<()>;

    /// Read the counters of one interface and drop its stats and limit state
    fn get_and_clear_stats(&mut self, if_index: u32) -> Result<InterfaceStats>;

    /// Drop every entry left by a previous instance
    fn clear_all(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Capability a backend can be built from
pub enum BackendSource {
    /// Probed kernel maps
    Maps(OffloadMaps),
    /// Daemon client, `None` when the daemon is unreachable
    Daemon(Option<Box<dyn OffloadDaemon>>),
}

/// Build the backend, or `None` when offload must stay disabled
pub fn select_backend(enabled: bool, source: BackendSource) -> Option<Box<dyn OffloadBackend>> {
    if !enabled {
        log::info!("Tethering offload disabled by configuration");
        return None;
    }

    match source {
        BackendSource::Maps(maps) => match maps.complete() {
            Ok(set) => {
                log::info!("Using map-based offload backend");
                Some(Box::new(MapBackend::new(set)))
            }
            Err(missing) => {
                log::error!(
                    "❌ Tethering offload disabled, maps not available: {}",
                    missing.join(", ")
                );
                None
            }
        },
        BackendSource::Daemon(Some(daemon)) => {
            log::info!("Using legacy offload backend");
            Some(Box::new(LegacyBackend::new(daemon)))
        }
        BackendSource::Daemon(None) => {
            log::error!("❌ Tethering offload disabled, offload daemon not available");
            None
        }
    }
}
