// Offload coordinator: composes the rule, quota, stats, attachment and
// conntrack components behind one set of operations

pub mod attach;
pub mod conntrack;
pub mod poller;
pub mod quota;
pub mod registry;
pub mod upstream;

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::backends::attach::ProgramAttacher;
use crate::backends::conntrack::ConntrackMonitor;
use crate::backends::offload::{BackendMode, BackendSource, OffloadBackend, select_backend};
use crate::config::Config;
use crate::error::OffloadError;
use crate::rule::{DownstreamId, ForwardingRule};
use crate::stats::StatsSink;

use attach::ProgramAttachmentManager;
use conntrack::ConntrackLifecycle;
use poller::StatsTracker;
use quota::{QuotaManager, validate_quota};
use registry::RuleRegistry;
use upstream::UpstreamTable;

/// New upstream of a downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamInfo {
    pub if_index: u32,
    pub name: String,
}

/// Collaborators injected at construction
pub struct CoordinatorDeps {
    pub config: Config,
    pub backend: BackendSource,
    pub sink: Box<dyn StatsSink>,
    pub conntrack: Box<dyn ConntrackMonitor>,
    pub attacher: Option<Box<dyn ProgramAttacher>>,
}

pub struct Coordinator {
    /// `None` means offload is disabled for the lifetime of this instance
    backend: Option<Box<dyn OffloadBackend>>,
    registry: RuleRegistry,
    upstreams: UpstreamTable,
    quota: QuotaManager,
    tracker: StatsTracker,
    attachments: ProgramAttachmentManager,
    conntrack: ConntrackLifecycle,
    sink: Box<dyn StatsSink>,
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let CoordinatorDeps {
            config,
            backend,
            sink,
            conntrack,
            attacher,
        } = deps;

        let mut backend = select_backend(config.offload_enabled, backend);
        if let Some(backend) = backend.as_deref_mut() {
            // Entries left behind by a previous instance
            if let Err(e) = backend.clear_all() {
                log::error!("❌ {:#}", e);
            }
        }

        let mut coordinator = Self {
            backend,
            registry: RuleRegistry::new(),
            upstreams: UpstreamTable::new(),
            quota: QuotaManager::new(),
            tracker: StatsTracker::new(config.poll_interval_ms),
            attachments: ProgramAttachmentManager::new(attacher),
            conntrack: ConntrackLifecycle::new(conntrack),
            sink,
        };

        for (iface, quota_bytes) in &config.data_limits {
            if let Err(e) = coordinator.set_limit(iface, *quota_bytes) {
                log::warn!("⚠️  Ignoring configured limit for {}: {}", iface, e);
            }
        }

        coordinator
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn mode(&self) -> Option<BackendMode> {
        self.backend.as_ref().map(|b| b.mode())
    }

    /// Record the name of an upstream for stats attribution and limit lookup
    pub fn add_upstream_name(&mut self, if_index: u32, name: &str) {
        let Some(backend) = self.backend.as_deref_mut() else {
            return;
        };
        if if_index == 0 || name.is_empty() {
            log::debug!("Ignoring upstream name {:?} for index {}", name, if_index);
            return;
        }

        if self.upstreams.set_name(if_index, name) {
            log::debug!("Upstream {} is {}", if_index, name);
            self.quota
                .on_name_registered(if_index, name, backend, &mut self.upstreams);
        }
    }

    pub fn add_rule(&mut self, downstream: &DownstreamId, rule: ForwardingRule) -> bool {
        let Some(backend) = self.backend.as_deref_mut() else {
            return false;
        };
        self.registry
            .add_rule(downstream, rule, backend, &mut self.upstreams)
    }

    pub fn remove_rule(&mut self, downstream: &DownstreamId, rule: &ForwardingRule) -> bool {
        let Some(backend) = self.backend.as_deref_mut() else {
            return false;
        };
        self.registry
            .remove_rule(downstream, rule, backend, &mut self.upstreams)
    }

    pub fn update_rules(&mut self, downstream: &DownstreamId, new_upstream_if_index: u32) {
        let Some(backend) = self.backend.as_deref_mut() else {
            return;
        };
        self.registry
            .update_rules(downstream, new_upstream_if_index, backend, &mut self.upstreams);
    }

    pub fn clear_rules(&mut self, downstream: &DownstreamId) {
        let Some(backend) = self.backend.as_deref_mut() else {
            return;
        };
        self.registry
            .clear_rules(downstream, backend, &mut self.upstreams);
    }

    /// The downstream moved to another upstream, or lost it
    pub fn upstream_changed(&mut self, downstream: &DownstreamId, upstream: Option<UpstreamInfo>) {
        match upstream {
            Some(info) => {
                self.add_upstream_name(info.if_index, &info.name);
                self.update_rules(downstream, info.if_index);
            }
            None => self.clear_rules(downstream),
        }
    }

    pub fn rules_for(&self, downstream: &DownstreamId) -> Vec<ForwardingRule> {
        self.registry.rules_for(downstream).to_vec()
    }

    pub fn set_limit(&mut self, iface: &str, quota_bytes: i64) -> Result<(), OffloadError> {
        let Some(backend) = self.backend.as_deref_mut() else {
            return validate_quota(quota_bytes);
        };
        self.quota
            .set_limit(iface, quota_bytes, backend, &mut self.upstreams)
    }

    pub fn set_alert(&mut self, quota_bytes: i64) -> Result<(), OffloadError> {
        if self.backend.is_none() {
            return validate_quota(quota_bytes);
        }
        StatsTracker::set_alert(quota_bytes, &mut self.upstreams, self.sink.as_mut())
    }

    /// Arm polling. Returns the interval, or `None` when offload is disabled.
    pub fn start_polling(&mut self) -> Option<Duration> {
        self.backend.as_ref()?;
        Some(self.tracker.start_polling())
    }

    pub fn stop_polling(&mut self) {
        self.tracker.stop_polling();
    }

    pub fn is_polling(&self) -> bool {
        self.tracker.is_polling()
    }

    /// Changes whenever polling is started or stopped
    pub fn poll_generation(&self) -> u64 {
        self.tracker.generation()
    }

    pub fn poll_interval(&self) -> Duration {
        self.tracker.poll_interval()
    }

    /// Takes effect on the next `start_polling`
    pub fn set_poll_interval_ms(&mut self, interval_ms: u64) {
        self.tracker.set_configured_interval(interval_ms);
    }

    pub fn on_poll_tick(&mut self) {
        let Some(backend) = self.backend.as_deref_mut() else {
            return;
        };
        self.tracker
            .poll(backend, &mut self.upstreams, self.sink.as_mut());
    }

    pub fn push_stats(&mut self) {
        if self.backend.is_none() {
            return;
        }
        StatsTracker::push_stats(&mut self.upstreams, self.sink.as_mut());
    }

    pub fn attach_pair(&mut self, internal: &str, external: &str) {
        if self.backend.is_none() {
            return;
        }
        self.attachments.attach_pair(internal, external);
    }

    pub fn detach_pair(&mut self, internal: &str, external: &str) {
        if self.backend.is_none() {
            return;
        }
        self.attachments.detach_pair(internal, external);
    }

    pub fn add_downstream(&mut self, downstream: &DownstreamId) {
        if self.backend.is_none() {
            return;
        }
        self.conntrack.add_downstream(downstream);
    }

    /// Stop monitoring connections for the downstream. Its rules are left to
    /// `clear_rules` or `upstream_changed(None)`.
    pub fn remove_downstream(&mut self, downstream: &DownstreamId) {
        if self.backend.is_none() {
            return;
        }
        self.conntrack.remove_downstream(downstream);
    }

    /// Stop polling, drop every rule and publish the remaining traffic
    pub fn shutdown(&mut self) {
        self.stop_polling();
        if self.backend.is_none() {
            return;
        }

        for downstream in self.registry.downstreams() {
            self.clear_rules(&downstream);
        }
        self.push_stats();
        self.attachments.detach_all();
        self.conntrack.remove_all();
        log::info!("Offload coordinator shut down");
    }

    /// Human-readable state for diagnostics
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mode = match self.mode() {
            Some(mode) => mode.to_string(),
            None => "disabled".to_string(),
        };
        let _ = writeln!(out, "Offload: {}", mode);
        let _ = writeln!(
            out,
            "Polling: {} (every {:?})",
            if self.is_polling() { "on" } else { "off" },
            self.poll_interval()
        );

        let _ = writeln!(out, "Forwarding rules:");
        for (downstream, rules) in self.registry.iter() {
            let _ = writeln!(out, "  {}:", downstream);
            for rule in rules {
                let _ = writeln!(out, "    {}", rule);
            }
        }

        let _ = writeln!(out, "Upstreams:");
        for record in self.upstreams.iter() {
            let _ = writeln!(
                out,
                "  {} ({}): rules={} quota={} alert={} read={:?}",
                record.if_index,
                record.name.as_deref().unwrap_or("?"),
                record.rule_count,
                record.quota,
                record.alert,
                record.last_read
            );
        }
        for (iface, quota) in self.quota.unresolved() {
            let _ = writeln!(out, "  pending limit {} for {}", quota, iface);
        }

        let _ = writeln!(out, "Attached pairs:");
        for (internal, external) in self.attachments.pairs() {
            let _ = writeln!(out, "  {} <-> {}", internal, external);
        }
        let _ = writeln!(
            out,
            "Conntrack: {} downstreams, monitor {}",
            self.conntrack.active(),
            if self.conntrack.is_running() {
                "running"
            } else {
                "stopped"
            }
        );
        out
    }
}
