// Per-upstream state, indexed by interface index

use serde::Serialize;
use std::collections::BTreeMap;
use tetheroffload_common::QUOTA_UNLIMITED;

use crate::stats::ForwardedStats;

/// Everything the coordinator knows about one upstream interface
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRecord {
    pub if_index: u32,
    pub name: Option<String>,
    /// Cumulative counters from the last backend read
    pub last_read: ForwardedStats,
    /// Cumulative counters at the last push
    pub published: ForwardedStats,
    /// Traffic of cleared kernel entries not yet pushed
    pub pending: ForwardedStats,
    /// Data limit in bytes, `QUOTA_UNLIMITED` for none
    pub quota: i64,
    /// Alert threshold in bytes, `QUOTA_UNLIMITED` when disarmed
    pub alert: i64,
    pub alert_fired: bool,
    /// Live rules across all downstreams using this upstream
    pub rule_count: usize,
}

impl UpstreamRecord {
    fn new(if_index: u32, alert: i64, alert_fired: bool) -> Self {
        Self {
            if_index,
            name: None,
            last_read: ForwardedStats::default(),
            published: ForwardedStats::default(),
            pending: ForwardedStats::default(),
            quota: QUOTA_UNLIMITED,
            alert,
            alert_fired,
            rule_count: 0,
        }
    }

    /// Alert is armed, not yet fired, and usage is at or past the threshold
    pub fn alert_reached(&self) -> bool {
        self.alert != QUOTA_UNLIMITED
            && !self.alert_fired
            && self.last_read.total_bytes() >= self.alert as u64
    }
}

#[derive(Debug)]
pub struct UpstreamTable {
    records: BTreeMap<u32, UpstreamRecord>,
    // Applied to records created after the last set_alert
    default_alert: i64,
    default_alert_fired: bool,
}

impl Default for UpstreamTable {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            default_alert: QUOTA_UNLIMITED,
            default_alert_fired: false,
        }
    }
}

impl UpstreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, if_index: u32) -> Option<&UpstreamRecord> {
        self.records.get(&if_index)
    }

    pub fn get_or_create(&mut self, if_index: u32) -> &mut UpstreamRecord {
        let alert = self.default_alert;
        let fired = self.default_alert_fired;
        self.records
            .entry(if_index)
            .or_insert_with(|| UpstreamRecord::new(if_index, alert, fired))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpstreamRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UpstreamRecord> {
        self.records.values_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn find_by_name(&self, name: &str) -> Option<u32> {
        self.records
            .values()
            .find(|r| r.name.as_deref() == Some(name))
            .map(|r| r.if_index)
    }

    pub fn name_of(&self, if_index: u32) -> Option<&str> {
        self.records.get(&if_index).and_then(|r| r.name.as_deref())
    }

    /// Record the interface name. Returns false when the name was already set to the same value.
    pub fn set_name(&mut self, if_index: u32, name: &str) -> bool {
        let record = self.get_or_create(if_index);
        match record.name.as_deref() {
            Some(existing) if existing == name => false,
            Some(existing) => {
                log::warn!(
                    "Upstream {} renamed from {} to {}",
                    if_index,
                    existing,
                    name
                );
                record.name = Some(name.to_string());
                true
            }
            None => {
                record.name = Some(name.to_string());
                true
            }
        }
    }

    /// Count one more rule on the upstream, returns (before, after)
    pub fn acquire(&mut self, if_index: u32) -> (usize, usize) {
        let record = self.get_or_create(if_index);
        let before = record.rule_count;
        record.rule_count += 1;
        (before, record.rule_count)
    }

    /// Count one rule less on the upstream, returns (before, after)
    pub fn release(&mut self, if_index: u32) -> (usize, usize) {
        match self.records.get_mut(&if_index) {
            Some(record) if record.rule_count > 0 => {
                let before = record.rule_count;
                record.rule_count -= 1;
                (before, record.rule_count)
            }
            _ => {
                log::warn!("Rule count of upstream {} already zero", if_index);
                (0, 0)
            }
        }
    }

    pub fn rule_count(&self, if_index: u32) -> usize {
        self.records.get(&if_index).map_or(0, |r| r.rule_count)
    }

    /// Store the latest cumulative reading of an interface
    pub fn record_snapshot(&mut self, if_index: u32, stats: ForwardedStats) {
        self.get_or_create(if_index).last_read = stats;
    }

    /// Fold the final reading of a cleared kernel entry into pending traffic.
    /// The kernel counters restart from zero afterwards.
    pub fn fold_final(&mut self, if_index: u32, stats: ForwardedStats) {
        let record = self.get_or_create(if_index);
        let delta = stats.delta_since(&record.published);
        record.pending += delta;
        record.last_read = ForwardedStats::default();
        record.published = ForwardedStats::default();
        record.alert_fired = false;
    }

    /// Deltas since the last push of every named upstream; resets the baselines
    pub fn take_deltas(&mut self) -> Vec<(String, ForwardedStats)> {
        let mut deltas = Vec::new();
        for record in self.records.values_mut() {
            let Some(name) = record.name.clone() else {
                continue;
            };
            let mut delta = record.last_read.delta_since(&record.published);
            delta += record.pending;
            record.published = record.last_read;
            record.pending = ForwardedStats::default();
            deltas.push((name, delta));
        }
        deltas
    }

    /// Arm (or disarm with `QUOTA_UNLIMITED`) the alert on every upstream
    pub fn set_alert(&mut self, alert: i64) {
        self.default_alert = alert;
        self.default_alert_fired = false;
        for record in self.records.values_mut() {
            record.alert = alert;
            record.alert_fired = false;
        }
    }

    /// Current alert threshold
    pub fn alert(&self) -> i64 {
        self.default_alert
    }

    pub fn default_alert_fired(&self) -> bool {
        self.default_alert_fired
    }

    /// Mark the threshold as reached for upstreams that appear later
    pub fn mark_default_alert_fired(&mut self) {
        self.default_alert_fired = true;
    }
}
