// Stats polling, cumulative to delta reconciliation, and alerts

use std::time::Duration;
use tetheroffload_common::QUOTA_UNLIMITED;

use super::quota::validate_quota;
use super::upstream::UpstreamTable;
use crate::backends::offload::OffloadBackend;
use crate::error::OffloadError;
use crate::stats::{StatsRecord, StatsSink, TrafficOwner};

/// Default stats polling interval, also the shortest one allowed
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// Clamp a configured interval to the allowed minimum
pub fn effective_interval(configured_ms: u64) -> Duration {
    let configured = Duration::from_millis(configured_ms);
    if configured < DEFAULT_POLL_INTERVAL {
        DEFAULT_POLL_INTERVAL
    } else {
        configured
    }
}

/// Polling state. The timer itself belongs to the worker, which re-arms it
/// whenever `generation` changes.
#[derive(Debug)]
pub struct StatsTracker {
    configured_ms: u64,
    polling: bool,
    generation: u64,
}

impl StatsTracker {
    pub fn new(configured_ms: u64) -> Self {
        Self {
            configured_ms,
            polling: false,
            generation: 0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        effective_interval(self.configured_ms)
    }

    /// Takes effect on the next `start_polling`
    pub fn set_configured_interval(&mut self, configured_ms: u64) {
        self.configured_ms = configured_ms;
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// (Re)arm polling and return the interval to use
    pub fn start_polling(&mut self) -> Duration {
        self.polling = true;
        self.generation += 1;
        let interval = self.poll_interval();
        log::debug!("Stats polling every {:?}", interval);
        interval
    }

    pub fn stop_polling(&mut self) {
        if self.polling {
            log::debug!("Stats polling stopped");
        }
        self.polling = false;
        self.generation += 1;
    }

    /// One poll tick: refresh cumulative counters, then check the alert
    pub fn poll(
        &self,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
        sink: &mut dyn StatsSink,
    ) {
        match backend.get_all_stats() {
            Ok(all) => {
                for entry in all {
                    upstreams.record_snapshot(entry.if_index, entry.stats);
                }
            }
            Err(e) => log::error!("Failed to poll offload stats: {:#}", e),
        }
        Self::check_alert(upstreams, sink);
    }

    /// Publish deltas since the last push of every named upstream
    pub fn push_stats(upstreams: &mut UpstreamTable, sink: &mut dyn StatsSink) {
        let deltas = upstreams.take_deltas();
        if deltas.iter().all(|(_, delta)| delta.is_zero()) {
            log::trace!("No forwarded traffic since the last push");
            return;
        }

        let per_iface: Vec<StatsRecord> = deltas
            .iter()
            .map(|(iface, stats)| StatsRecord {
                iface: iface.clone(),
                owner: TrafficOwner::Interface,
                stats: *stats,
            })
            .collect();
        let per_owner: Vec<StatsRecord> = deltas
            .into_iter()
            .map(|(iface, stats)| StatsRecord {
                iface,
                owner: TrafficOwner::Tethering,
                stats,
            })
            .collect();

        sink.notify_stats_updated(&per_iface, &per_owner);
    }

    /// Arm the alert threshold on every upstream and check it right away
    pub fn set_alert(
        quota_bytes: i64,
        upstreams: &mut UpstreamTable,
        sink: &mut dyn StatsSink,
    ) -> Result<(), OffloadError> {
        validate_quota(quota_bytes)?;
        upstreams.set_alert(quota_bytes);
        if quota_bytes == QUOTA_UNLIMITED {
            log::debug!("Data alert disarmed");
        } else {
            log::debug!("Data alert armed at {} bytes", quota_bytes);
        }
        Self::check_alert(upstreams, sink);
        Ok(())
    }

    /// Fire the alert callback at most once for every upstream that reached the threshold
    pub fn check_alert(upstreams: &mut UpstreamTable, sink: &mut dyn StatsSink) {
        let mut reached = false;
        for record in upstreams.iter_mut() {
            if record.alert_reached() {
                log::info!(
                    "Data alert reached on upstream {} ({} bytes)",
                    record.if_index,
                    record.last_read.total_bytes()
                );
                record.alert_fired = true;
                reached = true;
            }
        }

        // A zero threshold is reached even before any upstream is known
        if upstreams.alert() == 0 {
            if !reached && upstreams.is_empty() && !upstreams.default_alert_fired() {
                reached = true;
            }
            if reached {
                upstreams.mark_default_alert_fired();
            }
        }

        if reached {
            sink.notify_alert_reached();
        }
    }
}
