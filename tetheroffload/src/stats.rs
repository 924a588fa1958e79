// Forwarded traffic counters and the publishing sink

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::ops::AddAssign;
use tetheroffload_common::TetherStatsValue;

/// rx/tx byte and packet counters, either cumulative or a delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

impl ForwardedStats {
    pub const fn new(rx_bytes: u64, rx_packets: u64, tx_bytes: u64, tx_packets: u64) -> Self {
        Self {
            rx_bytes,
            rx_packets,
            tx_bytes,
            tx_packets,
        }
    }

    /// Difference to an earlier cumulative reading.
    ///
    /// A counter smaller than its baseline means the kernel entry was
    /// recreated, so the new value is the whole delta.
    pub fn delta_since(&self, baseline: &ForwardedStats) -> ForwardedStats {
        fn diff(new: u64, old: u64) -> u64 {
            if new >= old { new - old } else { new }
        }

        ForwardedStats {
            rx_bytes: diff(self.rx_bytes, baseline.rx_bytes),
            rx_packets: diff(self.rx_packets, baseline.rx_packets),
            tx_bytes: diff(self.tx_bytes, baseline.tx_bytes),
            tx_packets: diff(self.tx_packets, baseline.tx_packets),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == ForwardedStats::default()
    }

    /// rx + tx bytes, used for alert checks
    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }
}

impl AddAssign for ForwardedStats {
    fn add_assign(&mut self, other: Self) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
    }
}

impl From<&TetherStatsValue> for ForwardedStats {
    fn from(value: &TetherStatsValue) -> Self {
        ForwardedStats::new(
            value.rx_bytes,
            value.rx_packets,
            value.tx_bytes,
            value.tx_packets,
        )
    }
}

/// Cumulative counters of one upstream interface as reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub if_index: u32,
    pub stats: ForwardedStats,
}

impl InterfaceStats {
    pub fn new(if_index: u32, stats: ForwardedStats) -> Self {
        Self { if_index, stats }
    }
}

/// Who the traffic in a published record is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficOwner {
    /// Attributed to the interface itself
    Interface,
    /// Attributed to the reserved tethering owner
    Tethering,
}

/// One published delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub iface: String,
    pub owner: TrafficOwner,
    #[serde(flatten)]
    pub stats: ForwardedStats,
}

/// Receiver of published statistics and data alerts
pub trait StatsSink: Send {
    /// Deliver one push: the per-interface set and the tethering-owner set
    fn notify_stats_updated(&mut self, per_iface: &[StatsRecord], per_owner: &[StatsRecord]);

    /// The configured alert threshold was reached
    fn notify_alert_reached(&mut self);
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SinkLine<'a> {
    Stats {
        timestamp: String,
        per_iface: &'a [StatsRecord],
        per_owner: &'a [StatsRecord],
    },
    Alert {
        timestamp: String,
    },
}

/// Writes every notification as one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_line(&mut self, line: &SinkLine<'_>) -> Result<()> {
        let json = serde_json::to_string(line).context("Failed to serialize stats line")?;
        writeln!(self.out, "{}", json).context("Failed to write stats line")?;
        self.out.flush().context("Failed to flush stats output")?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

impl<W: Write + Send> StatsSink for JsonLinesSink<W> {
    fn notify_stats_updated(&mut self, per_iface: &[StatsRecord], per_owner: &[StatsRecord]) {
        let line = SinkLine::Stats {
            timestamp: now(),
            per_iface,
            per_owner,
        };
        if let Err(e) = self.write_line(&line) {
            log::error!("Failed to publish stats: {:#}", e);
        }
    }

    fn notify_alert_reached(&mut self) {
        let line = SinkLine::Alert { timestamp: now() };
        if let Err(e) = self.write_line(&line) {
            log::error!("Failed to publish alert: {:#}", e);
        }
    }
}
