// JSON-lines event feed driving the offload worker

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::coordinator::UpstreamInfo;
use crate::error::OffloadError;
use crate::rule::{DownstreamId, ForwardingRule};
use crate::service::OffloadHandle;

/// One line of the feed, e.g. `{"event":"set_limit","iface":"rmnet0","quota_bytes":-1}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    UpstreamName {
        if_index: u32,
        name: String,
    },
    AddRule {
        downstream: DownstreamId,
        rule: ForwardingRule,
    },
    RemoveRule {
        downstream: DownstreamId,
        rule: ForwardingRule,
    },
    UpdateRules {
        downstream: DownstreamId,
        upstream_if_index: u32,
    },
    ClearRules {
        downstream: DownstreamId,
    },
    UpstreamChanged {
        downstream: DownstreamId,
        #[serde(default)]
        upstream: Option<UpstreamInfo>,
    },
    SetLimit {
        iface: String,
        quota_bytes: i64,
    },
    SetAlert {
        quota_bytes: i64,
    },
    PushStats,
    StartPolling,
    StopPolling,
    SetPollInterval {
        interval_ms: u64,
    },
    Attach {
        internal: String,
        external: String,
    },
    Detach {
        internal: String,
        external: String,
    },
    AddDownstream {
        downstream: DownstreamId,
    },
    /// Stops conntrack monitoring only; send `clear_rules` to drop the rules
    RemoveDownstream {
        downstream: DownstreamId,
    },
    Dump,
}

/// Forward one event to the worker
pub async fn dispatch(handle: &OffloadHandle, event: Event) -> Result<(), OffloadError> {
    match event {
        Event::UpstreamName { if_index, name } => handle.add_upstream_name(if_index, name).await,
        Event::AddRule { downstream, rule } => {
            if !handle.add_rule(downstream.clone(), rule).await? {
                log::debug!("Rule {} on {} not installed", rule, downstream);
            }
            Ok(())
        }
        Event::RemoveRule { downstream, rule } => {
            handle.remove_rule(downstream, rule).await?;
            Ok(())
        }
        Event::UpdateRules {
            downstream,
            upstream_if_index,
        } => handle.update_rules(downstream, upstream_if_index).await,
        Event::ClearRules { downstream } => handle.clear_rules(downstream).await,
        Event::UpstreamChanged {
            downstream,
            upstream,
        } => handle.upstream_changed(downstream, upstream).await,
        Event::SetLimit { iface, quota_bytes } => handle.set_limit(iface, quota_bytes).await,
        Event::SetAlert { quota_bytes } => handle.set_alert(quota_bytes).await,
        Event::PushStats => handle.push_stats().await,
        Event::StartPolling => {
            match handle.start_polling().await? {
                Some(interval) => log::info!("Polling offload stats every {:?}", interval),
                None => log::warn!("⚠️  Offload disabled, not polling"),
            }
            Ok(())
        }
        Event::StopPolling => handle.stop_polling().await,
        Event::SetPollInterval { interval_ms } => handle.set_poll_interval(interval_ms).await,
        Event::Attach { internal, external } => handle.attach_pair(internal, external).await,
        Event::Detach { internal, external } => handle.detach_pair(internal, external).await,
        Event::AddDownstream { downstream } => handle.add_downstream(downstream).await,
        Event::RemoveDownstream { downstream } => handle.remove_downstream(downstream).await,
        Event::Dump => {
            eprint!("{}", handle.dump().await?);
            Ok(())
        }
    }
}

/// Read events until the input ends. Bad lines and rejected requests are
/// logged and skipped; the feed only fails when the worker is gone.
pub async fn run_event_feed<R>(reader: R, handle: &OffloadHandle) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read event feed")?
    {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("⚠️  Skipping event on line {}: {}", line_no, e);
                continue;
            }
        };

        log::debug!("Event: {:?}", event);
        match dispatch(handle, event).await {
            Ok(()) => {}
            Err(OffloadError::ServiceStopped) => {
                return Err(OffloadError::ServiceStopped).context("Event feed interrupted");
            }
            Err(e) => log::warn!("⚠️  Event on line {} rejected: {}", line_no, e),
        }
    }

    Ok(())
}
