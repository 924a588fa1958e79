// Single worker task owning the coordinator. Every operation and every poll
// tick runs on it, one at a time.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::coordinator::{Coordinator, UpstreamInfo};
use crate::error::OffloadError;
use crate::rule::{DownstreamId, ForwardingRule};

const CHANNEL_SIZE: usize = 64;

type Job = Box<dyn FnOnce(&mut Coordinator) + Send>;

enum Message {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Start the worker. It runs until `shutdown` is called or every handle is dropped.
pub fn spawn(coordinator: Coordinator) -> OffloadHandle {
    let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
    tokio::spawn(run(coordinator, rx));
    OffloadHandle { tx }
}

fn next_deadline(coordinator: &Coordinator) -> Option<Instant> {
    coordinator
        .is_polling()
        .then(|| Instant::now() + coordinator.poll_interval())
}

async fn run(mut coordinator: Coordinator, mut rx: mpsc::Receiver<Message>) {
    let mut generation = coordinator.poll_generation();
    let mut deadline = next_deadline(&coordinator);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(Message::Run(job)) => job(&mut coordinator),
                    Some(Message::Shutdown(done)) => {
                        coordinator.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        log::debug!("All offload handles dropped");
                        break;
                    }
                }
                // Start/stop re-arms or cancels the pending tick
                if coordinator.poll_generation() != generation {
                    generation = coordinator.poll_generation();
                    deadline = next_deadline(&coordinator);
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                coordinator.on_poll_tick();
                deadline = next_deadline(&coordinator);
            }
        }
    }

    log::debug!("Offload worker stopped");
}

/// Cloneable entry point to the worker
#[derive(Clone)]
pub struct OffloadHandle {
    tx: mpsc::Sender<Message>,
}

impl OffloadHandle {
    async fn call<T, F>(&self, f: F) -> Result<T, OffloadError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Coordinator) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |coordinator| {
            let _ = reply_tx.send(f(coordinator));
        });
        self.tx
            .send(Message::Run(job))
            .await
            .map_err(|_| OffloadError::ServiceStopped)?;
        reply_rx.await.map_err(|_| OffloadError::ServiceStopped)
    }

    pub async fn add_upstream_name(&self, if_index: u32, name: String) -> Result<(), OffloadError> {
        self.call(move |c| c.add_upstream_name(if_index, &name))
            .await
    }

    pub async fn add_rule(
        &self,
        downstream: DownstreamId,
        rule: ForwardingRule,
    ) -> Result<bool, OffloadError> {
        self.call(move |c| c.add_rule(&downstream, rule)).await
    }

    pub async fn remove_rule(
        &self,
        downstream: DownstreamId,
        rule: ForwardingRule,
    ) -> Result<bool, OffloadError> {
        self.call(move |c| c.remove_rule(&downstream, &rule)).await
    }

    pub async fn update_rules(
        &self,
        downstream: DownstreamId,
        new_upstream_if_index: u32,
    ) -> Result<(), OffloadError> {
        self.call(move |c| c.update_rules(&downstream, new_upstream_if_index))
            .await
    }

    pub async fn clear_rules(&self, downstream: DownstreamId) -> Result<(), OffloadError> {
        self.call(move |c| c.clear_rules(&downstream)).await
    }

    pub async fn upstream_changed(
        &self,
        downstream: DownstreamId,
        upstream: Option<UpstreamInfo>,
    ) -> Result<(), OffloadError> {
        self.call(move |c| c.upstream_changed(&downstream, upstream))
            .await
    }

    pub async fn rules_for(
        &self,
        downstream: DownstreamId,
    ) -> Result<Vec<ForwardingRule>, OffloadError> {
        self.call(move |c| c.rules_for(&downstream)).await
    }

    pub async fn set_limit(&self, iface: String, quota_bytes: i64) -> Result<(), OffloadError> {
        self.call(move |c| c.set_limit(&iface, quota_bytes)).await?
    }

    pub async fn set_alert(&self, quota_bytes: i64) -> Result<(), OffloadError> {
        self.call(move |c| c.set_alert(quota_bytes)).await?
    }

    /// Interval polling runs at, `None` when offload is disabled
    pub async fn start_polling(&self) -> Result<Option<Duration>, OffloadError> {
        self.call(|c| c.start_polling()).await
    }

    pub async fn stop_polling(&self) -> Result<(), OffloadError> {
        self.call(|c| c.stop_polling()).await
    }

    pub async fn poll_interval(&self) -> Result<Duration, OffloadError> {
        self.call(|c| c.poll_interval()).await
    }

    /// Used from the next `start_polling` on
    pub async fn set_poll_interval(&self, interval_ms: u64) -> Result<(), OffloadError> {
        self.call(move |c| c.set_poll_interval_ms(interval_ms)).await
    }

    pub async fn push_stats(&self) -> Result<(), OffloadError> {
        self.call(|c| c.push_stats()).await
    }

    pub async fn attach_pair(&self, internal: String, external: String) -> Result<(), OffloadError> {
        self.call(move |c| c.attach_pair(&internal, &external))
            .await
    }

    pub async fn detach_pair(&self, internal: String, external: String) -> Result<(), OffloadError> {
        self.call(move |c| c.detach_pair(&internal, &external))
            .await
    }

    pub async fn add_downstream(&self, downstream: DownstreamId) -> Result<(), OffloadError> {
        self.call(move |c| c.add_downstream(&downstream)).await
    }

    pub async fn remove_downstream(&self, downstream: DownstreamId) -> Result<(), OffloadError> {
        self.call(move |c| c.remove_downstream(&downstream)).await
    }

    pub async fn dump(&self) -> Result<String, OffloadError> {
        self.call(|c| c.dump()).await
    }

    /// Tear everything down and stop the worker
    pub async fn shutdown(&self) -> Result<(), OffloadError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Message::Shutdown(done_tx))
            .await
            .map_err(|_| OffloadError::ServiceStopped)?;
        done_rx.await.map_err(|_| OffloadError::ServiceStopped)
    }
}
