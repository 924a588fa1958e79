// Conntrack monitor lifetime, driven by the set of active downstreams

use std::collections::BTreeSet;

use crate::backends::conntrack::ConntrackMonitor;
use crate::rule::DownstreamId;

pub struct ConntrackLifecycle {
    monitor: Box<dyn ConntrackMonitor>,
    handles: BTreeSet<DownstreamId>,
    running: bool,
}

impl ConntrackLifecycle {
    pub fn new(monitor: Box<dyn ConntrackMonitor>) -> Self {
        Self {
            monitor,
            handles: BTreeSet::new(),
            running: false,
        }
    }

    pub fn add_downstream(&mut self, handle: &DownstreamId) {
        if !self.handles.insert(handle.clone()) {
            log::debug!("Downstream {} already monitored", handle);
            return;
        }
        if self.handles.len() == 1 && !self.running {
            match self.monitor.start() {
                Ok(()) => self.running = true,
                Err(e) => log::error!("Failed to start conntrack monitor: {:#}", e),
            }
        }
    }

    pub fn remove_downstream(&mut self, handle: &DownstreamId) {
        if !self.handles.remove(handle) {
            log::debug!("Downstream {} not monitored", handle);
            return;
        }
        if self.handles.is_empty() && self.running {
            self.monitor.stop();
            self.running = false;
        }
    }

    /// Forget every downstream and stop the monitor
    pub fn remove_all(&mut self) {
        let handles: Vec<DownstreamId> = self.handles.iter().cloned().collect();
        for handle in &handles {
            self.remove_downstream(handle);
        }
    }

    pub fn active(&self) -> usize {
        self.handles.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}
