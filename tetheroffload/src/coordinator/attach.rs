// Reference-counted program attachment per interface

use std::collections::{BTreeMap, BTreeSet};

use crate::backends::attach::{ProgramAttacher, StreamDirection};

/// Tracks which (internal, external) pairs need the forwarding programs and
/// attaches each interface once, however many pairs share it
pub struct ProgramAttachmentManager {
    attacher: Option<Box<dyn ProgramAttacher>>,
    pairs: BTreeSet<(String, String)>,
    refcounts: BTreeMap<String, usize>,
}

impl ProgramAttachmentManager {
    pub fn new(attacher: Option<Box<dyn ProgramAttacher>>) -> Self {
        Self {
            attacher,
            pairs: BTreeSet::new(),
            refcounts: BTreeMap::new(),
        }
    }

    pub fn attach_pair(&mut self, internal: &str, external: &str) {
        if !self
            .pairs
            .insert((internal.to_string(), external.to_string()))
        {
            log::debug!("Pair {} <-> {} already attached", internal, external);
            return;
        }

        // External interface first: it carries traffic towards the clients
        self.acquire(external, StreamDirection::Downstream);
        self.acquire(internal, StreamDirection::Upstream);
    }

    pub fn detach_pair(&mut self, internal: &str, external: &str) {
        if !self
            .pairs
            .remove(&(internal.to_string(), external.to_string()))
        {
            log::debug!("Pair {} <-> {} not attached", internal, external);
            return;
        }

        self.release(external);
        self.release(internal);
    }

    /// Detach every pair, used on shutdown
    pub fn detach_all(&mut self) {
        let pairs: Vec<(String, String)> = self.pairs.iter().cloned().collect();
        for (internal, external) in pairs {
            self.detach_pair(&internal, &external);
        }
    }

    /// Attached pairs, for diagnostics
    pub fn pairs(&self) -> impl Iterator<Item = &(String, String)> {
        self.pairs.iter()
    }

    pub fn refcount(&self, iface: &str) -> usize {
        self.refcounts.get(iface).copied().unwrap_or(0)
    }

    fn acquire(&mut self, iface: &str, direction: StreamDirection) {
        let count = self.refcounts.entry(iface.to_string()).or_insert(0);
        *count += 1;
        if *count != 1 {
            log::debug!("{} already attached ({} pairs)", iface, count);
            return;
        }

        match self.attacher.as_deref_mut() {
            Some(attacher) => {
                if let Err(e) = attacher.attach(iface, direction) {
                    log::error!("Failed to attach {} program to {}: {:#}", direction, iface, e);
                }
            }
            None => log::debug!("No program attacher, skipping attach of {}", iface),
        }
    }

    fn release(&mut self, iface: &str) {
        let Some(count) = self.refcounts.get_mut(iface) else {
            log::warn!("{} has no attachment to release", iface);
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.refcounts.remove(iface);

        if let Some(attacher) = self.attacher.as_deref_mut() {
            if let Err(e) = attacher.detach(iface) {
                log::error!("Failed to detach program from {}: {:#}", iface, e);
            }
        }
    }
}
