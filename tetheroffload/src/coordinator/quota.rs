// Data limits per upstream

use std::collections::HashMap;
use tetheroffload_common::QUOTA_UNLIMITED;

use super::upstream::UpstreamTable;
use crate::backends::offload::OffloadBackend;
use crate::error::OffloadError;

/// Accept `[0, i64::MAX]` and the unlimited sentinel
pub fn validate_quota(quota_bytes: i64) -> Result<(), OffloadError> {
    if quota_bytes < 0 && quota_bytes != QUOTA_UNLIMITED {
        return Err(OffloadError::InvalidQuota(quota_bytes));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct QuotaManager {
    // Limits set for names not yet in the lookup table
    unresolved: HashMap<String, i64>,
}

impl QuotaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a limit for the named upstream and push it if the upstream has rules
    pub fn set_limit(
        &mut self,
        iface: &str,
        quota_bytes: i64,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) -> Result<(), OffloadError> {
        validate_quota(quota_bytes)?;

        match upstreams.find_by_name(iface) {
            Some(if_index) => Self::apply(if_index, quota_bytes, backend, upstreams),
            None => {
                log::debug!(
                    "Upstream {} not known yet, keeping limit {} until it registers",
                    iface,
                    quota_bytes
                );
                self.unresolved.insert(iface.to_string(), quota_bytes);
            }
        }
        Ok(())
    }

    /// Attach a limit remembered for `name` to the newly named upstream
    pub fn on_name_registered(
        &mut self,
        if_index: u32,
        name: &str,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) {
        if let Some(quota_bytes) = self.unresolved.remove(name) {
            log::debug!("Applying stored limit {} to {}", quota_bytes, name);
            Self::apply(if_index, quota_bytes, backend, upstreams);
        }
    }

    pub fn unresolved(&self) -> &HashMap<String, i64> {
        &self.unresolved
    }

    fn apply(
        if_index: u32,
        quota_bytes: i64,
        backend: &mut dyn OffloadBackend,
        upstreams: &mut UpstreamTable,
    ) {
        let record = upstreams.get_or_create(if_index);
        record.quota = quota_bytes;

        if record.rule_count == 0 {
            log::debug!(
                "Stored limit {} for upstream {} without rules",
                quota_bytes,
                if_index
            );
            return;
        }

        if let Err(e) = backend.set_quota(if_index, quota_bytes, false) {
            log::error!("Failed to set limit on upstream {}: {:#}", if_index, e);
        }
    }
}
