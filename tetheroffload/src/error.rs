// Errors callers are expected to match on. Everything else is anyhow.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OffloadError {
    /// Quota or alert value outside `[0, i64::MAX]` and not the unlimited sentinel
    #[error("invalid quota value {0}")]
    InvalidQuota(i64),

    /// The worker task is gone
    #[error("offload service stopped")]
    ServiceStopped,
}
