//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};

/// Configuration for an [`ObjectSync`](crate::ObjectSync) and its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Transient failures tolerated per entity before giving up.
    ///
    /// `None` retries forever.
    pub max_transient_retries: Option<u32>,
    /// Maximum batches the driver keeps outstanding at once.
    pub max_concurrent_requests: usize,
    /// Upper bound applied on top of the transcoder's fetch limit.
    pub fetch_limit_override: Option<usize>,
}

impl SyncConfig {
    /// Creates a configuration with unbounded retries.
    pub fn new() -> Self {
        Self {
            max_transient_retries: None,
            max_concurrent_requests: 4,
            fetch_limit_override: None,
        }
    }

    /// Gives up on an entity after `retries` transient failures.
    pub fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = Some(retries);
        self
    }

    /// Retries transient failures forever.
    pub fn with_unbounded_retries(mut self) -> Self {
        self.max_transient_retries = None;
        self
    }

    /// Sets the number of batches the driver may have outstanding.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Caps the transcoder's fetch limit.
    pub fn with_fetch_limit_override(mut self, limit: usize) -> Self {
        self.fetch_limit_override = Some(limit);
        self
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_concurrent_requests == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.fetch_limit_override == Some(0) {
            return Err(SyncError::InvalidConfig(
                "fetch_limit_override must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
