//! Enumerated configuration (`spec.md` §6). No on-disk format, no CLI, no
//! environment variables: the embedding process builds a [`CoreConfig`]
//! directly, the way the teacher constructs `RetryPolicy` and
//! `MacHotplugWatch` with plain constructor arguments rather than a
//! config-file crate.

use std::time::Duration;

/// Top-level configuration for the device-plane core.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Validity window for [`crate::discovery::Discovery::discover`]'s cache.
    pub cache_ttl: Duration,

    /// Retry policy for registry-facing calls (enumeration, handle creation).
    pub retry: crate::retry::RetryPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(1000),
            retry: crate::retry::RetryPolicy::default(),
        }
    }
}
