//! Bus configuration surface (§6): worker/concurrency shape plus the
//! optional behaviors a deployment turns on. Validated once at
//! construction, not threaded through as a fallible call on every
//! operation.

use thiserror::Error;

/// Validation failure for a [`BusConfig`], surfaced synchronously at bus
/// start (§7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `number_of_workers` was zero.
    #[error("number_of_workers must be at least 1")]
    ZeroWorkers,

    /// `max_parallelism` was zero.
    #[error("max_parallelism must be at least 1")]
    ZeroParallelism,
}

/// The bus's configuration surface.
///
/// No fluent façade or DI container (explicit non-goal) — this is plain
/// data, built with [`BusConfigBuilder`] and validated once with
/// [`BusConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Number of worker loops polling the transport concurrently.
    pub number_of_workers: usize,
    /// Upper bound on messages processed concurrently across all workers,
    /// enforced by [`crate::bottleneck::AsyncBottleneck`].
    pub max_parallelism: usize,
    /// Whether a lock-renewal task should be spawned per in-flight message
    /// instead of relying on prefetch (mutually exclusive with `prefetch`,
    /// §9).
    pub automatically_renew_peek_lock: bool,
    /// Number of messages to prefetch per worker, if any (mutually
    /// exclusive with `automatically_renew_peek_lock`).
    pub prefetch: Option<u32>,
    /// Whether the idempotent saga layer (§4.L) wraps saga dispatch.
    pub enable_idempotent_sagas: bool,
    /// Default `rbs2-return-address` assigned to outgoing messages that
    /// don't set one explicitly.
    pub default_return_address: Option<String>,
}

impl BusConfig {
    /// Start building a configuration from the defaults (4 workers, 20-way
    /// parallelism, no lock renewal, no prefetch, idempotent sagas off, no
    /// default return address).
    #[must_use]
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::default()
    }
}

/// Builder for [`BusConfig`].
#[derive(Debug, Clone)]
pub struct BusConfigBuilder {
    number_of_workers: usize,
    max_parallelism: usize,
    automatically_renew_peek_lock: bool,
    prefetch: Option<u32>,
    enable_idempotent_sagas: bool,
    default_return_address: Option<String>,
}

impl Default for BusConfigBuilder {
    fn default() -> Self {
        Self {
            number_of_workers: 4,
            max_parallelism: 20,
            automatically_renew_peek_lock: false,
            prefetch: None,
            enable_idempotent_sagas: false,
            default_return_address: None,
        }
    }
}

impl BusConfigBuilder {
    /// Set the number of worker loops.
    #[must_use]
    pub const fn number_of_workers(mut self, n: usize) -> Self {
        self.number_of_workers = n;
        self
    }

    /// Set the maximum parallel in-flight messages.
    #[must_use]
    pub const fn max_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = n;
        self
    }

    /// Enable lock-renewal instead of prefetch.
    #[must_use]
    pub const fn automatically_renew_peek_lock(mut self, enabled: bool) -> Self {
        self.automatically_renew_peek_lock = enabled;
        self
    }

    /// Enable prefetch of up to `n` messages per worker.
    #[must_use]
    pub const fn prefetch(mut self, n: u32) -> Self {
        self.prefetch = Some(n);
        self
    }

    /// Turn on the idempotent saga layer.
    #[must_use]
    pub const fn enable_idempotent_sagas(mut self, enabled: bool) -> Self {
        self.enable_idempotent_sagas = enabled;
        self
    }

    /// Set a default return address for outgoing messages.
    #[must_use]
    pub fn default_return_address(mut self, address: impl Into<String>) -> Self {
        self.default_return_address = Some(address.into());
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `number_of_workers` or `max_parallelism`
    /// is zero.
    pub fn build(self) -> Result<BusConfig, ConfigError> {
        if self.number_of_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        Ok(BusConfig {
            number_of_workers: self.number_of_workers,
            max_parallelism: self.max_parallelism,
            automatically_renew_peek_lock: self.automatically_renew_peek_lock,
            prefetch: self.prefetch,
            enable_idempotent_sagas: self.enable_idempotent_sagas,
            default_return_address: self.default_return_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = BusConfig::builder().build().unwrap();
        assert_eq!(config.number_of_workers, 4);
        assert_eq!(config.max_parallelism, 20);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = BusConfig::builder().number_of_workers(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroWorkers);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err = BusConfig::builder().max_parallelism(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroParallelism);
    }
}
