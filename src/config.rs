//! Configuration for the routing core.

use std::time::Duration;

/// Configuration consumed by the router and the backend pools.
///
/// The core does not parse configuration files; the embedding proxy builds
/// a `ProxyConfig` from whatever source it uses and hands it down.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Number of pipelined connections kept per primary address.
    pub backend_primary_parallel: usize,

    /// Number of pipelined connections kept per replica address.
    pub backend_replica_parallel: usize,

    /// Ignore replica groups even when descriptors carry them.
    pub backend_primary_only: bool,

    /// Password sent to backends by the master-switch run-id probe.
    pub product_auth: Option<String>,

    /// Minimum interval between keep-alive pings on one connection.
    pub backend_keepalive_period: Duration,

    /// Timeout for establishing a backend connection.
    pub backend_connect_timeout: Duration,

    /// Per-address timeout for the master-switch run-id probe.
    pub switch_probe_timeout: Duration,

    /// Read buffer size for backend response decoding.
    pub backend_recv_bufsize: usize,

    /// Write buffer size for backend request encoding.
    pub backend_send_bufsize: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backend_primary_parallel: 1,
            backend_replica_parallel: 1,
            backend_primary_only: false,
            product_auth: None,
            backend_keepalive_period: Duration::from_secs(75),
            backend_connect_timeout: Duration::from_secs(5),
            switch_probe_timeout: Duration::from_millis(100),
            backend_recv_bufsize: 8 * 1024,
            backend_send_bufsize: 64 * 1024,
        }
    }
}

impl ProxyConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary pool parallelism.
    pub fn with_primary_parallel(mut self, parallel: usize) -> Self {
        self.backend_primary_parallel = parallel;
        self
    }

    /// Set the replica pool parallelism.
    pub fn with_replica_parallel(mut self, parallel: usize) -> Self {
        self.backend_replica_parallel = parallel;
        self
    }

    /// Route every request to primaries, ignoring replica groups.
    pub fn with_primary_only(mut self, primary_only: bool) -> Self {
        self.backend_primary_only = primary_only;
        self
    }

    /// Set the backend password used by the run-id probe.
    pub fn with_product_auth(mut self, auth: impl Into<String>) -> Self {
        self.product_auth = Some(auth.into());
        self
    }

    /// Set the keep-alive ping interval.
    pub fn with_keepalive_period(mut self, period: Duration) -> Self {
        self.backend_keepalive_period = period;
        self
    }

    /// Set the backend connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.backend_connect_timeout = timeout;
        self
    }

    /// Set the per-address master-switch probe timeout.
    pub fn with_switch_probe_timeout(mut self, timeout: Duration) -> Self {
        self.switch_probe_timeout = timeout;
        self
    }
}
