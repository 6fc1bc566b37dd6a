use std::time::Duration;

use clap::Args;

/// Hard ceiling on simultaneous connect attempts.
pub const MAX_CONCURRENCY: usize = 5_000;

/// Tunables for one engine instance. Shared read-only by every scan it runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub probe_timeout: Duration,
    pub banner_timeout: Duration,
    pub banner_max_bytes: usize,
    pub http_timeout: Duration,
    pub scan_timeout: Duration,
    pub max_parallel_hosts: usize,
    pub include_closed: bool,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 200,
            probe_timeout: Duration::from_millis(1_500),
            banner_timeout: Duration::from_millis(500),
            banner_max_bytes: 1_024,
            http_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(300),
            max_parallel_hosts: 4,
            include_closed: false,
            user_agent: format!("netaudit-rs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    /// Concurrency after clamping to the supported range.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// Engine flags shared by the `serve` and `scan` subcommands.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Max concurrent TCP connect attempts per host.
    #[arg(long, env = "NETAUDIT_CONCURRENCY", default_value_t = 200)]
    pub concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", env = "NETAUDIT_TIMEOUT_MS", default_value_t = 1_500)]
    pub timeout_ms: u64,

    /// How long to wait for a service banner after connecting, in milliseconds.
    #[arg(long = "banner-timeout-ms", env = "NETAUDIT_BANNER_TIMEOUT_MS", default_value_t = 500)]
    pub banner_timeout_ms: u64,

    /// Timeout for the security-header HTTP request, in milliseconds.
    #[arg(long = "http-timeout-ms", env = "NETAUDIT_HTTP_TIMEOUT_MS", default_value_t = 5_000)]
    pub http_timeout_ms: u64,

    /// Wall-clock limit for a whole scan, in seconds.
    #[arg(long = "scan-timeout-secs", env = "NETAUDIT_SCAN_TIMEOUT_SECS", default_value_t = 300)]
    pub scan_timeout_secs: u64,

    /// Hosts scanned in parallel when a target expands to several addresses.
    #[arg(long = "parallel-hosts", env = "NETAUDIT_PARALLEL_HOSTS", default_value_t = 4)]
    pub parallel_hosts: usize,

    /// Report closed and filtered ports too, not only open ones.
    #[arg(long = "include-closed", env = "NETAUDIT_INCLUDE_CLOSED", default_value_t = false)]
    pub include_closed: bool,
}

impl From<EngineArgs> for EngineConfig {
    fn from(a: EngineArgs) -> Self {
        Self {
            concurrency: a.concurrency,
            probe_timeout: Duration::from_millis(a.timeout_ms),
            banner_timeout: Duration::from_millis(a.banner_timeout_ms),
            http_timeout: Duration::from_millis(a.http_timeout_ms),
            scan_timeout: Duration::from_secs(a.scan_timeout_secs),
            max_parallel_hosts: a.parallel_hosts.max(1),
            include_closed: a.include_closed,
            ..Self::default()
        }
    }
}
