use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "NETAUDIT_LOGLEVEL";

const DEFAULT_FILTER: &str = "netaudit_rs=info,tower_http=info";

/// Install the global tracing subscriber, writing to stderr so that JSON on
/// stdout stays clean.
pub fn init() -> Result<()> {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(filter)?)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
