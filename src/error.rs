use thiserror::Error;

/// Scan-level failures. Only these abort a request; everything else degrades
/// into the result structure.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid target '{0}': expected a hostname, IP address, URL or CIDR block")]
    InvalidTarget(String),
    #[error("could not resolve '{target}': {reason}")]
    UnresolvableTarget { target: String, reason: String },
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),
    #[error("scan deadline elapsed before probing started")]
    Timeout,
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Per-port connect failures. Recovered locally as a port state.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Header fetch failures. Recovered locally as a zero-score analysis.
#[derive(Debug, Error)]
pub enum HeaderFetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),
}
