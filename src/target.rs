use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::LazyLock;
use std::time::Duration;

use ipnet::Ipv4Net;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::error::ScanError;

/// Widest CIDR block accepted as a single target (1022 hosts).
pub const MIN_CIDR_PREFIX: u8 = 22;

static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Ip(IpAddr),
    Hostname(String),
    Cidr(Ipv4Net),
}

/// A validated, not yet resolved, target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub input: String,
    pub kind: TargetKind,
    pub scheme: Option<Scheme>,
    pub port: Option<u16>,
}

/// One concrete address to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    /// Label reported as `Host.host`.
    pub label: String,
    pub hostname: Option<String>,
    pub ip: IpAddr,
    pub scheme: Option<Scheme>,
    pub port: Option<u16>,
}

impl ScanTarget {
    /// Name used for SNI and the HTTP `Host` header.
    pub fn server_name(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| self.ip.to_string())
    }
}

/// Validate a user-supplied target: hostname, IP literal, `http(s)://` URL or
/// IPv4 CIDR block.
pub fn parse_target(raw: &str) -> Result<TargetSpec, ScanError> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(ScanError::InvalidTarget(raw.to_string()));
    }

    if input.contains("://") {
        return parse_url(input);
    }

    if input.contains('/') {
        let net: Ipv4Net = input
            .parse()
            .map_err(|_| ScanError::InvalidTarget(input.to_string()))?;
        if net.prefix_len() < MIN_CIDR_PREFIX {
            return Err(ScanError::InvalidTarget(format!(
                "{input} (CIDR blocks wider than /{MIN_CIDR_PREFIX} are not scanned)"
            )));
        }
        return Ok(TargetSpec {
            input: input.to_string(),
            kind: TargetKind::Cidr(net),
            scheme: None,
            port: None,
        });
    }

    Ok(TargetSpec {
        input: input.to_string(),
        kind: parse_host(input)?,
        scheme: None,
        port: None,
    })
}

fn parse_url(input: &str) -> Result<TargetSpec, ScanError> {
    let url = Url::parse(input).map_err(|_| ScanError::InvalidTarget(input.to_string()))?;
    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        _ => return Err(ScanError::InvalidTarget(input.to_string())),
    };
    let kind = match url.host() {
        Some(url::Host::Ipv4(ip)) => TargetKind::Ip(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => TargetKind::Ip(IpAddr::V6(ip)),
        Some(url::Host::Domain(d)) => parse_host(d)?,
        None => return Err(ScanError::InvalidTarget(input.to_string())),
    };
    Ok(TargetSpec {
        input: input.to_string(),
        kind,
        scheme: Some(scheme),
        port: url.port(),
    })
}

fn parse_host(s: &str) -> Result<TargetKind, ScanError> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(TargetKind::Ip(ip));
    }
    if is_valid_hostname(s) {
        let name = s.trim_end_matches('.').to_ascii_lowercase();
        return Ok(TargetKind::Hostname(name));
    }
    Err(ScanError::InvalidTarget(s.to_string()))
}

/// RFC 1123 hostname check. All-numeric names (e.g. `999.1.1.1`) are rejected
/// so that malformed IPv4 literals never reach DNS.
pub fn is_valid_hostname(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    let mut all_numeric = true;
    for label in s.split('.') {
        if !LABEL.is_match(label) {
            return false;
        }
        all_numeric &= label.bytes().all(|b| b.is_ascii_digit());
    }
    !all_numeric
}

/// Resolve a validated target into the addresses to scan.
///
/// Literal IPs are accepted unchanged and CIDR blocks expand locally; only
/// hostnames cause a DNS lookup, bounded by `timeout`.
pub async fn resolve(spec: &TargetSpec, timeout: Duration) -> Result<Vec<ScanTarget>, ScanError> {
    match &spec.kind {
        TargetKind::Ip(ip) => Ok(vec![ScanTarget {
            label: ip.to_string(),
            hostname: None,
            ip: *ip,
            scheme: spec.scheme,
            port: spec.port,
        }]),
        TargetKind::Cidr(net) => Ok(expand_cidr_hosts(*net)
            .into_iter()
            .map(|ip| ScanTarget {
                label: ip.to_string(),
                hostname: None,
                ip: IpAddr::V4(ip),
                scheme: None,
                port: None,
            })
            .collect()),
        TargetKind::Hostname(name) => {
            let ip = lookup(name, timeout).await?;
            debug!(hostname = %name, %ip, "resolved target");
            Ok(vec![ScanTarget {
                label: name.clone(),
                hostname: Some(name.clone()),
                ip,
                scheme: spec.scheme,
                port: spec.port,
            }])
        }
    }
}

async fn lookup(name: &str, timeout: Duration) -> Result<IpAddr, ScanError> {
    let unresolvable = |reason: String| ScanError::UnresolvableTarget {
        target: name.to_string(),
        reason,
    };
    let addrs: Vec<IpAddr> = tokio::time::timeout(timeout, tokio::net::lookup_host((name, 0)))
        .await
        .map_err(|_| unresolvable("DNS lookup timed out".into()))?
        .map_err(|e| unresolvable(e.to_string()))?
        .map(|sa| sa.ip())
        .collect();
    // Prefer IPv4: the dashboard reports dotted-quad addresses.
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| unresolvable("no addresses returned".into()))
}

/// Host addresses of an IPv4 block. Network and broadcast addresses are
/// skipped for blocks that have them; /31 and /32 yield every address.
pub fn expand_cidr_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_grammar() {
        assert!(is_valid_hostname("ivp.isea.in"));
        assert!(is_valid_hostname("localhost"));
        assert!(is_valid_hostname("a-b.example.com."));
        assert!(!is_valid_hostname("-bad.example.com"));
        assert!(!is_valid_hostname("bad-.example.com"));
        assert!(!is_valid_hostname("under_score.com"));
        assert!(!is_valid_hostname("a..b"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
        assert!(is_valid_hostname(&"a".repeat(63)));
        assert!(!is_valid_hostname("999.1.1.1"));
    }

    #[test]
    fn parses_literal_ip() {
        let spec = parse_target(" 10.0.0.7 ").unwrap();
        assert_eq!(spec.kind, TargetKind::Ip("10.0.0.7".parse().unwrap()));
        assert_eq!(spec.scheme, None);
    }

    #[test]
    fn parses_url_hints() {
        let spec = parse_target("https://Example.COM:8443/login").unwrap();
        assert_eq!(spec.kind, TargetKind::Hostname("example.com".into()));
        assert_eq!(spec.scheme, Some(Scheme::Https));
        assert_eq!(spec.port, Some(8443));

        let spec = parse_target("http://127.0.0.1/").unwrap();
        assert_eq!(spec.port, None);
        assert_eq!(spec.scheme, Some(Scheme::Http));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "not a host", "ftp://example.com", "256.1.1.1", "10.0.0.0/8", "host/path"] {
            assert!(
                matches!(parse_target(bad), Err(ScanError::InvalidTarget(_))),
                "expected failure for {bad:?}"
            );
        }
    }

    #[test]
    fn expand_small_cidr_excludes_network_and_broadcast() {
        let net = Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 30).unwrap();
        assert_eq!(
            expand_cidr_hosts(net),
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]
        );
    }

    #[test]
    fn expand_single_host_cidr() {
        let net = Ipv4Net::new(Ipv4Addr::new(10, 9, 8, 7), 32).unwrap();
        assert_eq!(expand_cidr_hosts(net), vec![Ipv4Addr::new(10, 9, 8, 7)]);
    }

    #[tokio::test]
    async fn literal_ip_needs_no_lookup() {
        let spec = parse_target("192.0.2.1").unwrap();
        let targets = resolve(&spec, Duration::from_millis(1)).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].hostname, None);
        assert_eq!(targets[0].label, "192.0.2.1");
    }
}
