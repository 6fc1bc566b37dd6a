use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::redirect::Policy;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::HeaderFetchError;
use crate::target::ScanTarget;
use crate::types::{HeaderScore, MissingHeader, Port, PortHeaderReport, PresentHeader, ScriptOutput};

/// One header of the security policy.
#[derive(Debug)]
pub struct PolicyHeader {
    pub name: &'static str,
    pub purpose: &'static str,
    pub recommended: &'static str,
}

/// Canonical security-header policy. Scores are computed against all entries.
pub static SECURITY_POLICY: &[PolicyHeader] = &[
    PolicyHeader {
        name: "Strict-Transport-Security",
        purpose: "Forces HTTPS",
        recommended: "max-age=63072000; includeSubDomains",
    },
    PolicyHeader {
        name: "Content-Security-Policy",
        purpose: "Prevents XSS",
        recommended: "default-src 'self'",
    },
    PolicyHeader {
        name: "X-Frame-Options",
        purpose: "Prevents clickjacking",
        recommended: "DENY",
    },
    PolicyHeader {
        name: "X-Content-Type-Options",
        purpose: "Stops MIME sniffing",
        recommended: "nosniff",
    },
    PolicyHeader {
        name: "Permissions-Policy",
        purpose: "Controls features",
        recommended: "camera=(), microphone=(), geolocation=()",
    },
];

/// Header analysis of one HTTP(S) port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFinding {
    pub status_line: Option<String>,
    pub parsed_headers: BTreeMap<String, String>,
    pub present: Vec<PresentHeader>,
    pub missing: Vec<MissingHeader>,
    pub score: HeaderScore,
    pub error: Option<String>,
}

impl HeaderFinding {
    /// Report for a port that could not be fetched: nothing found, score zero.
    pub fn unreachable(err: &HeaderFetchError) -> Self {
        let mut finding = evaluate(BTreeMap::new());
        finding.error = Some(err.to_string());
        finding
    }

    pub fn security_score(&self) -> u8 {
        self.score.security_score
    }

    /// `http-headers` script entry: status line and headers, one per line.
    pub fn script_output(&self) -> Option<ScriptOutput> {
        let status = self.status_line.as_ref()?;
        let mut lines = vec![status.clone()];
        lines.extend(self.parsed_headers.iter().map(|(k, v)| format!("{k}: {v}")));
        Some(ScriptOutput {
            id: "http-headers".into(),
            output: lines.join("\n"),
        })
    }

    pub fn report(&self) -> PortHeaderReport {
        PortHeaderReport {
            headers_found: self.parsed_headers.clone(),
            analysis: self.score.clone(),
        }
    }

    /// Attach raw headers and the present/missing split to a finding.
    pub fn apply_to(&self, port: &mut Port) {
        port.parsed_headers = Some(self.parsed_headers.clone());
        port.security_headers_present = Some(self.present.clone());
        port.security_headers_missing = Some(self.missing.clone());
        if let Some(script) = self.script_output() {
            port.scripts.push(script);
        }
    }
}

/// `content-type` -> `Content-Type`.
pub fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Compare observed headers against [`SECURITY_POLICY`].
pub fn evaluate(headers: BTreeMap<String, String>) -> HeaderFinding {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for policy in SECURITY_POLICY {
        let observed = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(policy.name))
            .map(|(_, v)| v);
        match observed {
            Some(value) => present.push(PresentHeader {
                header: policy.name.to_string(),
                value: value.clone(),
                purpose: policy.purpose.to_string(),
            }),
            None => missing.push(MissingHeader {
                header: policy.name.to_string(),
                purpose: policy.purpose.to_string(),
                recommended: policy.recommended.to_string(),
            }),
        }
    }
    let security_score = score(present.len(), SECURITY_POLICY.len());
    HeaderFinding {
        status_line: None,
        parsed_headers: headers,
        score: HeaderScore {
            security_score,
            missing_headers: missing.iter().map(|m| m.header.clone()).collect(),
            vulnerability_percentage: 100 - security_score,
        },
        present,
        missing,
        error: None,
    }
}

fn score(present: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((present as f64 * 100.0) / total as f64).round().min(100.0) as u8
}

/// Fetches response headers and scores them.
#[derive(Debug, Clone)]
pub struct HeaderAnalyzer {
    timeout: Duration,
    user_agent: String,
}

impl HeaderAnalyzer {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            timeout,
            user_agent: user_agent.into(),
        }
    }

    /// Analyze `target:port`. Fetch failures degrade to a zero-score finding.
    pub async fn analyze(&self, target: &ScanTarget, port: u16, tls: bool) -> HeaderFinding {
        match self.fetch(target, port, tls).await {
            Ok((status, headers)) => {
                let mut finding = evaluate(headers);
                finding.status_line = Some(status);
                info!(
                    target = %target.label,
                    port,
                    score = finding.security_score(),
                    missing = finding.missing.len(),
                    "header analysis finished"
                );
                finding
            }
            Err(e) => {
                warn!(target = %target.label, port, error = %e, "header fetch failed");
                HeaderFinding::unreachable(&e)
            }
        }
    }

    async fn fetch(
        &self,
        target: &ScanTarget,
        port: u16,
        tls: bool,
    ) -> Result<(String, BTreeMap<String, String>), HeaderFetchError> {
        let scheme = if tls { "https" } else { "http" };
        let host = match (&target.hostname, target.ip) {
            (Some(name), _) => name.clone(),
            (None, IpAddr::V6(v6)) => format!("[{v6}]"),
            (None, ip) => ip.to_string(),
        };
        let url = Url::parse(&format!("{scheme}://{host}:{port}/"))?;

        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(Policy::none())
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .no_proxy();
        if let Some(name) = &target.hostname {
            // Pin the request to the address that was probed.
            builder = builder.resolve(name, SocketAddr::new(target.ip, port));
        }
        let client = builder.build().map_err(HeaderFetchError::Client)?;

        debug!(%url, "fetching headers");
        let resp = client.get(url).send().await?;
        let status = format!("{:?} {}", resp.version(), resp.status());
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in resp.headers() {
            let value = value
                .to_str()
                .map(str::to_string)
                .unwrap_or_else(|_| String::from_utf8_lossy(value.as_bytes()).into_owned());
            headers
                .entry(canonical_name(name.as_str()))
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(&value);
                })
                .or_insert(value);
        }
        Ok((status, headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderName, response::IntoResponse, routing::get, Router};
    use std::net::Ipv4Addr;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn canonicalizes_names() {
        assert_eq!(canonical_name("content-type"), "Content-Type");
        assert_eq!(canonical_name("x-frame-options"), "X-Frame-Options");
        assert_eq!(canonical_name("SERVER"), "Server");
    }

    #[test]
    fn scores_present_headers() {
        let f = evaluate(headers(&[
            ("Server", "nginx/1.18.0 (Ubuntu)"),
            ("X-Frame-Options", "SAMEORIGIN"),
            ("x-content-type-options", "nosniff"),
        ]));
        assert_eq!(f.present.len(), 2);
        assert_eq!(f.present[0].header, "X-Frame-Options");
        assert_eq!(f.present[0].purpose, "Prevents clickjacking");
        assert_eq!(f.score.security_score, 40);
        assert_eq!(f.score.vulnerability_percentage, 60);
        assert_eq!(
            f.score.missing_headers,
            vec!["Strict-Transport-Security", "Content-Security-Policy", "Permissions-Policy"]
        );
        assert_eq!(f.missing[0].recommended, "max-age=63072000; includeSubDomains");
    }

    #[test]
    fn score_and_vulnerability_sum_to_hundred() {
        let all: Vec<(&str, &str)> = SECURITY_POLICY.iter().map(|p| (p.name, "x")).collect();
        for n in 0..=all.len() {
            let f = evaluate(headers(&all[..n]));
            assert_eq!(f.score.security_score as u16 + f.score.vulnerability_percentage as u16, 100);
        }
        assert_eq!(evaluate(headers(&all)).score.security_score, 100);
    }

    #[test]
    fn unreachable_scores_zero() {
        let err = HeaderFetchError::Url(url::ParseError::EmptyHost);
        let f = HeaderFinding::unreachable(&err);
        assert!(f.parsed_headers.is_empty());
        assert_eq!(f.score.security_score, 0);
        assert_eq!(f.score.vulnerability_percentage, 100);
        assert_eq!(f.missing.len(), SECURITY_POLICY.len());
        assert!(f.script_output().is_none());
    }

    async fn hardened() -> impl IntoResponse {
        (
            [
                (HeaderName::from_static("x-frame-options"), "DENY"),
                (HeaderName::from_static("strict-transport-security"), "max-age=63072000"),
                (HeaderName::from_static("server"), "unit-test"),
            ],
            "ok",
        )
    }

    #[tokio::test]
    async fn analyzes_live_http_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/", get(hardened));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let target = ScanTarget {
            label: "127.0.0.1".into(),
            hostname: None,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            scheme: None,
            port: None,
        };
        let analyzer = HeaderAnalyzer::new(Duration::from_secs(5), "test");
        let f = analyzer.analyze(&target, port, false).await;

        assert_eq!(f.error, None);
        assert_eq!(f.parsed_headers.get("Server").map(String::as_str), Some("unit-test"));
        assert_eq!(f.score.security_score, 40);
        let script = f.script_output().unwrap();
        assert!(script.output.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn closed_port_degrades_to_zero_score() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ScanTarget {
            label: "127.0.0.1".into(),
            hostname: None,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            scheme: None,
            port: None,
        };
        let f = HeaderAnalyzer::new(Duration::from_secs(2), "test").analyze(&target, port, false).await;
        assert!(f.error.is_some());
        assert_eq!(f.score.security_score, 0);
    }
}
